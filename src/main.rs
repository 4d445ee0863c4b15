use clap::Parser;
use socks_ssh_broker::cli::Cli;
use socks_ssh_broker::manager::TunnelManager;
use socks_ssh_broker::remediator;
use socks_ssh_broker::remote_exec::SshRemoteExec;
use socks_ssh_broker::{config, logger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();

    let cli = Cli::parse();
    tracing::info!("socks-ssh-broker starting, config: {:?}", cli.config);

    let mut cfg = config::load_from_path(&cli.config).await;
    if let Some(local_port) = cli.local_port {
        cfg.local_port = local_port;
    }

    let manager = TunnelManager::new();

    if let Err(e) = manager.connect(&cfg).await {
        let diagnosis = TunnelManager::diagnose(&e.to_string());
        tracing::error!(
            "failed to connect: {} (category: {:?}, fixable: {})",
            e,
            diagnosis.category,
            diagnosis.fixable
        );

        if cli.repair && diagnosis.fixable {
            tracing::info!("attempting server-side repair on {}", cfg.hop1.host);
            let exec = SshRemoteExec::new(
                cfg.hop1.host.clone(),
                cfg.hop1.port,
                cfg.hop1.user.clone(),
                cfg.hop1.password.clone(),
            );
            let probe = remediator::IcmpProbe;
            match remediator::repair(&exec, &probe, &cfg.hop1.host).await {
                Ok(report) if report.succeeded => {
                    tracing::info!("repair report: {}", report.message);
                    manager.connect(&cfg).await?;
                }
                Ok(report) => anyhow::bail!("repair did not succeed, giving up: {}", report.message),
                Err(repair_err) => anyhow::bail!("repair attempt failed: {}", repair_err),
            }
        } else {
            return Err(e.into());
        }
    }

    tracing::info!("tunnel established on 127.0.0.1:{}", cfg.local_port);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    manager.disconnect().await?;

    Ok(())
}
