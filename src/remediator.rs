//! `Remediator`: best-effort server-side repair sequence (spec.md §4.7),
//! grounded in `original_source/doctor.py`'s `AutoDoctor.repair_server`.
//!
//! Each phase is one script shipped over its own `RemoteExec::run_script`
//! call (one `bash -c` invocation per phase, matching the original). The
//! sshd-repair phase is the only one whose failure aborts the sequence;
//! network, security, and performance phases are best-effort and their
//! failures are logged but not fatal.

use crate::error::{Result, TunnelError};
use crate::remote_exec::RemoteExec;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::process::Command;

const ICMP_TIMEOUT: Duration = Duration::from_secs(10);

/// `connectivity_probe`: a local, non-SSH reachability check of a hop
/// (spec.md §4.7). Expressed as a trait — like `Transport` and
/// `RemoteExec` — so `repair`'s phase-gating logic (skip `network_repair`
/// when the probe succeeds) can be exercised deterministically in tests
/// without shelling out to `ping`.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_reachable(&self, host: &str) -> bool;
}

/// Grounded in `original_source/doctor.py`'s `_test_connectivity`
/// (`ping -c 2 -W 3 <ip>`); the wall-clock bound is the 10s ICMP probe
/// timeout of spec.md §5, wider than the original's per-ping `-W 3` to
/// allow for both pings plus process spawn overhead.
pub struct IcmpProbe;

#[async_trait]
impl ConnectivityProbe for IcmpProbe {
    async fn is_reachable(&self, host: &str) -> bool {
        let result = tokio::time::timeout(
            ICMP_TIMEOUT,
            Command::new("ping").arg("-c").arg("2").arg("-W").arg("3").arg(host).output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => output.status.success(),
            Ok(Err(e)) => {
                tracing::debug!("connectivity probe could not run ping: {}", e);
                false
            }
            Err(_) => {
                tracing::debug!("connectivity probe timed out");
                false
            }
        }
    }
}

const NETWORK_REPAIR_SCRIPT: &str = r#"
log() { echo ">>> Network: $1"; }
log "Checking network interfaces..."
ip addr show | grep -E "inet |inet6 " | head -5
log "Testing DNS resolution..."
nslookup google.com 2>/dev/null || echo "DNS resolution failed"
log "Fixing DNS settings..."
if [ -f /etc/resolv.conf ]; then
    cp /etc/resolv.conf /etc/resolv.conf.backup 2>/dev/null
    echo "nameserver 8.8.8.8" > /etc/resolv.conf
    echo "nameserver 1.1.1.1" >> /etc/resolv.conf
fi
log "Network repair complete"
"#;

const SSH_REPAIR_SCRIPT: &str = r#"
log() { echo ">>> SSH: $1"; }
log "Checking SSH service status..."
if command -v systemctl >/dev/null; then
    systemctl is-active sshd >/dev/null 2>&1 || systemctl start sshd
    systemctl enable sshd >/dev/null 2>&1
elif command -v service >/dev/null; then
    service ssh status >/dev/null 2>&1 || service ssh start
fi
CFG="/etc/ssh/sshd_config"
cp "$CFG" "${CFG}.backup.$(date +%s)" 2>/dev/null
sed -i 's/^#\?AllowTcpForwarding.*/AllowTcpForwarding yes/g' $CFG
sed -i 's/^#\?GatewayPorts.*/GatewayPorts yes/g' $CFG
sed -i 's/^#\?PermitTunnel.*/PermitTunnel yes/g' $CFG
sed -i 's/^#\?ClientAliveInterval.*/ClientAliveInterval 60/g' $CFG
sed -i 's/^#\?ClientAliveCountMax.*/ClientAliveCountMax 3/g' $CFG
sed -i 's/^#\?TCPKeepAlive.*/TCPKeepAlive yes/g' $CFG
sed -i 's/^#\?MaxAuthTries.*/MaxAuthTries 6/g' $CFG
sed -i 's/^#\?PasswordAuthentication.*/PasswordAuthentication yes/g' $CFG
sed -i 's/^#\?PermitRootLogin.*/PermitRootLogin yes/g' $CFG
sed -i 's/^#\?MaxSessions.*/MaxSessions 1000/g' $CFG
sed -i 's/^#\?MaxStartups.*/MaxStartups 100:30:1000/g' $CFG
PORT=$(grep "^Port" $CFG | awk '{print $2}')
[ -z "$PORT" ] && PORT=22
log "Opening firewall for SSH port $PORT..."
if command -v ufw >/dev/null; then
    ufw --force enable >/dev/null 2>&1
    ufw allow $PORT/tcp >/dev/null 2>&1
    ufw allow 1080/tcp >/dev/null 2>&1
    ufw reload >/dev/null 2>&1
fi
if command -v iptables >/dev/null; then
    iptables -I INPUT -p tcp --dport $PORT -j ACCEPT 2>/dev/null
    iptables -I INPUT -p tcp --dport 1080 -j ACCEPT 2>/dev/null
fi
if command -v firewall-cmd >/dev/null; then
    firewall-cmd --permanent --add-port=$PORT/tcp >/dev/null 2>&1
    firewall-cmd --permanent --add-port=1080/tcp >/dev/null 2>&1
    firewall-cmd --reload >/dev/null 2>&1
fi
log "Restarting SSH service..."
if command -v systemctl >/dev/null; then
    systemctl restart sshd
elif command -v service >/dev/null; then
    service ssh restart
fi
sleep 3
log "SSH repair complete"
echo "SSH_REPAIR_COMPLETE"
"#;

const SECURITY_SCRIPT: &str = r#"
log() { echo ">>> Security: $1"; }
usermod -s /bin/bash root 2>/dev/null || true
chmod 600 /etc/ssh/sshd_config 2>/dev/null || true
chmod 700 /root/.ssh 2>/dev/null || true
chmod 600 /root/.ssh/* 2>/dev/null || true
log "Security fixes complete"
"#;

const PERFORMANCE_SCRIPT: &str = r#"
log() { echo ">>> Performance: $1"; }
if ! grep -q "bbr" /etc/sysctl.conf 2>/dev/null; then
    echo "net.core.default_qdisc=fq" >> /etc/sysctl.conf
    echo "net.ipv4.tcp_congestion_control=bbr" >> /etc/sysctl.conf
fi
if ! grep -q "net.core.rmem_max" /etc/sysctl.conf 2>/dev/null; then
    echo "net.core.rmem_max=16777216" >> /etc/sysctl.conf
    echo "net.core.wmem_max=16777216" >> /etc/sysctl.conf
    echo "net.ipv4.tcp_rmem=4096 87380 16777216" >> /etc/sysctl.conf
    echo "net.ipv4.tcp_wmem=4096 87380 16777216" >> /etc/sysctl.conf
fi
echo "fs.file-max = 65535" >> /etc/sysctl.conf
echo "net.core.somaxconn = 4096" >> /etc/sysctl.conf
echo "net.ipv4.ip_local_port_range = 1024 65535" >> /etc/sysctl.conf
sysctl -p >/dev/null 2>&1
ulimit -n 65535 2>/dev/null || true
log "Performance optimization complete"
"#;

const VERIFY_SCRIPT: &str = r#"
log() { echo ">>> Verification: $1"; }
if command -v systemctl >/dev/null; then
    systemctl is-active sshd >/dev/null 2>&1 && echo "SSH_ACTIVE"
elif command -v service >/dev/null; then
    service ssh status >/dev/null 2>&1 && echo "SSH_ACTIVE"
fi
grep -q "AllowTcpForwarding yes" /etc/ssh/sshd_config && echo "TCP_FORWARDING_ENABLED"
PORT=$(grep "^Port" /etc/ssh/sshd_config | awk '{print $2}')
[ -z "$PORT" ] && PORT=22
if command -v ufw >/dev/null; then
    ufw status | grep -q "$PORT/tcp" && echo "FIREWALL_OPEN"
elif command -v iptables >/dev/null; then
    iptables -L | grep -q "dpt:$PORT" && echo "FIREWALL_OPEN"
fi
log "Verification complete"
"#;

#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub succeeded: bool,
    pub message: String,
    pub ssh_service_repaired: bool,
    pub verification_passed: bool,
}

/// Run the full repair sequence against `target` using `exec`.
///
/// Phase order: connectivity probe (local, no SSH) -> network repair
/// (best-effort, skipped when the probe succeeds) -> sshd repair
/// (mandatory) -> security hardening (best-effort) -> performance tuning
/// (best-effort) -> verification. Only the sshd-repair phase is mandatory:
/// its sentinel being absent from stdout yields
/// `TunnelError::RemediationFailed` and aborts the sequence (spec.md §7);
/// every other phase is best-effort and its failure is logged, not fatal.
pub async fn repair(exec: &dyn RemoteExec, probe: &dyn ConnectivityProbe, host: &str) -> Result<RepairReport> {
    tracing::info!("starting comprehensive server repair");

    if probe.is_reachable(host).await {
        tracing::debug!("connectivity probe to {} succeeded, skipping network repair", host);
    } else {
        tracing::warn!("connectivity probe to {} failed, attempting network repair", host);
        if let Err(e) = exec.run_script(NETWORK_REPAIR_SCRIPT).await {
            tracing::warn!("network repair phase failed: {}", e);
        }
    }

    let ssh_output = exec.run_script(SSH_REPAIR_SCRIPT).await.map_err(|e| TunnelError::RemediationFailed {
        phase: "ssh_repair".to_string(),
        stderr: e.to_string(),
    })?;

    if !ssh_output.stdout.contains("SSH_REPAIR_COMPLETE") {
        tracing::error!("ssh repair phase ran but did not complete: {}", ssh_output.stderr);
        return Err(TunnelError::RemediationFailed {
            phase: "ssh_repair".to_string(),
            stderr: ssh_output.stderr,
        });
    }

    if let Err(e) = exec.run_script(SECURITY_SCRIPT).await {
        tracing::warn!("security hardening phase failed: {}", e);
    }
    if let Err(e) = exec.run_script(PERFORMANCE_SCRIPT).await {
        tracing::warn!("performance tuning phase failed: {}", e);
    }

    let verification_passed = match exec.run_script(VERIFY_SCRIPT).await {
        Ok(output) => {
            // spec.md §4.7: verification succeeds only if all three
            // sentinels are present.
            output.stdout.contains("SSH_ACTIVE")
                && output.stdout.contains("TCP_FORWARDING_ENABLED")
                && output.stdout.contains("FIREWALL_OPEN")
        }
        Err(e) => {
            tracing::warn!("verification phase failed: {}", e);
            false
        }
    };

    if verification_passed {
        tracing::info!("server repair completed successfully");
        Ok(RepairReport {
            succeeded: true,
            message: "comprehensive repair successful".to_string(),
            ssh_service_repaired: true,
            verification_passed: true,
        })
    } else {
        tracing::warn!("repair completed but verification failed");
        Ok(RepairReport {
            succeeded: false,
            message: "repair completed but verification failed".to_string(),
            ssh_service_repaired: true,
            verification_passed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_exec::ExecOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedExec {
        responses: Mutex<Vec<Result<ExecOutput>>>,
        calls: AtomicUsize,
    }

    impl ScriptedExec {
        fn new(responses: Vec<Result<ExecOutput>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    fn ok(stdout: &str) -> Result<ExecOutput> {
        Ok(ExecOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_status: Some(0),
        })
    }

    #[async_trait]
    impl RemoteExec for ScriptedExec {
        async fn run_script(&self, _script: &str) -> Result<ExecOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                ok("")
            } else {
                responses.remove(0)
            }
        }
    }

    struct ScriptedProbe(bool);

    #[async_trait]
    impl ConnectivityProbe for ScriptedProbe {
        async fn is_reachable(&self, _host: &str) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn full_success_runs_sshd_security_perf_and_verification() {
        // Probe succeeds, so network_repair is skipped: sshd_repair,
        // security_hardening, perf_tuning, verification == 4 exec calls.
        let exec = ScriptedExec::new(vec![
            ok("SSH_REPAIR_COMPLETE"),
            ok(""),
            ok(""),
            ok("SSH_ACTIVE\nTCP_FORWARDING_ENABLED\nFIREWALL_OPEN"),
        ]);
        let probe = ScriptedProbe(true);

        let report = repair(&exec, &probe, "10.0.0.1").await.unwrap();
        assert!(report.succeeded);
        assert!(report.verification_passed);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failed_probe_runs_network_repair_before_sshd_repair() {
        let exec = ScriptedExec::new(vec![
            ok(""),
            ok("SSH_REPAIR_COMPLETE"),
            ok(""),
            ok(""),
            ok("SSH_ACTIVE\nTCP_FORWARDING_ENABLED\nFIREWALL_OPEN"),
        ]);
        let probe = ScriptedProbe(false);

        let report = repair(&exec, &probe, "10.0.0.1").await.unwrap();
        assert!(report.succeeded);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn ssh_repair_failure_aborts_before_security_and_perf() {
        let exec = ScriptedExec::new(vec![Err(crate::error::TunnelError::TransportError("refused".into()))]);
        let probe = ScriptedProbe(true);

        let result = repair(&exec, &probe, "10.0.0.1").await;
        assert!(matches!(result, Err(TunnelError::RemediationFailed { .. })));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_completion_sentinel_is_a_remediation_failure() {
        // spec.md §7: a mandatory phase's sentinel absent -> RemediationFailed.
        let exec = ScriptedExec::new(vec![ok("not the sentinel")]);
        let probe = ScriptedProbe(true);

        let result = repair(&exec, &probe, "10.0.0.1").await;
        assert!(matches!(result, Err(TunnelError::RemediationFailed { .. })));
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn verification_failure_is_reported_but_not_an_error() {
        let exec = ScriptedExec::new(vec![
            ok("SSH_REPAIR_COMPLETE"),
            ok(""),
            ok(""),
            ok("SSH_ACTIVE"),
        ]);
        let probe = ScriptedProbe(true);

        let report = repair(&exec, &probe, "10.0.0.1").await.unwrap();
        assert!(!report.succeeded);
        assert!(report.ssh_service_repaired);
        assert!(!report.verification_passed);
    }

    #[tokio::test]
    async fn verification_requires_all_three_sentinels() {
        // spec.md §4.7: SSH_ACTIVE + TCP_FORWARDING_ENABLED alone, without
        // FIREWALL_OPEN, is not sufficient.
        let exec = ScriptedExec::new(vec![
            ok("SSH_REPAIR_COMPLETE"),
            ok(""),
            ok(""),
            ok("SSH_ACTIVE\nTCP_FORWARDING_ENABLED"),
        ]);
        let probe = ScriptedProbe(true);

        let report = repair(&exec, &probe, "10.0.0.1").await.unwrap();
        assert!(!report.verification_passed);
    }
}
