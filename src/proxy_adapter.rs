//! System-proxy registration and public-IP probing (spec.md §6), adapted
//! from `original_source/utils.py`'s `SystemUtils.set_system_proxy` and
//! `fetch_public_ip`.
//!
//! Both are expressed as traits with a no-op default: wiring an actual
//! OS-level proxy toggle or outbound HTTP probe is out of scope for the
//! broker itself (it belongs to whatever embeds it), but the seam is
//! real — the original ships both behaviors, so the port exists even
//! though spec.md's Non-goals exclude a concrete system-proxy backend.

use async_trait::async_trait;

/// Toggle the host's system-wide SOCKS proxy setting to point at the
/// broker's local listener. `NoopProxyRegistrar` is the default: the
/// broker never mutates system network settings on its own.
#[async_trait]
pub trait ProxyRegistrar: Send + Sync {
    async fn enable(&self, local_port: u16);
    async fn disable(&self);
}

pub struct NoopProxyRegistrar;

#[async_trait]
impl ProxyRegistrar for NoopProxyRegistrar {
    async fn enable(&self, local_port: u16) {
        tracing::debug!("system proxy registration is a no-op (would enable on port {})", local_port);
    }

    async fn disable(&self) {
        tracing::debug!("system proxy registration is a no-op (would disable)");
    }
}

/// Looks up the apparent public IP as seen through the tunnel, the way
/// the original confirms a tunnel is actually egressing where expected.
#[async_trait]
pub trait PublicIpProbe: Send + Sync {
    async fn fetch(&self) -> Option<String>;
}

pub struct UnavailablePublicIpProbe;

#[async_trait]
impl PublicIpProbe for UnavailablePublicIpProbe {
    async fn fetch(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_registrar_does_not_panic() {
        let registrar = NoopProxyRegistrar;
        registrar.enable(1080).await;
        registrar.disable().await;
    }

    #[tokio::test]
    async fn unavailable_probe_returns_none() {
        let probe = UnavailablePublicIpProbe;
        assert_eq!(probe.fetch().await, None);
    }
}
