use eyre::WrapErr;
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Reverse DNS resolver built from the system configuration.
#[derive(Clone)]
pub(crate) struct ReverseResolver(Arc<TokioAsyncResolver>);

impl std::fmt::Debug for ReverseResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReverseResolver")
    }
}

impl ReverseResolver {
    pub(crate) fn from_system_conf() -> eyre::Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .wrap_err("Couldn't read system DNS configuration")?;
        Ok(Self(Arc::new(resolver)))
    }

    /// Resolve `ip` to a host name, giving up after `timeout`.
    #[tracing::instrument(level = "debug", skip(self), err(level = "debug"))]
    pub(crate) async fn lookup(&self, ip: IpAddr, timeout: Duration) -> eyre::Result<String> {
        let lookup = tokio::time::timeout(timeout, self.0.reverse_lookup(ip))
            .await
            .wrap_err("Reverse DNS lookup timed out")??;
        let name = lookup
            .iter()
            .next()
            .ok_or_else(|| eyre::eyre!("No PTR records for {ip}"))?
            .to_string();
        Ok(name.trim_end_matches('.').to_owned())
    }
}
