use std::sync::Mutex;
use std::time::Duration;

use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::debug;

use crate::status::RpcError;

/// Default connection timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 10.0;

/// Options for [`dial`].
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Plain-text HTTP/2 instead of TLS.
    pub insecure: bool,

    /// Override the authority used for TLS verification and `:authority`.
    pub authority: Option<String>,

    /// Maximum time to wait for the connection to be established.
    pub connect_timeout: Option<f64>,
}

/// The script-visible dial result: a channel plus `close()` / `target()`.
///
/// Connection is lazy; the first RPC drives the actual connect, so `dial`
/// itself stays synchronous on the loop thread.
#[derive(Debug)]
pub struct ChannelHandle {
    target: String,
    channel: Mutex<Option<Channel>>,
}

impl ChannelHandle {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The underlying channel; fails after `close()`.
    pub fn channel(&self) -> Result<Channel, RpcError> {
        self.lock()
            .clone()
            .ok_or_else(|| RpcError::unavailable(format!("channel to {} is closed", self.target)))
    }

    /// Drop the channel. Idempotent; in-flight calls keep their own clone.
    pub fn close(&self) {
        self.lock().take();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Channel>> {
        self.channel
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Build a channel handle for `host:port`.
///
/// `insecure` selects h2c plain text; the default is TLS with the system
/// trust roots, verifying `authority` (or the target host) as the server
/// name.
pub fn dial(target: &str, opts: &DialOptions) -> Result<ChannelHandle, RpcError> {
    let scheme = if opts.insecure { "http" } else { "https" };
    let uri = format!("{scheme}://{target}");

    let mut endpoint = build_endpoint(&uri, opts)?;

    if !opts.insecure {
        let mut tls = ClientTlsConfig::new().with_native_roots();
        if let Some(authority) = &opts.authority {
            tls = tls.domain_name(authority.clone());
        }
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| RpcError::unavailable(format!("TLS configuration error: {e}")))?;
    }

    debug!(target, insecure = opts.insecure, "dialing channel");
    let channel = endpoint.connect_lazy();
    Ok(ChannelHandle {
        target: target.to_string(),
        channel: Mutex::new(Some(channel)),
    })
}

fn build_endpoint(uri: &str, opts: &DialOptions) -> Result<Endpoint, RpcError> {
    let mut endpoint: Endpoint = Channel::from_shared(uri.to_string())
        .map_err(|e| RpcError::invalid_argument(format!("invalid address: {e}")))?;

    let connect_timeout = opts
        .connect_timeout
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
    endpoint = endpoint.connect_timeout(Duration::from_secs_f64(connect_timeout));

    if opts.insecure {
        if let Some(authority) = &opts.authority {
            let origin = format!("http://{authority}")
                .parse()
                .map_err(|e| RpcError::invalid_argument(format!("invalid authority: {e}")))?;
            endpoint = endpoint.origin(origin);
        }
    }

    Ok(endpoint)
}
