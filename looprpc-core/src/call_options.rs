use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::metadata::Metadata;
use crate::promise::OnceGuard;

/// A script callback receiving response headers or trailers.
pub type MetadataCallback = Arc<dyn Fn(&Metadata) + Send + Sync + 'static>;

/// Script-side cancellation handle, the abort-controller shape.
pub struct AbortController {
    token: CancellationToken,
}

impl AbortController {
    pub fn new() -> AbortController {
        AbortController {
            token: CancellationToken::new(),
        }
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            token: self.token.clone(),
        }
    }
}

impl Default for AbortController {
    fn default() -> Self {
        AbortController::new()
    }
}

/// The signal half handed into call options.
#[derive(Clone)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    pub(crate) fn from_token(token: CancellationToken) -> AbortSignal {
        AbortSignal { token }
    }

    pub fn aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Options accepted as the trailing argument of every client call.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub metadata: Option<Metadata>,
    /// Deadline for the whole call; values of zero are ignored.
    pub timeout_ms: Option<u64>,
    pub signal: Option<AbortSignal>,
    pub on_header: Option<MetadataCallback>,
    pub on_trailer: Option<MetadataCallback>,
}

/// The parsed per-call context.
///
/// Owns the composed cancellation: aborting the signal, hitting the
/// deadline, or releasing the context all funnel into one token that every
/// blocking transport operation is raced against. `release` is the single
/// composed cancel; terminal submit paths call it exactly once, as the last
/// step, so resources are held until the script observes completion.
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<tokio::time::Instant>,
    timeout: Option<Duration>,
    pub(crate) outgoing: MetadataMap,
    pub(crate) on_header: Option<MetadataCallback>,
    pub(crate) on_trailer: Option<MetadataCallback>,
    released: OnceGuard,
}

impl CallContext {
    /// Parse options into a live context. Always succeeds and always yields
    /// a context whose cancel must be released, even for empty options.
    pub(crate) fn parse(opts: CallOptions, runtime: &Handle) -> CallContext {
        let token = CancellationToken::new();

        let timeout = opts
            .timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        if let Some(signal) = &opts.signal {
            if signal.aborted() {
                token.cancel();
            } else {
                let signal = signal.clone();
                let linked = token.clone();
                runtime.spawn(async move {
                    tokio::select! {
                        _ = signal.cancelled() => linked.cancel(),
                        _ = linked.cancelled() => {}
                    }
                });
            }
        }

        let outgoing = opts
            .metadata
            .as_ref()
            .map(Metadata::to_tonic)
            .unwrap_or_default();

        CallContext {
            token,
            deadline,
            timeout,
            outgoing,
            on_header: opts.on_header,
            on_trailer: opts.on_trailer,
            released: OnceGuard::new(),
        }
    }

    /// Attach outgoing metadata and the wire deadline to a request.
    pub(crate) fn apply_to_request<T>(&self, req: &mut tonic::Request<T>) {
        *req.metadata_mut() = self.outgoing.clone();
        if let Some(timeout) = self.timeout {
            req.set_timeout(timeout);
        }
    }

    /// Race a transport operation against cancellation and the deadline.
    pub(crate) async fn guard<T>(
        &self,
        fut: impl Future<Output = Result<T, Status>>,
    ) -> Result<T, Status> {
        tokio::pin!(fut);
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    result = &mut fut => result,
                    _ = self.token.cancelled() => Err(Status::cancelled("call cancelled")),
                    _ = tokio::time::sleep_until(deadline) => {
                        Err(Status::deadline_exceeded("call deadline exceeded"))
                    }
                }
            }
            None => {
                tokio::select! {
                    result = &mut fut => result,
                    _ = self.token.cancelled() => Err(Status::cancelled("call cancelled")),
                }
            }
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The composed cancel. Idempotent via the once-guard; the first call
    /// cancels the token, which also winds down any signal watcher task.
    pub(crate) fn release(&self) {
        if self.released.first() {
            self.token.cancel();
        }
    }
}

impl Drop for CallContext {
    fn drop(&mut self) {
        self.release();
    }
}
