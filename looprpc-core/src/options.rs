use std::sync::Arc;

use prost_reflect::DescriptorPool;
use tokio::runtime::Handle;
use tonic::transport::Channel;

use crate::event_loop::{EventLoop, LoopTask};
use crate::status::RpcError;

/// Collaborators required to build the bridge core.
///
/// All four are mandatory; construction fails fast naming the first missing
/// one. The channel here is the default channel; individual clients may
/// override it.
#[derive(Default)]
pub struct CoreOptions {
    pub channel: Option<Channel>,
    pub pool: Option<DescriptorPool>,
    pub event_loop: Option<Arc<dyn EventLoop>>,
    pub runtime: Option<Handle>,
}

/// Validated collaborator set shared by both engines and the reflection
/// client. The pool and channel are read-only-shared across workers.
#[derive(Clone)]
pub(crate) struct Core {
    pub(crate) channel: Channel,
    pub(crate) pool: DescriptorPool,
    pub(crate) event_loop: Arc<dyn EventLoop>,
    pub(crate) runtime: Handle,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core").finish_non_exhaustive()
    }
}

impl CoreOptions {
    pub(crate) fn build(self) -> Result<Core, RpcError> {
        let channel = self
            .channel
            .ok_or_else(|| RpcError::invalid_argument("missing required channel"))?;
        let pool = self
            .pool
            .ok_or_else(|| RpcError::invalid_argument("missing required protobuf pool"))?;
        let event_loop = self
            .event_loop
            .ok_or_else(|| RpcError::invalid_argument("missing required event loop"))?;
        let runtime = self
            .runtime
            .ok_or_else(|| RpcError::invalid_argument("missing required worker runtime"))?;
        Ok(Core {
            channel,
            pool,
            event_loop,
            runtime,
        })
    }
}

impl Core {
    /// Submit a task to the loop; when the loop is gone, run the fallback on
    /// this thread instead. Every settle site goes through here so the
    /// submit-failure convention is applied uniformly.
    pub(crate) fn submit_or_else(&self, task: LoopTask, fallback: impl FnOnce()) {
        if self.event_loop.submit(task).is_err() {
            fallback();
        }
    }
}
