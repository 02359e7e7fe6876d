use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::debug;

/// A unit of work to run on the loop thread.
pub type LoopTask = Box<dyn FnOnce() + Send + 'static>;

/// The single-threaded side of the bridge.
///
/// All script-visible callbacks, promise reactions, and call-object
/// construction go through `submit`; background workers never run them
/// directly. `submit` is fallible: once the loop has stopped it returns
/// [`LoopClosed`] and the caller must complete any pending promise
/// out-of-band.
pub trait EventLoop: Send + Sync + 'static {
    fn submit(&self, task: LoopTask) -> Result<(), LoopClosed>;
}

/// Error returned by [`EventLoop::submit`] after the loop has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopClosed;

impl fmt::Display for LoopClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event loop not running")
    }
}

impl std::error::Error for LoopClosed {}

enum LoopMsg {
    Task(LoopTask),
    Stop,
}

/// A default loop implementation: one dedicated worker thread draining a
/// task queue. Embedders with their own runtime loop implement [`EventLoop`]
/// instead; tests and standalone hosts use this one.
pub struct ScriptLoop {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

/// Cloneable submit handle for a [`ScriptLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<LoopMsg>,
    closed: Arc<AtomicBool>,
}

impl ScriptLoop {
    /// Spawn the loop thread.
    pub fn start() -> std::io::Result<ScriptLoop> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name("script-loop".into())
            .spawn(move || {
                while let Some(msg) = rx.blocking_recv() {
                    match msg {
                        LoopMsg::Task(task) => task(),
                        LoopMsg::Stop => break,
                    }
                }
                debug!("script loop stopped");
            })?;
        Ok(ScriptLoop {
            handle: LoopHandle { tx, closed },
            thread: Some(thread),
        })
    }

    /// A handle usable from any thread to submit loop tasks.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Stop the loop. Tasks already queued before the stop marker still run;
    /// submits racing with shutdown are rejected.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.closed.store(true, Ordering::SeqCst);
        let _ = self.handle.tx.send(LoopMsg::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ScriptLoop {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

impl EventLoop for LoopHandle {
    fn submit(&self, task: LoopTask) -> Result<(), LoopClosed> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LoopClosed);
        }
        self.tx.send(LoopMsg::Task(task)).map_err(|_| LoopClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn tasks_run_in_submission_order() {
        let looper = ScriptLoop::start().unwrap();
        let handle = looper.handle();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            handle
                .submit(Box::new(move || {
                    tx.send(i).unwrap();
                }))
                .unwrap();
        }
        let got: Vec<i32> = (0..10).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        looper.shutdown();
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let looper = ScriptLoop::start().unwrap();
        let handle = looper.handle();
        looper.shutdown();
        let err = handle.submit(Box::new(|| {})).unwrap_err();
        assert_eq!(err, LoopClosed);
        assert_eq!(err.to_string(), "event loop not running");
    }

    #[test]
    fn tasks_run_on_loop_thread() {
        let looper = ScriptLoop::start().unwrap();
        let (tx, rx) = std_mpsc::channel();
        looper
            .handle()
            .submit(Box::new(move || {
                tx.send(thread::current().name().map(str::to_owned)).unwrap();
            }))
            .unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("script-loop"));
        looper.shutdown();
    }
}
