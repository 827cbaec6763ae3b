// Execution contexts for response and progress handlers.

use std::fmt;
use std::thread;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where a handler runs. Implementations must not run the job while the caller
/// holds any lock it expects the job to take.
pub trait Executor: Send + Sync + fmt::Debug {
    fn execute(&self, job: Job);
}

/// Runs the job on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl Executor for Inline {
    fn execute(&self, job: Job) {
        job()
    }
}

/// Runs jobs on a tokio runtime's blocking pool.
#[derive(Debug, Clone)]
pub struct RuntimeExecutor {
    handle: Handle,
}

impl RuntimeExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Bind to the runtime of the calling task, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Executor for RuntimeExecutor {
    fn execute(&self, job: Job) {
        self.handle.spawn_blocking(job);
    }
}

/// A dedicated thread running jobs one at a time in submission order.
///
/// This is the default home of response handlers, the counterpart of a UI
/// application's main event loop.
pub struct SerialQueue {
    label: String,
    sender: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    pub fn new(label: impl Into<String>) -> std::io::Result<Self> {
        let label = label.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        thread::Builder::new().name(label.clone()).spawn(move || {
            while let Some(job) = receiver.blocking_recv() {
                job();
            }
            debug!("Serial queue drained and closed");
        })?;

        Ok(Self { label, sender })
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Executor for SerialQueue {
    fn execute(&self, job: Job) {
        if self.sender.send(job).is_err() {
            warn!(queue = %self.label, "Serial queue is closed, dropping job");
        }
    }
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue").field("label", &self.label).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[test]
    fn test_inline_runs_immediately() {
        let (tx, rx) = std_mpsc::channel();
        Inline.execute(Box::new(move || tx.send(1).unwrap()));
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn test_serial_queue_preserves_order() {
        let queue = SerialQueue::new("test-queue").unwrap();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..50 {
            let tx = tx.clone();
            queue.execute(Box::new(move || tx.send(i).unwrap()));
        }
        let received: Vec<i32> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_serial_queue_runs_off_caller_thread() {
        let queue = SerialQueue::new("named-queue").unwrap();
        let (tx, rx) = std_mpsc::channel();
        queue.execute(Box::new(move || {
            tx.send(thread::current().name().map(str::to_string)).unwrap()
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("named-queue"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runtime_executor() {
        let executor = RuntimeExecutor::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.execute(Box::new(move || {
            let _ = tx.send("done");
        }));
        assert_eq!(rx.await.unwrap(), "done");
    }
}
