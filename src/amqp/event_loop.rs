use super::EventLoop;
use crate::Result;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

/// An [`EventLoop`] backed by a current-thread tokio runtime.
///
/// No worker thread is spawned: tasks on this runtime, the AMQP session
/// included, only advance while the owning thread is inside one of the
/// `run_*` calls.
pub struct TokioLoop {
    runtime: Option<Runtime>,
    handle: Handle,
    tick: Duration,
}

impl TokioLoop {
    /// `tick` bounds how long a single [`run_once`](EventLoop::run_once)
    /// iteration may block.
    pub fn new(tick: Duration) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();

        Ok(Self {
            runtime: Some(runtime),
            handle,
            tick: tick.max(Duration::from_millis(1)),
        })
    }

    /// Handle used to spawn tasks that this loop will drive.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_stopped(&self) -> bool {
        self.runtime.is_none()
    }
}

impl EventLoop for TokioLoop {
    fn run_non_blocking(&mut self) {
        if let Some(runtime) = &self.runtime {
            runtime.block_on(tokio::task::yield_now());
        }
    }

    fn run_once(&mut self) {
        if let Some(runtime) = &self.runtime {
            // The timer has to be registered from inside the runtime.
            let tick = self.tick;
            runtime.block_on(async move { tokio::time::sleep(tick).await });
        }
    }

    fn stop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!("Stopping producer event loop");
            runtime.shutdown_background();
        }
    }
}

impl Drop for TokioLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
