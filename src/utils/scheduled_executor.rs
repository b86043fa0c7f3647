// Scheduled Executor for periodic tasks
// Inspired by curvine's ScheduledExecutor
// Adapted for async/tokio runtime

use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// A trait for tasks that run periodically
pub trait ScheduledTask: Send + Sync + 'static {
    /// Execute the task
    /// Returns Ok(()) on success, Err on failure
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>>;

    /// Check if the task should terminate
    /// Default: never terminate (run forever)
    fn should_terminate(&self) -> bool {
        false
    }
}

/// Blanket implementation for Arc<T> where T: ScheduledTask
/// This allows passing Arc-wrapped tasks directly to the executor
impl<T: ScheduledTask> ScheduledTask for Arc<T> {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        (**self).run()
    }

    fn should_terminate(&self) -> bool {
        (**self).should_terminate()
    }
}

/// A handle that can stop a running `ScheduledExecutor` from elsewhere.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Scheduled executor for running periodic tasks
pub struct ScheduledExecutor {
    interval: Duration,
    task_name: String,
    shutdown: Arc<AtomicBool>,
}

impl ScheduledExecutor {
    /// Create a new scheduled executor
    ///
    /// # Arguments
    /// * `task_name` - Name of the task (for logging)
    /// * `interval` - Interval between executions
    pub fn new(task_name: impl Into<String>, interval: Duration) -> Self {
        Self { task_name: task_name.into(), interval, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    /// A handle that can request shutdown before calling `start`.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// Start the scheduled task
    ///
    /// This spawns a tokio task that runs the provided task periodically.
    /// The task will continue running until:
    /// - `shutdown()` is called on the handle
    /// - The task's `should_terminate()` returns true
    ///
    /// # Example
    /// ```rust
    /// let executor = ScheduledExecutor::new("my-task", Duration::from_secs(30));
    /// let handle = executor.shutdown_handle();
    /// executor.start(my_task).await;
    ///
    /// // Later, to stop:
    /// handle.shutdown();
    /// ```
    pub async fn start<T>(self, task: T)
    where
        T: ScheduledTask,
    {
        let task_name = self.task_name.clone();
        let interval_ms = self.interval.as_millis() as i64;
        let shutdown = self.shutdown;

        tracing::info!(
            "Starting scheduled task '{}' with interval: {:?}",
            task_name,
            self.interval
        );

        let mut next_execution = Utc::now().timestamp_millis() + interval_ms;

        loop {
            if shutdown.load(Ordering::Relaxed) || task.should_terminate() {
                tracing::info!("Scheduled task '{}' is shutting down", task_name);
                break;
            }

            let now = Utc::now().timestamp_millis();

            if now >= next_execution {
                tracing::debug!("Executing scheduled task '{}'", task_name);

                match task.run().await {
                    Ok(()) => {
                        tracing::debug!("Scheduled task '{}' completed successfully", task_name);
                    },
                    Err(e) => {
                        tracing::error!("Scheduled task '{}' failed: {}", task_name, e);
                    },
                }

                next_execution = Utc::now().timestamp_millis() + interval_ms;
            }

            let wait_ms = next_execution.saturating_sub(Utc::now().timestamp_millis());
            if wait_ms > 0 {
                sleep(Duration::from_millis(wait_ms as u64)).await;
            }
        }

        tracing::info!("Scheduled task '{}' stopped", task_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct TestTask {
        counter: Arc<AtomicU32>,
        max_runs: u32,
    }

    impl ScheduledTask for TestTask {
        fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
            Box::pin(async move {
                let count = self.counter.fetch_add(1, Ordering::Relaxed);
                tracing::info!("TestTask run #{}", count + 1);
                Ok(())
            })
        }

        fn should_terminate(&self) -> bool {
            self.counter.load(Ordering::Relaxed) >= self.max_runs
        }
    }

    #[tokio::test]
    async fn test_scheduled_executor() {
        let counter = Arc::new(AtomicU32::new(0));
        let task = TestTask { counter: counter.clone(), max_runs: 3 };

        let executor = ScheduledExecutor::new("test", Duration::from_millis(100));
        executor.start(task).await;

        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }
}
