use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rocket::tokio::{
    self,
    sync::Notify,
    task::{JoinError, JoinHandle},
    time::Duration,
};

/// A task scheduled to run after a delay.
/// It will automatically execute once the delay has passed, or can be triggered early.
pub struct ScheduledTask<T> {
    task_handle: JoinHandle<T>,
    wait_handle: JoinHandle<()>,
    signal: Arc<Notify>,
}

impl<T> ScheduledTask<T>
where
    T: Send + 'static,
{
    /// Schedule the given task to execute once `delay` has elapsed.
    /// A zero delay executes it as soon as the runtime gets to it.
    pub fn after<Fut>(task: Fut, delay: Duration) -> Self
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        // Create the synchronisation signal.
        let signal = Arc::new(Notify::new());

        // Schedule the task to wait on the signal.
        let task_signal = signal.clone();
        let task_handle = tokio::spawn(async move {
            task_signal.notified().await;
            task.await
        });

        // Spawn another task to give the signal at the appropriate time.
        let wait_signal = signal.clone();
        let wait_handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            wait_signal.notify_one();
        });

        Self {
            task_handle,
            wait_handle,
            signal,
        }
    }

    /// Trigger the task now instead of waiting for the delay to pass.
    /// Has no effect if the task already ran.
    pub fn trigger_now(&self) {
        self.wait_handle.abort();
        // `notify_one` stores a permit, so this is not lost if the task
        // has not reached its wait point yet.
        self.signal.notify_one();
    }
}

/// Implement `Future` for `ScheduledTask` so we can directly `await` it.
impl<T> Future for ScheduledTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task_handle).poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    #[rocket::async_test]
    async fn runs_after_delay() {
        let runs = Arc::new(AtomicUsize::new(0));
        let task_runs = runs.clone();
        let task = ScheduledTask::after(
            async move { task_runs.fetch_add(1, Ordering::SeqCst) },
            Duration::from_millis(20),
        );
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(task.await.unwrap(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[rocket::async_test]
    async fn trigger_now_skips_the_wait() {
        let task = ScheduledTask::after(async { 42 }, Duration::from_secs(3600));
        task.trigger_now();
        let result = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert_eq!(result.unwrap().unwrap(), 42);
    }
}
