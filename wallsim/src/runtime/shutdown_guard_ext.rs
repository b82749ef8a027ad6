use tokio_graceful::ShutdownGuard;
use tracing::{Instrument, Span};

/// Spawns tasks that are dropped as soon as the guard is cancelled, while
/// holding a guard clone so that shutdown waits for them to go away.
pub trait ShutdownGuardExt {
    fn spawn_supervised_task_fn_with_span<F, T>(
        &self,
        span: Span,
        task: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(ShutdownGuard) -> T + Send + 'static,
        T: std::future::Future<Output = ()> + Send + 'static;

    fn spawn_supervised_task_with_span<T>(
        &self,
        span: Span,
        task: T,
    ) -> tokio::task::JoinHandle<()>
    where
        T: std::future::Future<Output = ()> + Send + 'static;

    fn spawn_supervised_task<T>(&self, task: T) -> tokio::task::JoinHandle<()>
    where
        T: std::future::Future<Output = ()> + Send + 'static,
    {
        self.spawn_supervised_task_with_span(Span::current(), task)
    }
}

impl ShutdownGuardExt for ShutdownGuard {
    fn spawn_supervised_task_fn_with_span<F, T>(
        &self,
        span: Span,
        task: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(ShutdownGuard) -> T + Send + 'static,
        T: std::future::Future<Output = ()> + Send + 'static,
    {
        let guard = self.clone();
        self.spawn_supervised_task_with_span(span, async move { task(guard).await })
    }

    fn spawn_supervised_task_with_span<T>(&self, span: Span, task: T) -> tokio::task::JoinHandle<()>
    where
        T: std::future::Future<Output = ()> + Send + 'static,
    {
        let guard = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                () = task.instrument(span) => {}
            };
            drop(guard);
        })
    }
}
