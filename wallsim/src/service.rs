use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use tokio_graceful::ShutdownGuard;

/// A long running part of a wallsim process, such as a relay listener or the
/// control interface. Once the runtime serves it, it runs in its own task and
/// any error it returns brings the whole runtime down.
///
/// The task is dropped when the runtime shuts down, so a service only needs the
/// guard to hand it on to the tasks it spawns itself.
#[async_trait]
pub trait RegistedService {
    async fn serve(&self, shutdown_guard: ShutdownGuard, ready: Sender<()>) -> Result<()>;
}
