use std::sync::Arc;

use anyhow::Result;
use scopeguard::defer;
use tokio_graceful::Shutdown;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::service::RegistedService;
use crate::state::WallsimState;

mod shutdown_guard_ext;

pub use shutdown_guard_ext::ShutdownGuardExt;

/// Runs a set of services until one of them fails, a signal arrives or the
/// canceller is triggered, then waits for every supervised task to go away.
pub struct WallsimRuntime {
    services: Vec<(Box<dyn RegistedService + Send + Sync>, Span)>,
    state: Arc<WallsimState>,
    shutdown: Shutdown,
    // Lets the caller stop the runtime. The runtime only cancels it itself on exit.
    canceller: CancellationToken,
}

impl Default for WallsimRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl WallsimRuntime {
    pub fn new() -> Self {
        let canceller = CancellationToken::new();

        let shutdown = {
            let canceller = canceller.clone();
            Shutdown::builder()
                .with_signal(async move {
                    tokio::select! {
                        _ = canceller.cancelled() => {}
                        _ = tokio_graceful::default_signal() => {}
                    }
                })
                .with_overwrite_fn(tokio::signal::ctrl_c)
                .build()
        };

        Self {
            services: vec![],
            state: Arc::new(WallsimState::new()),
            shutdown,
            canceller,
        }
    }

    pub fn add_service(&mut self, service: Box<dyn RegistedService + Send + Sync>, span: Span) {
        self.services.push((service, span));
    }

    pub fn state(&self) -> Arc<WallsimState> {
        Arc::clone(&self.state)
    }

    pub fn canceller(&self) -> CancellationToken {
        self.canceller.clone()
    }

    pub async fn serve(self) -> Result<()> {
        self.serve_with_ready(tokio::sync::oneshot::channel().0)
            .await
    }

    pub async fn serve_with_ready(mut self, ready: tokio::sync::oneshot::Sender<()>) -> Result<()> {
        let for_cancel_safety = self.canceller.clone();
        defer! {
            // The future of this function may be dropped before it completes.
            for_cancel_safety.cancel();
        }

        let shutdown_guard = self.shutdown.guard();

        {
            let mut receiver = self.state.ready.0.subscribe();
            shutdown_guard.spawn_supervised_task(async move {
                loop {
                    if *receiver.borrow_and_update() {
                        let _ = ready.send(());
                        break;
                    }
                    if receiver.changed().await.is_err() {
                        break;
                    }
                }
            });
        }

        let service_count = self.services.len();
        let (mut ready_receiver, mut error_receiver) = {
            let (ready_sender, ready_receiver) = tokio::sync::mpsc::channel(service_count.max(1));
            let (error_sender, error_receiver) = tokio::sync::mpsc::channel(service_count.max(1));

            for (service, span) in self.services.drain(..) {
                let ready_sender = ready_sender.clone();
                let error_sender = error_sender.clone();
                shutdown_guard.spawn_supervised_task_fn_with_span(
                    span,
                    move |shutdown_guard| async move {
                        if let Err(e) = service.serve(shutdown_guard, ready_sender).await {
                            tracing::error!(error = ?e, "Service failed");
                            let _ = error_sender.send(e).await;
                        }
                    },
                );
            }
            (ready_receiver, error_receiver)
        };

        let check_services_ready = async {
            for _ in 0..service_count {
                ready_receiver.recv().await;
            }
        };

        let maybe_err = tokio::select! {
            _ = check_services_ready => {
                tracing::info!("All of the {service_count} services are ready");
                let _ = self.state.ready.0.send(true);

                tokio::select! {
                    maybe_err = error_receiver.recv() => maybe_err,
                    _ = shutdown_guard.cancelled() => None,
                }
            }
            maybe_err = error_receiver.recv() => maybe_err,
            _ = shutdown_guard.cancelled() => None,
        };

        if maybe_err.is_some() {
            tracing::error!("Failed to serve all services, canceling and exiting now");
        } else {
            tracing::info!("Shutting down");
        }

        self.canceller.cancel();
        drop(shutdown_guard);
        self.shutdown.shutdown().await;

        tracing::debug!("Shutdown complete");
        match maybe_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
