use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::mpsc::Sender;
use tokio_graceful::ShutdownGuard;

use crate::config::{list_tests, Endpoint};
use crate::engine::ExecOutput;
use crate::error::WallsimError;
use crate::service::RegistedService;
use crate::state::WallsimState;
use crate::topology::orchestrator::{Orchestrator, StartSummary};
use crate::topology::report::StepReport;
use crate::topology::{NodeState, Role};

pub use restful::RestfulControlInterface;

mod restful;

pub struct ControlInterface {
    restful: RestfulControlInterface,
}

impl ControlInterface {
    pub fn new(address: Endpoint, orchestrator: Arc<Orchestrator>, state: Arc<WallsimState>) -> Self {
        let core = Arc::new(ControlInterfaceCore::new(orchestrator, state));
        Self {
            restful: RestfulControlInterface::new(address, core),
        }
    }
}

#[async_trait]
impl RegistedService for ControlInterface {
    async fn serve(&self, shutdown_guard: ShutdownGuard, ready: Sender<()>) -> Result<()> {
        tracing::info!("Control interface launching");
        let listener = self.restful.bind().await?;
        let _ = ready.send(()).await;

        tokio::select! {
            _ = shutdown_guard.cancelled() => {}
            res = self.restful.serve(listener) => {
                if let Err(err) = &res {
                    tracing::error!("Restful control interface failed: {err:#}");
                }
                res?
            }
        }

        tracing::info!("Control interface exited");
        Ok(())
    }
}

/// Everything the control surface can do, independent of how it is exposed.
pub struct ControlInterfaceCore {
    orchestrator: Arc<Orchestrator>,
    state: Arc<WallsimState>,
}

impl ControlInterfaceCore {
    pub fn new(orchestrator: Arc<Orchestrator>, state: Arc<WallsimState>) -> Self {
        Self { orchestrator, state }
    }

    pub async fn livez(&self) -> bool {
        true
    }

    pub async fn readyz(&self) -> bool {
        self.state.is_ready()
    }

    pub async fn start(&self, test_name: &str) -> Result<StartSummary, WallsimError> {
        self.orchestrator.start(test_name).await
    }

    pub async fn stop(&self) -> StepReport {
        self.orchestrator.stop().await
    }

    pub async fn status(&self) -> IndexMap<Role, NodeState> {
        self.orchestrator.status().await
    }

    pub async fn exec(&self, role: Role, cmd: &str) -> ExecOutput {
        self.orchestrator.execute(role, cmd).await
    }

    pub async fn tests(&self) -> Result<Vec<String>, WallsimError> {
        let base_dir = self.orchestrator.base_dir().clone();
        let tests = tokio::task::spawn_blocking(move || list_tests(&base_dir))
            .await
            .map_err(anyhow::Error::from)??;
        Ok(tests)
    }
}
