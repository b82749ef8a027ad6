use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use strum_macros::Display;
use tokio::sync::Mutex;
use tracing::Instrument as _;

use super::bootstrap::{BootstrapJob, BootstrapReport, BootstrapRunner};
use super::path::PathEnforcer;
use super::provision::NodeProvisioner;
use super::report::StepReport;
use super::{Node, NodeState, Role};
use crate::config::{TestSpec, TopologyArgs};
use crate::engine::{ContainerEngine, ExecOutput, NetworkSpec};
use crate::error::WallsimError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Provisioning,
    Enforcing,
    Bootstrapping,
    Running,
    Stopping,
}

/// Whether A <-> B traffic is guaranteed to cross W.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Containment {
    Enforced,
    NotGuaranteed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StartSummary {
    pub test_name: String,
    pub nodes: IndexMap<Role, NodeState>,
    pub containment: Containment,
    pub preparation: StepReport,
    pub hardening: StepReport,
    pub bootstrap: Vec<BootstrapReport>,
}

struct Topology {
    test_name: String,
    network: String,
    w: Option<Node>,
    a: Option<Node>,
    b: Option<Node>,
}

impl Topology {
    fn node(&self, role: Role) -> Option<&Node> {
        match role {
            Role::A => self.a.as_ref(),
            Role::B => self.b.as_ref(),
            Role::W => self.w.as_ref(),
        }
    }

    fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        [&mut self.a, &mut self.b, &mut self.w]
            .into_iter()
            .filter_map(Option::as_mut)
    }
}

struct State {
    phase: Phase,
    topology: Option<Topology>,
}

/// Owns at most one active topology and serializes every lifecycle transition.
pub struct Orchestrator {
    engine: Arc<dyn ContainerEngine>,
    base_dir: PathBuf,
    topology_args: TopologyArgs,
    state: Mutex<State>,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        base_dir: PathBuf,
        topology_args: TopologyArgs,
    ) -> Self {
        Self {
            engine,
            base_dir,
            topology_args,
            state: Mutex::new(State {
                phase: Phase::Idle,
                topology: None,
            }),
        }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    pub async fn active_test(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .topology
            .as_ref()
            .map(|t| t.test_name.clone())
    }

    /// Bring up the topology of `test_name`, replacing any active one. On
    /// failure everything created so far is removed again.
    pub async fn start(&self, test_name: &str) -> Result<StartSummary, WallsimError> {
        let mut state = self.state.lock().await;

        if state.topology.is_some() {
            tracing::info!("Stopping active topology before starting a new one");
            let report = self.teardown(&mut state).await;
            if !report.is_clean() {
                tracing::warn!(failures = report.failures().len(), "Previous topology was not fully removed");
            }
        }

        let spec = TestSpec::load(&self.base_dir, test_name)?;
        spec.validate(&self.topology_args)
            .map_err(|e| WallsimError::ConfigurationInvalid(e.into()))?;

        let span = tracing::info_span!("topology", test = test_name);
        let result = self.bring_up(&mut state, &spec).instrument(span).await;
        match result {
            Ok(summary) => {
                state.phase = Phase::Running;
                tracing::info!(test = test_name, containment = ?summary.containment, "Topology running");
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(test = test_name, error = %e, "Failed to start topology, cleaning up");
                let report = self.teardown(&mut state).await;
                if !report.is_clean() {
                    tracing::warn!(failures = ?report.failures(), "Cleanup after failed start was incomplete");
                }
                Err(e)
            }
        }
    }

    async fn bring_up(&self, state: &mut State, spec: &TestSpec) -> Result<StartSummary, WallsimError> {
        let args = &self.topology_args;
        let engine = self.engine.as_ref();

        state.phase = Phase::Provisioning;

        // A subnet left behind by an earlier run would make creation fail.
        if let Err(e) = engine.remove_network(&args.network_name).await {
            tracing::debug!(error = ?e, "No stale network removed");
        }
        engine
            .create_network(&NetworkSpec {
                name: args.network_name.clone(),
                subnet: args.subnet,
                gateway: args.gateway,
            })
            .await
            .map_err(WallsimError::SubnetCreation)?;

        let topology = state.topology.insert(Topology {
            test_name: spec.name.clone(),
            network: args.network_name.clone(),
            w: None,
            a: None,
            b: None,
        });

        let provisioner = NodeProvisioner::new(engine, &args.network_name);
        let enforcer = PathEnforcer::new(engine, &args.interface_name, args.prefix_len());
        let node_name = |role: Role| format!("{}_{}", spec.name, role);
        let mut preparation = StepReport::default();

        // W first: it must forward and stay silent about redirects before A
        // and B exist.
        let w = topology.w.insert(
            provisioner
                .provision(Role::W, node_name(Role::W), &spec.w)
                .instrument(tracing::info_span!("node", role = %Role::W))
                .await?,
        );
        self.prepare(&enforcer, w, &mut preparation).await;
        let hardening = enforcer.harden(w).await;

        for role in [Role::A, Role::B] {
            let config = spec.node(role);
            let node = provisioner
                .provision(role, node_name(role), config)
                .instrument(tracing::info_span!("node", role = %role))
                .await?;
            self.prepare(&enforcer, &node, &mut preparation).await;
            match role {
                Role::A => topology.a = Some(node),
                _ => topology.b = Some(node),
            }
        }

        for node in topology.nodes_mut() {
            let wireshark = &spec.node(node.role).wireshark;
            if wireshark.enabled {
                if let Err(e) = provisioner.attach_sidecar(node, wireshark).await {
                    tracing::warn!(role = %node.role, error = ?e, "Capture sidecar not started");
                }
            }
        }

        state.phase = Phase::Enforcing;
        let missing: Vec<Role> = Role::all()
            .filter(|role| topology.node(*role).is_none())
            .collect();
        let (Some(w), Some(a), Some(b)) = (&mut topology.w, &mut topology.a, &mut topology.b)
        else {
            return Err(WallsimError::EnforcementIncomplete { missing });
        };
        let containment = match enforcer.enforce(w, a, b).await {
            Ok(_) => Containment::Enforced,
            Err(e) if args.strict_containment => return Err(e),
            Err(e) => {
                tracing::error!(error = %e, "Topology is running without path containment");
                Containment::NotGuaranteed {
                    reason: e.to_string(),
                }
            }
        };

        state.phase = Phase::Bootstrapping;
        let runner = BootstrapRunner::new(engine);
        let jobs: Vec<(&Node, BootstrapJob)> = Role::all()
            .filter_map(|role| topology.node(role))
            .map(|node| {
                let job = BootstrapJob {
                    role: node.role,
                    source_dir: spec.script_dir(node.role),
                    commands: spec.node(node.role).start_script.clone(),
                    upload_path: args.upload_path.clone(),
                    workdir: args.workdir.clone(),
                };
                (node, job)
            })
            .collect();

        let results = futures::future::join_all(jobs.iter().map(|(node, job)| {
            runner
                .run(node, job)
                .instrument(tracing::info_span!("bootstrap", role = %node.role))
        }))
        .await;

        let mut bootstrap = vec![];
        for result in results {
            match result {
                Ok(report) => bootstrap.push(report),
                Err(e) => {
                    // The job is aborted but the topology itself is intact.
                    tracing::error!(error = %e, "Bootstrap job aborted");
                    if let WallsimError::BootstrapUploadFailed { role, .. } = &e {
                        let mut failures = StepReport::default();
                        failures.record("upload", &e);
                        bootstrap.push(BootstrapReport {
                            role: *role,
                            uploaded: false,
                            outcomes: vec![],
                            failures,
                        });
                    }
                }
            }
        }

        let nodes = Role::all()
            .filter_map(|role| topology.node(role))
            .map(|node| (node.role, node.state))
            .collect();

        Ok(StartSummary {
            test_name: spec.name.clone(),
            nodes,
            containment,
            preparation,
            hardening,
            bootstrap,
        })
    }

    /// Install the tools enforcement needs. A failure is reported and surfaces
    /// again when the path is enforced.
    async fn prepare(&self, enforcer: &PathEnforcer<'_>, node: &Node, report: &mut StepReport) {
        let command = &self.topology_args.tools_command;
        if command.is_empty() {
            return;
        }
        let result = enforcer
            .ensure_tools(node, command)
            .instrument(tracing::info_span!("tools", role = %node.role))
            .await;
        report.check(format!("tools on {}", node.role), result);
    }

    /// Tear down the active topology, if any. Never fails; whatever could not
    /// be removed is listed in the report.
    pub async fn stop(&self) -> StepReport {
        let mut state = self.state.lock().await;
        self.teardown(&mut state).await
    }

    async fn teardown(&self, state: &mut State) -> StepReport {
        let mut report = StepReport::default();
        let Some(mut topology) = state.topology.take() else {
            state.phase = Phase::Idle;
            return report;
        };
        state.phase = Phase::Stopping;

        let span = tracing::info_span!("teardown", test = %topology.test_name);
        async {
            let network = topology.network.clone();
            let provisioner = NodeProvisioner::new(self.engine.as_ref(), &network);
            for node in topology.nodes_mut() {
                report.merge(provisioner.teardown(node).await);
            }
            report.check(
                format!("remove network {network}"),
                self.engine.remove_network(&network).await,
            );
            tracing::info!(failures = report.failures().len(), "Topology removed");
        }
        .instrument(span)
        .await;

        state.phase = Phase::Idle;
        report
    }

    /// Live state of every tracked node. A node the engine cannot report on is
    /// shown as stopped.
    pub async fn status(&self) -> IndexMap<Role, NodeState> {
        let mut state = self.state.lock().await;
        let mut status = IndexMap::new();
        let Some(topology) = state.topology.as_mut() else {
            return status;
        };
        for node in topology.nodes_mut() {
            node.state = match self.engine.node_state(&node.id).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(role = %node.role, error = ?e, "State query failed");
                    NodeState::Stopped
                }
            };
        }
        for role in Role::all() {
            if let Some(node) = topology.node(role) {
                status.insert(role, node.state);
            }
        }
        status
    }

    /// Run a shell command inside the node of `role`.
    pub async fn execute(&self, role: Role, command: &str) -> ExecOutput {
        let state = self.state.lock().await;
        let Some(node) = state.topology.as_ref().and_then(|t| t.node(role)) else {
            return ExecOutput::new(1, WallsimError::NotRunning(role).to_string());
        };
        match self.engine.exec_shell(&node.id, command, None).await {
            Ok(output) => output,
            Err(e) => ExecOutput::new(1, format!("{e:#}")),
        }
    }
}
