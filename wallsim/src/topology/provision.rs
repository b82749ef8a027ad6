use std::collections::HashMap;

use anyhow::Result;

use super::path::hardening_sysctls;
use super::report::StepReport;
use super::{Node, NodeState, Role, Sidecar};
use crate::config::{NodeConfig, PortForward, WiresharkArgs};
use crate::engine::{ContainerEngine, NodeSpec, SidecarSpec, IDLE_COMMAND};
use crate::error::WallsimError;

const NODE_CAPABILITIES: [&str; 1] = ["NET_ADMIN"];
const SIDECAR_CAPABILITIES: [&str; 2] = ["NET_ADMIN", "NET_RAW"];

/// Creates, attaches and tears down the container of one role.
pub struct NodeProvisioner<'a> {
    engine: &'a dyn ContainerEngine,
    network: &'a str,
}

impl<'a> NodeProvisioner<'a> {
    pub fn new(engine: &'a dyn ContainerEngine, network: &'a str) -> Self {
        Self { engine, network }
    }

    /// Create the node, attach it to the subnet with its fixed address and
    /// start it. Nothing of a node that failed half way is left behind.
    pub async fn provision(
        &self,
        role: Role,
        name: String,
        config: &NodeConfig,
    ) -> Result<Node, WallsimError> {
        let mut forward_ports = config.network.forward_ports.clone();
        if config.wireshark.enabled {
            // The sidecar shares this node's namespace, so its port is published here.
            forward_ports.push(PortForward::same(config.wireshark.port));
        }

        let sysctls: HashMap<String, String> = if role.is_gateway() {
            hardening_sysctls(None)
                .into_iter()
                .map(|(k, v)| (k, v.to_owned()))
                .collect()
        } else {
            HashMap::new()
        };

        let spec = NodeSpec {
            name: name.clone(),
            image: config.image.clone(),
            command: IDLE_COMMAND.iter().map(|s| s.to_string()).collect(),
            cap_add: NODE_CAPABILITIES.iter().map(|s| s.to_string()).collect(),
            forward_ports: forward_ports.clone(),
            sysctls,
        };

        let id = self
            .engine
            .create_node(&spec)
            .await
            .map_err(|source| WallsimError::Provision {
                role,
                step: "create",
                source,
            })?;

        let mut node = Node {
            role,
            name,
            id,
            image: config.image.clone(),
            address: config.network.ip,
            state: NodeState::Created,
            interface: None,
            hardware_address: None,
            forward_ports,
            capabilities: spec.cap_add,
            sidecar: None,
        };

        if let Err(source) = self
            .engine
            .connect_node(self.network, &node.id, node.address)
            .await
        {
            self.discard(&mut node).await;
            return Err(WallsimError::Provision {
                role,
                step: "attach",
                source,
            });
        }

        if let Err(source) = self.engine.start_node(&node.id).await {
            self.discard(&mut node).await;
            return Err(WallsimError::Provision {
                role,
                step: "start",
                source,
            });
        }
        node.state = NodeState::Running;

        tracing::info!(name = %node.name, address = %node.address, image = %node.image, "Node provisioned");
        Ok(node)
    }

    /// Start a packet capture container inside the node's network namespace.
    pub async fn attach_sidecar(&self, node: &mut Node, args: &WiresharkArgs) -> Result<()> {
        let name = format!("{}_wireshark", node.name);
        let id = self
            .engine
            .run_sidecar(&SidecarSpec {
                name: name.clone(),
                image: args.image.clone(),
                target_id: node.id.clone(),
                cap_add: SIDECAR_CAPABILITIES.iter().map(|s| s.to_string()).collect(),
            })
            .await?;
        tracing::info!(%name, port = args.port, "Capture sidecar started");
        node.sidecar = Some(Sidecar {
            id,
            name,
            port: args.port,
        });
        Ok(())
    }

    /// Stop and remove the node and its sidecar. Safe to call on a node which
    /// is already gone.
    pub async fn teardown(&self, node: &mut Node) -> StepReport {
        let mut report = StepReport::default();
        if node.state == NodeState::Removed {
            return report;
        }

        if let Some(sidecar) = node.sidecar.take() {
            report.check(
                format!("remove sidecar {}", sidecar.name),
                self.engine.remove_node(&sidecar.id).await,
            );
        }
        report.check(
            format!("stop {}", node.name),
            self.engine.stop_node(&node.id).await,
        );
        if report
            .check(
                format!("remove {}", node.name),
                self.engine.remove_node(&node.id).await,
            )
            .is_some()
        {
            node.state = NodeState::Removed;
        } else {
            node.state = NodeState::Stopped;
        }
        report
    }

    async fn discard(&self, node: &mut Node) {
        let report = self.teardown(node).await;
        if !report.is_clean() {
            tracing::warn!(name = %node.name, "Partially provisioned node could not be fully removed");
        }
    }
}
