use std::collections::HashMap;
use std::net::Ipv4Addr;

use anyhow::Result;
use async_trait::async_trait;
use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};

use crate::config::PortForward;
use crate::topology::NodeState;

pub mod docker;
#[cfg(test)]
pub(crate) mod mock;

/// Command keeping an otherwise idle node alive.
pub const IDLE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSpec {
    pub name: String,
    pub subnet: Ipv4Cidr,
    pub gateway: Ipv4Addr,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub cap_add: Vec<String>,
    pub forward_ports: Vec<PortForward>,
    /// Kernel parameters applied when the node's namespace is created.
    pub sysctls: HashMap<String, String>,
}

/// A container started inside the network namespace of another one.
#[derive(Debug, Clone, PartialEq)]
pub struct SidecarSpec {
    pub name: String,
    pub image: String,
    pub target_id: String,
    pub cap_add: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn new(exit_code: i64, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The container runtime the topology is built on. Teardown operations treat
/// an already absent object as success.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn create_node(&self, spec: &NodeSpec) -> Result<String>;

    async fn connect_node(&self, network: &str, node_id: &str, address: Ipv4Addr) -> Result<()>;

    async fn start_node(&self, node_id: &str) -> Result<()>;

    async fn stop_node(&self, node_id: &str) -> Result<()>;

    async fn remove_node(&self, node_id: &str) -> Result<()>;

    /// Run `cmd` inside the node and wait for it. Stdout and stderr are merged.
    async fn exec(&self, node_id: &str, cmd: &[String], workdir: Option<&str>) -> Result<ExecOutput>;

    /// Unpack a tar archive at `path` inside the node.
    async fn upload_archive(&self, node_id: &str, path: &str, archive: Vec<u8>) -> Result<()>;

    async fn node_state(&self, node_id: &str) -> Result<NodeState>;

    async fn run_sidecar(&self, spec: &SidecarSpec) -> Result<String>;

    async fn exec_shell(&self, node_id: &str, script: &str, workdir: Option<&str>) -> Result<ExecOutput> {
        let cmd = ["sh".to_owned(), "-c".to_owned(), script.to_owned()];
        self.exec(node_id, &cmd, workdir).await
    }

    /// Start a freshly created node, removing it again if it does not come up.
    /// The start error is returned either way.
    async fn start_or_remove(&self, node_id: &str) -> Result<()> {
        let Err(e) = self.start_node(node_id).await else {
            return Ok(());
        };
        if let Err(cleanup) = self.remove_node(node_id).await {
            tracing::warn!(node = node_id, error = ?cleanup, "Failed to remove node after failed start");
        }
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::mock::MockEngine;
    use super::*;

    async fn created(engine: &MockEngine, name: &str) -> Result<String> {
        engine
            .create_node(&NodeSpec {
                name: name.into(),
                image: "alpine:3.20".into(),
                ..Default::default()
            })
            .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 10)]
    async fn test_start_or_remove() -> Result<()> {
        let engine = MockEngine::with_faults(|f| {
            f.fail_start.insert("broken".into());
            f.fail_start.insert("stuck".into());
            f.fail_remove.insert("stuck".into());
        });

        let ok = created(&engine, "ok").await?;
        engine.start_or_remove(&ok).await?;
        assert_eq!(engine.node_state(&ok).await?, NodeState::Running);

        let broken = created(&engine, "broken").await?;
        assert!(engine.start_or_remove(&broken).await.is_err());
        assert_eq!(engine.node_state(&broken).await?, NodeState::Removed);

        // A failed removal does not hide the start error.
        let stuck = created(&engine, "stuck").await?;
        let err = engine.start_or_remove(&stuck).await.err().map(|e| e.to_string());
        assert_eq!(err.as_deref(), Some("node stuck failed to start"));
        assert!(engine.calls().contains(&format!("remove {stuck}")));
        assert_eq!(engine.node_state(&stuck).await?, NodeState::Created);
        Ok(())
    }
}
