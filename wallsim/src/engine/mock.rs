//! In-memory engine used by the topology tests. It models just enough of a
//! node's network stack to answer the commands the path enforcer issues.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use super::{ContainerEngine, ExecOutput, NetworkSpec, NodeSpec, SidecarSpec};
use crate::topology::NodeState;

#[derive(Debug, Clone)]
pub struct MockNode {
    pub name: String,
    pub spec: Option<NodeSpec>,
    pub address: Option<Ipv4Addr>,
    pub interface: String,
    pub mac: String,
    pub state: NodeState,
    pub neighbors: Vec<String>,
    pub routes: Vec<String>,
    pub uploads: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
pub struct MockFaults {
    pub fail_network: bool,
    pub fail_create: HashSet<String>,
    pub fail_connect: HashSet<String>,
    pub fail_upload: HashSet<String>,
    pub fail_start: HashSet<String>,
    pub fail_remove: HashSet<String>,
    pub fail_state: bool,
    /// Node names whose subnet interface exposes no hardware address.
    pub hide_mac: HashSet<String>,
    /// Node names that lose their default route when the subnet interface goes down.
    pub default_route_on_subnet: HashSet<String>,
    /// Script substrings mapped to the exit code they should produce.
    pub failing_commands: HashMap<String, i64>,
}

#[derive(Default)]
struct Inner {
    calls: Vec<String>,
    networks: HashSet<String>,
    nodes: BTreeMap<String, MockNode>,
    next_mac: u8,
}

#[derive(Default)]
pub struct MockEngine {
    inner: Mutex<Inner>,
    pub faults: Mutex<MockFaults>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(f: impl FnOnce(&mut MockFaults)) -> Self {
        let engine = Self::default();
        if let Ok(mut faults) = engine.faults.lock() {
            f(&mut faults);
        }
        engine
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("mock engine poisoned"))
    }

    fn faults(&self) -> Result<std::sync::MutexGuard<'_, MockFaults>> {
        self.faults.lock().map_err(|_| anyhow!("mock engine poisoned"))
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().map(|i| i.calls.clone()).unwrap_or_default()
    }

    pub fn node(&self, name: &str) -> Option<MockNode> {
        self.lock().ok()?.nodes.get(&id_of(name)).cloned()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.lock()
            .map(|i| i.nodes.values().map(|n| n.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.lock().map(|i| i.networks.contains(name)).unwrap_or(false)
    }

    /// Simulate a node dying behind the orchestrator's back.
    pub fn set_state(&self, name: &str, state: NodeState) {
        if let Ok(mut inner) = self.lock() {
            if let Some(node) = inner.nodes.get_mut(&id_of(name)) {
                node.state = state;
            }
        }
    }
}

fn id_of(name: &str) -> String {
    format!("id-{name}")
}

impl MockNode {
    fn run(&mut self, script: &str, faults: &MockFaults) -> ExecOutput {
        if let Some((_, code)) = faults
            .failing_commands
            .iter()
            .find(|(pattern, _)| script.contains(pattern.as_str()))
        {
            return ExecOutput::new(*code, format!("{script}: failed"));
        }

        if script == "ip -o -4 addr show" {
            let mut out =
                "1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever\n"
                    .to_string();
            out.push_str(
                "2: eth0    inet 172.17.0.5/16 brd 172.17.255.255 scope global eth0\\       valid_lft forever preferred_lft forever\n",
            );
            if let Some(address) = self.address {
                out.push_str(&format!(
                    "3: {iface}    inet {address}/16 brd 172.20.255.255 scope global {iface}\\       valid_lft forever preferred_lft forever\n",
                    iface = self.interface
                ));
            }
            return ExecOutput::new(0, out);
        }

        if script == "ip -4 route show default" {
            let out = if faults.default_route_on_subnet.contains(&self.name) {
                format!("default via 172.20.0.1 dev {} \n", self.interface)
            } else {
                "default via 172.17.0.1 dev eth0 \n".to_string()
            };
            return ExecOutput::new(0, out);
        }

        if script.starts_with("ip link set dev") {
            if let Some(new_name) = script
                .split(" && ")
                .filter_map(|step| step.split_once(" name "))
                .map(|(_, name)| name.trim().to_string())
                .next()
            {
                self.interface = new_name;
            }
            return ExecOutput::new(0, "");
        }

        if let Some(rest) = script.strip_prefix("cat /sys/class/net/") {
            let iface = rest.trim_end_matches("/address");
            if iface == self.interface && !faults.hide_mac.contains(&self.name) {
                return ExecOutput::new(0, format!("{}\n", self.mac));
            }
            return ExecOutput::new(
                1,
                format!("cat: /sys/class/net/{iface}/address: No such file or directory\n"),
            );
        }

        if script.starts_with("ip neigh replace") {
            self.neighbors.push(script.to_string());
            return ExecOutput::new(0, "");
        }

        if script.starts_with("ip route replace") {
            self.routes.push(script.to_string());
            return ExecOutput::new(0, "");
        }

        ExecOutput::new(0, format!("ran: {script}\n"))
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let fail = self.faults()?.fail_network;
        let mut inner = self.lock()?;
        inner.calls.push(format!("create_network {}", spec.name));
        if fail || inner.networks.contains(&spec.name) {
            bail!("network {} cannot be created", spec.name);
        }
        inner.networks.insert(spec.name.clone());
        Ok(format!("net-{}", spec.name))
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.calls.push(format!("remove_network {name}"));
        inner.networks.remove(name);
        Ok(())
    }

    async fn create_node(&self, spec: &NodeSpec) -> Result<String> {
        let fail = self.faults()?.fail_create.contains(&spec.name);
        let mut inner = self.lock()?;
        inner.calls.push(format!("create_node {}", spec.name));
        if fail {
            bail!("image {} unavailable", spec.image);
        }
        let id = id_of(&spec.name);
        if inner.nodes.contains_key(&id) {
            bail!("name {} already in use", spec.name);
        }
        inner.next_mac += 1;
        let mac = format!("02:42:ac:14:00:{:02x}", inner.next_mac);
        inner.nodes.insert(
            id.clone(),
            MockNode {
                name: spec.name.clone(),
                spec: Some(spec.clone()),
                address: None,
                interface: "eth1".to_string(),
                mac,
                state: NodeState::Created,
                neighbors: vec![],
                routes: vec![],
                uploads: vec![],
            },
        );
        Ok(id)
    }

    async fn connect_node(&self, network: &str, node_id: &str, address: Ipv4Addr) -> Result<()> {
        let fail = {
            let faults = self.faults()?;
            let inner = self.lock()?;
            inner
                .nodes
                .get(node_id)
                .map(|n| faults.fail_connect.contains(&n.name))
                .unwrap_or(false)
        };
        let mut inner = self.lock()?;
        inner.calls.push(format!("connect {node_id} {address}"));
        if fail || !inner.networks.contains(network) {
            bail!("cannot attach {node_id} to {network}");
        }
        if inner.nodes.values().any(|n| n.address == Some(address)) {
            bail!("address {address} already in use");
        }
        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| anyhow!("no such node {node_id}"))?;
        node.address = Some(address);
        Ok(())
    }

    async fn start_node(&self, node_id: &str) -> Result<()> {
        let faults = self.faults()?;
        let mut inner = self.lock()?;
        inner.calls.push(format!("start {node_id}"));
        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| anyhow!("no such node {node_id}"))?;
        if faults.fail_start.contains(&node.name) {
            bail!("node {} failed to start", node.name);
        }
        node.state = NodeState::Running;
        Ok(())
    }

    async fn stop_node(&self, node_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner.calls.push(format!("stop {node_id}"));
        if let Some(node) = inner.nodes.get_mut(node_id) {
            node.state = NodeState::Stopped;
        }
        Ok(())
    }

    async fn remove_node(&self, node_id: &str) -> Result<()> {
        let faults = self.faults()?;
        let mut inner = self.lock()?;
        inner.calls.push(format!("remove {node_id}"));
        let name = inner.nodes.get(node_id).map(|n| n.name.clone());
        if name.is_some_and(|name| faults.fail_remove.contains(&name)) {
            bail!("node {node_id} is busy");
        }
        inner.nodes.remove(node_id);
        Ok(())
    }

    async fn exec(&self, node_id: &str, cmd: &[String], _workdir: Option<&str>) -> Result<ExecOutput> {
        let script = match cmd {
            [sh, c, script] if sh == "sh" && c == "-c" => script.clone(),
            _ => cmd.join(" "),
        };
        let faults = self.faults()?;
        let mut inner = self.lock()?;
        inner.calls.push(format!("exec {node_id}: {script}"));
        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| anyhow!("no such node {node_id}"))?;
        if node.state != NodeState::Running {
            bail!("node {node_id} is not running");
        }
        Ok(node.run(&script, &faults))
    }

    async fn upload_archive(&self, node_id: &str, path: &str, archive: Vec<u8>) -> Result<()> {
        let faults = self.faults()?;
        let mut inner = self.lock()?;
        inner.calls.push(format!("upload {node_id} {path}"));
        let node = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| anyhow!("no such node {node_id}"))?;
        if faults.fail_upload.contains(&node.name) {
            bail!("upload to {node_id} rejected");
        }
        node.uploads.push((path.to_string(), archive));
        Ok(())
    }

    async fn node_state(&self, node_id: &str) -> Result<NodeState> {
        if self.faults()?.fail_state {
            bail!("engine unreachable");
        }
        let inner = self.lock()?;
        Ok(inner
            .nodes
            .get(node_id)
            .map(|n| n.state)
            .unwrap_or(NodeState::Removed))
    }

    async fn run_sidecar(&self, spec: &SidecarSpec) -> Result<String> {
        let mut inner = self.lock()?;
        inner
            .calls
            .push(format!("sidecar {} -> {}", spec.name, spec.target_id));
        let id = id_of(&spec.name);
        inner.nodes.insert(
            id.clone(),
            MockNode {
                name: spec.name.clone(),
                spec: None,
                address: None,
                interface: "eth0".to_string(),
                mac: "02:42:ac:14:00:ff".to_string(),
                state: NodeState::Running,
                neighbors: vec![],
                routes: vec![],
                uploads: vec![],
            },
        );
        Ok(id)
    }
}
