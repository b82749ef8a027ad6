use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{bail, Context as _};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::config::PortForward;

pub mod bootstrap;
pub mod orchestrator;
pub mod path;
pub mod provision;
pub mod report;

/// The three fixed roles of a topology. `W` sits on the path between `A` and `B`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
pub enum Role {
    A,
    B,
    W,
}

impl Role {
    pub fn is_gateway(&self) -> bool {
        matches!(self, Role::W)
    }

    /// All roles in provisioning order, the gateway first.
    pub fn all() -> impl Iterator<Item = Role> {
        [Role::W, Role::A, Role::B].into_iter()
    }
}

/// Lifecycle state of one node as last observed from the container engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Created,
    Running,
    Paused,
    Restarting,
    Stopped,
    Removed,
}

/// A 48-bit link layer address, as printed by `/sys/class/net/<iface>/address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .with_context(|| format!("Hardware address `{s}` is too short"))?;
            if part.len() != 2 {
                bail!("Invalid octet `{part}` in hardware address `{s}`");
            }
            *octet = u8::from_str_radix(part, 16)
                .with_context(|| format!("Invalid octet `{part}` in hardware address `{s}`"))?;
        }
        if parts.next().is_some() {
            bail!("Hardware address `{s}` is too long");
        }
        if octets == [0u8; 6] {
            bail!("Hardware address `{s}` is unset");
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Packet capture container attached to a node's network namespace.
#[derive(Debug, Clone, Serialize)]
pub struct Sidecar {
    pub id: String,
    pub name: String,
    pub port: u16,
}

/// A provisioned container playing one role.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub role: Role,
    pub name: String,
    pub id: String,
    pub image: String,
    pub address: Ipv4Addr,
    pub state: NodeState,
    /// Name of the interface holding `address`. Unknown until the path enforcer
    /// has located it.
    pub interface: Option<String>,
    pub hardware_address: Option<MacAddr>,
    pub forward_ports: Vec<PortForward>,
    pub capabilities: Vec<String>,
    pub sidecar: Option<Sidecar>,
}

impl Node {
    pub fn is_running(&self) -> bool {
        self.state == NodeState::Running
    }
}
