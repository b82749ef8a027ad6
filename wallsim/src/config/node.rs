use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{bail, Context as _};
use serde::{Deserialize, Serialize};

pub const DEFAULT_IMAGE: &str = "ubuntu:latest";
pub const DEFAULT_WIRESHARK_PORT: u16 = 3000;
pub const DEFAULT_WIRESHARK_IMAGE: &str = "lscr.io/linuxserver/wireshark:latest";

/// Content of `<test>/<ROLE>/config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    #[serde(default = "default_image")]
    pub image: String,

    pub network: NetworkArgs,

    #[serde(default)]
    pub wireshark: WiresharkArgs,

    /// Shell commands run inside the node, in order, after the topology is enforced.
    #[serde(default)]
    pub start_script: Vec<String>,
}

fn default_image() -> String {
    DEFAULT_IMAGE.to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkArgs {
    pub ip: Ipv4Addr,

    #[serde(default)]
    pub forward_ports: Vec<PortForward>,
}

/// Optional packet capture sidecar sharing the node's network namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WiresharkArgs {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_wireshark_port")]
    pub port: u16,

    #[serde(default = "default_wireshark_image")]
    pub image: String,
}

fn default_wireshark_port() -> u16 {
    DEFAULT_WIRESHARK_PORT
}

fn default_wireshark_image() -> String {
    DEFAULT_WIRESHARK_IMAGE.to_owned()
}

impl Default for WiresharkArgs {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_WIRESHARK_PORT,
            image: default_wireshark_image(),
        }
    }
}

/// A host port published to a container port. Written either as a bare port
/// number (`8080`) or as `"<host>:<container>"`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "PortForwardRepr", into = "String")]
pub struct PortForward {
    pub host_port: u16,
    pub container_port: u16,
}

impl PortForward {
    pub fn same(port: u16) -> Self {
        Self {
            host_port: port,
            container_port: port,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortForwardRepr {
    Port(u16),
    Mapping(String),
}

impl TryFrom<PortForwardRepr> for PortForward {
    type Error = anyhow::Error;

    fn try_from(value: PortForwardRepr) -> Result<Self, Self::Error> {
        match value {
            PortForwardRepr::Port(port) => Ok(PortForward::same(port)),
            PortForwardRepr::Mapping(s) => s.parse(),
        }
    }
}

impl FromStr for PortForward {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_port = |p: &str| -> anyhow::Result<u16> {
            let port = p
                .trim()
                .parse::<u16>()
                .with_context(|| format!("Invalid port `{p}` in port forward `{s}`"))?;
            if port == 0 {
                bail!("Port 0 is not allowed in port forward `{s}`");
            }
            Ok(port)
        };

        match s.split_once(':') {
            Some((host, container)) => Ok(Self {
                host_port: parse_port(host)?,
                container_port: parse_port(container)?,
            }),
            None => Ok(Self::same(parse_port(s)?)),
        }
    }
}

impl fmt::Display for PortForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_port, self.container_port)
    }
}

impl From<PortForward> for String {
    fn from(value: PortForward) -> Self {
        value.to_string()
    }
}
