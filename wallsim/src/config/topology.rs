use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::Context as _;
use cidr::Ipv4Cidr;
use serde::{Deserialize, Serialize};

pub const DEFAULT_NETWORK_NAME: &str = "wall_sim_net";
pub const DEFAULT_INTERFACE_NAME: &str = "wall0";
pub const DEFAULT_UPLOAD_PATH: &str = "/";
pub const DEFAULT_WORKDIR: &str = "/start_script";
/// Installs `ip` on Debian or Alpine based images that lack it. Writing
/// sysctls needs no tools.
pub const DEFAULT_TOOLS_COMMAND: &str = "command -v ip >/dev/null 2>&1 \
    || (apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq iproute2) \
    || apk add --no-cache iproute2";

/// Settings shared by every test topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TopologyArgs {
    #[serde(default = "default_network_name")]
    pub network_name: String,

    #[serde(default = "default_subnet")]
    pub subnet: Ipv4Cidr,

    #[serde(default = "default_gateway")]
    pub gateway: Ipv4Addr,

    /// Canonical name the subnet-facing interface gets inside every node.
    #[serde(default = "default_interface_name")]
    pub interface_name: String,

    /// Directory inside the node where the start script archive is unpacked.
    #[serde(default = "default_upload_path")]
    pub upload_path: String,

    /// Working directory for start script commands.
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Tear the topology down when path containment cannot be guaranteed,
    /// instead of keeping it running with containment flagged as missing.
    #[serde(default)]
    pub strict_containment: bool,

    /// Run in every node right after it is created, before the path through W
    /// is enforced. An empty command skips the step.
    #[serde(default = "default_tools_command")]
    pub tools_command: String,
}

fn default_network_name() -> String {
    DEFAULT_NETWORK_NAME.to_owned()
}

#[allow(clippy::expect_used)]
fn default_subnet() -> Ipv4Cidr {
    Ipv4Cidr::new(Ipv4Addr::new(172, 20, 0, 0), 16).expect("constant subnet is a valid cidr")
}

fn default_gateway() -> Ipv4Addr {
    Ipv4Addr::new(172, 20, 0, 1)
}

fn default_interface_name() -> String {
    DEFAULT_INTERFACE_NAME.to_owned()
}

fn default_upload_path() -> String {
    DEFAULT_UPLOAD_PATH.to_owned()
}

fn default_workdir() -> String {
    DEFAULT_WORKDIR.to_owned()
}

fn default_tools_command() -> String {
    DEFAULT_TOOLS_COMMAND.to_owned()
}

impl Default for TopologyArgs {
    fn default() -> Self {
        Self {
            network_name: default_network_name(),
            subnet: default_subnet(),
            gateway: default_gateway(),
            interface_name: default_interface_name(),
            upload_path: default_upload_path(),
            workdir: default_workdir(),
            strict_containment: false,
            tools_command: default_tools_command(),
        }
    }
}

impl TopologyArgs {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open topology file {path:?}"))?;
        let args: Self = serde_yaml::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse topology file {path:?}"))?;
        args.check()?;
        Ok(args)
    }

    pub fn check(&self) -> anyhow::Result<()> {
        if !self.subnet.contains(&self.gateway) {
            anyhow::bail!(
                "Gateway {} is outside of subnet {}",
                self.gateway,
                self.subnet
            );
        }
        // Linux limits interface names to IFNAMSIZ - 1 bytes.
        if self.interface_name.is_empty()
            || self.interface_name.len() > 15
            || self.interface_name.contains(['/', ' '])
        {
            anyhow::bail!("Invalid interface name {:?}", self.interface_name);
        }
        Ok(())
    }

    pub fn prefix_len(&self) -> u8 {
        self.subnet.network_length()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn test_default_topology() -> Result<()> {
        let args = TopologyArgs::default();
        args.check()?;
        assert_eq!(args.subnet.to_string(), "172.20.0.0/16");
        assert_eq!(args.prefix_len(), 16);
        assert_eq!(args.network_name, "wall_sim_net");
        Ok(())
    }

    #[test]
    fn test_partial_override() -> Result<()> {
        let args: TopologyArgs = serde_yaml::from_str(
            "subnet: 10.99.0.0/24\ngateway: 10.99.0.254\ninterface_name: sim0\n",
        )?;
        args.check()?;
        assert_eq!(args.prefix_len(), 24);
        assert_eq!(args.interface_name, "sim0");
        assert_eq!(args.workdir, DEFAULT_WORKDIR);
        assert_eq!(args.tools_command, DEFAULT_TOOLS_COMMAND);

        let args: TopologyArgs = serde_yaml::from_str("tools_command: ''\n")?;
        assert!(args.tools_command.is_empty());
        Ok(())
    }

    #[test]
    fn test_reject_gateway_outside_subnet() -> Result<()> {
        let args: TopologyArgs =
            serde_yaml::from_str("subnet: 10.99.0.0/24\ngateway: 172.20.0.1\n")?;
        assert!(args.check().is_err());

        let args: TopologyArgs = serde_yaml::from_str("interface_name: a-very-long-name0\n")?;
        assert!(args.check().is_err());
        Ok(())
    }
}
