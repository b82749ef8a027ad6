use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator as _;

use crate::error::{AddressError, WallsimError};
use crate::topology::Role;

pub mod node;
pub mod topology;

pub use node::{NetworkArgs, NodeConfig, PortForward, WiresharkArgs};
pub use topology::TopologyArgs;

/// Directory under the base dir that holds one sub directory per test.
pub const TESTEE_DIR: &str = "testee";
/// Name of the per-role config file inside `<test>/<ROLE>/`.
pub const NODE_CONFIG_FILE: &str = "config.yaml";
/// Name of the per-role directory shipped into the node by the bootstrap runner.
pub const START_SCRIPT_DIR: &str = "start_script";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub port: u16,
}

/// Everything needed to bring up one test topology.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSpec {
    pub name: String,
    pub dir: PathBuf,
    pub a: NodeConfig,
    pub b: NodeConfig,
    pub w: NodeConfig,
}

impl TestSpec {
    /// Load `<base_dir>/testee/<test_name>/{A,B,W}/config.yaml`. Fails with
    /// `ConfigurationMissing` as soon as one role has no config file.
    pub fn load(base_dir: &Path, test_name: &str) -> Result<Self, WallsimError> {
        if test_name.is_empty() || test_name.contains(['/', '\\']) || test_name == ".." {
            return Err(WallsimError::ConfigurationInvalid(anyhow::anyhow!(
                "invalid test name {test_name:?}"
            )));
        }

        let dir = base_dir.join(TESTEE_DIR).join(test_name);

        let load_role = |role: Role| -> Result<NodeConfig, WallsimError> {
            let path = dir.join(role.to_string()).join(NODE_CONFIG_FILE);
            if !path.is_file() {
                return Err(WallsimError::ConfigurationMissing { role, path });
            }
            tracing::debug!(%role, ?path, "Loading node config");
            let file = File::open(&path)
                .with_context(|| format!("Failed to open {path:?}"))
                .map_err(WallsimError::ConfigurationInvalid)?;
            serde_yaml::from_reader(BufReader::new(file))
                .with_context(|| format!("Failed to parse {path:?}"))
                .map_err(WallsimError::ConfigurationInvalid)
        };

        let w = load_role(Role::W)?;
        let a = load_role(Role::A)?;
        let b = load_role(Role::B)?;

        Ok(Self {
            name: test_name.to_owned(),
            dir,
            a,
            b,
            w,
        })
    }

    pub fn node(&self, role: Role) -> &NodeConfig {
        match role {
            Role::A => &self.a,
            Role::B => &self.b,
            Role::W => &self.w,
        }
    }

    /// Directory whose content is uploaded into the node of `role`.
    pub fn script_dir(&self, role: Role) -> PathBuf {
        self.dir.join(role.to_string()).join(START_SCRIPT_DIR)
    }

    /// All three addresses must lie inside the subnet, be pairwise distinct, and
    /// must not take the subnet's own gateway address.
    pub fn validate(&self, topology: &TopologyArgs) -> Result<(), AddressError> {
        let mut seen: Vec<(Role, std::net::Ipv4Addr)> = vec![];
        for role in Role::iter() {
            let addr = self.node(role).network.ip;
            if !topology.subnet.contains(&addr) {
                return Err(AddressError::OutsideSubnet {
                    role,
                    addr,
                    subnet: topology.subnet.to_string(),
                });
            }
            if addr == topology.gateway {
                return Err(AddressError::GatewayCollision { role, addr });
            }
            if let Some((first, _)) = seen.iter().find(|(_, other)| *other == addr) {
                return Err(AddressError::Duplicated {
                    addr,
                    first: *first,
                    second: role,
                });
            }
            seen.push((role, addr));
        }
        Ok(())
    }
}

/// Names of all test directories under `<base_dir>/testee`, sorted.
pub fn list_tests(base_dir: &Path) -> anyhow::Result<Vec<String>> {
    let testee_dir = base_dir.join(TESTEE_DIR);
    let mut tests = vec![];
    for entry in std::fs::read_dir(&testee_dir)
        .with_context(|| format!("Failed to list tests in {testee_dir:?}"))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            tests.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    tests.sort();
    Ok(tests)
}
