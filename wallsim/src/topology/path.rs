//! Forces all A <-> B traffic through W.
//!
//! Every node gets its subnet interface pinned to one canonical name, static
//! neighbor entries for the peers it talks to, and on A and B a host route to
//! the other end via W. W forwards packets and must not send ICMP redirects,
//! otherwise A and B would learn the direct path.

use std::net::Ipv4Addr;

use anyhow::{anyhow, bail, Context as _, Result};
use serde::Serialize;
use tracing::Instrument as _;

use super::report::StepReport;
use super::{MacAddr, Node, Role};
use crate::engine::ContainerEngine;
use crate::error::WallsimError;

const LIST_ADDRESSES: &str = "ip -o -4 addr show";
const SHOW_DEFAULT_ROUTE: &str = "ip -4 route show default";
const DISABLE_ALL_REDIRECTS: &str =
    "for f in /proc/sys/net/ipv4/conf/*/send_redirects; do echo 0 > \"$f\" || exit 1; done";

/// Sysctls hardening the gateway node. Applied in this order.
pub fn hardening_sysctls(interface: Option<&str>) -> Vec<(String, &'static str)> {
    let mut settings = vec![
        ("net.ipv4.ip_forward".to_string(), "1"),
        ("net.ipv4.conf.all.send_redirects".to_string(), "0"),
        ("net.ipv4.conf.default.send_redirects".to_string(), "0"),
    ];
    if let Some(interface) = interface {
        settings.push((format!("net.ipv4.conf.{interface}.send_redirects"), "0"));
    }
    settings
}

/// Shell snippet setting one sysctl through `/proc/sys`.
fn write_sysctl(key: &str, value: &str) -> String {
    format!("echo {value} > /proc/sys/{}", key.replace('.', "/"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NeighborEntry {
    pub on: Role,
    pub peer: Ipv4Addr,
    pub hardware_address: MacAddr,
    pub interface: String,
}

impl NeighborEntry {
    fn command(&self) -> String {
        format!(
            "ip neigh replace {} lladdr {} dev {} nud permanent",
            self.peer, self.hardware_address, self.interface
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub on: Role,
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    pub via: Ipv4Addr,
    pub interface: String,
}

impl RouteEntry {
    fn command(&self) -> String {
        format!(
            "ip route replace {}/{} via {} dev {}",
            self.destination, self.prefix_len, self.via, self.interface
        )
    }

    /// The route must win over the connected subnet route by longest prefix match.
    pub fn check_overrides(&self, subnet_prefix_len: u8) -> Result<()> {
        if self.prefix_len <= subnet_prefix_len {
            bail!(
                "route to {}/{} on {} would not override the /{} subnet route",
                self.destination,
                self.prefix_len,
                self.on,
                subnet_prefix_len
            );
        }
        Ok(())
    }
}

/// The resolved facts of one node the plan is built from.
#[derive(Debug, Clone)]
pub struct PinnedNode {
    pub role: Role,
    pub address: Ipv4Addr,
    pub hardware_address: MacAddr,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnforcementPlan {
    pub neighbors: Vec<NeighborEntry>,
    pub routes: Vec<RouteEntry>,
}

impl EnforcementPlan {
    /// A learns W, B learns W, W learns A and B. A reaches B via W and the other
    /// way around.
    pub fn build(
        w: &PinnedNode,
        a: &PinnedNode,
        b: &PinnedNode,
        interface: &str,
        subnet_prefix_len: u8,
    ) -> Result<Self> {
        let neighbor = |on: Role, peer: &PinnedNode| NeighborEntry {
            on,
            peer: peer.address,
            hardware_address: peer.hardware_address,
            interface: interface.to_owned(),
        };
        let route = |on: Role, destination: &PinnedNode| RouteEntry {
            on,
            destination: destination.address,
            prefix_len: 32,
            via: w.address,
            interface: interface.to_owned(),
        };

        let plan = Self {
            neighbors: vec![
                neighbor(Role::A, w),
                neighbor(Role::B, w),
                neighbor(Role::W, a),
                neighbor(Role::W, b),
            ],
            routes: vec![route(Role::A, b), route(Role::B, a)],
        };
        for route in &plan.routes {
            route.check_overrides(subnet_prefix_len)?;
        }
        Ok(plan)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnforcementReport {
    pub plan: EnforcementPlan,
}

pub struct PathEnforcer<'a> {
    engine: &'a dyn ContainerEngine,
    interface_name: &'a str,
    subnet_prefix_len: u8,
}

impl<'a> PathEnforcer<'a> {
    pub fn new(engine: &'a dyn ContainerEngine, interface_name: &'a str, subnet_prefix_len: u8) -> Self {
        Self {
            engine,
            interface_name,
            subnet_prefix_len,
        }
    }

    /// Make sure the node has the tools enforcement relies on. The command is
    /// expected to be a no-op when they are already installed.
    pub async fn ensure_tools(&self, node: &Node, command: &str) -> Result<()> {
        run_checked(self.engine, node, command)
            .await
            .with_context(|| format!("Failed to install network tools on {}", node.name))?;
        Ok(())
    }

    /// Enable forwarding on the gateway node and stop it from advertising the
    /// direct path. Every setting is attempted, failures are only reported.
    ///
    /// Settings are written to `/proc/sys` so no userland tools are needed.
    /// If the subnet interface cannot be located, redirects are switched off
    /// on every interface instead.
    pub async fn harden(&self, gateway: &Node) -> StepReport {
        let mut report = StepReport::default();

        let interface = match &gateway.interface {
            Some(interface) => Some(interface.clone()),
            None => report.check(
                "locate interface",
                self.locate_interface(gateway).await,
            ),
        };

        for (key, value) in hardening_sysctls(interface.as_deref()) {
            let result = run_checked(self.engine, gateway, &write_sysctl(&key, value)).await;
            report.check(format!("sysctl {key}"), result);
        }
        if interface.is_none() {
            let result = run_checked(self.engine, gateway, DISABLE_ALL_REDIRECTS).await;
            report.check("sysctl net.ipv4.conf.*.send_redirects", result);
        }
        report
    }

    /// Find the interface holding the node's subnet address, rename it to the
    /// canonical name and read its hardware address.
    pub async fn pin_interface(&self, node: &mut Node) -> Result<MacAddr> {
        let current = self.locate_interface(node).await?;
        let target = self.interface_name;

        if current != target {
            let default_route = run_checked(self.engine, node, SHOW_DEFAULT_ROUTE).await?;
            let default_via = default_route_via(&default_route, &current);

            run_checked(
                self.engine,
                node,
                &format!(
                    "ip link set dev {current} down && ip link set dev {current} name {target} && ip link set dev {target} up"
                ),
            )
            .await
            .with_context(|| format!("Failed to rename {current} to {target}"))?;

            // Taking the link down dropped the default route if it used it.
            if let Some(via) = default_via {
                run_checked(
                    self.engine,
                    node,
                    &format!("ip route replace default via {via} dev {target}"),
                )
                .await
                .context("Failed to restore default route")?;
            }
            tracing::debug!(from = %current, to = %target, "Interface renamed");
        }
        node.interface = Some(target.to_owned());

        let raw = run_checked(
            self.engine,
            node,
            &format!("cat /sys/class/net/{target}/address"),
        )
        .await
        .context("Failed to read hardware address")?;
        let mac: MacAddr = raw.parse()?;
        node.hardware_address = Some(mac);
        Ok(mac)
    }

    /// Pin every node, then install neighbor entries followed by host routes.
    /// Returns `EnforcementIncomplete` if any node has no hardware address, in
    /// which case nothing is installed.
    pub async fn enforce(
        &self,
        w: &mut Node,
        a: &mut Node,
        b: &mut Node,
    ) -> Result<EnforcementReport, WallsimError> {
        let mut missing = vec![];
        let mut pinned = vec![];
        for node in [&mut *w, &mut *a, &mut *b] {
            let span = tracing::info_span!("pin", role = %node.role);
            match self.pin_interface(node).instrument(span).await {
                Ok(mac) => pinned.push(PinnedNode {
                    role: node.role,
                    address: node.address,
                    hardware_address: mac,
                }),
                Err(e) => {
                    tracing::error!(role = %node.role, error = ?e, "Failed to pin interface");
                    missing.push(node.role);
                }
            }
        }
        let [pw, pa, pb] = match <[PinnedNode; 3]>::try_from(pinned) {
            Ok(pinned) if missing.is_empty() => pinned,
            _ => return Err(WallsimError::EnforcementIncomplete { missing }),
        };

        let plan = EnforcementPlan::build(&pw, &pa, &pb, self.interface_name, self.subnet_prefix_len)
            .map_err(|source| WallsimError::Enforcement {
                role: Role::W,
                source,
            })?;

        let (w, a, b): (&Node, &Node, &Node) = (w, a, b);

        for entry in &plan.neighbors {
            run_checked(self.engine, node_for(entry.on, w, a, b), &entry.command())
                .await
                .map_err(|source| WallsimError::Enforcement {
                    role: entry.on,
                    source,
                })?;
        }
        for entry in &plan.routes {
            run_checked(self.engine, node_for(entry.on, w, a, b), &entry.command())
                .await
                .map_err(|source| WallsimError::Enforcement {
                    role: entry.on,
                    source,
                })?;
        }

        tracing::info!(
            neighbors = plan.neighbors.len(),
            routes = plan.routes.len(),
            "Path through W enforced"
        );
        Ok(EnforcementReport { plan })
    }

    async fn locate_interface(&self, node: &Node) -> Result<String> {
        let listing = run_checked(self.engine, node, LIST_ADDRESSES).await?;
        interface_holding(&listing, node.address).ok_or_else(|| {
            anyhow!(
                "no interface holds {} on {}",
                node.address,
                node.name
            )
        })
    }
}

fn node_for<'n>(role: Role, w: &'n Node, a: &'n Node, b: &'n Node) -> &'n Node {
    match role {
        Role::A => a,
        Role::B => b,
        Role::W => w,
    }
}

/// Run a shell snippet in the node, failing on a non-zero exit.
async fn run_checked(engine: &dyn ContainerEngine, node: &Node, script: &str) -> Result<String> {
    let output = engine.exec_shell(&node.id, script, None).await?;
    if !output.success() {
        bail!(
            "`{script}` exited with {}: {}",
            output.exit_code,
            output.output.trim()
        );
    }
    Ok(output.output)
}

/// Pick the interface name out of `ip -o -4 addr show` output.
fn interface_holding(listing: &str, address: Ipv4Addr) -> Option<String> {
    listing.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let _index = fields.next()?;
        let name = fields.next()?;
        let mut fields = fields.skip_while(|f| *f != "inet");
        fields.next()?;
        let cidr = fields.next()?;
        let addr: Ipv4Addr = cidr.split('/').next()?.parse().ok()?;
        (addr == address).then(|| name.split('@').next().unwrap_or(name).to_owned())
    })
}

/// The gateway of a default route going out through `interface`, if any.
fn default_route_via(routes: &str, interface: &str) -> Option<Ipv4Addr> {
    routes.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let dev = fields.iter().position(|f| *f == "dev")?;
        if fields.get(dev + 1) != Some(&interface) {
            return None;
        }
        let via = fields.iter().position(|f| *f == "via")?;
        fields.get(via + 1)?.parse().ok()
    })
}
