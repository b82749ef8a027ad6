use std::collections::HashMap;
use std::net::Ipv4Addr;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions, UploadToContainerOptions,
    },
    errors::Error as DockerError,
    exec::{CreateExecOptions, StartExecResults},
    network::{ConnectNetworkOptions, CreateNetworkOptions},
    secret::{
        ContainerStateStatusEnum, EndpointIpamConfig, EndpointSettings, HostConfig, Ipam,
        IpamConfig, PortBinding,
    },
    Docker,
};
use futures::StreamExt as _;

use super::{ContainerEngine, ExecOutput, NetworkSpec, NodeSpec, SidecarSpec};
use crate::topology::NodeState;

/// Seconds the engine waits for a node to exit before killing it.
const STOP_TIMEOUT_SECS: i64 = 2;

/// [`ContainerEngine`] backed by a local Docker daemon.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub async fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker")?;
        let version = docker.version().await.context("Docker ping failed")?;
        tracing::info!(
            version = version.version.as_deref().unwrap_or("unknown"),
            "Connected to container engine"
        );
        Ok(Self { docker })
    }
}

fn is_not_found(e: &DockerError) -> bool {
    matches!(
        e,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Stop/remove on an object which is already gone, or already stopped, is not an error.
fn tolerate_absent(result: Result<(), DockerError>) -> Result<(), DockerError> {
    match result {
        Err(DockerError::DockerResponseServerError {
            status_code: 304 | 404,
            ..
        }) => Ok(()),
        other => other,
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            driver: "bridge".to_string(),
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(spec.subnet.to_string()),
                    gateway: Some(spec.gateway.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            options: HashMap::from([(
                "com.docker.network.bridge.enable_icc".to_string(),
                "true".to_string(),
            )]),
            ..Default::default()
        };

        let response = self
            .docker
            .create_network(options)
            .await
            .with_context(|| format!("Failed to create network {}", spec.name))?;
        tracing::info!(network = %spec.name, id = %response.id, subnet = %spec.subnet, "Network created");
        Ok(response.id)
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        tolerate_absent(self.docker.remove_network(name).await)
            .with_context(|| format!("Failed to remove network {name}"))
    }

    async fn create_node(&self, spec: &NodeSpec) -> Result<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for forward in &spec.forward_ports {
            let key = format!("{}/tcp", forward.container_port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(forward.host_port.to_string()),
                }]),
            );
        }

        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.name.clone()),
            cmd: Some(spec.command.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                cap_add: Some(spec.cap_add.clone()),
                port_bindings: Some(port_bindings),
                sysctls: (!spec.sysctls.is_empty()).then(|| spec.sysctls.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let id = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .with_context(|| format!("Failed to create node {} from {}", spec.name, spec.image))?
            .id;
        Ok(id)
    }

    async fn connect_node(&self, network: &str, node_id: &str, address: Ipv4Addr) -> Result<()> {
        self.docker
            .connect_network(
                network,
                ConnectNetworkOptions {
                    container: node_id.to_string(),
                    endpoint_config: EndpointSettings {
                        ipam_config: Some(EndpointIpamConfig {
                            ipv4_address: Some(address.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                },
            )
            .await
            .with_context(|| format!("Failed to attach {node_id} to {network} as {address}"))
    }

    async fn start_node(&self, node_id: &str) -> Result<()> {
        self.docker
            .start_container(node_id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("Failed to start {node_id}"))
    }

    async fn stop_node(&self, node_id: &str) -> Result<()> {
        tolerate_absent(
            self.docker
                .stop_container(
                    node_id,
                    Some(StopContainerOptions {
                        t: STOP_TIMEOUT_SECS,
                    }),
                )
                .await,
        )
        .with_context(|| format!("Failed to stop {node_id}"))
    }

    async fn remove_node(&self, node_id: &str) -> Result<()> {
        tolerate_absent(
            self.docker
                .remove_container(
                    node_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await,
        )
        .with_context(|| format!("Failed to remove {node_id}"))
    }

    async fn exec(&self, node_id: &str, cmd: &[String], workdir: Option<&str>) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                node_id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: workdir.map(str::to_owned),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("Failed to create exec in {node_id}"))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .with_context(|| format!("Failed to start exec in {node_id}"))?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = started {
            while let Some(msg) = stream.next().await {
                match msg.context("Failed to read exec output")? {
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message } => {
                        output.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .with_context(|| format!("Failed to inspect exec in {node_id}"))?;
        let exit_code = inspect
            .exit_code
            .with_context(|| format!("Exec in {node_id} finished without an exit code"))?;

        Ok(ExecOutput { exit_code, output })
    }

    async fn upload_archive(&self, node_id: &str, path: &str, archive: Vec<u8>) -> Result<()> {
        self.docker
            .upload_to_container(
                node_id,
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .with_context(|| format!("Failed to upload archive to {node_id}:{path}"))
    }

    async fn node_state(&self, node_id: &str) -> Result<NodeState> {
        let info = match self.docker.inspect_container(node_id, None).await {
            Ok(info) => info,
            Err(e) if is_not_found(&e) => return Ok(NodeState::Removed),
            Err(e) => return Err(e).with_context(|| format!("Failed to inspect {node_id}")),
        };

        let state = match info.state.and_then(|s| s.status) {
            Some(ContainerStateStatusEnum::CREATED) => NodeState::Created,
            Some(ContainerStateStatusEnum::RUNNING) => NodeState::Running,
            Some(ContainerStateStatusEnum::PAUSED) => NodeState::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => NodeState::Restarting,
            Some(ContainerStateStatusEnum::REMOVING) => NodeState::Removed,
            Some(
                ContainerStateStatusEnum::EXITED
                | ContainerStateStatusEnum::DEAD
                | ContainerStateStatusEnum::EMPTY,
            )
            | None => NodeState::Stopped,
        };
        Ok(state)
    }

    async fn run_sidecar(&self, spec: &SidecarSpec) -> Result<String> {
        let config = Config {
            image: Some(spec.image.clone()),
            host_config: Some(HostConfig {
                cap_add: Some(spec.cap_add.clone()),
                network_mode: Some(format!("container:{}", spec.target_id)),
                ..Default::default()
            }),
            ..Default::default()
        };

        let id = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .with_context(|| format!("Failed to create sidecar {}", spec.name))?
            .id;

        self.start_or_remove(&id)
            .await
            .with_context(|| format!("Failed to start sidecar {}", spec.name))?;
        Ok(id)
    }
}
