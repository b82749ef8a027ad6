#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use cli::{Cli, GlobalSubcommand, RelayCommand, TopologyOptions};
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wallsim::build;
use wallsim::config::{Endpoint, TopologyArgs};
use wallsim::control_interface::ControlInterface;
use wallsim::relay::{ForwardProxy, TerminatingProxy};
use wallsim::runtime::WallsimRuntime;
use wallsim::{ContainerEngine, DockerEngine, Orchestrator};

mod cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info,tokio_graceful=off,wallsim=info".into()),
            ),
        )
        .init();

    tracing::info!(
        r#"
                 _ _     _
 __      ____ _| | |___(_)_ __ ___
 \ \ /\ / / _` | | / __| | '_ ` _ \
  \ V  V / (_| | | \__ \ | | | | | |
   \_/\_/ \__,_|_|_|___/_|_| |_| |_|  version: v{}  commit: {}  buildtime: {}"#,
        build::PKG_VERSION,
        build::COMMIT_HASH,
        build::BUILD_TIME
    );

    tracing::info!("Current process PID: {}", std::process::id());

    let fut = async {
        match cli.command {
            GlobalSubcommand::Serve(options) => {
                let orchestrator = orchestrator(&options.topology).await?;

                let mut runtime = WallsimRuntime::new();
                runtime.add_service(
                    Box::new(ControlInterface::new(
                        Endpoint {
                            host: Some(options.host),
                            port: options.port,
                        },
                        orchestrator.clone(),
                        runtime.state(),
                    )),
                    tracing::info_span!("control_interface"),
                );
                let served = runtime.serve().await;

                // Leave no nodes behind once the control interface is gone.
                let report = orchestrator.stop().await;
                if !report.is_clean() {
                    tracing::warn!(?report, "Topology was not fully removed");
                }
                served?;
            }
            GlobalSubcommand::Up(options) => {
                let orchestrator = orchestrator(&options.topology).await?;

                let summary = orchestrator
                    .start(&options.test_name)
                    .await
                    .with_context(|| format!("Failed to start test {}", options.test_name))?;
                println!("{}", serde_json::to_string_pretty(&summary)?);

                tracing::info!("Topology is up, press Ctrl-C to tear it down");
                tokio_graceful::default_signal().await;

                let report = orchestrator.stop().await;
                if !report.is_clean() {
                    tracing::warn!(?report, "Topology was not fully removed");
                }
            }
            GlobalSubcommand::Relay(command) => {
                let mut runtime = WallsimRuntime::new();
                match command {
                    RelayCommand::Forward { listen, next_hop } => {
                        tracing::info!(%listen, %next_hop, "Starting forward proxy");
                        runtime.add_service(
                            Box::new(ForwardProxy::new(listen, next_hop)),
                            tracing::info_span!("forward_proxy"),
                        );
                    }
                    RelayCommand::Terminate { listen } => {
                        tracing::info!(%listen, "Starting terminating proxy");
                        runtime.add_service(
                            Box::new(TerminatingProxy::new(listen)),
                            tracing::info_span!("terminating_proxy"),
                        );
                    }
                }
                runtime.serve().await?;
            }
        }

        tracing::info!("Gracefully exit now");
        Ok::<_, anyhow::Error>(())
    };

    if let Err(error) = fut.await {
        tracing::error!(error = format!("{error:#}"));
        std::process::exit(1);
    }
}

async fn orchestrator(options: &TopologyOptions) -> anyhow::Result<Arc<Orchestrator>> {
    let topology_args = match &options.topology_file {
        Some(path) => {
            tracing::info!("Loading topology settings from: {path:?}");
            TopologyArgs::load(path)?
        }
        None => TopologyArgs::default(),
    };
    tracing::debug!("Topology settings: {topology_args:#?}");

    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerEngine::connect().await?);
    Ok(Arc::new(Orchestrator::new(
        engine,
        options.base_dir.clone(),
        topology_args,
    )))
}
