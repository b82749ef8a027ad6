use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use wallsim::build::CLAP_LONG_VERSION;
use wallsim::relay::RelayEndpoint;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[clap(long_version = CLAP_LONG_VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: GlobalSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum GlobalSubcommand {
    /// Serve the control interface in front of one topology orchestrator.
    #[command(name = "serve")]
    Serve(ServeOptions),

    /// Start one test topology and keep it up until interrupted.
    #[command(name = "up")]
    Up(UpOptions),

    /// Run one side of the relay chain.
    #[command(name = "relay", subcommand)]
    Relay(RelayCommand),
}

#[derive(Parser, Debug)]
pub struct TopologyOptions {
    /// Directory holding `testee/<test>/<role>/config.yaml`.
    #[arg(long, default_value = ".")]
    pub base_dir: PathBuf,

    /// YAML file overriding the network settings of the topology.
    #[arg(long)]
    pub topology_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct ServeOptions {
    #[command(flatten)]
    pub topology: TopologyOptions,

    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    #[arg(short, long, default_value_t = 5000)]
    pub port: u16,
}

#[derive(Parser, Debug)]
pub struct UpOptions {
    pub test_name: String,

    #[command(flatten)]
    pub topology: TopologyOptions,
}

#[derive(Subcommand, Debug)]
pub enum RelayCommand {
    /// Tunnel every local connection to a fixed next hop.
    Forward {
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], wallsim::relay::DEFAULT_FORWARD_PORT)))]
        listen: SocketAddr,

        #[arg(long, default_value = wallsim::relay::DEFAULT_NEXT_HOP)]
        next_hop: RelayEndpoint,
    },
    /// Resolve the destination from the first request line and relay to it.
    Terminate {
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], wallsim::relay::DEFAULT_TERMINATE_PORT)))]
        listen: SocketAddr,
    },
}
