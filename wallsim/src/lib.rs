#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use shadow_rs::shadow;

pub mod config;
pub mod control_interface;
pub mod engine;
pub mod error;
pub mod relay;
pub mod runtime;
pub mod service;
pub mod state;
pub mod topology;

shadow!(build);

pub(crate) const HTTP_RESPONSE_SERVER_HEADER: &str =
    const_format::concatcp!("wallsim/", crate::build::PKG_VERSION);

pub use crate::engine::{docker::DockerEngine, ContainerEngine};
pub use crate::error::WallsimError;
pub use crate::topology::orchestrator::Orchestrator;
pub use crate::topology::Role;
