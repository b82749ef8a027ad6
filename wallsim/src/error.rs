use std::net::Ipv4Addr;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::Role;

#[derive(Error, Debug)]
pub enum WallsimError {
    #[error("Configuration for {role} not found at {path:?}")]
    ConfigurationMissing { role: Role, path: PathBuf },

    #[error("Invalid configuration: {0:#}")]
    ConfigurationInvalid(#[source] anyhow::Error),

    #[error("Failed to provision node {role} during {step}: {source:#}")]
    Provision {
        role: Role,
        step: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to create virtual subnet: {0:#}")]
    SubnetCreation(#[source] anyhow::Error),

    #[error("Path enforcement incomplete, no hardware address resolved for {missing:?}")]
    EnforcementIncomplete { missing: Vec<Role> },

    #[error("Failed to install route state on {role}: {source:#}")]
    Enforcement {
        role: Role,
        #[source]
        source: anyhow::Error,
    },

    #[error("Bootstrap command `{command}` on {role} exited with code {exit_code}")]
    BootstrapCommandFailed {
        role: Role,
        command: String,
        exit_code: i64,
    },

    #[error("Failed to upload bootstrap archive to {role}: {source:#}")]
    BootstrapUploadFailed {
        role: Role,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    RelayConnection(#[from] RelayConnectionError),

    #[error("Container engine error: {0:#}")]
    Engine(#[from] anyhow::Error),

    #[error("Node {0} is not running")]
    NotRunning(Role),
}

/// Failures scoped to a single relayed connection. They close that connection only.
#[derive(Error, Debug)]
pub enum RelayConnectionError {
    #[error("Client closed the connection before sending a request")]
    EmptyRequest,

    #[error("Malformed request line: {0}")]
    MalformedRequestLine(String),

    #[error("Invalid CONNECT target `{0}`, expected host:port")]
    InvalidConnectTarget(String),

    #[error("Invalid absolute URI `{0}`")]
    InvalidAbsoluteUri(String),

    #[error("Failed to connect to {dst}: {source}")]
    UnreachableDestination {
        dst: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on relayed connection: {0}")]
    Io(#[from] std::io::Error),
}

/// Error response structure
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    /// Human-readable error description
    pub message: String,
}

impl IntoResponse for WallsimError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            message: self.to_string(),
        });

        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

/// Addresses that violate the topology invariants.
#[derive(Error, Debug, PartialEq)]
pub enum AddressError {
    #[error("Address {addr} of {role} is outside of subnet {subnet}")]
    OutsideSubnet {
        role: Role,
        addr: Ipv4Addr,
        subnet: String,
    },

    #[error("Address {addr} is assigned to both {first} and {second}")]
    Duplicated {
        addr: Ipv4Addr,
        first: Role,
        second: Role,
    },

    #[error("Address {addr} of {role} collides with the subnet gateway")]
    GatewayCollision { role: Role, addr: Ipv4Addr },
}
