/*
Copyright 2025 The vxgate Authors.

SPDX-License-Identifier: Apache-2.0
*/

//! The vxgate routing agent. One binary, four jobs: the gateway-side and
//! consumer-side initialization steps (run as init containers with network
//! privilege) and the matching long-running steps (lease/probe service on
//! the gateway, liveness probing and self-healing on the consumer). The
//! controlplane injects these containers; the agent itself has no
//! Kubernetes API access at all.

use thiserror::Error;

pub mod config;
pub mod consumer;
pub mod firewall;
pub mod gateway;
pub mod lease;
mod netlink;
pub mod overlay;
pub mod probe;
pub mod resolve;
pub mod routes;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot resolve or reach gateway endpoint `{0}`: {1}")]
    EndpointUnreachable(String, String),
    #[error("lease acquisition failed: {0}")]
    LeaseFailure(String),
    #[error("tunnel interface `{0}` is not present; is the tunnel container running?")]
    TunnelDown(String),
    #[error("netlink error: {0}")]
    Netlink(String),
    #[error("firewall programming failed: {0}")]
    Firewall(String),
    #[error("invalid configuration: `{0}`")]
    InvalidConfig(String),
    #[error("lease protocol error: {0}")]
    Proto(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
