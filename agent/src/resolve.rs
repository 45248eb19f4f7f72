/*
Copyright 2025 The vxgate Authors.

SPDX-License-Identifier: Apache-2.0
*/

//! Gateway endpoint resolution. The endpoint identity in the relation is a
//! stable name; the address behind it changes whenever the gateway pod is
//! rescheduled. Address staleness is the normal case, so callers resolve
//! here on every (re)connection attempt and never persist the result.

use std::net::{SocketAddr, SocketAddrV4};

use tokio::net::lookup_host;

use crate::{Error, Result};

pub async fn resolve_endpoint(endpoint: &str, port: u16) -> Result<SocketAddrV4> {
    let addrs = lookup_host((endpoint, port))
        .await
        .map_err(|e| Error::EndpointUnreachable(endpoint.to_string(), e.to_string()))?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(v4);
        }
    }
    Err(Error::EndpointUnreachable(
        endpoint.to_string(),
        "name resolved to no IPv4 address".to_string(),
    ))
}
