/*
Copyright 2025 The vxgate Authors.

SPDX-License-Identifier: Apache-2.0
*/

//! The UDP lease/probe protocol between consumer agents and the gateway's
//! long-running step. Lease requests ride the ordinary cluster path (the
//! consumer has no overlay address yet when it asks); pings ride the
//! overlay and double as the gateway answering for its own identity.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Message {
    LeaseRequest { client_id: String, vni: u32 },
    LeaseGrant(Lease),
    LeaseDenied { reason: String },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

/// Overlay address pool served by the gateway. Grants are stable per
/// client id so a restarting consumer gets its previous address back.
pub struct LeasePool {
    subnet: Ipv4Net,
    gateway: Ipv4Addr,
    assigned: HashMap<String, Ipv4Addr>,
}

impl LeasePool {
    pub fn new(subnet: Ipv4Net) -> Self {
        LeasePool {
            subnet,
            gateway: common::overlay_gateway_address(&subnet),
            assigned: HashMap::new(),
        }
    }

    pub fn grant(&mut self, client_id: &str) -> Result<Lease, String> {
        if let Some(addr) = self.assigned.get(client_id) {
            return Ok(self.lease_for(*addr));
        }
        let base = u32::from(self.subnet.network());
        let broadcast = u32::from(self.subnet.broadcast());
        // offset 1 is the gateway itself
        for candidate in (base + 2)..broadcast {
            let addr = Ipv4Addr::from(candidate);
            if !self.assigned.values().any(|assigned| *assigned == addr) {
                self.assigned.insert(client_id.to_string(), addr);
                return Ok(self.lease_for(addr));
            }
        }
        Err(format!("overlay address pool {} exhausted", self.subnet))
    }

    fn lease_for(&self, addr: Ipv4Addr) -> Lease {
        Lease {
            address: addr,
            prefix_len: self.subnet.prefix_len(),
            gateway: self.gateway,
        }
    }
}

/// Serves leases and answers pings until cancelled. `vni` guards against a
/// consumer that was configured for a different overlay segment reaching
/// this gateway by accident.
pub async fn serve(socket: UdpSocket, subnet: Ipv4Net, vni: u32) -> Result<()> {
    let mut pool = LeasePool::new(subnet);
    let mut buf = [0u8; 2048];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        let request = match serde_json::from_slice::<Message>(&buf[..len]) {
            Ok(request) => request,
            Err(error) => {
                warn!(%peer, %error, "discarding malformed datagram");
                continue;
            }
        };
        let reply = match request {
            Message::LeaseRequest { client_id, vni: requested } if requested == vni => {
                match pool.grant(&client_id) {
                    Ok(lease) => {
                        debug!(%client_id, address = %lease.address, "granted lease");
                        Message::LeaseGrant(lease)
                    }
                    Err(reason) => Message::LeaseDenied { reason },
                }
            }
            Message::LeaseRequest { vni: requested, .. } => Message::LeaseDenied {
                reason: format!("overlay id mismatch: serving {vni}, requested {requested}"),
            },
            Message::Ping { nonce } => Message::Pong { nonce },
            other => {
                debug!(%peer, ?other, "ignoring unexpected message");
                continue;
            }
        };
        socket.send_to(&serde_json::to_vec(&reply)?, peer).await?;
    }
}

/// Requests a lease from the gateway, retrying within the caller's bound.
/// Failure here is final for the initialization step; the platform's
/// restart of the crashed step is the retry mechanism above this.
pub async fn request(
    gateway: SocketAddr,
    client_id: &str,
    vni: u32,
    bound: Duration,
) -> Result<Lease> {
    const ATTEMPTS: u32 = 3;
    let per_attempt = bound / ATTEMPTS;
    let request = serde_json::to_vec(&Message::LeaseRequest {
        client_id: client_id.to_string(),
        vni,
    })?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(gateway).await?;

    let mut last_error = String::from("no response");
    for _ in 0..ATTEMPTS {
        socket.send(&request).await?;
        let mut buf = [0u8; 2048];
        match timeout(per_attempt, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => match serde_json::from_slice::<Message>(&buf[..len])? {
                Message::LeaseGrant(lease) => return Ok(lease),
                Message::LeaseDenied { reason } => return Err(Error::LeaseFailure(reason)),
                other => {
                    last_error = format!("unexpected reply: {other:?}");
                }
            },
            Ok(Err(error)) => {
                last_error = error.to_string();
            }
            Err(_) => {
                last_error = format!("no reply from {gateway} within {per_attempt:?}");
            }
        }
    }
    Err(Error::LeaseFailure(last_error))
}

/// One liveness probe round trip over the overlay.
pub async fn ping(gateway: SocketAddr, nonce: u64, bound: Duration) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(gateway).await?;
    socket
        .send(&serde_json::to_vec(&Message::Ping { nonce })?)
        .await?;
    let mut buf = [0u8; 512];
    let len = timeout(bound, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::EndpointUnreachable(gateway.to_string(), "probe timed out".into()))??;
    match serde_json::from_slice::<Message>(&buf[..len])? {
        Message::Pong { nonce: echoed } if echoed == nonce => Ok(()),
        other => Err(Error::EndpointUnreachable(
            gateway.to_string(),
            format!("unexpected probe reply: {other:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> LeasePool {
        LeasePool::new("100.64.93.0/29".parse().unwrap())
    }

    #[test]
    fn grants_are_stable_per_client() {
        let mut pool = pool();
        let first = pool.grant("consumer-a").unwrap();
        let again = pool.grant("consumer-a").unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn grants_skip_the_gateway_address() {
        let mut pool = pool();
        let lease = pool.grant("consumer-a").unwrap();
        assert_eq!(lease.gateway, "100.64.93.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(lease.address, "100.64.93.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(lease.prefix_len, 29);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        // /29 leaves .2 through .6 grantable
        let mut pool = pool();
        for i in 0..5 {
            pool.grant(&format!("consumer-{i}")).unwrap();
        }
        assert!(pool.grant("one-too-many").is_err());
    }

    #[test]
    fn wire_roundtrip_of_each_op() {
        let messages = vec![
            Message::LeaseRequest {
                client_id: "c".into(),
                vni: 42,
            },
            Message::LeaseGrant(Lease {
                address: "100.64.93.2".parse().unwrap(),
                prefix_len: 24,
                gateway: "100.64.93.1".parse().unwrap(),
            }),
            Message::LeaseDenied {
                reason: "overlay id mismatch".into(),
            },
            Message::Ping { nonce: 7 },
            Message::Pong { nonce: 7 },
        ];
        for msg in messages {
            let bytes = serde_json::to_vec(&msg).unwrap();
            let back: Message = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(msg, back);
        }
    }

    #[tokio::test]
    async fn server_denies_vni_mismatch() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        tokio::spawn(serve(
            server_socket,
            "100.64.93.0/24".parse().unwrap(),
            42,
        ));

        let result = request(server_addr, "consumer-a", 43, Duration::from_secs(3)).await;
        match result {
            Err(Error::LeaseFailure(reason)) => assert!(reason.contains("mismatch")),
            other => panic!("expected lease denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_grants_and_answers_pings() {
        let server_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();
        tokio::spawn(serve(
            server_socket,
            "100.64.93.0/24".parse().unwrap(),
            42,
        ));

        let lease = request(server_addr, "consumer-a", 42, Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(lease.gateway, "100.64.93.1".parse::<Ipv4Addr>().unwrap());

        ping(server_addr, 99, Duration::from_secs(3)).await.unwrap();
    }
}
