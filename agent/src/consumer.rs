/*
Copyright 2025 The vxgate Authors.

SPDX-License-Identifier: Apache-2.0
*/

//! Consumer-side agent steps. `initialize` is run once by the init
//! container and re-run in-process by the long-running step whenever the
//! gateway becomes unreachable for a sustained period.

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ConsumerConfig;
use crate::probe::ProbeState;
use crate::{lease, overlay, resolve, routes, Error, Result};

pub struct Established {
    pub overlay_gateway: SocketAddrV4,
    pub ifindex: u32,
}

/// Brings the overlay up from nothing: resolve the gateway's current
/// address, recreate the local endpoint, acquire a lease, and program
/// routes. On first boot the explicit allow-list routes are installed via
/// the ordinary next hop BEFORE the default route is replaced — the
/// resolver and the lease service ride the ordinary path, and flipping the
/// default first would cut the ground out from under both.
pub async fn initialize(config: &ConsumerConfig, first_boot: bool) -> Result<Established> {
    let remote = resolve::resolve_endpoint(&config.endpoint, config.lease_port).await?;
    info!(endpoint = %config.endpoint, address = %remote.ip(), "resolved gateway endpoint");

    overlay::ensure_absent(&config.overlay_ifname)?;
    let ifindex = overlay::create_vxlan(
        &config.overlay_ifname,
        config.vni,
        Some(*remote.ip()),
        false,
    )?;
    overlay::link_up(ifindex)?;

    let lease = lease::request(
        SocketAddr::V4(remote),
        &client_id(),
        config.vni,
        Duration::from_secs(config.lease_timeout_secs),
    )
    .await?;
    overlay::add_address(ifindex, lease.address, lease.prefix_len)?;
    info!(address = %lease.address, "acquired overlay lease");

    if first_boot {
        let allow_list = common::effective_allow_list(&config.disallowed_cidrs)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let next_hop = routes::underlay_next_hop()?;
        for net in &allow_list {
            routes::replace_unicast(*net, next_hop)?;
        }
        info!(
            routes = allow_list.len(),
            via = %next_hop.gateway,
            "cluster-path exception routes installed"
        );
    }

    routes::replace_default(lease.gateway, ifindex)?;
    info!(gateway = %lease.gateway, ifname = %config.overlay_ifname, "default route now rides the overlay");

    Ok(Established {
        overlay_gateway: SocketAddrV4::new(lease.gateway, config.lease_port),
        ifindex,
    })
}

/// The long-running probe loop: blocking wait, then one probe, then act on
/// the outcome. Recovery from a relocated gateway is handled entirely here;
/// the reconciler that injected this container never gets involved.
pub async fn run(config: ConsumerConfig) -> Result<()> {
    let _ = std::fs::remove_file(common::READY_FILE);

    let subnet = config.overlay_subnet;
    let mut target = SocketAddrV4::new(
        common::overlay_gateway_address(&subnet),
        config.lease_port,
    );
    let mut state = ProbeState::new(config.probe_failure_threshold);
    let probe_bound = Duration::from_secs(2);
    let mut nonce: u64 = 0;
    let mut ever_established = false;

    loop {
        tokio::time::sleep(Duration::from_secs(config.probe_interval_secs)).await;
        nonce = nonce.wrapping_add(1);
        match lease::ping(SocketAddr::V4(target), nonce, probe_bound).await {
            Ok(()) => {
                state.record_success();
                if !ever_established {
                    std::fs::write(common::READY_FILE, b"ok")?;
                    ever_established = true;
                    info!(gateway = %target, "overlay established");
                }
            }
            Err(error) => {
                if !state.record_failure() {
                    continue;
                }
                warn!(
                    gateway = %target,
                    %error,
                    "sustained probe failure; re-establishing overlay from scratch"
                );
                match initialize(&config, false).await {
                    Ok(established) => {
                        target = established.overlay_gateway;
                        info!(gateway = %target, "overlay re-established");
                    }
                    Err(error) => {
                        warn!(%error, "re-establishment failed; will retry after next probe window");
                    }
                }
            }
        }
    }
}

fn client_id() -> String {
    // the pod name; stable for the life of the instance, unique per pod
    std::env::var("HOSTNAME").unwrap_or_else(|_| "consumer".to_string())
}
