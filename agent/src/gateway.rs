/*
Copyright 2025 The vxgate Authors.

SPDX-License-Identifier: Apache-2.0
*/

//! Gateway-side agent steps. The initialization step does everything that
//! requires network privilege (overlay endpoint, forwarding state, firewall
//! rules, kill-switch fragment) and exits; the long-running step only
//! serves leases and probe answers — forwarding is the kernel state the
//! init step installed, not an active process.

use tokio::net::UdpSocket;
use tracing::info;

use crate::config::GatewayConfig;
use crate::{firewall, lease, overlay, Error, Result};

pub fn init(config: &GatewayConfig) -> Result<()> {
    let allow_list = common::effective_allow_list(&config.disallowed_cidrs)
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;

    // The tunnel container owns the tunnel. If its interface is missing the
    // tunnel is not established and this step must fail visibly rather than
    // set up an overlay that would dead-end.
    if !overlay::link_exists(&config.tunnel_ifname) {
        return Err(Error::TunnelDown(config.tunnel_ifname.clone()));
    }

    overlay::ensure_absent(&config.overlay_ifname)?;
    let ifindex = overlay::create_vxlan(&config.overlay_ifname, config.vni, None, true)?;
    let gateway_addr = common::overlay_gateway_address(&config.overlay_subnet);
    overlay::add_address(ifindex, gateway_addr, config.overlay_subnet.prefix_len())?;
    overlay::link_up(ifindex)?;
    info!(
        ifname = %config.overlay_ifname,
        vni = config.vni,
        address = %gateway_addr,
        "overlay endpoint created"
    );

    firewall::enable_ip_forwarding()?;
    firewall::install_gateway_forwarding(
        &config.overlay_ifname,
        &config.tunnel_ifname,
        &allow_list,
    )?;

    let fragment = common::gateway_killswitch_fragment(
        &allow_list,
        &config.cluster_ifname,
        &config.tunnel_ifname,
    );
    firewall::write_killswitch_fragment(&config.rules_path, &fragment)?;

    Ok(())
}

pub async fn run(config: GatewayConfig) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", config.lease_port)).await?;
    // Bound on both the ordinary path (lease requests) and the overlay
    // address (probes); readiness means "reachable", so flag it now.
    std::fs::write(common::READY_FILE, b"ok")?;
    info!(port = config.lease_port, vni = config.vni, "lease service listening");
    lease::serve(socket, config.overlay_subnet, config.vni).await
}
