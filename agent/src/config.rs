/*
Copyright 2025 The vxgate Authors.

SPDX-License-Identifier: Apache-2.0
*/

use clap::{Parser, Subcommand};
use ipnet::Ipv4Net;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "agent", about = "vxgate routing agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Gateway initialization step: overlay endpoint, forwarding state,
    /// kill-switch fragment. Runs once, with network privilege.
    GatewayInit(GatewayConfig),
    /// Gateway long-running step: the UDP lease/probe service.
    GatewayRun(GatewayConfig),
    /// Consumer initialization step: overlay interface, lease, route
    /// program. Exits non-zero on failure so the platform restarts it.
    ConsumerInit(ConsumerConfig),
    /// Consumer long-running step: gateway liveness probing and
    /// self-healing re-establishment.
    ConsumerRun(ConsumerConfig),
}

#[derive(Debug, Parser, Clone)]
pub struct GatewayConfig {
    /// VXLAN network identifier of the overlay segment.
    #[clap(long)]
    pub vni: u32,

    /// CIDR blocks that must never ride the overlay.
    #[clap(long, value_delimiter = ',', required = true)]
    pub disallowed_cidrs: Vec<String>,

    #[clap(long, default_value = common::OVERLAY_IFNAME)]
    pub overlay_ifname: String,

    /// Interface exposed by the external tunnel container.
    #[clap(long, default_value = "tun0")]
    pub tunnel_ifname: String,

    /// The pod's ordinary cluster-network interface.
    #[clap(long, default_value = "eth0")]
    pub cluster_ifname: String,

    #[clap(long, default_value_t = common::LEASE_PORT)]
    pub lease_port: u16,

    #[clap(long, default_value = common::DEFAULT_OVERLAY_SUBNET)]
    pub overlay_subnet: Ipv4Net,

    /// Where the kill-switch rule fragment is written for the tunnel
    /// container to apply at its own startup.
    #[clap(long, default_value = common::KILLSWITCH_RULES_PATH)]
    pub rules_path: PathBuf,
}

#[derive(Debug, Parser, Clone)]
pub struct ConsumerConfig {
    /// Stable name of the gateway endpoint. Resolved on every connection
    /// attempt; never cached across restarts.
    #[clap(long)]
    pub endpoint: String,

    #[clap(long)]
    pub vni: u32,

    #[clap(long, value_delimiter = ',', required = true)]
    pub disallowed_cidrs: Vec<String>,

    #[clap(long, default_value = common::OVERLAY_IFNAME)]
    pub overlay_ifname: String,

    #[clap(long, default_value_t = common::LEASE_PORT)]
    pub lease_port: u16,

    #[clap(long, default_value = common::DEFAULT_OVERLAY_SUBNET)]
    pub overlay_subnet: Ipv4Net,

    /// Seconds between gateway liveness probes.
    #[clap(long, default_value_t = 5)]
    pub probe_interval_secs: u64,

    /// Consecutive probe misses treated as sustained failure.
    #[clap(long, default_value_t = 3)]
    pub probe_failure_threshold: u32,

    /// Overall bound on lease acquisition during initialization.
    #[clap(long, default_value_t = 15)]
    pub lease_timeout_secs: u64,
}
