/*
Copyright 2025 The vxgate Authors.

SPDX-License-Identifier: Apache-2.0
*/

//! A stand-in for the gateway's lease service, for exercising consumer
//! agents (and the wire protocol) without a cluster or a tunnel. Binds the
//! lease port, grants leases from the configured subnet and answers pings
//! until interrupted.

use clap::Parser;
use ipnet::Ipv4Net;
use tokio::{net::UdpSocket, signal};

#[derive(Debug, Parser)]
#[command(name = "fake-gateway")]
struct Opt {
    #[clap(long, default_value_t = 5814)]
    port: u16,
    #[clap(long, default_value_t = 42)]
    vni: u32,
    #[clap(long, default_value = "100.64.93.0/24")]
    subnet: Ipv4Net,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();

    let socket = UdpSocket::bind(("0.0.0.0", opt.port)).await?;
    println!(
        "fake gateway serving leases for vni {} from {} on port {}",
        opt.vni, opt.subnet, opt.port
    );
    tokio::spawn(async move {
        if let Err(error) = agent::lease::serve(socket, opt.subnet, opt.vni).await {
            eprintln!("lease service failed: {error}");
            std::process::exit(1);
        }
    });

    signal::ctrl_c().await?;
    Ok(())
}
