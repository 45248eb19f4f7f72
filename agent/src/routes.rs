/*
Copyright 2025 The vxgate Authors.

SPDX-License-Identifier: Apache-2.0
*/

//! Route programming for the consumer side. The branch point between
//! "ordinary cluster path" and "overlay" is decided here exactly once, at
//! program time: every allow-listed block gets an explicit route via the
//! pre-existing cluster next hop, and only then is the default route
//! replaced with the overlay. Nothing re-evaluates that decision
//! per-packet.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use netlink_packet_core::{NLM_F_CREATE, NLM_F_REPLACE};
use netlink_packet_route::{
    route::{
        RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteProtocol, RouteScope,
        RouteType,
    },
    AddressFamily, RouteNetlinkMessage,
};

use crate::{netlink, Error, Result};

/// The ordinary cluster-network next hop: gateway address and outgoing
/// interface of the current IPv4 default route.
#[derive(Debug, Clone, Copy)]
pub struct NextHop {
    pub gateway: Ipv4Addr,
    pub ifindex: u32,
}

/// Looks up the current default route in the main table. Must be called
/// before the default route is replaced with the overlay.
pub fn underlay_next_hop() -> Result<NextHop> {
    let mut msg = RouteMessage::default();
    msg.header.address_family = AddressFamily::Inet;
    msg.header.table = RouteHeader::RT_TABLE_MAIN;

    let answers = netlink::dump(RouteNetlinkMessage::GetRoute(msg))?;
    for answer in answers {
        let route = match answer {
            RouteNetlinkMessage::NewRoute(route) => route,
            _ => continue,
        };
        if route.header.destination_prefix_length != 0
            || route.header.table != RouteHeader::RT_TABLE_MAIN
        {
            continue;
        }
        let mut gateway = None;
        let mut ifindex = None;
        for attr in &route.attributes {
            match attr {
                RouteAttribute::Gateway(RouteAddress::Inet(ip)) => gateway = Some(*ip),
                RouteAttribute::Oif(index) => ifindex = Some(*index),
                _ => {}
            }
        }
        if let (Some(gateway), Some(ifindex)) = (gateway, ifindex) {
            return Ok(NextHop { gateway, ifindex });
        }
    }
    Err(Error::Netlink(
        "no IPv4 default route found in the main table".to_string(),
    ))
}

/// Installs (or refreshes) an explicit route for a single allow-listed
/// block via the ordinary cluster next hop.
pub fn replace_unicast(dest: Ipv4Net, via: NextHop) -> Result<()> {
    let msg = unicast_route(dest, Some(via.gateway), via.ifindex);
    netlink::ack(
        RouteNetlinkMessage::NewRoute(msg),
        NLM_F_CREATE | NLM_F_REPLACE,
    )
}

/// Replaces the default route so all remaining traffic leaves via the
/// overlay interface toward the gateway's overlay address.
pub fn replace_default(overlay_gateway: Ipv4Addr, overlay_ifindex: u32) -> Result<()> {
    let dest: Ipv4Net = "0.0.0.0/0".parse().expect("default destination must parse");
    let msg = unicast_route(dest, Some(overlay_gateway), overlay_ifindex);
    netlink::ack(
        RouteNetlinkMessage::NewRoute(msg),
        NLM_F_CREATE | NLM_F_REPLACE,
    )
}

fn unicast_route(dest: Ipv4Net, gateway: Option<Ipv4Addr>, oif: u32) -> RouteMessage {
    let mut msg = RouteMessage::default();
    msg.header.address_family = AddressFamily::Inet;
    msg.header.destination_prefix_length = dest.prefix_len();
    msg.header.table = RouteHeader::RT_TABLE_MAIN;
    msg.header.protocol = RouteProtocol::Static;
    msg.header.scope = RouteScope::Universe;
    msg.header.kind = RouteType::Unicast;

    if dest.prefix_len() > 0 {
        msg.attributes
            .push(RouteAttribute::Destination(RouteAddress::Inet(
                dest.network(),
            )));
    }
    if let Some(gateway) = gateway {
        msg.attributes
            .push(RouteAttribute::Gateway(RouteAddress::Inet(gateway)));
    }
    msg.attributes.push(RouteAttribute::Oif(oif));
    msg
}
