/*
Copyright 2025 The vxgate Authors.

SPDX-License-Identifier: Apache-2.0
*/

//! Overlay interface lifecycle. Both sides of a relation run a VXLAN
//! endpoint bound to the relation's segment identifier: the gateway side
//! with address learning enabled (it discovers consumers from their
//! encapsulated traffic), the consumer side pointed at the gateway's
//! current underlay address.

use std::ffi::CString;
use std::net::{IpAddr, Ipv4Addr};

use netlink_packet_core::{NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE};
use netlink_packet_route::{
    address::{AddressAttribute, AddressMessage, AddressScope},
    link::{InfoData, InfoKind, InfoVxlan, LinkAttribute, LinkFlags, LinkInfo, LinkMessage},
    AddressFamily, RouteNetlinkMessage,
};

use crate::{netlink, Error, Result};

/// Returns the interface index for a name, if the interface exists.
pub fn ifindex_opt(name: &str) -> Option<u32> {
    let ifname_c = CString::new(name).ok()?;
    let index = unsafe { libc::if_nametoindex(ifname_c.as_ptr()) };
    if index == 0 {
        None
    } else {
        Some(index)
    }
}

pub fn ifindex(name: &str) -> Result<u32> {
    ifindex_opt(name).ok_or_else(|| Error::Netlink(format!("no such interface: {name}")))
}

pub fn link_exists(name: &str) -> bool {
    ifindex_opt(name).is_some()
}

/// Deletes the named link if it exists. Re-initialization always starts
/// from a clean slate so a half-configured interface from a previous
/// attempt cannot linger.
pub fn ensure_absent(name: &str) -> Result<()> {
    if let Some(index) = ifindex_opt(name) {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        netlink::ack(RouteNetlinkMessage::DelLink(msg), 0)?;
    }
    Ok(())
}

/// Creates a VXLAN link and returns its interface index.
///
/// `remote` is the unicast peer for consumer-side endpoints; the gateway
/// side passes `None` and relies on `learning` to populate its forwarding
/// database from incoming overlay traffic.
pub fn create_vxlan(
    name: &str,
    vni: u32,
    remote: Option<Ipv4Addr>,
    learning: bool,
) -> Result<u32> {
    let mut vxlan_info = vec![
        InfoVxlan::Id(vni),
        InfoVxlan::Port(common::VXLAN_PORT),
        InfoVxlan::Learning(learning),
    ];
    if let Some(remote) = remote {
        vxlan_info.push(InfoVxlan::Group(remote));
    }

    let mut msg = LinkMessage::default();
    msg.attributes.push(LinkAttribute::IfName(name.to_string()));
    msg.attributes.push(LinkAttribute::LinkInfo(vec![
        LinkInfo::Kind(InfoKind::Vxlan),
        LinkInfo::Data(InfoData::Vxlan(vxlan_info)),
    ]));

    netlink::ack(
        RouteNetlinkMessage::NewLink(msg),
        NLM_F_CREATE | NLM_F_EXCL,
    )?;
    ifindex(name)
}

pub fn link_up(index: u32) -> Result<()> {
    let mut msg = LinkMessage::default();
    msg.header.index = index;
    msg.header.flags = LinkFlags::Up;
    msg.header.change_mask = LinkFlags::Up;
    netlink::ack(RouteNetlinkMessage::SetLink(msg), 0)
}

pub fn add_address(index: u32, addr: Ipv4Addr, prefix_len: u8) -> Result<()> {
    let mut msg = AddressMessage::default();
    msg.header.family = AddressFamily::Inet;
    msg.header.prefix_len = prefix_len;
    msg.header.scope = AddressScope::Universe;
    msg.header.index = index;
    msg.attributes
        .push(AddressAttribute::Local(IpAddr::V4(addr)));
    msg.attributes
        .push(AddressAttribute::Address(IpAddr::V4(addr)));
    netlink::ack(
        RouteNetlinkMessage::NewAddress(msg),
        NLM_F_CREATE | NLM_F_REPLACE,
    )
}
