/*
Copyright 2025 The vxgate Authors.

SPDX-License-Identifier: Apache-2.0
*/

//! Minimal rtnetlink plumbing: one blocking request/response transaction
//! per call, no connection reuse. The agent's mutations are rare (interface
//! bring-up, route programming) so a fresh socket per request keeps the
//! code free of shared state.

use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST,
};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};

use crate::{Error, Result};

/// Sends a mutating request and waits for the kernel's ack.
pub(crate) fn ack(payload: RouteNetlinkMessage, extra_flags: u16) -> Result<()> {
    transact(payload, NLM_F_REQUEST | NLM_F_ACK | extra_flags).map(|_| ())
}

/// Sends a dump request and collects every answer until the kernel's done
/// marker.
pub(crate) fn dump(payload: RouteNetlinkMessage) -> Result<Vec<RouteNetlinkMessage>> {
    transact(payload, NLM_F_REQUEST | NLM_F_DUMP)
}

fn transact(payload: RouteNetlinkMessage, flags: u16) -> Result<Vec<RouteNetlinkMessage>> {
    let mut socket = Socket::new(NETLINK_ROUTE)
        .map_err(|e| Error::Netlink(format!("failed to open netlink socket: {e}")))?;
    socket
        .bind_auto()
        .map_err(|e| Error::Netlink(format!("failed to bind netlink socket: {e}")))?;
    socket
        .connect(&SocketAddr::new(0, 0))
        .map_err(|e| Error::Netlink(format!("failed to connect netlink socket: {e}")))?;

    let mut nl_hdr = NetlinkHeader::default();
    nl_hdr.flags = flags;
    nl_hdr.sequence_number = 1;

    let mut packet = NetlinkMessage::new(nl_hdr, NetlinkPayload::from(payload));
    packet.finalize();
    let mut buf = vec![0u8; packet.header.length as usize];
    if buf.len() != packet.buffer_len() {
        return Err(Error::Netlink("construct packet failed".to_string()));
    }
    packet.serialize(&mut buf[..]);
    socket
        .send(&buf[..], 0)
        .map_err(|e| Error::Netlink(format!("netlink send failed: {e}")))?;

    let mut answers = Vec::new();
    let mut recv_buf = vec![0u8; 8192];
    loop {
        let len = socket
            .recv(&mut &mut recv_buf[..], 0)
            .map_err(|e| Error::Netlink(format!("netlink receive failed: {e}")))?;
        let mut offset = 0;
        while offset < len {
            let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&recv_buf[offset..])
                .map_err(|e| Error::Netlink(format!("malformed netlink response: {e}")))?;
            let msg_len = msg.header.length as usize;
            match msg.payload {
                // An error message with no code is the kernel's ack.
                NetlinkPayload::Error(err) => {
                    return match err.code {
                        None => Ok(answers),
                        Some(code) => Err(Error::Netlink(format!(
                            "kernel refused request (errno {})",
                            -code.get()
                        ))),
                    };
                }
                NetlinkPayload::Done(_) => return Ok(answers),
                NetlinkPayload::InnerMessage(inner) => answers.push(inner),
                NetlinkPayload::Noop => {}
                NetlinkPayload::Overrun(_) => {
                    return Err(Error::Netlink("netlink receive buffer overrun".to_string()))
                }
                _ => {}
            }
            if msg_len == 0 {
                break;
            }
            offset += msg_len;
        }
    }
}
