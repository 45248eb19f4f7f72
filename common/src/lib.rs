/*
Copyright 2025 The vxgate Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Shared between the controlplane and the agent. Most importantly this is
//! where the effective egress allow-list is derived: the consumer-side
//! NetworkPolicy, the consumer-side route exceptions and the gateway-side
//! firewall fragment are all computed from [`effective_allow_list`] so the
//! three enforcement points cannot drift apart.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error;

// The overlay interface name created by the agent on both sides.
pub const OVERLAY_IFNAME: &str = "vxg0";

// UDP port carrying VXLAN encapsulation (IANA).
pub const VXLAN_PORT: u16 = 4789;

// UDP port of the gateway's lease/probe service.
pub const LEASE_PORT: u16 = 5814;

// Valid VXLAN network identifier range (24 bits, 0 is reserved).
pub const VNI_MIN: u32 = 1;
pub const VNI_MAX: u32 = (1 << 24) - 1;

// Overlay segment used when the relation does not override it. CGNAT space,
// guaranteed not to collide with cluster pod or service ranges.
pub const DEFAULT_OVERLAY_SUBNET: &str = "100.64.93.0/24";

// Link-local address the service-mesh interception layer uses for
// control-plane callbacks (liveness probing) into the pod. Routing this
// through the overlay would black-hole kubelet health checks, so it is
// unconditionally part of the allow-list on every enforcement layer.
pub const MESH_CALLBACK_CIDR: &str = "169.254.7.127/32";

// File the long-running agent touches once it considers itself established;
// the injected containers' readiness probes test for it.
pub const READY_FILE: &str = "/tmp/vxgate-ready";

// Where the gateway-side kill-switch rule fragment is written. The external
// tunnel container picks the fragment up from this (shared) path at its own
// startup.
pub const KILLSWITCH_RULES_PATH: &str = "/killswitch/post-rules.txt";

#[derive(Error, Debug)]
pub enum CidrError {
    #[error("invalid IPv4 CIDR block `{0}`: {1}")]
    Unparseable(String, ipnet::AddrParseError),
}

/// Derives the effective egress allow-list from the relation's disallowed
/// CIDR list ("disallowed" from the overlay's point of view: these blocks
/// must never be routed through the tunnel, which makes them exactly the
/// set of permitted non-tunnel destinations).
///
/// Insertion order is preserved, duplicates are dropped, and the mesh
/// interception callback address is appended if not already present.
/// Only IPv4 blocks are accepted: the overlay and both enforcement layers
/// are IPv4-only, and silently ignoring a v6 block on one layer but not
/// another is exactly the drift this function exists to rule out.
pub fn effective_allow_list(disallowed_cidrs: &[String]) -> Result<Vec<Ipv4Net>, CidrError> {
    let mut out: Vec<Ipv4Net> = Vec::with_capacity(disallowed_cidrs.len() + 1);
    for raw in disallowed_cidrs {
        let net: Ipv4Net = raw
            .parse()
            .map_err(|e| CidrError::Unparseable(raw.clone(), e))?;
        if !out.contains(&net) {
            out.push(net);
        }
    }
    let mesh: Ipv4Net = MESH_CALLBACK_CIDR
        .parse()
        .expect("mesh callback constant must parse");
    if !out.contains(&mesh) {
        out.push(mesh);
    }
    Ok(out)
}

/// Renders the gateway-side kill-switch fragment applied by the external
/// tunnel container at startup: accept cluster-internal destinations on the
/// ordinary interface, drop everything else that is not leaving through the
/// tunnel. Holds even when the tunnel itself is down.
pub fn gateway_killswitch_fragment(
    allow_list: &[Ipv4Net],
    cluster_ifname: &str,
    tunnel_ifname: &str,
) -> String {
    let mut rules = String::new();
    for net in allow_list {
        rules.push_str(&format!(
            "iptables -A OUTPUT -o {cluster_ifname} -d {net} -j ACCEPT\n"
        ));
    }
    rules.push_str(&format!(
        "iptables -A OUTPUT ! -o {tunnel_ifname} -j DROP\n"
    ));
    rules
}

/// The address the gateway claims for itself on the overlay segment: the
/// first usable host of the subnet. Consumers probe this address and use it
/// as their overlay next hop.
pub fn overlay_gateway_address(subnet: &ipnet::Ipv4Net) -> Ipv4Addr {
    let base = u32::from(subnet.network());
    Ipv4Addr::from(base + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_preserves_order_and_dedups() {
        let cidrs = vec![
            "10.0.0.0/8".to_string(),
            "10.96.0.0/12".to_string(),
            "10.0.0.0/8".to_string(),
        ];
        let list = effective_allow_list(&cidrs).unwrap();
        let rendered: Vec<String> = list.iter().map(|n| n.to_string()).collect();
        assert_eq!(
            rendered,
            vec!["10.0.0.0/8", "10.96.0.0/12", MESH_CALLBACK_CIDR]
        );
    }

    #[test]
    fn allow_list_appends_mesh_callback_once() {
        let cidrs = vec!["10.0.0.0/8".to_string(), MESH_CALLBACK_CIDR.to_string()];
        let list = effective_allow_list(&cidrs).unwrap();
        let mesh_count = list
            .iter()
            .filter(|n| n.to_string() == MESH_CALLBACK_CIDR)
            .count();
        assert_eq!(mesh_count, 1);
    }

    #[test]
    fn allow_list_rejects_garbage() {
        let cidrs = vec!["not-a-cidr".to_string()];
        assert!(effective_allow_list(&cidrs).is_err());
    }

    #[test]
    fn killswitch_fragment_accepts_then_drops() {
        let list = effective_allow_list(&["10.0.0.0/8".to_string()]).unwrap();
        let fragment = gateway_killswitch_fragment(&list, "eth0", "tun0");
        let lines: Vec<&str> = fragment.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("-d 10.0.0.0/8 -j ACCEPT"));
        assert!(lines[1].contains(MESH_CALLBACK_CIDR));
        assert_eq!(lines[2], "iptables -A OUTPUT ! -o tun0 -j DROP");
    }

    #[test]
    fn gateway_address_is_first_host() {
        let subnet: ipnet::Ipv4Net = DEFAULT_OVERLAY_SUBNET.parse().unwrap();
        assert_eq!(
            overlay_gateway_address(&subnet),
            "100.64.93.1".parse::<Ipv4Addr>().unwrap()
        );
    }
}
