/*
Copyright 2025 The vxgate Authors.

SPDX-License-Identifier: Apache-2.0
*/

//! Kernel forwarding state and firewall rules for the gateway side, plus
//! the kill-switch rule fragment handed to the external tunnel container.

use std::path::Path;
use std::process::Command;

use ipnet::Ipv4Net;
use tracing::info;

use crate::{Error, Result};

const IP_FORWARD_SYSCTL: &str = "/proc/sys/net/ipv4/ip_forward";

pub fn enable_ip_forwarding() -> Result<()> {
    std::fs::write(IP_FORWARD_SYSCTL, "1")
        .map_err(|e| Error::Firewall(format!("cannot enable {IP_FORWARD_SYSCTL}: {e}")))
}

/// Installs the forwarding rules that move overlay traffic into the tunnel
/// and accept overlay-encapsulated packets arriving with cluster-internal
/// source addresses (a default-deny INPUT chain would drop them).
pub fn install_gateway_forwarding(
    overlay_ifname: &str,
    tunnel_ifname: &str,
    allow_list: &[Ipv4Net],
) -> Result<()> {
    iptables(&[
        "-A", "FORWARD", "-i", overlay_ifname, "-o", tunnel_ifname, "-j", "ACCEPT",
    ])?;
    iptables(&[
        "-A",
        "FORWARD",
        "-i",
        tunnel_ifname,
        "-o",
        overlay_ifname,
        "-m",
        "conntrack",
        "--ctstate",
        "RELATED,ESTABLISHED",
        "-j",
        "ACCEPT",
    ])?;
    iptables(&[
        "-t",
        "nat",
        "-A",
        "POSTROUTING",
        "-o",
        tunnel_ifname,
        "-j",
        "MASQUERADE",
    ])?;
    for net in allow_list {
        iptables(&["-A", "INPUT", "-s", &net.to_string(), "-j", "ACCEPT"])?;
    }
    info!(overlay_ifname, tunnel_ifname, "gateway forwarding rules installed");
    Ok(())
}

/// Writes the kill-switch fragment where the tunnel container picks it up.
/// Written to a temporary name in the same directory and renamed so the
/// tunnel container can never observe a half-written fragment.
pub fn write_killswitch_fragment(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        Error::Firewall(format!("rules path {} has no parent directory", path.display()))
    })?;
    std::fs::create_dir_all(parent)?;
    let staging = path.with_extension("partial");
    std::fs::write(&staging, content)?;
    std::fs::rename(&staging, path)?;
    info!(path = %path.display(), "kill-switch rule fragment written");
    Ok(())
}

fn iptables(args: &[&str]) -> Result<()> {
    let output = Command::new("iptables")
        .args(args)
        .output()
        .map_err(|e| Error::Firewall(format!("cannot execute iptables: {e}")))?;
    if !output.status.success() {
        return Err(Error::Firewall(format!(
            "iptables {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_write_is_renamed_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules").join("post-rules.txt");
        write_killswitch_fragment(&path, "iptables -A OUTPUT -j DROP\n").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "iptables -A OUTPUT -j DROP\n");
        assert!(!path.with_extension("partial").exists());
    }

    #[test]
    fn fragment_overwrite_replaces_previous_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("post-rules.txt");
        write_killswitch_fragment(&path, "old\n").unwrap();
        write_killswitch_fragment(&path, "new\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
    }
}
