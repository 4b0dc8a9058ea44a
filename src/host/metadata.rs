//! Facts about the machine a host runs on.

use std::net::{IpAddr, Ipv4Addr};

const HOSTNAME_FILE: &str = "/proc/sys/kernel/hostname";

/// Machine host name: `$HOSTNAME`, then the kernel's, then `localhost`.
pub fn hostname() -> String {
    if let Some(name) = std::env::var("HOSTNAME").ok().filter(|h| !h.trim().is_empty()) {
        return name.trim().to_string();
    }
    match std::fs::read_to_string(HOSTNAME_FILE) {
        Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
        _ => "localhost".to_string(),
    }
}

/// Primary local IP address, or loopback when it cannot be determined.
pub fn local_ip() -> IpAddr {
    match local_ip_address::local_ip() {
        Ok(ip) => ip,
        Err(e) => {
            tracing::error!(error = %e, "Failed to determine local IP, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
