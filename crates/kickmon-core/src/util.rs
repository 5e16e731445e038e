//! Small helpers shared by the collector, sinks and the shim.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Current time as fractional seconds since the Unix epoch.
pub fn epoch_secs() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// IPv4 address this host would use for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel to pick a
/// route. Falls back to loopback on hosts without a default route.
pub fn local_host_address() -> Ipv4Addr {
    let discover = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
        Ok(socket.local_addr()?.ip())
    };

    match discover() {
        Ok(IpAddr::V4(addr)) if !addr.is_unspecified() => addr,
        _ => Ipv4Addr::LOCALHOST,
    }
}

/// Current process id.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Process group of the calling process.
pub fn current_pgrp() -> i32 {
    // SAFETY: getpgrp has no preconditions and cannot fail.
    unsafe { libc::getpgrp() }
}
