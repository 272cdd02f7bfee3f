//! Kernel hotplug event stream.
//!
//! Device discovery listens on a `NETLINK_KOBJECT_UEVENT` socket for kernel
//! uevents, filtered to whole-disk block devices. The socket is wrapped in
//! the [`EventSource`] trait so the discovery heuristic can be driven from
//! recorded event sequences in tests.

use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rustix::net::netlink::{self, SocketAddrNetlink};
use rustix::net::{self, AddressFamily, RecvFlags, SocketFlags, SocketType, sockopt};

/// Uevent action kinds the discovery heuristic distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Add,
    Change,
}

/// A single whole-disk block hotplug event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    pub action: EventAction,
    /// Kernel device name (e.g., `mmcblk0`).
    pub device: String,
}

/// Source of hotplug events.
///
/// `next_event` blocks up to `timeout` and returns `None` when no relevant
/// event arrived within it. Irrelevant events (other subsystems, partitions,
/// remove actions) are consumed and skipped without resetting the timeout.
pub trait EventSource {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<HotplugEvent>>;
}

/// Netlink-backed event source listening to kernel uevents.
pub struct UeventSource {
    fd: OwnedFd,
}

impl UeventSource {
    /// Opens the kernel uevent broadcast socket (multicast group 1).
    pub fn open() -> Result<Self> {
        let fd = net::socket_with(
            AddressFamily::NETLINK,
            SocketType::DGRAM,
            SocketFlags::CLOEXEC,
            Some(netlink::KOBJECT_UEVENT),
        )
        .context("failed to open netlink uevent socket")?;

        net::bind(&fd, &SocketAddrNetlink::new(0, 1))
            .context("failed to bind netlink uevent socket")?;

        Ok(Self { fd })
    }
}

impl EventSource for UeventSource {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<HotplugEvent>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 4096];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            sockopt::set_socket_timeout(&self.fd, sockopt::Timeout::Recv, Some(remaining))
                .context("failed to set uevent receive timeout")?;

            match net::recv(&self.fd, &mut buf[..], RecvFlags::empty()) {
                Ok((len, _)) => {
                    if let Some(event) = parse_uevent(&buf[..len]) {
                        return Ok(Some(event));
                    }
                    // Not a whole-disk block event; keep draining.
                }
                Err(rustix::io::Errno::AGAIN) | Err(rustix::io::Errno::INTR) => {
                    return Ok(None);
                }
                Err(e) => {
                    return Err(anyhow::Error::from(std::io::Error::from(e))
                        .context("failed to receive uevent"));
                }
            }
        }
    }
}

/// Parses a raw kernel uevent datagram into a [`HotplugEvent`].
///
/// Kernel uevents are a `action@devpath` header followed by NUL-separated
/// `KEY=VALUE` properties. Returns `None` for anything that is not an
/// add/change event on a whole-disk block device. Datagrams from libudev
/// (which carry a binary header) are ignored.
fn parse_uevent(datagram: &[u8]) -> Option<HotplugEvent> {
    let mut fields = datagram.split(|&b| b == 0).filter_map(|f| std::str::from_utf8(f).ok());

    let header = fields.next()?;
    if !header.contains('@') {
        return None;
    }

    let mut action = None;
    let mut devname = None;
    let mut subsystem = None;
    let mut devtype = None;

    for field in fields {
        if let Some((key, value)) = field.split_once('=') {
            match key {
                "ACTION" => action = Some(value),
                "DEVNAME" => devname = Some(value),
                "SUBSYSTEM" => subsystem = Some(value),
                "DEVTYPE" => devtype = Some(value),
                _ => {}
            }
        }
    }

    if subsystem != Some("block") || devtype != Some("disk") {
        return None;
    }

    let action = match action {
        Some("add") => EventAction::Add,
        Some("change") => EventAction::Change,
        _ => return None,
    };

    // DEVNAME may carry a /dev prefix on some kernels.
    let device = devname?.rsplit('/').next()?.to_string();
    if device.is_empty() {
        return None;
    }

    Some(HotplugEvent { action, device })
}
