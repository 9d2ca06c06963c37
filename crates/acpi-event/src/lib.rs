//! Kernel ACPI event listener.
//!
//! The kernel publishes ACPI events (power button, lid, AC adapter) on the
//! `acpi_mc_group` multicast group of the `acpi_event` generic netlink
//! family. [`listen`] resolves the family, joins the group and feeds every
//! event, in its textual form, to a [`Dispatcher`].
//!
//! [`listen`] blocks forever; run it on a dedicated thread.

pub mod dispatch;
pub mod event;
pub mod netlink;
mod socket;

use std::convert::Infallible;
use std::io;

use guest_common::Category;
use tracing::{debug, info, warn};

pub use dispatch::{Dispatcher, Outcome, POWER_BUTTON};
pub use event::AcpiEvent;

use netlink::{Family, GENL_ID_CTRL, NLMSG_DONE, NLMSG_ERROR, NetlinkError};
use socket::NetlinkSocket;

/// Generic netlink family registered by the kernel ACPI driver.
pub const ACPI_FAMILY: &str = "acpi_event";
/// Multicast group carrying ACPI events.
pub const ACPI_MCAST_GROUP: &str = "acpi_mc_group";

const RECV_BUFFER_SIZE: usize = 16 * 1024;
const FAMILY_REQUEST_SEQ: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum AcpiError {
    #[error("ACPI events unavailable: {0}")]
    Unavailable(String),

    #[error("netlink socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("netlink protocol error: {0}")]
    Protocol(#[from] NetlinkError),
}

impl AcpiError {
    pub fn category(&self) -> Category {
        match self {
            AcpiError::Unavailable(_) => Category::Soft,
            AcpiError::Socket(_) => Category::Soft,
            AcpiError::Protocol(_) => Category::Malformed,
        }
    }
}

/// Listen for ACPI events and dispatch them until the socket fails.
///
/// Returns [`AcpiError::Unavailable`] when the platform has no ACPI event
/// family (or no netlink at all); callers treat that as "no ACPI".
pub fn listen(dispatcher: &Dispatcher) -> Result<Infallible, AcpiError> {
    let socket = NetlinkSocket::open()
        .map_err(|e| AcpiError::Unavailable(format!("cannot open netlink socket: {e}")))?;
    let family = resolve_family(&socket, ACPI_FAMILY)?;
    let group = family.group(ACPI_MCAST_GROUP).ok_or_else(|| {
        AcpiError::Unavailable(format!(
            "family {ACPI_FAMILY} has no group {ACPI_MCAST_GROUP}"
        ))
    })?;
    socket.join_group(group)?;
    info!(family = family.id, group, "listening for ACPI events");

    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AcpiError::Socket(e)),
        };
        handle_datagram(dispatcher, buf.get(..n).unwrap_or_default());
    }
}

/// Decode one datagram and dispatch each event in it. Malformed messages
/// are logged and skipped. Returns the outcome of every event seen.
pub fn handle_datagram(dispatcher: &Dispatcher, data: &[u8]) -> Vec<Outcome> {
    let messages = match netlink::decode_messages(data) {
        Ok(messages) => messages,
        Err(e) => {
            warn!(error = %e, "skipping malformed netlink datagram");
            return Vec::new();
        }
    };

    let mut outcomes = Vec::new();
    for message in messages {
        if message.msg_type < GENL_ID_CTRL {
            continue;
        }
        let events = match event::events_in(&message.payload) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "skipping malformed ACPI message");
                continue;
            }
        };
        for event in events {
            let text = event.to_string();
            info!(event = %text, "ACPI event");
            outcomes.push(dispatcher.dispatch(&text));
        }
    }
    outcomes
}

fn resolve_family(socket: &NetlinkSocket, name: &str) -> Result<Family, AcpiError> {
    socket.send(&netlink::family_request(name, FAMILY_REQUEST_SEQ))?;

    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AcpiError::Socket(e)),
        };
        for message in netlink::decode_messages(buf.get(..n).unwrap_or_default())? {
            if message.seq != FAMILY_REQUEST_SEQ {
                debug!(seq = message.seq, "ignoring unrelated netlink message");
                continue;
            }
            match message.msg_type {
                GENL_ID_CTRL => return Ok(Family::decode(&message.payload)?),
                NLMSG_ERROR => match message.error_code() {
                    Some(0) => continue,
                    Some(code) => return Err(family_error(name, code)),
                    None => return Err(NetlinkError::Truncated("nlmsgerr").into()),
                },
                NLMSG_DONE => {
                    return Err(AcpiError::Unavailable(format!(
                        "no reply for generic netlink family {name}"
                    )));
                }
                _ => {}
            }
        }
    }
}

/// Error for a non-zero `nlmsgerr` code (a negated errno) in reply to a
/// family lookup.
fn family_error(name: &str, code: i32) -> AcpiError {
    let errno = code.wrapping_neg();
    if errno == libc::ENOENT {
        return AcpiError::Unavailable(format!("generic netlink family {name} not registered"));
    }
    AcpiError::Socket(io::Error::from_raw_os_error(errno))
}
