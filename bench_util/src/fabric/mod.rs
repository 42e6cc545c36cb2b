//! Software datagram fabric.
//!
//! The benchmark engine drives the classic verbs surface: queue pairs with
//! a `RESET -> INIT -> RTR -> RTS` state machine, separate send/receive
//! completion queues polled non-blocking, work requests tagged with a
//! caller-chosen id, and a 32-bit immediate carried to the receiver.
//!
//! This module implements that surface in software. Every queue pair owns
//! one UDP socket; its port doubles as the queue-pair number and its
//! address is advertised through the global identifier, so the handshake
//! record alone is enough to wire two endpoints together.

mod device;
mod qp;

pub use device::Device;
pub use qp::{Completion, QueuePair, WcOpcode};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

/// completion status of a successful work request
pub const WC_SUCCESS: u32 = 0;

/// access flag bits accepted at the INIT transition
pub const ACCESS_LOCAL_WRITE: u32 = 1 << 0;
pub const ACCESS_REMOTE_WRITE: u32 = 1 << 1;
pub const ACCESS_REMOTE_READ: u32 = 1 << 2;
pub const ACCESS_REMOTE_ATOMIC: u32 = 1 << 3;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid queue pair transition: {from:?} -> {to:?}")]
    InvalidTransition { from: QpState, to: QpState },
    #[error("queue pair is not ready to send")]
    NotReady,
    #[error("receive queue is full")]
    RecvQueueFull,
    #[error("message of {0} bytes exceeds the datagram limit")]
    MessageTooLarge(u32),
}

/// Queue pair readiness states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
}

/// 16-byte global identifier. Carries an IPv4-mapped or IPv6 address so a
/// peer can be reached from the handshake record alone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Gid(v4.to_ipv6_mapped().octets()),
            IpAddr::V6(v6) => Gid(v6.octets()),
        }
    }

    pub fn to_ip(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.0);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    /// Low 64 bits; a zero value means the peer did not advertise a
    /// routable address and the lid path is used instead.
    pub fn interface_id(&self) -> u64 {
        u64::from_be_bytes(self.0[8..16].try_into().unwrap())
    }
}

/// Addressing info for one queue pair, exchanged during the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QpEndpoint {
    pub lid: i32,
    pub qp_num: i32,
    pub gid: Gid,
}

impl QpEndpoint {
    /// Destination address of the peer queue pair. A non-zero global
    /// identifier selects the globally routed path; otherwise the peer is
    /// assumed local.
    pub fn addr(&self) -> std::net::SocketAddr {
        let ip = if self.gid.interface_id() != 0 {
            self.gid.to_ip()
        } else {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        };
        std::net::SocketAddr::new(ip, self.qp_num as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gid_ip_roundtrip() {
        let ip: IpAddr = "192.168.7.13".parse().unwrap();
        let gid = Gid::from_ip(ip);
        assert_eq!(gid.to_ip(), ip);
        assert_ne!(gid.interface_id(), 0);
    }

    #[test]
    fn test_zero_gid_falls_back_to_local() {
        let ep = QpEndpoint {
            lid: 3,
            qp_num: 9000,
            gid: Gid::default(),
        };
        assert_eq!(ep.addr(), "127.0.0.1:9000".parse().unwrap());
    }
}
