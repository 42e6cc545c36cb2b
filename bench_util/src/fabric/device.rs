use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::info;

use super::qp::QueuePair;
use super::{FabricError, Gid};
use crate::args::QpType;

static NEXT_LID: AtomicI32 = AtomicI32::new(1);

/// An opened fabric device: the context all queue pairs of one Connection
/// are created from. Stands in for context + protection domain of a
/// hardware NIC.
pub struct Device {
    local_ip: IpAddr,
    lid: i32,
    gid: Gid,
}

impl Device {
    /// Open a device bound to the given local address. The address is what
    /// peers will reach this device's queue pairs at, so it must be
    /// routable from the remote side.
    pub fn open(local_ip: IpAddr) -> Self {
        let lid = NEXT_LID.fetch_add(1, Ordering::Relaxed);
        let gid = Gid::from_ip(local_ip);
        info!("Opened fabric device at {} (lid {})", local_ip, lid);
        Self { local_ip, lid, gid }
    }

    pub fn lid(&self) -> i32 {
        self.lid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Create one queue pair with its own socket and completion queues.
    /// The socket's ephemeral port becomes the queue-pair number.
    pub fn create_qp(
        &self,
        qp_type: QpType,
        tx_depth: u32,
        rx_depth: u32,
    ) -> Result<Arc<QueuePair>, FabricError> {
        let socket = UdpSocket::bind(SocketAddr::new(self.local_ip, 0))?;
        socket.set_nonblocking(true)?;
        let qp_num = socket.local_addr()?.port() as i32;
        Ok(Arc::new(QueuePair::new(
            socket, qp_num, self.lid, self.gid, qp_type, tx_depth, rx_depth,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qp_numbers_are_distinct() {
        let dev = Device::open("127.0.0.1".parse().unwrap());
        let a = dev.create_qp(QpType::Rc, 16, 16).unwrap();
        let b = dev.create_qp(QpType::Rc, 16, 16).unwrap();
        assert_ne!(a.qp_num(), b.qp_num());
        assert_eq!(a.lid(), b.lid());
    }
}
