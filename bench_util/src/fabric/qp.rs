use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicU32, Ordering};
use std::sync::Mutex;

use log::debug;

use super::{FabricError, Gid, QpEndpoint, QpState, WC_SUCCESS};
use crate::args::QpType;

/// retry/timeout policy fixed at the RTS transition
pub const RTS_TIMEOUT: u8 = 14;
pub const RTS_RETRY_CNT: u8 = 7;
pub const RTS_RNR_RETRY: u8 = 7;

/// bytes prepended to every datagram: immediate data + payload length
const WIRE_HEADER: usize = 8;
/// largest payload one datagram can carry
const MAX_DATAGRAM: usize = 65507 - WIRE_HEADER;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WcOpcode {
    #[default]
    Send,
    Recv,
}

/// One completion-queue entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Completion {
    pub wr_id: u64,
    pub imm_data: u32,
    pub status: u32,
    pub opcode: WcOpcode,
    pub byte_len: u32,
}

/// A queue pair of the software fabric: one socket, a posted-receive
/// queue, and separate send/receive completion queues. All methods take
/// `&self`; distinct roles poll distinct completion queues.
pub struct QueuePair {
    socket: UdpSocket,
    qp_num: i32,
    lid: i32,
    gid: Gid,
    qp_type: QpType,
    tx_depth: u32,
    rx_depth: u32,

    state: AtomicU8,
    access_flags: AtomicU32,
    remote: Mutex<Option<QpEndpoint>>,

    posted_recvs: Mutex<VecDeque<u64>>,
    send_cq: Mutex<VecDeque<Completion>>,
    recv_cq: Mutex<VecDeque<Completion>>,

    /// datagrams that arrived with no posted receive, dropped
    rnr_drops: AtomicU64,
}

fn state_from_u8(raw: u8) -> QpState {
    match raw {
        0 => QpState::Reset,
        1 => QpState::Init,
        2 => QpState::Rtr,
        _ => QpState::Rts,
    }
}

fn state_to_u8(state: QpState) -> u8 {
    match state {
        QpState::Reset => 0,
        QpState::Init => 1,
        QpState::Rtr => 2,
        QpState::Rts => 3,
    }
}

impl QueuePair {
    pub(super) fn new(
        socket: UdpSocket,
        qp_num: i32,
        lid: i32,
        gid: Gid,
        qp_type: QpType,
        tx_depth: u32,
        rx_depth: u32,
    ) -> Self {
        Self {
            socket,
            qp_num,
            lid,
            gid,
            qp_type,
            tx_depth,
            rx_depth,
            state: AtomicU8::new(state_to_u8(QpState::Reset)),
            access_flags: AtomicU32::new(0),
            remote: Mutex::new(None),
            posted_recvs: Mutex::new(VecDeque::new()),
            send_cq: Mutex::new(VecDeque::new()),
            recv_cq: Mutex::new(VecDeque::new()),
            rnr_drops: AtomicU64::new(0),
        }
    }

    pub fn qp_num(&self) -> i32 {
        self.qp_num
    }

    pub fn lid(&self) -> i32 {
        self.lid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn qp_type(&self) -> QpType {
        self.qp_type
    }

    pub fn tx_depth(&self) -> u32 {
        self.tx_depth
    }

    pub fn rx_depth(&self) -> u32 {
        self.rx_depth
    }

    pub fn state(&self) -> QpState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    /// Addressing record advertised to the peer during the handshake.
    pub fn endpoint(&self) -> QpEndpoint {
        QpEndpoint {
            lid: self.lid,
            qp_num: self.qp_num,
            gid: self.gid,
        }
    }

    /// Queue-pair number of the connected peer, if RTR was reached.
    pub fn remote_qpn(&self) -> Option<i32> {
        self.remote.lock().unwrap().map(|ep| ep.qp_num)
    }

    pub fn rnr_drops(&self) -> u64 {
        self.rnr_drops.load(Ordering::Relaxed)
    }

    fn transition(&self, from: QpState, to: QpState) -> Result<(), FabricError> {
        self.state
            .compare_exchange(
                state_to_u8(from),
                state_to_u8(to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|cur| FabricError::InvalidTransition {
                from: state_from_u8(cur),
                to,
            })
    }

    /// RESET -> INIT: fix the access flags and the port the queue pair
    /// serves on.
    pub fn modify_to_init(&self, access_flags: u32) -> Result<(), FabricError> {
        self.transition(QpState::Reset, QpState::Init)?;
        self.access_flags.store(access_flags, Ordering::Release);
        Ok(())
    }

    /// INIT -> RTR: wire this queue pair to the peer described by the
    /// handshake record. A non-zero global identifier selects the globally
    /// routed address; otherwise the peer is resolved locally by lid.
    pub fn modify_to_rtr(&self, remote: QpEndpoint) -> Result<(), FabricError> {
        self.transition(QpState::Init, QpState::Rtr)?;
        self.socket.connect(remote.addr())?;
        *self.remote.lock().unwrap() = Some(remote);
        debug!(
            "qp[{}] -> RTR, peer qp[{}] at {}",
            self.qp_num,
            remote.qp_num,
            remote.addr()
        );
        Ok(())
    }

    /// RTR -> RTS. The retry/timeout policy is fixed; nothing about it is
    /// negotiated.
    pub fn modify_to_rts(&self) -> Result<(), FabricError> {
        self.transition(QpState::Rtr, QpState::Rts)?;
        let _ = (RTS_TIMEOUT, RTS_RETRY_CNT, RTS_RNR_RETRY);
        Ok(())
    }

    /// Submit a send work request carrying `imm_data`; a signaled request
    /// produces an entry on the send completion queue.
    pub fn post_send(
        &self,
        payload: &[u8],
        wr_id: u64,
        imm_data: u32,
        signal: bool,
    ) -> Result<(), FabricError> {
        if self.state() != QpState::Rts {
            return Err(FabricError::NotReady);
        }
        if payload.len() > MAX_DATAGRAM {
            return Err(FabricError::MessageTooLarge(payload.len() as u32));
        }

        let mut packet = Vec::with_capacity(WIRE_HEADER + payload.len());
        packet.extend_from_slice(&imm_data.to_be_bytes());
        packet.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        packet.extend_from_slice(payload);

        loop {
            match self.socket.send(&packet) {
                Ok(_) => break,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    // local socket buffer full; the reader side drains it
                    std::hint::spin_loop();
                }
                Err(err) => return Err(err.into()),
            }
        }

        if signal {
            self.send_cq.lock().unwrap().push_back(Completion {
                wr_id,
                imm_data,
                status: WC_SUCCESS,
                opcode: WcOpcode::Send,
                byte_len: payload.len() as u32,
            });
        }
        Ok(())
    }

    /// Queue one receive work request. Fails when the receive queue is
    /// already at depth, which mirrors a hardware receive-queue overflow.
    pub fn post_recv(&self, wr_id: u64) -> Result<(), FabricError> {
        if self.state() == QpState::Reset {
            return Err(FabricError::NotReady);
        }
        let mut posted = self.posted_recvs.lock().unwrap();
        if posted.len() >= self.rx_depth as usize {
            return Err(FabricError::RecvQueueFull);
        }
        posted.push_back(wr_id);
        Ok(())
    }

    /// Non-blocking poll of the send completion queue. Returns the number
    /// of entries written into `wc`.
    pub fn poll_send_cq(&self, wc: &mut [Completion]) -> Result<usize, FabricError> {
        let mut cq = self.send_cq.lock().unwrap();
        let n = cq.len().min(wc.len());
        for slot in wc.iter_mut().take(n) {
            *slot = cq.pop_front().unwrap();
        }
        Ok(n)
    }

    /// Non-blocking poll of the receive completion queue. Drains the
    /// socket first: each arrived datagram consumes one posted receive and
    /// becomes a completion carrying the sender's immediate data.
    pub fn poll_recv_cq(&self, wc: &mut [Completion]) -> Result<usize, FabricError> {
        self.drain_socket()?;
        let mut cq = self.recv_cq.lock().unwrap();
        let n = cq.len().min(wc.len());
        for slot in wc.iter_mut().take(n) {
            *slot = cq.pop_front().unwrap();
        }
        Ok(n)
    }

    fn drain_socket(&self) -> Result<(), FabricError> {
        let mut buf = [0u8; WIRE_HEADER + MAX_DATAGRAM];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(len) if len >= WIRE_HEADER => {
                    let imm_data = u32::from_be_bytes(buf[0..4].try_into().unwrap());
                    let byte_len = u32::from_be_bytes(buf[4..8].try_into().unwrap());
                    let wr_id = match self.posted_recvs.lock().unwrap().pop_front() {
                        Some(id) => id,
                        None => {
                            // receiver not ready: the datagram is lost
                            self.rnr_drops.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    };
                    self.recv_cq.lock().unwrap().push_back(Completion {
                        wr_id,
                        imm_data,
                        status: WC_SUCCESS,
                        opcode: WcOpcode::Recv,
                        byte_len,
                    });
                }
                Ok(_) => continue, // runt datagram, ignore
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::ConnectionRefused => {
                    // peer socket briefly gone; treated as datagram loss
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::Device;
    use super::*;

    fn rts_pair() -> (std::sync::Arc<QueuePair>, std::sync::Arc<QueuePair>) {
        let dev = Device::open("127.0.0.1".parse().unwrap());
        let a = dev.create_qp(QpType::Rc, 32, 32).unwrap();
        let b = dev.create_qp(QpType::Rc, 32, 32).unwrap();
        for (qp, peer) in [(&a, &b), (&b, &a)] {
            qp.modify_to_init(super::super::ACCESS_LOCAL_WRITE)
                .unwrap();
            qp.modify_to_rtr(peer.endpoint()).unwrap();
            qp.modify_to_rts().unwrap();
        }
        (a, b)
    }

    #[test]
    fn test_state_machine_order_enforced() {
        let dev = Device::open("127.0.0.1".parse().unwrap());
        let qp = dev.create_qp(QpType::Rc, 4, 4).unwrap();
        // RTS straight from RESET must fail
        assert!(qp.modify_to_rts().is_err());
        qp.modify_to_init(0).unwrap();
        assert!(qp.modify_to_init(0).is_err());
        qp.modify_to_rtr(qp.endpoint()).unwrap();
        qp.modify_to_rts().unwrap();
        assert_eq!(qp.state(), QpState::Rts);
    }

    #[test]
    fn test_send_requires_rts() {
        let dev = Device::open("127.0.0.1".parse().unwrap());
        let qp = dev.create_qp(QpType::Rc, 4, 4).unwrap();
        assert!(matches!(
            qp.post_send(b"hello", 0, 0, true),
            Err(FabricError::NotReady)
        ));
    }

    #[test]
    fn test_send_recv_carries_immediate() {
        let (a, b) = rts_pair();
        b.post_recv(77).unwrap();
        a.post_send(&[0u8; 64], 5, 1234, true).unwrap();

        let mut wc = [Completion::default(); 4];
        assert_eq!(a.poll_send_cq(&mut wc).unwrap(), 1);
        assert_eq!(wc[0].wr_id, 5);

        let mut got = 0;
        while got == 0 {
            got = b.poll_recv_cq(&mut wc).unwrap();
        }
        assert_eq!(wc[0].wr_id, 77);
        assert_eq!(wc[0].imm_data, 1234);
        assert_eq!(wc[0].byte_len, 64);
        assert_eq!(wc[0].status, WC_SUCCESS);
    }

    #[test]
    fn test_unsignaled_send_skips_cq() {
        let (a, b) = rts_pair();
        b.post_recv(1).unwrap();
        a.post_send(&[0u8; 8], 0, 0, false).unwrap();
        let mut wc = [Completion::default(); 1];
        assert_eq!(a.poll_send_cq(&mut wc).unwrap(), 0);
    }

    #[test]
    fn test_recv_queue_depth_enforced() {
        let dev = Device::open("127.0.0.1".parse().unwrap());
        let qp = dev.create_qp(QpType::Rc, 4, 2).unwrap();
        qp.modify_to_init(0).unwrap();
        qp.post_recv(0).unwrap();
        qp.post_recv(1).unwrap();
        assert!(matches!(qp.post_recv(2), Err(FabricError::RecvQueueFull)));
    }
}
