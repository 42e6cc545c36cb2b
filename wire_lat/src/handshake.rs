//! Queue-pair handshake over the reliable socket.
//!
//! For every queue pair the two sides exchange one fixed-size addressing
//! record and then a 4-byte synchronization token. The token is a
//! barrier: neither side starts posting traffic for a queue pair before
//! the other has driven it all the way to ready-to-send.

use std::io::{Read, Write};
use std::net::TcpStream;

use log::info;

use bench_util::fabric::{
    QpEndpoint, Gid, QueuePair, ACCESS_LOCAL_WRITE, ACCESS_REMOTE_ATOMIC, ACCESS_REMOTE_READ,
    ACCESS_REMOTE_WRITE,
};
use bench_util::SYNC_TOKEN;

use crate::conn::Connection;
use crate::BenchError;

/// bytes of one addressing record on the wire
pub const QP_INFO_WIRE_SIZE: usize = 24;

/// Serialize one record: `{ i32 lid, i32 qp_num, byte[16] gid }` in the
/// host's native layout. Unframed; both ends agree on this layout out of
/// band.
pub fn encode_qp_info(ep: &QpEndpoint) -> [u8; QP_INFO_WIRE_SIZE] {
    let mut buf = [0u8; QP_INFO_WIRE_SIZE];
    buf[0..4].copy_from_slice(&ep.lid.to_ne_bytes());
    buf[4..8].copy_from_slice(&ep.qp_num.to_ne_bytes());
    buf[8..24].copy_from_slice(&ep.gid.0);
    buf
}

pub fn decode_qp_info(buf: &[u8; QP_INFO_WIRE_SIZE]) -> QpEndpoint {
    QpEndpoint {
        lid: i32::from_ne_bytes(buf[0..4].try_into().unwrap()),
        qp_num: i32::from_ne_bytes(buf[4..8].try_into().unwrap()),
        gid: Gid(buf[8..24].try_into().unwrap()),
    }
}

/// Drive a queue pair RESET -> INIT -> RTR -> RTS against the peer's
/// record. Any stage failing aborts the handshake for the whole
/// connection.
pub fn modify_qp_to_rts(qp: &QueuePair, remote: QpEndpoint) -> Result<(), BenchError> {
    qp.modify_to_init(
        ACCESS_LOCAL_WRITE | ACCESS_REMOTE_READ | ACCESS_REMOTE_WRITE | ACCESS_REMOTE_ATOMIC,
    )?;
    qp.modify_to_rtr(remote)?;
    qp.modify_to_rts()?;
    Ok(())
}

fn read_qp_info(stream: &mut TcpStream) -> Result<QpEndpoint, BenchError> {
    let mut buf = [0u8; QP_INFO_WIRE_SIZE];
    stream.read_exact(&mut buf)?;
    Ok(decode_qp_info(&buf))
}

fn write_qp_info(stream: &mut TcpStream, ep: &QpEndpoint) -> Result<(), BenchError> {
    stream.write_all(&encode_qp_info(ep))?;
    Ok(())
}

fn read_sync(stream: &mut TcpStream) -> Result<(), BenchError> {
    let mut buf = [0u8; SYNC_TOKEN.len()];
    stream.read_exact(&mut buf)?;
    if buf != SYNC_TOKEN {
        return Err(BenchError::SyncTokenMismatch);
    }
    Ok(())
}

fn write_sync(stream: &mut TcpStream) -> Result<(), BenchError> {
    stream.write_all(&SYNC_TOKEN)?;
    Ok(())
}

/// Server side of the handshake: receive the client's record first, then
/// answer with ours, bring the queue pair up, and sync read-then-write.
pub fn connect_qp_server(conn: &Connection, stream: &mut TcpStream) -> Result<(), BenchError> {
    for qp_idx in 0..conn.num_qps() {
        let qp = conn.qp(qp_idx);
        let remote = read_qp_info(stream)?;
        write_qp_info(stream, &qp.endpoint())?;
        modify_qp_to_rts(qp, remote)?;

        info!(
            "qp[{}] <-> qp[{}]",
            qp.qp_num(),
            remote.qp_num
        );

        read_sync(stream)?;
        write_sync(stream)?;
    }
    Ok(())
}

/// Client side: send our record first, receive the server's, bring the
/// primary queue pair up, and additionally wire the two colocated
/// loopback queue pairs to each other (their records never cross the
/// wire). Sync order mirrors the server: write-then-read.
pub fn connect_qp_client(
    conn: &Connection,
    loopback1: &Connection,
    loopback2: &Connection,
    stream: &mut TcpStream,
) -> Result<(), BenchError> {
    for qp_idx in 0..conn.num_qps() {
        let qp = conn.qp(qp_idx);
        write_qp_info(stream, &qp.endpoint())?;
        let remote = read_qp_info(stream)?;
        modify_qp_to_rts(qp, remote)?;

        let lqp1 = loopback1.qp(qp_idx);
        let lqp2 = loopback2.qp(qp_idx);
        modify_qp_to_rts(lqp1, lqp2.endpoint())?;
        modify_qp_to_rts(lqp2, lqp1.endpoint())?;

        info!("qp[{}] <-> qp[{}]", qp.qp_num(), remote.qp_num);
        info!("lqp[{}] <-> lqp[{}]", lqp1.qp_num(), lqp2.qp_num());

        write_sync(stream)?;
        read_sync(stream)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout_is_24_bytes() {
        let ep = QpEndpoint {
            lid: 7,
            qp_num: 41213,
            gid: Gid::from_ip("10.0.0.2".parse().unwrap()),
        };
        let wire = encode_qp_info(&ep);
        assert_eq!(wire.len(), QP_INFO_WIRE_SIZE);
        assert_eq!(decode_qp_info(&wire), ep);
    }

    #[test]
    fn test_record_native_field_order() {
        let ep = QpEndpoint {
            lid: 1,
            qp_num: 2,
            gid: Gid([9; 16]),
        };
        let wire = encode_qp_info(&ep);
        assert_eq!(wire[0..4], 1i32.to_ne_bytes());
        assert_eq!(wire[4..8], 2i32.to_ne_bytes());
        assert_eq!(wire[8..24], [9; 16]);
    }
}
