//! Client and server wired together in-process over localhost.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use clap::Parser;

use bench_util::args::CmdlineArgs;
use bench_util::fabric::Device;
use bench_util::rdtsc::init_rdtsc;
use bench_util::MSG_CTL_STOP;
use latbencher_core::RunFlag;
use wire_lat::client::{run_client, run_test_client};
use wire_lat::conn::Connection;
use wire_lat::handshake;
use wire_lat::server;

/// Skip the calibration spin; tests only need a monotonic clock, not an
/// accurate one.
fn init_clock() {
    let _ = init_rdtsc(false, 3.0);
}

fn test_args(port: u16, output: &str) -> CmdlineArgs {
    let mut args = CmdlineArgs::parse_from([
        "wire_lat",
        "--iterations",
        "2000",
        "--warmup-ops",
        "0",
        "--sampling",
        "--sampling-ratio",
        "0.2",
        "--tx-depth",
        "32",
        "--port",
        &port.to_string(),
        "--output",
        output,
    ]);
    args.coordinate().unwrap();
    args
}

#[test]
fn test_handshake_wires_peers_symmetrically() {
    init_clock();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let args = test_args(port, "unused.csv");

    let server_args = args.clone();
    let server_side = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let device = Device::open(stream.local_addr().unwrap().ip());
        let conn = Connection::new(&device, &server_args, false).unwrap();
        handshake::connect_qp_server(&conn, &mut stream).unwrap();
        conn
    });

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let device = Device::open(stream.local_addr().unwrap().ip());
    let loopback_device = Device::open("127.0.0.1".parse().unwrap());
    let primary = Connection::new(&device, &args, true).unwrap();
    let loopback1 = Connection::new(&loopback_device, &args, true).unwrap();
    let loopback2 = Connection::new(&loopback_device, &args, false).unwrap();
    handshake::connect_qp_client(&primary, &loopback1, &loopback2, &mut stream).unwrap();

    let server_conn = server_side.join().unwrap();
    // both ends of the primary pair learned each other's queue-pair number
    assert_eq!(
        primary.qp(0).remote_qpn(),
        Some(server_conn.qp(0).qp_num())
    );
    assert_eq!(
        server_conn.qp(0).remote_qpn(),
        Some(primary.qp(0).qp_num())
    );
    // the loopback pair is wired to itself, never to the server
    assert_eq!(loopback1.qp(0).remote_qpn(), Some(loopback2.qp(0).qp_num()));
    assert_eq!(loopback2.qp(0).remote_qpn(), Some(loopback1.qp(0).qp_num()));
}

#[test]
fn test_full_run_produces_histograms() {
    init_clock();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let output = std::env::temp_dir()
        .join(format!("wire_lat_e2e_{}.csv", std::process::id()))
        .to_str()
        .unwrap()
        .to_string();
    let args = test_args(port, &output);

    let server_args = args.clone();
    let server_side = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let device = Device::open(stream.local_addr().unwrap().ip());
        let conn = Arc::new(Connection::new(&device, &server_args, false).unwrap());
        server::handle_client(stream, &server_args, &conn, RunFlag::new())
    });

    let summary = run_client(&args).unwrap();
    // the stop control message ends the server side as well
    server_side.join().unwrap().unwrap();

    assert!(summary.total > 0);
    assert!(summary.counted <= summary.total);
    assert!(summary.p50 <= summary.p99);
    assert!(summary.p99 <= summary.p9999);

    let raw = std::fs::read_to_string(format!("{}_raw", output)).unwrap();
    let filtered = std::fs::read_to_string(&output).unwrap();
    assert_eq!(raw.lines().count() as u64, summary.total);
    assert_eq!(filtered.lines().count() as u64, summary.counted);
    for line in filtered.lines() {
        let isolated: f64 = line.rsplit(',').next().unwrap().parse().unwrap();
        assert!(isolated > 0.0, "filtered row with non-positive latency: {}", line);
    }

    let _ = std::fs::remove_file(&output);
    let _ = std::fs::remove_file(format!("{}_raw", output));
}

#[test]
fn test_failed_run_still_stops_the_server() {
    init_clock();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    // unwritable output path makes the collection step fail after the
    // traffic phase
    let args = test_args(port, "/nonexistent-dir/latency.csv");

    let server_args = args.clone();
    let server_side = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let device = Device::open(stream.local_addr().unwrap().ip());
        let conn = Arc::new(Connection::new(&device, &server_args, false).unwrap());
        server::handle_client(stream, &server_args, &conn, RunFlag::new())
    });

    assert!(run_client(&args).is_err());
    // the stop control message went out despite the failure, so the
    // server run terminates instead of spinning forever
    server_side.join().unwrap().unwrap();
}

#[test]
fn test_counters_settle_at_queue_depth_bounds() {
    init_clock();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let args = test_args(port, "unused_depth.csv");

    let server_args = args.clone();
    let server_side = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let device = Device::open(stream.local_addr().unwrap().ip());
        let conn = Arc::new(Connection::new(&device, &server_args, false).unwrap());
        server::handle_client(stream, &server_args, &conn, RunFlag::new()).map(|()| conn)
    });

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let device = Device::open(stream.local_addr().unwrap().ip());
    let loopback_device = Device::open("127.0.0.1".parse().unwrap());
    let primary = Arc::new(Connection::new(&device, &args, true).unwrap());
    let loopback1 = Arc::new(Connection::new(&loopback_device, &args, true).unwrap());
    let loopback2 = Arc::new(Connection::new(&loopback_device, &args, false).unwrap());
    handshake::connect_qp_client(&primary, &loopback1, &loopback2, &mut stream).unwrap();

    run_test_client(&args, 0, &primary, 1, &loopback1, &loopback2).unwrap();
    primary
        .qp(0)
        .post_send(&[0u8; 1], MSG_CTL_STOP as u64, MSG_CTL_STOP, false)
        .unwrap();
    let server_conn = server_side.join().unwrap().unwrap();

    use std::sync::atomic::Ordering;
    // once the run drains, every send that was posted has completed
    for conn in [&primary, &loopback1] {
        for qp_idx in 0..conn.num_qps() {
            let counters = conn.counters(qp_idx);
            assert_eq!(
                counters.posted_wr.load(Ordering::Relaxed),
                counters.completed_wr.load(Ordering::Relaxed)
            );
        }
    }
    // receive sides never exceed their configured depth
    for conn in [&loopback2, &server_conn] {
        for qp_idx in 0..conn.num_qps() {
            assert!(conn.counters(qp_idx).inflight_recv() <= args.rx_depth as u64);
        }
    }
}
