//! Server side: accept clients over the handshake socket and sink their
//! traffic, keeping the receive queues full until the stop control
//! message arrives.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use bench_util::args::CmdlineArgs;
use bench_util::fabric::{Completion, Device, WC_SUCCESS};
use bench_util::rdtsc::{get_rdtsc_timespec, time_elapsed_in_us, Timespec};
use bench_util::thread_opt;
use bench_util::{MSG_CTL_STOP, MSG_REGULAR};
use latbencher_core::{RolePool, RunFlag};

use crate::collector;
use crate::conn::{Connection, Registry};
use crate::handshake;
use crate::{BenchError, ThreadTask};

/// completions drained per poll call
const POLL_BATCH: usize = 16;

/// how long the accept loop sleeps between polls of the listening socket
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Serve clients until `run` is stopped. Each accepted client gets its
/// own registry slot and worker pools; a failing client never takes the
/// server down.
pub fn run_server(args: &CmdlineArgs, run: RunFlag) -> Result<(), BenchError> {
    let listener = TcpListener::bind(("0.0.0.0", args.port))?;
    listener.set_nonblocking(true)?;
    info!("Listening on port {}", args.port);

    let registry = Arc::new(Registry::new());
    let mut clients = Vec::new();
    while run.running() {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("Accepted client {}", peer);
                let args = args.clone();
                let registry = registry.clone();
                let run = run.clone();
                clients.push(std::thread::spawn(move || {
                    if let Err(err) = serve_client(stream, &args, &registry, run) {
                        error!("client {}: {}", peer, err);
                    }
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => return Err(err.into()),
        }
    }

    info!("Shutting down, waiting for {} client(s)", clients.len());
    for handle in clients {
        if handle.join().is_err() {
            warn!("a client thread panicked");
        }
    }
    Ok(())
}

fn serve_client(
    stream: TcpStream,
    args: &CmdlineArgs,
    registry: &Registry,
    run: RunFlag,
) -> Result<(), BenchError> {
    let conn = Arc::new(Connection::new(
        &Device::open(stream.local_addr()?.ip()),
        args,
        false,
    )?);
    let idx = registry.insert(conn.clone())?;
    let result = handle_client(stream, args, &conn, run);
    registry.remove(idx);
    result
}

/// Handshake with one client and sink its traffic to completion.
pub fn handle_client(
    mut stream: TcpStream,
    args: &CmdlineArgs,
    conn: &Arc<Connection>,
    run: RunFlag,
) -> Result<(), BenchError> {
    handshake::connect_qp_server(conn, &mut stream)?;
    run_test_server(args, conn, run)
}

/// Spawn the server worker pools and join them in dependency order: the
/// receive pollers decide when the run is over, the others follow.
fn run_test_server(
    args: &CmdlineArgs,
    conn: &Arc<Connection>,
    run: RunFlag,
) -> Result<(), BenchError> {
    // fill every receive queue before the client's first datagram can
    // arrive
    for qp_idx in 0..conn.num_qps() {
        let qp = conn.qp(qp_idx);
        for _ in 0..args.rx_depth {
            qp.post_recv(MSG_REGULAR as u64)?;
        }
        conn.counters(qp_idx)
            .recv_posted_wr
            .fetch_add(args.rx_depth as u64, std::sync::atomic::Ordering::Relaxed);
    }

    let recv_pollers = spawn_recv_pollers(args, conn.clone(), run);
    let recv_posters = spawn_recv_posters(args, conn.clone());
    let send_pollers = spawn_send_pollers(args, conn.clone());

    let recv_result = recv_pollers.join();
    conn.stop_polling();
    let aux_result = recv_posters.join().and(send_pollers.join());

    for qp_idx in 0..conn.num_qps() {
        let drops = conn.qp(qp_idx).rnr_drops();
        if drops > 0 {
            warn!("qp[{}]: {} datagram(s) arrived with no posted receive", qp_idx, drops);
        }
    }
    recv_result?;
    aux_result?;
    Ok(())
}

/// Receive-completion pollers. The stop control message from the client
/// ends the run; everything received after the warmup threshold counts
/// toward the reported sink throughput.
fn spawn_recv_pollers(
    args: &CmdlineArgs,
    conn: Arc<Connection>,
    run: RunFlag,
) -> RolePool<BenchError> {
    let num_threads = args.server_poll_recv_threads.max(1) as usize;
    let (warmup_ops, msg_size, realtime) = (args.warmup_ops, args.msg_size, args.realtime);
    let tasks = (0..num_threads).map(|thread_id| ThreadTask {
        thread_id,
        conn_idx: 0,
    });
    RolePool::spawn("recv-poller", tasks, move |task: ThreadTask| {
        thread_opt::optimize_thread(task.thread_id, realtime);

        let mut wc = [Completion::default(); POLL_BATCH];
        let mut received: u64 = 0;
        let mut timed: Option<(Timespec, u64)> = None;
        while conn.polling() && run.running() {
            for qp_idx in (task.thread_id..conn.num_qps()).step_by(num_threads) {
                let n = conn.qp(qp_idx).poll_recv_cq(&mut wc)?;
                if n == 0 {
                    std::hint::spin_loop();
                    continue;
                }
                for entry in &wc[..n] {
                    if entry.status != WC_SUCCESS {
                        return Err(BenchError::CompletionStatus {
                            thread_id: task.thread_id,
                            status: entry.status,
                        });
                    }
                    if entry.imm_data == MSG_CTL_STOP {
                        info!("recv-poller[{}]: stop control message", task.thread_id);
                        conn.stop_polling();
                    }
                }
                received += n as u64;
                conn.counters(qp_idx)
                    .recv_completed_wr
                    .fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
                if timed.is_none() && received >= warmup_ops {
                    timed = Some((get_rdtsc_timespec(), received));
                }
            }
        }

        if let Some((start, base)) = timed {
            let ops = received - base;
            let duration_us = time_elapsed_in_us(start);
            info!(
                "recv-poller[{}]: {} msgs after warmup in {:.0} us, {:.4} Mops/s, {:.3} Gb/s",
                task.thread_id,
                ops,
                duration_us,
                collector::throughput_mops(ops, duration_us),
                collector::bandwidth_gbps(ops, msg_size, duration_us),
            );
        }
        Ok(())
    })
}

/// Keep every receive queue topped up to its depth.
fn spawn_recv_posters(args: &CmdlineArgs, conn: Arc<Connection>) -> RolePool<BenchError> {
    let num_threads = args.server_post_recv_threads.max(1) as usize;
    let rx_depth = args.rx_depth as u64;
    let tasks = (0..num_threads).map(|thread_id| ThreadTask {
        thread_id,
        conn_idx: 0,
    });
    RolePool::spawn("recv-poster", tasks, move |task: ThreadTask| {
        while conn.polling() {
            for qp_idx in (task.thread_id..conn.num_qps()).step_by(num_threads) {
                let counters = conn.counters(qp_idx);
                if counters.inflight_recv() >= rx_depth {
                    std::hint::spin_loop();
                    continue;
                }
                match conn.qp(qp_idx).post_recv(MSG_REGULAR as u64) {
                    Ok(()) => {
                        counters
                            .recv_posted_wr
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    // another poster filled the queue first
                    Err(bench_util::fabric::FabricError::RecvQueueFull) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    })
}

/// The server posts no sends during a run; this pool exists so a send
/// completion queue can never back up if that changes.
fn spawn_send_pollers(args: &CmdlineArgs, conn: Arc<Connection>) -> RolePool<BenchError> {
    let num_threads = args.server_poll_send_threads.max(1) as usize;
    let tasks = (0..num_threads).map(|thread_id| ThreadTask {
        thread_id,
        conn_idx: 0,
    });
    RolePool::spawn("send-poller", tasks, move |task: ThreadTask| {
        let mut wc = [Completion::default(); POLL_BATCH];
        while conn.polling() {
            for qp_idx in (task.thread_id..conn.num_qps()).step_by(num_threads) {
                let n = conn.qp(qp_idx).poll_send_cq(&mut wc)?;
                if n > 0 {
                    conn.counters(qp_idx)
                        .completed_wr
                        .fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
                } else {
                    std::thread::yield_now();
                }
            }
        }
        Ok(())
    })
}
