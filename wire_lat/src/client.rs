//! Client side: the posting engine that floods the server, the pollers
//! that timestamp completions, and the final latency report.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rand::distributions::{Bernoulli, Distribution};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use bench_util::args::{CmdlineArgs, ConfigError};
use bench_util::fabric::{Completion, Device, WC_SUCCESS};
use bench_util::rdtsc::{cpu_mhz, get_rdtsc_timespec, time_elapsed_in_sec, time_elapsed_in_us};
use bench_util::thread_opt;
use bench_util::{MSG_CTL_STOP, MSG_REGULAR};
use latbencher_core::{BenchStat, RolePool, RunFlag, SimpleBenchReporter};

use crate::collector::{self, collect_and_dump, LatencySummary};
use crate::conn::{Connection, Registry};
use crate::handshake;
use crate::rate::{calc_gap_cycle, BurstPacer};
use crate::{BenchError, ThreadTask};

/// completions drained per poll call
const POLL_BATCH: usize = 16;

/// Connect to the server, run the measurement, and dump the CSVs.
pub fn run_client(args: &CmdlineArgs) -> Result<LatencySummary, BenchError> {
    let mut stream = TcpStream::connect((args.destination.as_str(), args.port))?;
    info!(
        "Connected to {}:{} from {}",
        args.destination,
        args.port,
        stream.local_addr()?
    );

    let device = Device::open(stream.local_addr()?.ip());
    // the loopback pair never leaves the host
    let loopback_device = Device::open("127.0.0.1".parse().unwrap());

    let registry = Registry::new();
    let primary = Arc::new(Connection::new(&device, args, true)?);
    let loopback1 = Arc::new(Connection::new(&loopback_device, args, true)?);
    let loopback2 = Arc::new(Connection::new(&loopback_device, args, false)?);
    let primary_idx = registry.insert(primary.clone())?;
    let loopback_idx = registry.insert(loopback1.clone())?;
    registry.insert(loopback2.clone())?;

    handshake::connect_qp_client(&primary, &loopback1, &loopback2, &mut stream)?;

    let result = run_test_client(args, primary_idx, &primary, loopback_idx, &loopback1, &loopback2)
        .and_then(|()| collect_and_dump(&primary, &loopback1, &args.output));

    // the stop control message is the server's only termination signal;
    // it has to go out even when the run failed, or the peer spins
    // forever
    if let Err(err) = primary
        .qp(0)
        .post_send(&[0u8; 1], MSG_CTL_STOP as u64, MSG_CTL_STOP, false)
    {
        warn!("failed to send the stop control message: {}", err);
    }

    let summary = result?;
    info!(
        "{} of {} samples counted, histogram at {} (raw at {}_raw)",
        summary.counted, summary.total, args.output, args.output
    );
    Ok(summary)
}

/// Spawn the client worker pools and join them in dependency order:
/// posters first, then the pollers they feed.
pub fn run_test_client(
    args: &CmdlineArgs,
    primary_idx: usize,
    primary: &Arc<Connection>,
    loopback_idx: usize,
    loopback1: &Arc<Connection>,
    loopback2: &Arc<Connection>,
) -> Result<(), BenchError> {
    let send_pollers = spawn_send_pollers(
        "send-poller",
        primary_idx,
        primary.clone(),
        args.client_poll_send_threads,
    );
    let loopback_send_pollers = spawn_send_pollers(
        "loopback-send-poller",
        loopback_idx,
        loopback1.clone(),
        args.client_poll_send_threads,
    );
    let loopback_recv_pollers = spawn_loopback_recv_pollers(args, loopback2.clone());

    let stat = Arc::new(BenchStat::default());
    let report_flag = RunFlag::new();
    let reporter = spawn_reporter(report_flag.clone(), stat.clone());

    let posters = spawn_posters(args, primary.clone(), loopback1.clone(), stat)?;
    let post_result = posters.join();

    report_flag.stop();
    let _ = reporter.join();

    // pollers drain whatever the posters left in flight before stopping
    wait_for_drain(primary, args.tx_depth);
    wait_for_drain(loopback1, args.tx_depth);
    primary.stop_polling();
    loopback1.stop_polling();
    loopback2.stop_polling();
    let poll_result = send_pollers
        .join()
        .and(loopback_send_pollers.join())
        .and(loopback_recv_pollers.join());

    post_result?;
    poll_result?;
    Ok(())
}

fn spawn_posters(
    args: &CmdlineArgs,
    primary: Arc<Connection>,
    loopback1: Arc<Connection>,
    stat: Arc<BenchStat>,
) -> Result<RolePool<BenchError>, BenchError> {
    let gap_cycle = if args.bw_limiter {
        calc_gap_cycle(
            args.rate_limit,
            args.msg_size,
            args.client_post_threads,
            args.burst_size,
            cpu_mhz(),
        )
    } else {
        0
    };
    let sampler = Bernoulli::new(args.sampling_ratio)
        .map_err(|_| ConfigError::Invalid("sampling_ratio must lie in [0, 1]".into()))?;

    let num_qps = primary.num_qps();
    let (msg_size, tx_depth) = (args.msg_size, args.tx_depth);
    let (sampling, warmup_ops) = (args.sampling, args.warmup_ops);
    let (duration, message_per_thread) = (args.duration, args.message_per_thread());
    let (bw_limiter, burst_size, realtime) = (args.bw_limiter, args.burst_size, args.realtime);

    let tasks = (0..args.client_post_threads as usize).map(|thread_id| ThreadTask {
        thread_id,
        conn_idx: 0,
    });
    Ok(RolePool::spawn("poster", tasks, move |task: ThreadTask| {
        thread_opt::optimize_thread(task.thread_id, realtime);

        let qp_idx = task.thread_id % num_qps;
        let qp = primary.qp(qp_idx);
        let lqp = loopback1.qp(qp_idx);
        let counters = primary.counters(qp_idx);

        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed + task.thread_id as u64);
        let mut pacer = if bw_limiter {
            BurstPacer::new(true, burst_size, gap_cycle)
        } else {
            BurstPacer::disabled()
        };

        let mut posted: u64 = 0;
        let start = get_rdtsc_timespec();
        loop {
            if duration > 0 {
                if time_elapsed_in_sec(start) >= duration as f64 {
                    break;
                }
            } else if posted >= message_per_thread {
                break;
            }

            // flow control: never more than tx_depth sends outstanding
            if counters.inflight_send() >= tx_depth as u64 {
                std::hint::spin_loop();
                continue;
            }
            debug_assert!(counters.inflight_send() < tx_depth as u64);
            if !pacer.ready() {
                continue;
            }

            let sampled = sampling && posted >= warmup_ops && sampler.sample(&mut rng);
            let seq = if sampled { primary.next_sample_seq() } else { None };
            match seq {
                Some(seq) => {
                    let wire_start = get_rdtsc_timespec();
                    qp.post_send(primary.payload(qp_idx, msg_size), seq, seq as u32, true)?;
                    let local_start = get_rdtsc_timespec();
                    lqp.post_send(loopback1.payload(qp_idx, msg_size), seq, seq as u32, true)?;
                    primary.record_sample_start(seq, wire_start);
                    loopback1.record_sample_start(seq, local_start);
                    loopback1
                        .counters(qp_idx)
                        .posted_wr
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                None => {
                    qp.post_send(
                        primary.payload(qp_idx, msg_size),
                        MSG_REGULAR as u64,
                        MSG_REGULAR,
                        true,
                    )?;
                }
            }
            counters
                .posted_wr
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            pacer.on_post();
            posted += 1;
            stat.finished_one_op();
        }

        let duration_us = time_elapsed_in_us(start);
        info!(
            "poster[{}]: {} msgs in {:.0} us, {:.4} Mops/s, {:.3} Gb/s",
            task.thread_id,
            posted,
            duration_us,
            collector::throughput_mops(posted, duration_us),
            collector::bandwidth_gbps(posted, msg_size, duration_us),
        );
        Ok(())
    }))
}

/// Send-completion pollers of one connection. Each thread strides over
/// the connection's queue pairs; a non-sentinel work-request id is a
/// sampled post whose completion timestamp pairs with its recorded start.
fn spawn_send_pollers(
    role: &str,
    conn_idx: usize,
    conn: Arc<Connection>,
    num_threads: u32,
) -> RolePool<BenchError> {
    let num_threads = num_threads.max(1) as usize;
    let tasks = (0..num_threads).map(move |thread_id| ThreadTask {
        thread_id,
        conn_idx,
    });
    RolePool::spawn(role, tasks, move |task: ThreadTask| {
        let mut wc = [Completion::default(); POLL_BATCH];
        while conn.polling() {
            for qp_idx in (task.thread_id..conn.num_qps()).step_by(num_threads) {
                let n = conn.qp(qp_idx).poll_send_cq(&mut wc)?;
                if n == 0 {
                    std::hint::spin_loop();
                    continue;
                }
                let end = get_rdtsc_timespec();
                for entry in &wc[..n] {
                    if entry.status != WC_SUCCESS {
                        return Err(BenchError::CompletionStatus {
                            thread_id: task.thread_id,
                            status: entry.status,
                        });
                    }
                    if entry.wr_id != MSG_REGULAR as u64 && entry.wr_id != MSG_CTL_STOP as u64 {
                        conn.record_sample_end(entry.wr_id, end);
                    }
                }
                conn.counters(qp_idx)
                    .completed_wr
                    .fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
            }
        }
        Ok(())
    })
}

/// Receive side of the loopback pair: keep the second loopback
/// connection's receive queues full so the first one's sends always land.
fn spawn_loopback_recv_pollers(
    args: &CmdlineArgs,
    loopback2: Arc<Connection>,
) -> RolePool<BenchError> {
    let num_threads = args.client_poll_recv_threads.max(1) as usize;
    let rx_depth = args.rx_depth;
    let tasks = (0..num_threads).map(|thread_id| ThreadTask {
        thread_id,
        conn_idx: 0,
    });
    RolePool::spawn("loopback-recv-poller", tasks, move |task: ThreadTask| {
        // pre-post the full receive depth before any send can arrive
        for qp_idx in (task.thread_id..loopback2.num_qps()).step_by(num_threads) {
            let qp = loopback2.qp(qp_idx);
            for _ in 0..rx_depth {
                qp.post_recv(MSG_REGULAR as u64)?;
            }
            loopback2
                .counters(qp_idx)
                .recv_posted_wr
                .fetch_add(rx_depth as u64, std::sync::atomic::Ordering::Relaxed);
        }

        let mut wc = [Completion::default(); POLL_BATCH];
        while loopback2.polling() {
            for qp_idx in (task.thread_id..loopback2.num_qps()).step_by(num_threads) {
                let qp = loopback2.qp(qp_idx);
                let n = qp.poll_recv_cq(&mut wc)?;
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
                    qp.post_recv(MSG_REGULAR as u64)?;
                }
                let counters = loopback2.counters(qp_idx);
                counters
                    .recv_completed_wr
                    .fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
                counters
                    .recv_posted_wr
                    .fetch_add(n as u64, std::sync::atomic::Ordering::Relaxed);
            }
        }
        Ok(())
    })
}

fn spawn_reporter(flag: RunFlag, stat: Arc<BenchStat>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reporter = SimpleBenchReporter::new();
        while flag.running() {
            std::thread::sleep(Duration::from_secs(1));
            if !flag.running() {
                break;
            }
            info!("{}", reporter.report_collected_stat(&[stat.clone()]));
        }
    })
}

/// Give the pollers a bounded window to retire the in-flight tail.
fn wait_for_drain(conn: &Connection, tx_depth: u32) {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let inflight: u64 = (0..conn.num_qps())
            .map(|qp_idx| conn.counters(qp_idx).inflight_send())
            .sum();
        if inflight == 0 {
            return;
        }
        if std::time::Instant::now() >= deadline {
            warn!(
                "{} send(s) still in flight after drain window (depth {})",
                inflight, tx_depth
            );
            return;
        }
        std::thread::yield_now();
    }
}
