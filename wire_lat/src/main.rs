use std::fs::File;

use anyhow::Context;
use clap::Parser;
use log::*;
use simplelog::*;

use bench_util::args::CmdlineArgs;
use bench_util::rdtsc::init_rdtsc;
use latbencher_core::RunFlag;

use wire_lat::{client, server};

fn main() -> anyhow::Result<()> {
    let mut args = CmdlineArgs::parse();
    args.load_config_file().context("loading --config file")?;
    args.coordinate().context("invalid arguments")?;

    init_logging(&args)?;
    init_rdtsc(true, 0.0).context("calibrating the cycle clock")?;

    debug!(
        "Sanity check parameters: msg_size {}, qps {}, tx/rx depth {}/{}, \
         iterations {}, sampling {} (ratio {}), limiter {} ({} Mbps, burst {})",
        args.msg_size,
        args.qps,
        args.tx_depth,
        args.rx_depth,
        args.iterations,
        args.sampling,
        args.sampling_ratio,
        args.bw_limiter,
        args.rate_limit,
        args.burst_size,
    );

    if args.server {
        let run = RunFlag::new();
        let handler_flag = run.clone();
        ctrlc::set_handler(move || {
            info!("Interrupted, stopping the server");
            handler_flag.stop();
        })
        .context("installing the interrupt handler")?;
        server::run_server(&args, run)?;
    } else {
        let summary = client::run_client(&args)?;
        info!(
            "Done: avg {:.1} ns, p50 {:.1} ns, p99 {:.1} ns over {} sample(s)",
            summary.average, summary.p50, summary.p99, summary.counted
        );
    }
    Ok(())
}

fn init_logging(args: &CmdlineArgs) -> anyhow::Result<()> {
    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let log_path = if args.server { "server.log" } else { "client.log" };
    CombinedLogger::init(vec![
        TermLogger::new(
            level,
            Config::default(),
            TerminalMode::Stdout,
            ColorChoice::Auto,
        ),
        WriteLogger::new(
            level,
            Config::default(),
            File::create(log_path).with_context(|| format!("creating {}", log_path))?,
        ),
    ])
    .context("initializing the logger")?;
    Ok(())
}
