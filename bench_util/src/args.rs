use std::fs;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Transport service type of the queue pairs under test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum QpType {
    /// reliable connected
    Rc,
    /// unreliable datagram
    Ud,
    /// unreliable connected
    Uc,
}

#[derive(Debug, Parser)]
pub struct CmdlineArgs {
    /* Common fields of client and server */
    /// Whether to run the bench in server mode
    #[arg(short, long)]
    pub server: bool,

    /// Payload bytes of each message
    #[arg(short, long, default_value_t = 1024)]
    pub msg_size: u32,

    /// Receive queue depth per queue pair
    #[arg(short, long, default_value_t = 512)]
    pub rx_depth: u32,

    /// Send queue depth per queue pair
    #[arg(short, long, default_value_t = 128)]
    pub tx_depth: u32,

    /// Number of queue pairs per connection
    #[arg(short, long, default_value_t = 1)]
    pub qps: u32,

    /// Queue pair service type
    #[arg(short = 'Q', long, value_enum, default_value_t = QpType::Rc)]
    pub qp_type: QpType,

    /// Total messages posted by the client across its posting threads
    #[arg(short = 'I', long, default_value_t = 5_000_000)]
    pub iterations: u64,

    /// Run duration in seconds; 0 means run by iteration count
    #[arg(short = 'D', long, default_value_t = 0)]
    pub duration: u64,

    /// Messages posted back-to-back between pacing gaps
    #[arg(short, long, default_value_t = 64)]
    pub burst_size: u32,

    /// Target bitrate in Mbps when the limiter is enabled
    #[arg(short = 'w', long, default_value_t = 1000)]
    pub rate_limit: u32,

    /// Whether to pace bursts to the target bitrate
    #[arg(short = 'l', long)]
    pub bw_limiter: bool,

    /// Whether to sample per-message latency
    #[arg(short = 'S', long)]
    pub sampling: bool,

    /// Probability that a post is sampled
    #[arg(short = 'k', long, default_value_t = 0.01)]
    pub sampling_ratio: f64,

    /// Operations posted before sampling and throughput timing start
    #[arg(long, default_value_t = 500_000)]
    pub warmup_ops: u64,

    /// Whether to give worker threads SCHED_FIFO priority
    #[arg(short = 'e', long)]
    pub realtime: bool,

    /* Per-role thread pool sizes */
    /// Client posting threads
    #[arg(short = 'z', long, default_value_t = 1)]
    pub client_post_threads: u32,

    /// Client send-completion polling threads
    #[arg(short = 'c', long, default_value_t = 1)]
    pub client_poll_send_threads: u32,

    /// Client loopback receive-polling threads
    #[arg(short = 'x', long, default_value_t = 1)]
    pub client_poll_recv_threads: u32,

    /// Server receive-posting threads
    #[arg(short = 'Z', long, default_value_t = 1)]
    pub server_post_recv_threads: u32,

    /// Server send-completion polling threads
    #[arg(short = 'C', long, default_value_t = 1)]
    pub server_poll_send_threads: u32,

    /// Server receive-completion polling threads
    #[arg(short = 'X', long, default_value_t = 1)]
    pub server_poll_recv_threads: u32,

    /// Remote host to connect to (client mode)
    #[arg(short = 'i', long, default_value_t = String::from("127.0.0.1"))]
    pub destination: String,

    /// TCP port of the handshake socket
    #[arg(short, long, default_value_t = 18515)]
    pub port: u16,

    /// Path of the filtered latency CSV; the raw dump gets a `_raw` suffix
    #[arg(short, long, default_value_t = String::from("latency.csv"))]
    pub output: String,

    /// Optional JSON configuration file applied before the command line
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Clone for CmdlineArgs {
    fn clone(&self) -> Self {
        Self {
            destination: self.destination.clone(),
            output: self.output.clone(),
            config: self.config.clone(),
            ..*self
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed configuration file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Optional overlay loaded from a JSON file. Fields left out keep their
/// command-line (or default) value.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub msg_size: Option<u32>,
    pub rx_depth: Option<u32>,
    pub tx_depth: Option<u32>,
    pub qps: Option<u32>,
    pub qp_type: Option<QpType>,
    pub iterations: Option<u64>,
    pub duration: Option<u64>,
    pub burst_size: Option<u32>,
    pub rate_limit: Option<u32>,
    pub bw_limiter: Option<bool>,
    pub sampling: Option<bool>,
    pub sampling_ratio: Option<f64>,
    pub warmup_ops: Option<u64>,
    pub realtime: Option<bool>,
    pub client_post_threads: Option<u32>,
    pub client_poll_send_threads: Option<u32>,
    pub client_poll_recv_threads: Option<u32>,
    pub server_post_recv_threads: Option<u32>,
    pub server_poll_send_threads: Option<u32>,
    pub server_poll_recv_threads: Option<u32>,
    pub destination: Option<String>,
    pub port: Option<u16>,
    pub output: Option<String>,
}

impl FileConfig {
    pub fn apply(self, args: &mut CmdlineArgs) {
        macro_rules! overlay {
            ($($field:ident),+ $(,)?) => {
                $(if let Some(v) = self.$field { args.$field = v; })+
            };
        }
        overlay!(
            msg_size,
            rx_depth,
            tx_depth,
            qps,
            qp_type,
            iterations,
            duration,
            burst_size,
            rate_limit,
            bw_limiter,
            sampling,
            sampling_ratio,
            warmup_ops,
            realtime,
            client_post_threads,
            client_poll_send_threads,
            client_poll_recv_threads,
            server_post_recv_threads,
            server_poll_send_threads,
            server_poll_recv_threads,
            destination,
            port,
            output,
        );
    }
}

impl CmdlineArgs {
    /// Load the JSON overlay named by `--config`, if any.
    pub fn load_config_file(&mut self) -> Result<(), ConfigError> {
        if let Some(path) = self.config.clone() {
            let raw = fs::read_to_string(path)?;
            let file: FileConfig = serde_json::from_str(&raw)?;
            file.apply(self);
        }
        Ok(())
    }

    /// coordinate the arguments to make them be compatible to each other
    pub fn coordinate(&mut self) -> Result<(), ConfigError> {
        if self.msg_size == 0 {
            return Err(ConfigError::Invalid("msg_size must be non-zero".into()));
        }
        if self.qps == 0 {
            return Err(ConfigError::Invalid("qps must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.sampling_ratio) {
            return Err(ConfigError::Invalid(
                "sampling_ratio must lie in [0, 1]".into(),
            ));
        }
        if self.bw_limiter && self.burst_size == 0 {
            return Err(ConfigError::Invalid(
                "burst_size must be non-zero with the limiter enabled".into(),
            ));
        }
        if self.bw_limiter && self.rate_limit == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit must be non-zero with the limiter enabled".into(),
            ));
        }
        self.tx_depth = self.tx_depth.max(1);
        self.rx_depth = self.rx_depth.max(1);
        self.client_post_threads = self.client_post_threads.max(1);
        self.iterations = self.iterations.max(self.client_post_threads as u64);
        Ok(())
    }

    /// Messages each client posting thread is responsible for.
    pub fn message_per_thread(&self) -> u64 {
        self.iterations / self.client_post_threads as u64
    }

    /// Capacity of the per-connection sample arrays: generous enough that
    /// the Bernoulli trial cannot overrun them.
    pub fn max_samples(&self) -> usize {
        (self.iterations as f64 * (self.sampling_ratio + 0.05)).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(extra: &[&str]) -> CmdlineArgs {
        let mut argv = vec!["wire_lat"];
        argv.extend_from_slice(extra);
        CmdlineArgs::parse_from(argv)
    }

    #[test]
    fn test_defaults_coordinate() {
        let mut args = parse(&[]);
        args.coordinate().unwrap();
        assert_eq!(args.msg_size, 1024);
        assert_eq!(args.qps, 1);
        assert!(!args.server);
    }

    #[test]
    fn test_sampling_ratio_rejected() {
        let mut args = parse(&["--sampling-ratio", "1.5"]);
        assert!(args.coordinate().is_err());
    }

    #[test]
    fn test_zero_rate_limit_rejected_with_limiter() {
        let mut args = parse(&["--bw-limiter", "--rate-limit", "0"]);
        assert!(args.coordinate().is_err());
        // harmless when the limiter is off
        let mut args = parse(&["--rate-limit", "0"]);
        args.coordinate().unwrap();
    }

    #[test]
    fn test_overlay_wins_over_default() {
        let mut args = parse(&[]);
        let file: FileConfig =
            serde_json::from_str(r#"{"msg_size": 4096, "sampling": true}"#).unwrap();
        file.apply(&mut args);
        assert_eq!(args.msg_size, 4096);
        assert!(args.sampling);
        assert_eq!(args.tx_depth, 128);
    }

    #[test]
    fn test_sample_capacity_bound() {
        let mut args = parse(&["--iterations", "100000", "--sampling-ratio", "0.1"]);
        args.coordinate().unwrap();
        // capacity covers the expected draw plus 5% headroom
        assert_eq!(args.max_samples(), 15000);
    }
}
