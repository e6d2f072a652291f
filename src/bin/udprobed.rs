//! Responder binary: answer probes, report them, notify plugins.
//!
//! The same executable doubles as the plugin worker: when re-executed
//! with the worker flag it skips the runtime entirely, loads the named
//! shared object and feeds it records from standard input.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use udprobe::configuration::{
    FamilySelection, ResponderConfig, SocketOptions, DEFAULT_BUFFER_SIZE, DEFAULT_PORT, DEFAULT_TTL,
};
use udprobe::payload::PAYLOAD_SIZE;
use udprobe::plugin::{self, WORKER_FLAG};
use udprobe::report::ReportFormat;
use udprobe::responder;

#[derive(Parser, Debug)]
#[clap(version, about = "Unicast UDP latency and reachability responder")]
struct Cli {
    /// Address family to listen on: 4 or 6
    #[clap(short, long, default_value = "4")]
    family: FamilySelection,

    /// UDP port to listen on
    #[clap(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Key written into every response
    #[clap(short, long, default_value_t = 0)]
    key: u64,

    /// Answer only requests carrying this requester key; 0 accepts all
    #[clap(long, default_value_t = 0)]
    filter_key: u64,

    /// Receive and report requests without answering them
    #[clap(short, long)]
    monologue: bool,

    /// Outgoing TTL/Hop-Limit
    #[clap(short, long, default_value_t = DEFAULT_TTL)]
    ttl: u8,

    /// Socket buffer size in bytes, both directions
    #[clap(short, long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Abort on the first response send failure
    #[clap(short, long)]
    exit_on_error: bool,

    /// Shut down after this many seconds without traffic
    #[clap(short, long)]
    idle_timeout: Option<u64>,

    /// Plugin shared object to load; may be given multiple times
    #[clap(long = "plugin")]
    plugins: Vec<PathBuf>,

    /// Report output format
    #[clap(long, value_enum, default_value_t = ReportFormat::Csv)]
    report: ReportFormat,
}

impl Cli {
    fn into_config(self) -> ResponderConfig {
        ResponderConfig {
            family: self.family,
            socket: SocketOptions {
                port: self.port,
                recv_buffer: self.buffer_size,
                send_buffer: self.buffer_size,
                ttl: self.ttl,
            },
            responder_key: self.key,
            requester_key_filter: self.filter_key,
            monologue: self.monologue,
            exit_on_error: self.exit_on_error,
            inactivity_timeout: self.idle_timeout.map(Duration::from_secs),
            plugins: self.plugins,
            report: self.report,
        }
    }
}

fn main() {
    env_logger::init();

    // Worker mode bypasses argument parsing and the async runtime:
    // the process is a plain synchronous record feeder.
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some(WORKER_FLAG) {
        match args.get(2) {
            Some(path) => {
                std::process::exit(plugin::run_worker(Path::new(path), PAYLOAD_SIZE));
            }
            None => {
                eprintln!("{} requires a plugin path", WORKER_FLAG);
                std::process::exit(2);
            }
        }
    }

    let config = Cli::parse().into_config();
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {}", e);
        std::process::exit(2);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("could not start runtime: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(responder::run_responder(config)) {
        Ok(()) => {}
        Err(responder::ResponderError::Terminated) => {
            log::info!("run terminated by signal");
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("responder failed: {}", e);
            std::process::exit(1);
        }
    }
}
