//! Requester binary: probe a set of targets and report round trips.

use std::time::Duration;

use clap::Parser;

use udprobe::configuration::{
    FamilySelection, Pacing, RequesterConfig, SocketOptions, DEFAULT_BUFFER_SIZE, DEFAULT_PORT,
    DEFAULT_TTL,
};
use udprobe::report::ReportFormat;
use udprobe::requester;

#[derive(Parser, Debug)]
#[clap(version, about = "Unicast UDP latency and reachability requester")]
struct Cli {
    /// Targets to probe: numeric addresses or host names
    #[clap(required = true)]
    targets: Vec<String>,

    /// Destination UDP port on the responders
    #[clap(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Local UDP port to bind; 0 asks for an ephemeral port
    #[clap(short = 'o', long, default_value_t = 0)]
    local_port: u16,

    /// Address families to probe: 4, 6 or both
    #[clap(short, long, default_value = "both")]
    family: FamilySelection,

    /// Pacing of sends within a round: dispersed or grouped
    #[clap(long, default_value = "dispersed")]
    pacing: Pacing,

    /// Number of probe rounds
    #[clap(short, long, default_value_t = 10)]
    rounds: u64,

    /// Round interval in milliseconds
    #[clap(short, long, default_value_t = 1000)]
    interval: u64,

    /// Final wait for straggler responses, in milliseconds
    #[clap(short, long, default_value_t = 2000)]
    wait: u64,

    /// Requester key carried in every probe; 0 picks a random one
    #[clap(short, long, default_value_t = 0)]
    key: u64,

    /// Outgoing TTL/Hop-Limit
    #[clap(short, long, default_value_t = DEFAULT_TTL)]
    ttl: u8,

    /// Socket buffer size in bytes, both directions
    #[clap(short, long, default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Abort the run on the first send failure
    #[clap(short, long)]
    exit_on_error: bool,

    /// Report output format
    #[clap(long, value_enum, default_value_t = ReportFormat::Csv)]
    report: ReportFormat,
}

impl Cli {
    fn into_config(self) -> RequesterConfig {
        RequesterConfig {
            targets: self.targets,
            target_port: self.port,
            family: self.family,
            socket: SocketOptions {
                port: self.local_port,
                recv_buffer: self.buffer_size,
                send_buffer: self.buffer_size,
                ttl: self.ttl,
            },
            pacing: self.pacing,
            rounds: self.rounds,
            interval: Duration::from_millis(self.interval),
            wait: Duration::from_millis(self.wait),
            key: self.key,
            exit_on_error: self.exit_on_error,
            report: self.report,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = Cli::parse().into_config();
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {}", e);
        std::process::exit(2);
    }

    log::info!(
        "probing {} target specification(s), {} rounds every {:?}",
        config.targets.len(),
        config.rounds,
        config.interval
    );

    match requester::run_requester(config).await {
        Ok(()) => {}
        Err(requester::RequesterError::Terminated) => {
            log::info!("run terminated by signal");
            std::process::exit(1);
        }
        Err(e) => {
            log::error!("requester failed: {}", e);
            std::process::exit(1);
        }
    }
}
