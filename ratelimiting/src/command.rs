use crate::chain::{ChainLinker, PinnedRegistry};
use crate::ebpf::maps::{KernelStores, StoreSettings};
use crate::ebpf::{load_stage, remove_rlimit_memlock, LoadedStage};
use crate::logging::{init_logging, level_from_verbosity, LogSink};
use crate::monitor::run_steady;
use crate::monitor::sweeper::EvictionSweeper;
use crate::shutdown::{listen_for_signals, ShutdownHandler};
use crate::system::log_startup_info;
use crate::utils::network_utils::interface_index;
use crate::utils::time_utils::SystemClock;
use anyhow::anyhow;
use clap::Parser;
use log::{error, info, warn};
use ratelimiting_common::DEFAULT_PROGRAM_NAME;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub const DEFAULT_PIN_PATH: &str = "/sys/fs/bpf/xdp_rl_ingress_next_prog";
pub const DEFAULT_LOG_FILE: &str = "/var/log/l3af/ratelimiting.log";

#[derive(Debug, Parser, Clone)]
#[clap(name = "ratelimiting")]
#[clap(version = env!("CARGO_PKG_VERSION"))]
#[clap(about = "Ratelimit incoming TCP connections using XDP")]
pub struct Options {
    #[clap(short = 'i', long, help = "Network interface the chain runs on (required)")]
    pub iface: Option<String>,

    #[clap(
        short = 'r',
        long,
        help = "Connections admitted per sliding window (required)"
    )]
    pub rate: Option<u64>,

    #[clap(
        short = 'p',
        long,
        help = "Destination ports to rate limit, separated by --port-delimiter"
    )]
    pub ports: Option<String>,

    #[clap(
        short = 'v',
        long,
        num_args = 0..=1,
        help = "Log level: 0 off, 1 error, 2 warn, 3 info (default), 4 debug, 5 trace"
    )]
    pub verbose: Option<Option<u8>>,

    #[clap(
        short = 'd',
        long,
        num_args = 0..=1,
        help = "Traffic direction (reserved, currently ignored)"
    )]
    pub direction: Option<Option<String>>,

    #[clap(
        short = 'm',
        long = "map-name",
        help = "Pinned program array of the previous stage in the chain (required)"
    )]
    pub map_name: Option<PathBuf>,

    #[clap(long, help = "eBPF object file [default: <executable>_kern.o]")]
    pub object: Option<PathBuf>,

    #[clap(long, default_value = DEFAULT_PROGRAM_NAME, help = "XDP entry point in the eBPF object")]
    pub program: String,

    #[clap(
        long,
        default_value = DEFAULT_PIN_PATH,
        help = "Where this stage publishes its program array for the next stage"
    )]
    pub pin_path: PathBuf,

    #[clap(long, default_value = DEFAULT_LOG_FILE, help = "Log file, appended to")]
    pub log_file: PathBuf,

    #[clap(long, default_value = ",", help = "Separator used in --ports")]
    pub port_delimiter: String,

    #[clap(
        long,
        default_value = "10",
        help = "Seconds a window entry is kept before it may be evicted"
    )]
    pub buffer_time_secs: u64,

    #[clap(long, default_value = "60", help = "Seconds between window sweeps")]
    pub sweep_interval_secs: u64,
}

/// Validated arguments for one stage.
#[derive(Debug, Clone)]
pub struct StageArgs {
    pub iface: String,
    pub ifindex: u32,
    pub map_name: PathBuf,
    pub object: PathBuf,
    pub program: String,
    pub pin_path: PathBuf,
    pub store: StoreSettings,
    pub buffer_time: Duration,
    pub sweep_interval: Duration,
    pub direction: Option<String>,
}

// <argv[0]>_kern.o, next to the executable as invoked
fn default_object_path() -> Result<PathBuf, anyhow::Error> {
    let mut path = std::env::args_os()
        .next()
        .ok_or_else(|| anyhow!("Cannot derive eBPF object path, pass --object"))?;
    path.push("_kern.o");
    Ok(PathBuf::from(path))
}

// Validate arguments
fn validate_arguments(opt: &Options) -> Result<StageArgs, anyhow::Error> {
    let map_name = opt
        .map_name
        .clone()
        .ok_or_else(|| anyhow!("--map-name is required: previous stage's pinned map path"))?;

    let rate = opt
        .rate
        .ok_or_else(|| anyhow!("--rate is required"))?;

    if opt.sweep_interval_secs == 0 {
        return Err(anyhow!("sweep_interval_secs must be greater than 0"));
    }

    if opt.port_delimiter.is_empty() {
        return Err(anyhow!("port_delimiter cannot be empty"));
    }

    let iface = opt
        .iface
        .clone()
        .ok_or_else(|| anyhow!("--iface is required"))?;
    let ifindex = interface_index(&iface)
        .ok_or_else(|| anyhow!("Network interface '{}' does not exist", iface))?;

    let object = match &opt.object {
        Some(object) => object.clone(),
        None => default_object_path()?,
    };

    Ok(StageArgs {
        iface,
        ifindex,
        map_name,
        object,
        program: opt.program.clone(),
        pin_path: opt.pin_path.clone(),
        store: StoreSettings {
            rate,
            ports: opt.ports.clone(),
            port_delimiter: opt.port_delimiter.clone(),
        },
        buffer_time: Duration::from_secs(opt.buffer_time_secs),
        sweep_interval: Duration::from_secs(opt.sweep_interval_secs),
        direction: opt.direction.clone().map(|d| d.unwrap_or_default()),
    })
}

// LOADING -> CHAINING -> CONFIGURING -> STEADY -> TEARDOWN
async fn run_stage(args: &StageArgs, log_sink: LogSink) -> Result<(), anyhow::Error> {
    remove_rlimit_memlock()?;

    let LoadedStage { mut ebpf, program } = load_stage(&args.object, &args.program)?;
    let mut stores = KernelStores::from_ebpf(&mut ebpf)?;

    let linker = ChainLinker::new(
        PinnedRegistry,
        args.map_name.clone(),
        args.pin_path.clone(),
    );
    linker.link(&program, &mut stores.next_stage)?;

    stores.configure(&args.store)?;

    let shutdown = Arc::new(Notify::new());
    let _signals = listen_for_signals(shutdown.clone())?;

    let sweeper = EvictionSweeper::new(args.buffer_time);
    let cycles = run_steady(
        &mut stores,
        &sweeper,
        &SystemClock,
        args.sweep_interval,
        &log_sink,
        shutdown,
    )
    .await;
    info!("Stopped after {} sweep cycles", cycles);

    let mut handler = ShutdownHandler::new(linker, (stores, program, ebpf), log_sink);
    let report = handler.teardown();
    if !report.is_clean() {
        // log file is closed by now, this lands on stderr
        warn!("Teardown finished with errors: {:?}", report);
    }

    Ok(())
}

pub async fn run(options: Options) -> Result<(), anyhow::Error> {
    // Validate arguments
    let args = validate_arguments(&options)?;

    // Set up logging
    let level = level_from_verbosity(options.verbose.flatten());
    let log_sink = init_logging(level, &options.log_file);

    // Startup diagnostics
    log_startup_info(&args);

    let result = run_stage(&args, log_sink.clone()).await;
    if let Err(e) = &result {
        error!("{:#}", e);
        close_log_sink(&log_sink);
    }

    result
}

// Fatal path: the error record must reach the file before exit
fn close_log_sink(log_sink: &LogSink) {
    log::logger().flush();
    if let Err(e) = log_sink.close() {
        eprintln!("Failed to close log file: {}", e);
    }
}
