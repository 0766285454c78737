use std::{
    io::{self, Write},
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::{Args, CommandFactory, Parser, Subcommand};
use flowgre::{
    config, generator,
    generator::{barrage, replay, single},
    ingest,
    ingest::{proxy, record},
    store::{self, FileStore},
    transport,
};
use flowgre_payload::{Ipv4Cidr, Schema};
use jemallocator::Jemalloc;
use metrics_exporter_prometheus::PrometheusBuilder;
use rand::Rng;
use tokio::{
    runtime::Builder,
    signal::{
        self,
        unix::{SignalKind, signal as unix_signal},
    },
};
use tracing::info;
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Flowgre generator returned an error: {0}")]
    Generator(#[from] generator::Error),
    #[error("Flowgre ingest returned an error: {0}")]
    Ingest(#[from] ingest::Error),
    #[error("Failed to load config file: {0}")]
    Config(#[from] config::Error),
    #[error("Failed to open store: {0}")]
    Store(#[from] store::Error),
    #[error(transparent)]
    Transport(#[from] transport::Error),
    #[error("Failed to install prometheus recorder: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Flowgre task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Parser)]
#[clap(version, about = "A tool for generating, recording, replaying and proxying NetFlow v9")]
struct Cli {
    /// log at debug, overridden by RUST_LOG
    #[clap(long, short, global = true)]
    verbose: bool,
    /// address to bind a prometheus exporter to
    #[clap(long, global = true)]
    prometheus_addr: Option<SocketAddr>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a template and a few data packets to a collector
    Single(SingleArgs),
    /// Send a continuous barrage of flows to a collector
    Barrage(BarrageArgs),
    /// Record flows to disk for later replay
    Record(RecordArgs),
    /// Replay recorded flows at a collector
    Replay(ReplayArgs),
    /// Accept flows and relay them to multiple targets
    Proxy(ProxyArgs),
    /// Print the flowgre version
    Version,
}

#[derive(Args)]
struct Generation {
    /// CIDR range source IPs are drawn from
    #[clap(long, default_value = "10.0.0.0/8")]
    src_range: Ipv4Cidr,
    /// CIDR range destination IPs are drawn from
    #[clap(long, default_value = "10.0.0.0/8")]
    dst_range: Ipv4Cidr,
    /// flow schema, https or generic
    #[clap(long, default_value = "https")]
    schema: Schema,
}

#[derive(Args)]
struct SingleArgs {
    /// servername or IP address of the flow collector
    #[clap(long, short, default_value = "127.0.0.1")]
    server: String,
    /// destination port used by the flow collector
    #[clap(long, short, default_value_t = 9995)]
    port: u16,
    /// source port, 0 picks a random port between 10000 and 15000
    #[clap(long, default_value_t = 0)]
    src_port: u16,
    /// data packets to send after the template
    #[clap(long, short, default_value_t = 1)]
    count: u32,
    /// log a hex dump of every packet
    #[clap(long)]
    hexdump: bool,
    #[command(flatten)]
    generation: Generation,
}

#[derive(Args)]
struct BarrageArgs {
    /// servername or IP address of the flow collector
    #[clap(long, short, default_value = "127.0.0.1")]
    server: String,
    /// destination port used by the flow collector
    #[clap(long, short, default_value_t = 9995)]
    port: u16,
    /// workers to run, each a unique source
    #[clap(long, default_value_t = 4)]
    workers: u16,
    /// milliseconds between packets sent
    #[clap(long, default_value_t = 100)]
    delay: u64,
    /// YAML config file, supersedes every other barrage argument
    #[clap(long)]
    config: Option<PathBuf>,
    /// run the web dashboard
    #[clap(long)]
    web: bool,
    /// IP address the web dashboard listens on
    #[clap(long, default_value = "0.0.0.0")]
    web_ip: IpAddr,
    /// port the web dashboard listens on
    #[clap(long, default_value_t = 8080)]
    web_port: u16,
    #[command(flatten)]
    generation: Generation,
}

#[derive(Args)]
struct RecordArgs {
    /// IP address to listen on
    #[clap(long, short, default_value = "127.0.0.1")]
    ip: IpAddr,
    /// UDP port to listen on
    #[clap(long, short, default_value_t = 9995)]
    port: u16,
    /// directory to place recorded flows in
    #[clap(long, default_value = "recorded_flows")]
    db: PathBuf,
}

#[derive(Args)]
struct ReplayArgs {
    /// servername or IP address to replay flows at
    #[clap(long, short, default_value = "127.0.0.1")]
    server: String,
    /// target UDP port
    #[clap(long, short, default_value_t = 9995)]
    port: u16,
    /// milliseconds between packets sent, per worker
    #[clap(long, default_value_t = 100)]
    delay: u64,
    /// directory to read recorded flows from
    #[clap(long, default_value = "recorded_flows")]
    db: PathBuf,
    /// replay the recording forever
    #[clap(long = "loop")]
    looping: bool,
    /// workers to spawn for replay
    #[clap(long, default_value_t = 1)]
    workers: u16,
    /// stamp the current time into replayed flows
    #[clap(long)]
    updatets: bool,
}

#[derive(Args)]
struct ProxyArgs {
    /// IP address to listen on
    #[clap(long, short, default_value = "127.0.0.1")]
    ip: IpAddr,
    /// UDP port to listen on
    #[clap(long, short, default_value_t = 9995)]
    port: u16,
    /// target in IP:PORT format, repeat for up to 10 targets
    #[clap(long = "target", required = true)]
    targets: Vec<SocketAddr>,
}

async fn run_single(args: SingleArgs) -> Result<(), Error> {
    let config = single::Config {
        target: transport::resolve(&args.server, args.port)?,
        src_port: (args.src_port != 0).then_some(args.src_port),
        count: args.count,
        hexdump: args.hexdump,
        schema: args.generation.schema,
        src_range: args.generation.src_range,
        dst_range: args.generation.dst_range,
    };
    let report = single::run(config)
        .await
        .map_err(generator::Error::from)?;
    info!(
        "Sent {} packets, {} bytes, as Source ID {}",
        report.packets_sent, report.bytes_sent, report.source_id
    );
    Ok(())
}

async fn run_barrage(args: BarrageArgs, shutdown: flowgre_signal::Watcher) -> Result<(), Error> {
    let seed: [u8; 32] = rand::rng().random();
    let config = match args.config {
        Some(path) => {
            let (_, target) = config::load(&path)?;
            target.barrage(args.generation.schema, seed)?
        }
        None => barrage::Config {
            seed,
            target: transport::resolve(&args.server, args.port)?,
            workers: args.workers,
            delay: Duration::from_millis(args.delay),
            schema: args.generation.schema,
            src_range: args.generation.src_range,
            dst_range: args.generation.dst_range,
            web: args.web.then_some(SocketAddr::new(args.web_ip, args.web_port)),
        },
    };
    barrage::run(config, shutdown)
        .await
        .map_err(generator::Error::from)?;
    Ok(())
}

async fn run_record(args: RecordArgs, shutdown: flowgre_signal::Watcher) -> Result<(), Error> {
    let store = FileStore::open(&args.db)?;
    let record = record::Record::bind(SocketAddr::new(args.ip, args.port))
        .await
        .map_err(ingest::Error::from)?;
    info!("Recording to {}", args.db.display());
    let recording = record
        .run(store, shutdown)
        .await
        .map_err(ingest::Error::from)?;
    info!(
        "Netflow v9 Packets: {} Ignored Packets: {} Persisted: {}",
        recording.counts.valid, recording.counts.invalid, recording.persisted
    );
    Ok(())
}

async fn run_replay(args: ReplayArgs, shutdown: flowgre_signal::Watcher) -> Result<(), Error> {
    let store = FileStore::open(&args.db)?;
    info!("Reading from {}", args.db.display());
    let config = replay::Config {
        target: transport::resolve(&args.server, args.port)?,
        workers: args.workers,
        delay: Duration::from_millis(args.delay),
        looping: args.looping,
        update_timestamps: args.updatets,
    };
    replay::run(config, store, shutdown)
        .await
        .map_err(generator::Error::from)?;
    Ok(())
}

async fn run_proxy(args: ProxyArgs, shutdown: flowgre_signal::Watcher) -> Result<(), Error> {
    let config = proxy::Config {
        listen: SocketAddr::new(args.ip, args.port),
        targets: args.targets,
    };
    let proxy = proxy::Proxy::bind(config)
        .await
        .map_err(ingest::Error::from)?;
    proxy.run(shutdown).await.map_err(ingest::Error::from)?;
    Ok(())
}

async fn run_command(command: Commands, shutdown: flowgre_signal::Watcher) -> Result<(), Error> {
    match command {
        Commands::Single(args) => run_single(args).await,
        Commands::Barrage(args) => run_barrage(args, shutdown).await,
        Commands::Record(args) => run_record(args, shutdown).await,
        Commands::Replay(args) => run_replay(args, shutdown).await,
        Commands::Proxy(args) => run_proxy(args, shutdown).await,
        Commands::Version => Ok(()),
    }
}

/// Resolves on SIGINT, SIGTERM or SIGHUP.
async fn shutdown_requested() -> Result<(), Error> {
    let mut terminate = unix_signal(SignalKind::terminate())?;
    let mut hangup = unix_signal(SignalKind::hangup())?;
    tokio::select! {
        res = signal::ctrl_c() => res?,
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
    }
    Ok(())
}

async fn inner_main(cli: Cli) -> Result<(), Error> {
    if let Some(addr) = cli.prometheus_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Prometheus exporter listening on {addr}");
    }

    let (shutdown_watcher, shutdown_broadcast) = flowgre_signal::signal();
    let mut command = tokio::spawn(run_command(cli.command, shutdown_watcher));

    tokio::select! {
        res = &mut command => {
            shutdown_broadcast.signal();
            res?
        }
        res = shutdown_requested() => {
            res?;
            info!("Received signal, shutting down...");
            shutdown_broadcast.signal_and_wait().await;
            command.await?
        }
    }
}

/// The same line `--version` prints.
fn version() -> String {
    Cli::command().render_version()
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    if matches!(cli.command, Commands::Version) {
        io::stdout().write_all(version().as_bytes())?;
        return Ok(());
    }

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .finish()
        .init();

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(cli));
    info!("Bye. :)");
    res
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands, version};

    #[test]
    fn version_subcommand_matches_version_flag() {
        assert_eq!(version().trim_end(), format!("flowgre {}", env!("CARGO_PKG_VERSION")));
        let cli = Cli::try_parse_from(["flowgre", "version"]).expect("parses");
        assert!(matches!(cli.command, Commands::Version));
    }

    #[test]
    fn barrage_defaults_match_documented_flags() {
        let cli = Cli::try_parse_from(["flowgre", "barrage"]).expect("parses");
        let Commands::Barrage(args) = cli.command else {
            panic!("expected barrage");
        };
        assert_eq!(args.server, "127.0.0.1");
        assert_eq!(args.port, 9995);
        assert_eq!(args.workers, 4);
        assert_eq!(args.delay, 100);
        assert_eq!(args.web_port, 8080);
        assert!(!args.web);
        assert_eq!(args.generation.src_range.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn proxy_takes_repeated_targets() {
        let cli = Cli::try_parse_from([
            "flowgre",
            "proxy",
            "--target",
            "127.0.0.1:2055",
            "--target",
            "127.0.0.1:2056",
            "--verbose",
        ])
        .expect("parses");
        assert!(cli.verbose);
        let Commands::Proxy(args) = cli.command else {
            panic!("expected proxy");
        };
        assert_eq!(args.targets.len(), 2);
        assert!(Cli::try_parse_from(["flowgre", "proxy"]).is_err());
    }

    #[test]
    fn replay_loop_flag_and_bad_cidr() {
        let cli = Cli::try_parse_from(["flowgre", "replay", "--loop", "--updatets", "--workers", "3"])
            .expect("parses");
        let Commands::Replay(args) = cli.command else {
            panic!("expected replay");
        };
        assert!(args.looping);
        assert!(args.updatets);
        assert_eq!(args.workers, 3);

        assert!(Cli::try_parse_from(["flowgre", "single", "--src-range", "10.0.0.0/33"]).is_err());
    }
}
