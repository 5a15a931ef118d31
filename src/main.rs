use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use cindexd::config::{ServerConfig, ServerOptions};
use cindexd::server::Server;
use cindexd::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "cindexd")]
#[command(about = "A distributed code-indexing coordinator for C/C++ source trees")]
struct Args {
    /// TCP port peers connect to
    #[arg(long, default_value = "12526")]
    port: u16,

    /// UNIX socket for local clients and indexer children
    #[arg(long, default_value = "/tmp/cindexd.sock")]
    socket_file: PathBuf,

    /// Directory for persisted state (file ids)
    #[arg(long, default_value = ".cindexd")]
    data_dir: PathBuf,

    /// Concurrent local indexer children (defaults to the CPU count)
    #[arg(long)]
    job_count: Option<usize>,

    /// Stalled remote jobs are re-queued after this many milliseconds
    #[arg(long, default_value = "15000")]
    reschedule_timeout: u64,

    /// Job-server address as "host:port"; discovered via multicast if unset
    #[arg(long)]
    job_server: Option<String>,

    /// Multicast group for job-server discovery, as "address:port"
    /// Example: "237.50.50.50:12527"
    #[arg(long)]
    multicast: Option<String>,

    /// Act as the farm's job-server
    #[arg(long)]
    job_server_mode: bool,

    /// Never index locally; only farm work out to peers
    #[arg(long)]
    no_local_compiles: bool,

    /// Compress preprocessed units as soon as they are produced
    #[arg(long)]
    compress_always: bool,

    /// Compress preprocessed units right before shipping them to a peer
    #[arg(long)]
    compress_remote: bool,

    /// Preprocess even when running standalone
    #[arg(long)]
    force_preprocessing: bool,

    /// The indexer worker binary
    #[arg(long, default_value = "cindexd-worker")]
    worker: PathBuf,
}

fn parse_host_port(s: &str) -> Option<(String, u16)> {
    let (host, port) = s.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut options = ServerOptions::NONE;
    if args.job_server_mode {
        options.insert(ServerOptions::JOB_SERVER);
    }
    if args.no_local_compiles {
        options.insert(ServerOptions::NO_LOCAL_COMPILES);
    }
    if args.compress_always {
        options.insert(ServerOptions::COMPRESSION_ALWAYS);
    }
    if args.compress_remote {
        options.insert(ServerOptions::COMPRESSION_REMOTE);
    }
    if args.force_preprocessing {
        options.insert(ServerOptions::FORCE_PREPROCESSING);
    }

    let job_server = args.job_server.as_deref().and_then(parse_host_port);
    let multicast = args
        .multicast
        .as_deref()
        .and_then(parse_host_port)
        .and_then(|(addr, port)| Some((addr.parse::<Ipv4Addr>().ok()?, port)));

    let mut config = ServerConfig::new(args.port, args.socket_file);
    config.data_dir = args.data_dir;
    if let Some(job_count) = args.job_count {
        config.job_count = job_count.max(1);
    }
    config.reschedule_timeout_ms = args.reschedule_timeout;
    config.options = options;
    config.job_server = job_server;
    config.multicast = multicast;
    config.worker_binary = args.worker;

    tracing::info!(
        port = config.tcp_port,
        socket = %config.socket_file.display(),
        job_count = config.job_count,
        job_server = ?config.job_server,
        multicast = ?config.multicast,
        "Starting cindexd"
    );

    let cancel = install_shutdown_handler();
    let server = Server::new(config);
    let exit_code = server.run(cancel).await?;
    std::process::exit(exit_code);
}
