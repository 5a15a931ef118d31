use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Policy bits controlling how this coordinator participates in the farm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerOptions(u32);

impl ServerOptions {
    pub const NONE: ServerOptions = ServerOptions(0);
    /// This node is the farm's broadcast hub for proxy announcements.
    pub const JOB_SERVER: ServerOptions = ServerOptions(1 << 0);
    /// Never run indexer children locally; only farm work out.
    pub const NO_LOCAL_COMPILES: ServerOptions = ServerOptions(1 << 1);
    /// Compress preprocessed blobs as soon as they are produced.
    pub const COMPRESSION_ALWAYS: ServerOptions = ServerOptions(1 << 2);
    /// Compress preprocessed blobs lazily, right before shipping to a peer.
    pub const COMPRESSION_REMOTE: ServerOptions = ServerOptions(1 << 3);
    /// Preprocess even when running standalone.
    pub const FORCE_PREPROCESSING: ServerOptions = ServerOptions(1 << 4);

    pub fn contains(self, other: ServerOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ServerOptions) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for ServerOptions {
    type Output = ServerOptions;
    fn bitor(self, rhs: ServerOptions) -> ServerOptions {
        ServerOptions(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UNIX socket for local clients and indexer children.
    pub socket_file: PathBuf,
    /// TCP port peers connect to.
    pub tcp_port: u16,
    pub data_dir: PathBuf,
    /// Maximum concurrent local indexer children, and the preprocess pool size.
    pub job_count: usize,
    /// Admission bound on preprocess jobs in flight.
    pub max_pending_preprocess: usize,
    pub reschedule_timeout_ms: u64,
    /// Grace before a crashed compile is reported back to its project.
    pub crash_retry_delay_ms: u64,
    pub max_crash_count: usize,
    pub options: ServerOptions,
    /// Known job-server address; filled in by discovery when absent.
    pub job_server: Option<(String, u16)>,
    /// Multicast group for job-server discovery; `None` disables discovery.
    pub multicast: Option<(Ipv4Addr, u16)>,
    /// The out-of-process translation-unit indexer.
    pub worker_binary: PathBuf,
    pub visit_file_timeout_ms: u64,
    pub indexer_message_timeout_ms: u64,
    /// Arguments appended to every compile before dispatch.
    pub default_arguments: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_file: PathBuf::from("/tmp/cindexd.sock"),
            tcp_port: 12526,
            data_dir: PathBuf::from(".cindexd"),
            job_count: num_cpus(),
            max_pending_preprocess: 100,
            reschedule_timeout_ms: 15_000,
            crash_retry_delay_ms: 500,
            max_crash_count: 5,
            options: ServerOptions::NONE,
            job_server: None,
            multicast: None,
            worker_binary: PathBuf::from("cindexd-worker"),
            visit_file_timeout_ms: 60_000,
            indexer_message_timeout_ms: 60_000,
            default_arguments: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn new(tcp_port: u16, socket_file: PathBuf) -> Self {
        Self {
            tcp_port,
            socket_file,
            ..Default::default()
        }
    }

    pub fn with_job_server(mut self, host: String, port: u16) -> Self {
        self.job_server = Some((host, port));
        self
    }

    pub fn with_options(mut self, options: ServerOptions) -> Self {
        self.options.insert(options);
        self
    }

    pub fn is_job_server(&self) -> bool {
        self.options.contains(ServerOptions::JOB_SERVER)
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
