use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::fileids::FileIdTable;
use crate::net::connection::{ConnId, Connection, SendToken};
use crate::net::discovery::{self, Discovery};
use crate::net::wire::{JobPayload, Message};
use crate::project::{IndexData, JobOutcome, Project, Projects};
use crate::scheduler::{Action, IndexerJob, JobId, PoolStats, Scheduler};
use crate::unit::{JobFlags, Unit};
use crate::worker::preprocess::PreprocessPool;
use crate::worker::runner::LocalRunner;

const SERVER_RECONNECT_BASE_MS: u64 = 5000;
const PEER_DIAL_TIMEOUT_MS: u64 = 1000;

/// Everything the outside world can tell the server loop.
///
/// Connections, the preprocess pool, worker supervisors, and discovery all
/// post here; only the server task mutates scheduler state.
#[derive(Debug)]
pub enum ServerEvent {
    Accepted { conn: Connection },
    Message { conn: ConnId, msg: Message },
    ConnectionClosed { conn: ConnId },
    SendResult { conn: ConnId, token: SendToken, ok: bool },
    Multicast { from_ip: String, data: Vec<u8> },
    Preprocessed { unit: Unit, project: PathBuf },
    PreprocessFailed { file: PathBuf, status: i32, stderr: String },
    LocalJobFinished { pid: u32, exit_code: i32, stderr: String },
    /// A delayed project notification came due.
    ProjectNotify { data: IndexData, job: Box<IndexerJob> },
    ServerConnected { conn: Connection },
    ServerConnectFailed,
}

struct PendingSend {
    job_ids: Vec<JobId>,
    finished: bool,
}

/// The coordinator: accepts compiles, farms units out, reconciles results.
///
/// Single-task actor: a `tokio::select!` loop over one event channel plus
/// armed deadlines. All scheduling decisions happen in [`Scheduler`]; this
/// type owns the sockets, processes, timers, and projects that the decisions
/// act on.
pub struct Server {
    config: ServerConfig,
    scheduler: Scheduler,
    projects: Projects,
    fileids: FileIdTable,
    pool: PreprocessPool,
    runner: LocalRunner,
    connections: HashMap<ConnId, Connection>,
    server_conn: Option<ConnId>,
    conn_ids: Arc<AtomicU64>,
    next_token: SendToken,
    pending_sends: HashMap<SendToken, PendingSend>,
    events_tx: mpsc::Sender<ServerEvent>,
    events_rx: mpsc::Receiver<ServerEvent>,
    discovery: Option<Discovery>,
    reschedule_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    connect_failures: u64,
    quit_at: Option<Instant>,
    exit_code: i32,
    quit_now: bool,
    epoch: Instant,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let pool = PreprocessPool::new(config.job_count, config.options, events_tx.clone());
        let fileids = FileIdTable::restore(&config.data_dir);
        Server {
            scheduler: Scheduler::new(config.clone()),
            projects: Projects::new(),
            fileids,
            pool,
            runner: LocalRunner::new(),
            connections: HashMap::new(),
            server_conn: None,
            conn_ids: Arc::new(AtomicU64::new(1)),
            next_token: 1,
            pending_sends: HashMap::new(),
            events_tx,
            events_rx,
            discovery: None,
            reschedule_at: None,
            reconnect_at: None,
            connect_failures: 0,
            quit_at: None,
            exit_code: 0,
            quit_now: false,
            epoch: Instant::now(),
            config,
        }
    }

    /// Sender half of the event channel, for embedding and tests.
    pub fn events(&self) -> mpsc::Sender<ServerEvent> {
        self.events_tx.clone()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Listen, discover, and run until told to exit. Returns the exit code.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<i32> {
        let _ = std::fs::remove_file(&self.config.socket_file);
        let unix_listener = UnixListener::bind(&self.config.socket_file)?;
        let tcp_listener =
            TcpListener::bind(("0.0.0.0", self.config.tcp_port)).await?;
        tracing::info!(
            socket = %self.config.socket_file.display(),
            tcp_port = self.config.tcp_port,
            job_count = self.config.job_count,
            job_server = self.config.is_job_server(),
            "Coordinator listening"
        );

        self.spawn_unix_accept_loop(unix_listener);
        self.spawn_tcp_accept_loop(tcp_listener);

        if let Some((group, port)) = self.config.multicast {
            match Discovery::join(group, port).await {
                Ok(d) => {
                    d.spawn_receiver(self.events_tx.clone());
                    self.discovery = Some(d);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Multicast unavailable, running without discovery");
                }
            }
        }

        if !self.config.is_job_server() {
            self.connect_to_server().await;
        }

        loop {
            let reschedule = self.reschedule_at;
            let reconnect = self.reconnect_at;
            let quit = self.quit_at;

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                event = self.events_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
                _ = sleep_until_opt(reschedule), if reschedule.is_some() => {
                    self.reschedule_at = None;
                    let actions = self.scheduler.on_reschedule(self.now_ms());
                    self.execute(actions).await;
                }
                _ = sleep_until_opt(reconnect), if reconnect.is_some() => {
                    self.reconnect_at = None;
                    self.connect_to_server().await;
                }
                _ = sleep_until_opt(quit), if quit.is_some() => {
                    break;
                }
            }

            // collapse any number of work pokes into one pass per iteration
            while self.scheduler.take_work_request() {
                let pool = PoolStats {
                    busy: self.pool.busy(),
                    backlog: self.pool.backlog(),
                };
                let actions = self.scheduler.work(self.now_ms(), pool, &self.projects);
                self.execute(actions).await;
            }

            if self.quit_now {
                break;
            }
        }

        self.teardown();
        Ok(self.exit_code)
    }

    fn teardown(&mut self) {
        self.runner.kill_all();
        if let Err(e) = self.fileids.save(&self.config.data_dir) {
            tracing::error!(error = %e, "Couldn't persist file ids");
        }
        let _ = std::fs::remove_file(&self.config.socket_file);
    }

    fn spawn_unix_accept_loop(&self, listener: UnixListener) {
        let events = self.events_tx.clone();
        let conn_ids = self.conn_ids.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let id = conn_ids.fetch_add(1, Ordering::Relaxed);
                let conn = Connection::spawn(stream, id, None, events.clone());
                if events.send(ServerEvent::Accepted { conn }).await.is_err() {
                    return;
                }
            }
        });
    }

    fn spawn_tcp_accept_loop(&self, listener: TcpListener) {
        let events = self.events_tx.clone();
        let conn_ids = self.conn_ids.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, addr)) = listener.accept().await else { return };
                let id = conn_ids.fetch_add(1, Ordering::Relaxed);
                let conn =
                    Connection::spawn(stream, id, Some(addr.ip().to_string()), events.clone());
                if events.send(ServerEvent::Accepted { conn }).await.is_err() {
                    return;
                }
            }
        });
    }

    /// Locate and dial the job-server: use the configured address if we have
    /// one, otherwise ask the multicast group and back off linearly.
    async fn connect_to_server(&mut self) {
        if self.server_conn.is_some() || self.config.is_job_server() {
            return;
        }
        let Some((host, port)) = self.scheduler.config().job_server.clone() else {
            if let Some(d) = &self.discovery {
                tracing::debug!("Asking the multicast group for the job-server");
                if let Err(e) = d.send_query().await {
                    tracing::warn!(error = %e, "Multicast query failed");
                }
                self.connect_failures += 1;
                self.reconnect_at = Some(
                    Instant::now()
                        + Duration::from_millis(SERVER_RECONNECT_BASE_MS * self.connect_failures),
                );
            }
            return;
        };

        let events = self.events_tx.clone();
        let conn_ids = self.conn_ids.clone();
        tokio::spawn(async move {
            let dial = timeout(
                Duration::from_millis(SERVER_RECONNECT_BASE_MS),
                TcpStream::connect((host.as_str(), port)),
            )
            .await;
            match dial {
                Ok(Ok(stream)) => {
                    let id = conn_ids.fetch_add(1, Ordering::Relaxed);
                    let conn = Connection::spawn(stream, id, Some(host), events.clone());
                    let _ = events.send(ServerEvent::ServerConnected { conn }).await;
                }
                _ => {
                    tracing::warn!(host = %host, port, "Couldn't reach the job-server");
                    let _ = events.send(ServerEvent::ServerConnectFailed).await;
                }
            }
        });
    }

    async fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Accepted { conn } => {
                self.connections.insert(conn.id, conn);
            }
            ServerEvent::Message { conn, msg } => {
                self.handle_message(conn, msg).await;
            }
            ServerEvent::ConnectionClosed { conn } => {
                self.connections.remove(&conn);
                self.scheduler.handle_connection_closed(conn);
                if self.server_conn == Some(conn) {
                    tracing::warn!("Lost the job-server connection");
                    self.server_conn = None;
                    self.scheduler.set_server_connected(false);
                    self.connect_failures += 1;
                    self.reconnect_at = Some(
                        Instant::now()
                            + Duration::from_millis(
                                SERVER_RECONNECT_BASE_MS * self.connect_failures,
                            ),
                    );
                }
            }
            ServerEvent::SendResult { conn: _, token, ok } => {
                if let Some(send) = self.pending_sends.remove(&token) {
                    let actions = if ok {
                        self.scheduler
                            .job_response_sent(&send.job_ids, send.finished, self.now_ms())
                    } else {
                        self.scheduler.job_response_send_failed(&send.job_ids);
                        Vec::new()
                    };
                    self.execute(actions).await;
                }
            }
            ServerEvent::Multicast { from_ip, data } => {
                self.handle_multicast(from_ip, data).await;
            }
            ServerEvent::Preprocessed { unit, project } => {
                self.scheduler.unit_preprocessed(unit, project);
            }
            ServerEvent::PreprocessFailed {
                file,
                status,
                stderr,
            } => {
                // no retry: the compile is dropped until resubmitted
                tracing::error!(
                    file = %file.display(),
                    status,
                    stderr = %stderr.lines().next().unwrap_or(""),
                    "Preprocess failed"
                );
                self.scheduler.request_work();
            }
            ServerEvent::LocalJobFinished {
                pid,
                exit_code,
                stderr,
            } => {
                self.runner.reap(pid);
                let now = self.now_ms();
                let actions =
                    self.scheduler
                        .handle_local_finished(pid, exit_code, &stderr, now, &self.projects);
                self.execute(actions).await;
            }
            ServerEvent::ProjectNotify { data, job } => {
                self.notify_project(data, *job);
            }
            ServerEvent::ServerConnected { conn } => {
                tracing::info!(peer = ?conn.peer_ip, "Connected to the job-server");
                self.connect_failures = 0;
                self.server_conn = Some(conn.id);
                conn.send(Message::Client);
                self.connections.insert(conn.id, conn);
                self.scheduler.set_server_connected(true);
            }
            ServerEvent::ServerConnectFailed => {
                self.connect_failures += 1;
                self.reconnect_at = Some(
                    Instant::now()
                        + Duration::from_millis(SERVER_RECONNECT_BASE_MS * self.connect_failures),
                );
            }
        }
    }

    async fn handle_message(&mut self, conn: ConnId, msg: Message) {
        match msg {
            Message::Client => {
                let peer = self.peer_ip(conn).unwrap_or_default();
                let actions = self.scheduler.handle_client(conn, peer);
                self.execute(actions).await;
            }
            Message::ClientConnected { peer } => {
                tracing::debug!(peer = %peer, "A new client joined the farm");
                self.scheduler.handle_client_connected();
            }
            Message::JobAnnouncement { host, port } => {
                let host = if host.is_empty() {
                    self.peer_ip(conn).unwrap_or_default()
                } else {
                    host
                };
                if !host.is_empty() {
                    self.scheduler.handle_job_announcement(host, port);
                }
            }
            Message::ProxyJobAnnouncement { port } => {
                let Some(origin) = self.peer_ip(conn) else { return };
                let actions = self.scheduler.handle_proxy_announcement(conn, origin, port);
                self.execute(actions).await;
            }
            Message::JobRequest { num_jobs } => {
                let actions = self.scheduler.handle_job_request(conn, num_jobs as usize);
                self.execute(actions).await;
            }
            Message::JobResponse {
                jobs,
                port,
                finished,
            } => {
                let Some(host) = self.peer_ip(conn) else { return };
                self.scheduler
                    .handle_job_response(conn, host, jobs, port, finished);
            }
            Message::Indexer(data) => {
                let remote_origin = self.peer_ip(conn).is_some();
                let actions = self
                    .scheduler
                    .handle_indexer_message(data, remote_origin, &self.projects);
                self.execute(actions).await;
                self.send_to(conn, Message::Finish { status: 0 });
            }
            Message::VisitFile { path, project, key } => {
                self.handle_visit_file(conn, path, project, key);
            }
            Message::Exit { exit_code, forward } => {
                let actions = self.scheduler.handle_exit(exit_code, forward);
                self.execute(actions).await;
            }
            Message::Compile {
                arguments,
                working_directory,
                project_root,
            } => {
                self.handle_compile(conn, arguments, working_directory, project_root);
            }
            other => {
                tracing::error!(conn, msg_id = other.id(), "Unexpected message");
                self.send_to(conn, Message::Finish { status: 1 });
            }
        }
    }

    async fn handle_multicast(&mut self, from_ip: String, data: Vec<u8>) {
        if data == discovery::QUERY {
            let configured = self
                .scheduler
                .config()
                .job_server
                .as_ref()
                .map(|(h, p)| (h.as_str(), *p));
            let connected = if self.server_conn.is_some() {
                configured
            } else {
                None
            };
            let answer = discovery::answer_query(
                connected,
                configured,
                self.config.is_job_server(),
                self.config.tcp_port,
            );
            if let (Some((host, port)), Some(d)) = (answer, &self.discovery) {
                tracing::debug!(asker = %from_ip, "Answering job-server query");
                if let Err(e) = d.send_location(&host, port).await {
                    tracing::warn!(error = %e, "Couldn't answer job-server query");
                }
            }
        } else if self.server_conn.is_none() && !self.config.is_job_server() {
            let Some((host, port)) = discovery::parse_location(&data) else {
                return;
            };
            let host = if host.is_empty() { from_ip } else { host };
            tracing::info!(host = %host, port, "Job-server located via multicast");
            self.scheduler.set_job_server_location(host, port);
            self.connect_to_server().await;
        }
    }

    fn handle_visit_file(&mut self, conn: ConnId, path: PathBuf, project: PathBuf, key: u64) {
        let mut file_id = 0u32;
        let mut visit = false;
        let mut resolved = path.clone();
        if let Some(project) = self.projects.get_mut(&project) {
            if project.is_valid_job(key) {
                resolved = std::fs::canonicalize(&path).unwrap_or(resolved);
                file_id = self.fileids.insert(&resolved);
                visit = project.visit_file(file_id, key);
                if visit {
                    if let Some(id) = self.scheduler.tables.job_id_by_key(key) {
                        if let Some(job) = self.scheduler.tables.job_mut(id) {
                            job.visited.insert(file_id);
                        }
                    }
                }
            }
        }
        self.send_to(
            conn,
            Message::VisitFileResponse {
                file_id,
                resolved,
                visit,
            },
        );
    }

    fn handle_compile(
        &mut self,
        conn: ConnId,
        arguments: String,
        working_directory: PathBuf,
        project_root: Option<PathBuf>,
    ) {
        let Some(mut source) = crate::source::Source::parse(&arguments, &working_directory) else {
            tracing::debug!(arguments = %arguments, "Not an indexable compile");
            self.send_to(conn, Message::Finish { status: 1 });
            return;
        };
        source
            .arguments
            .extend(self.config.default_arguments.iter().cloned());
        source.file_id = self.fileids.insert(&source.source_file);

        let root = project_root.unwrap_or_else(|| working_directory.clone());
        let project = self
            .projects
            .entry(root.clone())
            .or_insert_with(|| Project::new(root.clone()));
        project.load();
        project.add_source(source.clone());

        self.scheduler
            .enqueue_compile(source, root, JobFlags::COMPILE);
        self.send_to(conn, Message::Finish { status: 0 });
    }

    fn notify_project(&mut self, data: IndexData, job: IndexerJob) {
        let max_crash_count = self.config.max_crash_count;
        let Some(project) = self.projects.get_mut(&job.project) else {
            return;
        };
        match project.on_job_finished(&data, &job, max_crash_count) {
            JobOutcome::Retry(source) => {
                let flags = job.flags().masked(JobFlags::TYPE_MASK);
                self.scheduler.enqueue_compile(source, job.project, flags);
            }
            JobOutcome::Done | JobOutcome::Buffered => {}
        }
    }

    fn peer_ip(&self, conn: ConnId) -> Option<String> {
        self.connections.get(&conn).and_then(|c| c.peer_ip.clone())
    }

    fn send_to(&self, conn: ConnId, msg: Message) {
        if let Some(c) = self.connections.get(&conn) {
            c.send(msg);
        }
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::StartPreprocess(request) => {
                    self.pool.submit(request);
                }
                Action::LaunchLocal(id) => {
                    let followups = self.launch_local(id);
                    queue.extend(followups);
                }
                Action::SendToServer(msg) => {
                    if let Some(id) = self.server_conn {
                        self.send_to(id, msg);
                    }
                }
                Action::Broadcast { msg, except } => {
                    for &client in &self.scheduler.clients {
                        if Some(client) != except {
                            if let Some(c) = self.connections.get(&client) {
                                c.send(msg.clone());
                            }
                        }
                    }
                }
                Action::SendJobResponse {
                    conn,
                    job_ids,
                    finished,
                } => {
                    self.send_job_response(conn, job_ids, finished);
                }
                Action::RequestJobs { count } => {
                    self.request_jobs(count).await;
                }
                Action::StartRescheduleTimer => {
                    if self.reschedule_at.is_none() {
                        self.reschedule_at = Some(
                            Instant::now()
                                + Duration::from_millis(self.config.reschedule_timeout_ms),
                        );
                    }
                }
                Action::NotifyProject {
                    data,
                    job,
                    delay_ms,
                } => {
                    if delay_ms == 0 {
                        self.notify_project(data, *job);
                    } else {
                        let events = self.events_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                            let _ = events.send(ServerEvent::ProjectNotify { data, job }).await;
                        });
                    }
                }
                Action::ScheduleQuit { code, delay_ms } => {
                    self.exit_code = code;
                    if self.quit_at.is_none() {
                        self.quit_at = Some(Instant::now() + Duration::from_millis(delay_ms));
                    }
                }
                Action::Quit { code } => {
                    self.exit_code = code;
                    self.quit_now = true;
                }
            }
        }
    }

    fn launch_local(&mut self, id: JobId) -> Vec<Action> {
        let Some(job) = self.scheduler.tables.job(id) else {
            return Vec::new();
        };
        match self
            .runner
            .launch(job, &self.config, self.events_tx.clone())
        {
            Ok(pid) => {
                tracing::debug!(job_id = id, pid, source = %job.unit.source_file.display(), "Started indexer child");
                self.scheduler.local_launched(id, pid, self.now_ms());
                Vec::new()
            }
            Err(e) => {
                tracing::error!(job_id = id, error = %e, "Couldn't start indexer child");
                self.scheduler.local_launch_failed(id, &self.projects)
            }
        }
    }

    fn send_job_response(&mut self, conn: ConnId, job_ids: Vec<JobId>, finished: bool) {
        let Some(connection) = self.connections.get(&conn) else {
            self.scheduler.job_response_send_failed(&job_ids);
            return;
        };
        let mut payloads = Vec::with_capacity(job_ids.len());
        for &id in &job_ids {
            if let Some(job) = self.scheduler.tables.job(id) {
                payloads.push(JobPayload {
                    id: job.id,
                    unit: job.unit.clone(),
                    project: job.project.clone(),
                    blocked_files: job.blocked_files.clone(),
                });
            }
        }
        let token = self.next_token;
        self.next_token += 1;
        self.pending_sends.insert(
            token,
            PendingSend {
                job_ids: job_ids.clone(),
                finished,
            },
        );
        let sent = connection.send_tracked(
            Message::JobResponse {
                jobs: payloads,
                port: self.config.tcp_port,
                finished,
            },
            token,
        );
        if !sent {
            self.pending_sends.remove(&token);
            self.scheduler.job_response_send_failed(&job_ids);
        }
    }

    /// Ask the head peer for work, rotating it to the tail. Exactly one dial
    /// per work pass; a dead peer costs this tick, and the next pass tries
    /// the next peer in rotation order.
    async fn request_jobs(&mut self, count: usize) {
        let Some(remote) = self.scheduler.remotes.rotate_first() else {
            return;
        };
        tracing::debug!(peer = %remote.host, count, "Requesting jobs");
        let dial = timeout(
            Duration::from_millis(PEER_DIAL_TIMEOUT_MS),
            TcpStream::connect((remote.host.as_str(), remote.port)),
        )
        .await;
        match dial {
            Ok(Ok(stream)) => {
                let id = self.conn_ids.fetch_add(1, Ordering::Relaxed);
                let conn = Connection::spawn(
                    stream,
                    id,
                    Some(remote.host.clone()),
                    self.events_tx.clone(),
                );
                conn.send(Message::JobRequest {
                    num_jobs: count as u32,
                });
                self.connections.insert(id, conn);
                self.scheduler.tables.pending_job_requests.insert(id, count);
            }
            _ => {
                tracing::warn!(peer = %remote.host, port = remote.port, "Couldn't reach peer");
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
