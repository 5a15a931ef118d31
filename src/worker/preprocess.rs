use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

use crate::config::ServerOptions;
use crate::scheduler::tables::PreprocessRequest;
use crate::server::ServerEvent;
use crate::unit::Unit;

/// Bounded pool turning raw compile commands into preprocessed [`Unit`]s.
///
/// Workers never touch scheduler state; each finished unit is posted back to
/// the server loop as an event. The `busy`/`backlog` gauges feed the work
/// loop's slot arithmetic and its admission bound.
#[derive(Debug)]
pub struct PreprocessPool {
    tx: mpsc::UnboundedSender<PreprocessRequest>,
    busy: Arc<AtomicUsize>,
    backlog: Arc<AtomicUsize>,
}

impl PreprocessPool {
    pub fn new(
        workers: usize,
        options: ServerOptions,
        events: mpsc::Sender<ServerEvent>,
    ) -> PreprocessPool {
        let (tx, rx) = mpsc::unbounded_channel::<PreprocessRequest>();
        let rx = Arc::new(Mutex::new(rx));
        let busy = Arc::new(AtomicUsize::new(0));
        let backlog = Arc::new(AtomicUsize::new(0));

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let busy = busy.clone();
            let backlog = backlog.clone();
            let events = events.clone();
            tokio::spawn(async move {
                loop {
                    let request = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(request) = request else { return };
                    backlog.fetch_sub(1, Ordering::SeqCst);
                    busy.fetch_add(1, Ordering::SeqCst);
                    let event = run(request, options).await;
                    busy.fetch_sub(1, Ordering::SeqCst);
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            });
        }

        PreprocessPool { tx, busy, backlog }
    }

    pub fn submit(&self, request: PreprocessRequest) {
        self.backlog.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(request).is_err() {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    /// Work currently admitted to the pool, running or queued.
    pub fn in_flight(&self) -> usize {
        self.busy() + self.backlog()
    }
}

async fn run(request: PreprocessRequest, options: ServerOptions) -> ServerEvent {
    let source = &request.source;
    let start = Instant::now();

    let mut cmd = Command::new(&source.compiler);
    let mut skip_next = false;
    for arg in &source.arguments {
        if skip_next {
            skip_next = false;
            continue;
        }
        match arg.as_str() {
            "-o" => skip_next = true,
            "-c" => {}
            _ if source.names_source_file(arg) => {}
            _ => {
                cmd.arg(arg);
            }
        }
    }
    cmd.arg("-E")
        .arg(&source.source_file)
        .current_dir(&source.working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = match cmd.output().await {
        Ok(output) => output,
        Err(e) => {
            return ServerEvent::PreprocessFailed {
                file: source.source_file.clone(),
                status: -1,
                stderr: e.to_string(),
            };
        }
    };

    if !output.status.success() {
        return ServerEvent::PreprocessFailed {
            file: source.source_file.clone(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
    }

    let mut unit = Unit::new(request.source.clone(), request.flags);
    unit.preprocessed = output.stdout;
    unit.preprocess_duration_ms = start.elapsed().as_millis() as u64;

    if options.contains(ServerOptions::COMPRESSION_ALWAYS) {
        if let Err(e) = unit.compress_preprocessed() {
            tracing::warn!(file = %unit.source_file.display(), error = %e, "Compression failed, shipping raw");
        }
    }

    tracing::debug!(
        file = %unit.source_file.display(),
        bytes = unit.preprocessed.len(),
        duration_ms = unit.preprocess_duration_ms,
        "Preprocessed"
    );

    ServerEvent::Preprocessed {
        unit,
        project: request.project,
    }
}
