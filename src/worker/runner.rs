use std::collections::HashMap;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::net::wire::UnitPayload;
use crate::scheduler::job::IndexerJob;
use crate::server::ServerEvent;

/// Spawns and supervises the out-of-process indexer children.
///
/// Each child reads one serialized unit from stdin (4-byte LE size, then the
/// bincode payload) and reports its parse result over the socket named in
/// the payload. The supervisor only watches for exit.
#[derive(Debug)]
pub struct LocalRunner {
    kill_switches: HashMap<u32, oneshot::Sender<()>>,
}

impl LocalRunner {
    pub fn new() -> LocalRunner {
        LocalRunner {
            kill_switches: HashMap::new(),
        }
    }

    /// Fork the worker binary for `job`. Returns the child's pid; the exit
    /// arrives later as [`ServerEvent::LocalJobFinished`].
    pub fn launch(
        &mut self,
        job: &IndexerJob,
        config: &ServerConfig,
        events: mpsc::Sender<ServerEvent>,
    ) -> Result<u32> {
        let payload = UnitPayload {
            destination: job.destination.clone(),
            port: job.port,
            unit: job.unit.clone(),
            project: job.project.clone(),
            blocked_files: job.blocked_files.clone(),
            job_id: job.wire_id(),
            visit_file_timeout_ms: config.visit_file_timeout_ms,
            indexer_message_timeout_ms: config.indexer_message_timeout_ms,
        };
        let encoded = bincode::serialize(&payload)?;

        let mut child = Command::new(&config.worker_binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServerError::WorkerSpawn(config.worker_binary.clone(), e))?;

        let pid = child
            .id()
            .ok_or_else(|| ServerError::Internal("spawned worker has no pid".into()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ServerError::Internal("worker stdin not captured".into()))?;

        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.kill_switches.insert(pid, kill_tx);

        tokio::spawn(async move {
            let header = (encoded.len() as u32).to_le_bytes();
            if stdin.write_all(&header).await.is_ok() {
                let _ = stdin.write_all(&encoded).await;
            }
            drop(stdin);

            let output = tokio::select! {
                output = child.wait_with_output() => output,
                // kill_on_drop reaps the child when the cancelled wait future
                // is dropped
                _ = &mut kill_rx => return,
            };

            let (exit_code, stderr) = match output {
                Ok(output) => (
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                ),
                Err(e) => (-1, e.to_string()),
            };
            let _ = events
                .send(ServerEvent::LocalJobFinished {
                    pid,
                    exit_code,
                    stderr,
                })
                .await;
        });

        Ok(pid)
    }

    /// Kill a running child; used for aborts and teardown. The supervisor
    /// stops waiting and no finish event is delivered.
    pub fn kill(&mut self, pid: u32) {
        if let Some(kill_tx) = self.kill_switches.remove(&pid) {
            let _ = kill_tx.send(());
        }
    }

    pub fn reap(&mut self, pid: u32) {
        self.kill_switches.remove(&pid);
    }

    pub fn kill_all(&mut self) {
        for (_, kill_tx) in self.kill_switches.drain() {
            let _ = kill_tx.send(());
        }
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}
