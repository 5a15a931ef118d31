use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, ServerError};
use crate::project::IndexData;
use crate::scheduler::job::JobId;
use crate::unit::Unit;

/// Upper bound on a single frame; a preprocessed translation unit fits
/// comfortably, a corrupted length prefix does not.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// One job on the wire, as carried by [`JobResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub id: JobId,
    pub unit: Unit,
    pub project: PathBuf,
    pub blocked_files: HashMap<u32, PathBuf>,
}

/// What an indexer child reads from stdin before it starts parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitPayload {
    /// Socket file (local) or host (remote) to report the result to.
    pub destination: String,
    pub port: u16,
    pub unit: Unit,
    pub project: PathBuf,
    /// Files already claimed by other jobs; the worker skips their symbols.
    pub blocked_files: HashMap<u32, PathBuf>,
    pub job_id: JobId,
    pub visit_file_timeout_ms: u64,
    pub indexer_message_timeout_ms: u64,
}

/// Typed messages between coordinators, clients, and indexer children.
///
/// On the wire each message is a u32-LE length prefix, a one-byte message
/// id, then the bincode-encoded body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Peer handshake marker: "I am a farm client".
    Client,
    /// Fan-out from the job-server: a new peer joined, carrying its IP.
    ClientConnected { peer: String },
    /// "I have work, come get it." Empty host means "derive from sender".
    JobAnnouncement { host: String, port: u16 },
    /// Sent to the job-server, which rebroadcasts it as a JobAnnouncement
    /// stamped with the originator's IP.
    ProxyJobAnnouncement { port: u16 },
    /// "Send me up to n jobs."
    JobRequest { num_jobs: u32 },
    JobResponse {
        jobs: Vec<JobPayload>,
        port: u16,
        /// The responder ran out of announcable work before filling `num_jobs`.
        finished: bool,
    },
    /// A parse result from an indexer child or a peer running our job.
    Indexer(IndexData),
    /// A worker asks to claim a file for its job.
    VisitFile {
        path: PathBuf,
        project: PathBuf,
        key: u64,
    },
    VisitFileResponse {
        file_id: u32,
        resolved: PathBuf,
        visit: bool,
    },
    /// Teardown propagation; `forward` routes via the job-server first.
    Exit { exit_code: i32, forward: bool },
    /// Terminates a client conversation with a status code.
    Finish { status: i32 },
    /// A compile command submitted by a local client.
    Compile {
        arguments: String,
        working_directory: PathBuf,
        project_root: Option<PathBuf>,
    },
}

impl Message {
    pub fn id(&self) -> u8 {
        match self {
            Message::Client => 1,
            Message::ClientConnected { .. } => 2,
            Message::JobAnnouncement { .. } => 3,
            Message::ProxyJobAnnouncement { .. } => 4,
            Message::JobRequest { .. } => 5,
            Message::JobResponse { .. } => 6,
            Message::Indexer(_) => 7,
            Message::VisitFile { .. } => 8,
            Message::VisitFileResponse { .. } => 9,
            Message::Exit { .. } => 10,
            Message::Finish { .. } => 11,
            Message::Compile { .. } => 12,
        }
    }
}

/// Encode a message payload: one id byte followed by the bincode body.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let body = bincode::serialize(msg)?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(msg.id());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a payload previously produced by [`encode`].
pub fn decode(payload: &[u8]) -> Result<Message> {
    let (&id, body) = payload
        .split_first()
        .ok_or(ServerError::UnknownMessage(0))?;
    if !(1..=12).contains(&id) {
        return Err(ServerError::UnknownMessage(id));
    }
    let msg: Message = bincode::deserialize(body)?;
    if msg.id() != id {
        return Err(ServerError::UnknownMessage(id));
    }
    Ok(msg)
}

/// Write a length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let payload = encode(msg)?;
    if payload.len() > MAX_MESSAGE_BYTES {
        return Err(ServerError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed frame. Returns `Ok(None)` on clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_MESSAGE_BYTES {
        return Err(ServerError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode(&payload).map(Some)
}
