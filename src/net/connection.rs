use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::net::wire::{self, Message};
use crate::server::ServerEvent;

pub type ConnId = u64;

/// Token correlating a tracked send with its completion event.
pub type SendToken = u64;

struct Outbound {
    msg: Message,
    token: Option<SendToken>,
}

/// Handle to one framed peer/client/worker connection.
///
/// A reader task turns incoming frames into [`ServerEvent::Message`]s; a
/// writer task drains the outbox. Tracked sends report completion (or
/// failure) through [`ServerEvent::SendResult`], which is how the scheduler
/// learns whether a batch of shipped jobs actually left the machine.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    /// Remote IP for TCP peers; `None` for UNIX-socket clients and workers.
    pub peer_ip: Option<String>,
    outbox: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    pub fn spawn<S>(
        stream: S,
        id: ConnId,
        peer_ip: Option<String>,
        events: mpsc::Sender<ServerEvent>,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Outbound>();

        let reader_events = events.clone();
        tokio::spawn(async move {
            loop {
                match wire::read_frame(&mut read_half).await {
                    Ok(Some(msg)) => {
                        if reader_events
                            .send(ServerEvent::Message { conn: id, msg })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(conn = id, error = %e, "Connection read failed");
                        break;
                    }
                }
            }
            let _ = reader_events.send(ServerEvent::ConnectionClosed { conn: id }).await;
        });

        tokio::spawn(async move {
            while let Some(out) = outbox_rx.recv().await {
                let ok = wire::write_frame(&mut write_half, &out.msg).await.is_ok();
                if let Some(token) = out.token {
                    let _ = events
                        .send(ServerEvent::SendResult { conn: id, token, ok })
                        .await;
                }
                if !ok {
                    // fail any sends still queued behind the broken socket
                    while let Some(rest) = outbox_rx.recv().await {
                        if let Some(token) = rest.token {
                            let _ = events
                                .send(ServerEvent::SendResult { conn: id, token, ok: false })
                                .await;
                        }
                    }
                    return;
                }
            }
        });

        Connection { id, peer_ip, outbox: outbox_tx }
    }

    /// Queue a message. Returns false when the writer is gone.
    pub fn send(&self, msg: Message) -> bool {
        self.outbox.send(Outbound { msg, token: None }).is_ok()
    }

    /// Queue a message whose completion the server needs to observe.
    pub fn send_tracked(&self, msg: Message, token: SendToken) -> bool {
        self.outbox.send(Outbound { msg, token: Some(token) }).is_ok()
    }
}
