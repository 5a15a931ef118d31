use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::server::ServerEvent;

/// Two-byte "where is the job-server?" query.
pub const QUERY: &[u8] = b"s?";

/// Best-effort multicast discovery of the farm's job-server.
///
/// Anyone who knows the server's address answers a [`QUERY`] with a
/// serialized `(host, port)` pair on the same group. The job-server itself
/// answers with an empty host; receivers substitute the sender's IP.
#[derive(Debug, Clone)]
pub struct Discovery {
    socket: Arc<UdpSocket>,
    group: Ipv4Addr,
    port: u16,
}

impl Discovery {
    pub async fn join(group: Ipv4Addr, port: u16) -> Result<Discovery> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_loop_v4(true)?;
        Ok(Discovery {
            socket: Arc::new(socket),
            group,
            port,
        })
    }

    /// Ask the group where the job-server is.
    pub async fn send_query(&self) -> Result<()> {
        self.socket
            .send_to(QUERY, SocketAddrV4::new(self.group, self.port))
            .await?;
        Ok(())
    }

    /// Tell the group where the job-server is.
    pub async fn send_location(&self, host: &str, port: u16) -> Result<()> {
        let payload = bincode::serialize(&(host.to_string(), port))?;
        self.socket
            .send_to(&payload, SocketAddrV4::new(self.group, self.port))
            .await?;
        Ok(())
    }

    /// Forward datagrams to the server loop.
    pub fn spawn_receiver(&self, events: mpsc::Sender<ServerEvent>) {
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "Multicast receive failed");
                        return;
                    }
                };
                let event = ServerEvent::Multicast {
                    from_ip: from.ip().to_string(),
                    data: buf[..len].to_vec(),
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
        });
    }
}

/// Decode a `(host, port)` location datagram.
pub fn parse_location(data: &[u8]) -> Option<(String, u16)> {
    bincode::deserialize(data).ok()
}

/// Where to point an asker, in answer priority order: the server we are
/// connected to, the server configured in options, or ourselves.
pub fn answer_query(
    connected_server: Option<(&str, u16)>,
    configured_server: Option<(&str, u16)>,
    is_job_server: bool,
    own_port: u16,
) -> Option<(String, u16)> {
    if let Some((host, port)) = connected_server {
        return Some((host.to_string(), port));
    }
    if let Some((host, port)) = configured_server {
        return Some((host.to_string(), port));
    }
    if is_job_server {
        // empty host: the receiver substitutes our IP
        return Some((String::new(), own_port));
    }
    None
}
