//! Plain TCP host
//!
//! Each stream carries length-prefixed frames (4-byte big-endian length
//! followed by the message). Identity is carried in message envelopes, not
//! negotiated by the transport.

use crate::transport::{Host, HostEvent, PeerStream, EVENT_CHANNEL_CAPACITY};
use crate::types::{PeerAddress, PeerId, PeerInfo};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};

/// Largest frame accepted from a peer
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest chunk whose response still fits in one frame, leaving room for
/// the envelope around it
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE - 64 * 1024;

/// TCP-backed host
pub struct TcpHost {
    local: PeerInfo,
    listener: TcpListener,
    events: broadcast::Sender<HostEvent>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl TcpHost {
    /// Bind a listener. The advertised address is the bound socket address
    /// unless `advertise` overrides it (needed when binding 0.0.0.0).
    pub async fn bind(peer_id: PeerId, listen: &str, advertise: Option<String>) -> Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        let bound = listener.local_addr()?;
        let address = advertise.unwrap_or_else(|| bound.to_string());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tracing::info!("Listening on {} as {}", bound, peer_id);

        Ok(Self {
            local: PeerInfo {
                id: peer_id,
                address: PeerAddress::new(address),
            },
            listener,
            events,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }
}

impl Host for TcpHost {
    type Stream = TcpPeerStream;

    fn local_peer(&self) -> &PeerInfo {
        &self.local
    }

    async fn dial(&self, address: &PeerAddress) -> Result<TcpPeerStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed("host closed".to_string()));
        }
        let stream = TcpStream::connect(address.as_str())
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        Ok(TcpPeerStream {
            stream,
            remote: Some(address.clone()),
            events: self.events.clone(),
        })
    }

    async fn accept(&self) -> Result<TcpPeerStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed("host closed".to_string()));
        }
        tokio::select! {
            accepted = self.listener.accept() => {
                let (stream, from) = accepted?;
                tracing::trace!("Inbound connection from {}", from);
                stream.set_nodelay(true)?;
                Ok(TcpPeerStream {
                    stream,
                    remote: None,
                    events: self.events.clone(),
                })
            }
            _ = self.shutdown.notified() => {
                Err(Error::ConnectionFailed("host closed".to_string()))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        Ok(())
    }
}

/// A framed TCP stream
pub struct TcpPeerStream {
    stream: TcpStream,
    /// Listen address of the remote, known only for streams we dialed
    remote: Option<PeerAddress>,
    events: broadcast::Sender<HostEvent>,
}

impl TcpPeerStream {
    fn report_closed(&self) {
        if let Some(remote) = &self.remote {
            let _ = self.events.send(HostEvent::ConnectionClosed(remote.clone()));
        }
    }
}

impl PeerStream for TcpPeerStream {
    async fn send(&mut self, data: Vec<u8>) -> Result<()> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!("frame of {} bytes too large", data.len())));
        }
        let len = data.len() as u32;
        let result = async {
            self.stream.write_all(&len.to_be_bytes()).await?;
            self.stream.write_all(&data).await?;
            self.stream.flush().await
        }
        .await;

        result.map_err(|e| Error::ConnectionFailed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        let len = match self.stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) => {
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
                ) {
                    self.report_closed();
                }
                return Err(Error::ConnectionFailed(e.to_string()));
            }
        };
        if len > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!("peer sent {} byte frame", len)));
        }

        let mut data = vec![0u8; len];
        if let Err(e) = self.stream.read_exact(&mut data).await {
            self.report_closed();
            return Err(Error::ConnectionFailed(e.to_string()));
        }
        Ok(data)
    }

    async fn close(&mut self) -> Result<()> {
        // The peer may already be gone; nothing left to do then
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}
