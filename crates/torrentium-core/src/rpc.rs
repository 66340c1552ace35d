//! Request/response helpers over a [`Host`]
//!
//! Each call dials the peer, sends one envelope, waits for one reply, and
//! closes the stream. The whole exchange is bounded by a timeout.

use crate::proto::{Envelope, Payload};
use crate::transport::{Host, PeerStream};
use crate::types::{PeerAddress, PeerInfo};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::Duration;

/// Request ID counter, initialized with a random offset to avoid collisions across sessions
static REQUEST_COUNTER: LazyLock<AtomicU64> = LazyLock::new(|| {
    let mut buf = [0u8; 8];
    // If getrandom fails, use current time as fallback
    if getrandom::getrandom(&mut buf).is_err() {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        return AtomicU64::new(ts);
    }
    AtomicU64::new(u64::from_le_bytes(buf))
});

/// Get a unique request ID
pub fn next_request_id() -> u64 {
    REQUEST_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Send `payload` to the peer at `address` and return the reply payload.
///
/// `ErrorResponse` replies are turned into [`Error::Remote`].
pub async fn request<H: Host>(
    host: &H,
    address: &PeerAddress,
    payload: Payload,
    timeout: Duration,
) -> Result<Payload> {
    request_with_sender(host, address, payload, timeout)
        .await
        .map(|(_, payload)| payload)
}

/// Like [`request`], but also returns the identity the responder claimed
pub async fn request_with_sender<H: Host>(
    host: &H,
    address: &PeerAddress,
    payload: Payload,
    timeout: Duration,
) -> Result<(Option<PeerInfo>, Payload)> {
    let request_id = next_request_id();
    let kind = payload.kind();
    let envelope = Envelope::new(request_id, payload).with_sender(host.local_peer());

    tracing::trace!("Sending {} #{} to {}", kind, request_id, address);

    let exchange = async {
        let mut stream = host.dial(address).await?;
        let result = async {
            stream.send(envelope.to_bytes()).await?;
            stream.recv().await
        }
        .await;
        let _ = stream.close().await;
        result
    };

    let bytes = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::Timeout(format!("{} to {}", kind, address)))??;

    let reply = Envelope::from_bytes(&bytes)?;
    if reply.request_id != request_id {
        return Err(Error::Protocol(format!(
            "Request ID mismatch: expected {}, got {}",
            request_id, reply.request_id
        )));
    }

    let sender = reply.sender_info();
    match reply.payload {
        Some(Payload::ErrorResponse(err)) => Err(Error::Remote {
            code: err.code,
            message: err.message,
        }),
        Some(payload) => Ok((sender, payload)),
        None => Err(Error::Protocol("empty reply payload".to_string())),
    }
}

/// Read one request envelope from an inbound stream
pub async fn read_request<S: PeerStream>(stream: &mut S, timeout: Duration) -> Result<Envelope> {
    let bytes = tokio::time::timeout(timeout, stream.recv())
        .await
        .map_err(|_| Error::Timeout("waiting for request".to_string()))??;
    Envelope::from_bytes(&bytes)
}
