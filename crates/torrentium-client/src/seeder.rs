//! Seeder: answers inbound requests from other peers
//!
//! Serves manifests, chunks, text search and pings from the local catalog,
//! and hands DHT queries to the discovery service. Each inbound stream
//! carries exactly one request.

use crate::catalog::Catalog;
use std::sync::Arc;
use std::time::Duration;
use torrentium_core::chunk::{read_chunk, verify_chunk};
use torrentium_core::proto::{self, error_codes, Envelope, FileRecordMsg, Payload};
use torrentium_core::{ContentId, Error, FileRecord, Host, PeerStream};
use torrentium_dht::DhtService;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Request handler shared by every inbound stream
pub struct Seeder<H: Host> {
    dht: Arc<DhtService<H>>,
    catalog: Arc<Catalog>,
    read_timeout: Duration,
    max_search_results: u32,
}

impl<H: Host> Seeder<H> {
    pub fn new(
        dht: Arc<DhtService<H>>,
        catalog: Arc<Catalog>,
        read_timeout: Duration,
        max_search_results: u32,
    ) -> Self {
        Self {
            dht,
            catalog,
            read_timeout,
            max_search_results,
        }
    }

    /// Decode one request and build the reply envelope
    pub async fn handle_message(&self, data: &[u8]) -> Envelope {
        let envelope = match Envelope::from_bytes(data) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("Failed to decode message: {}", e);
                let code = match e {
                    Error::VersionMismatch { .. } => error_codes::VERSION_MISMATCH,
                    _ => error_codes::INVALID_MESSAGE,
                };
                return self.reply(0, error(code, format!("decode error: {}", e)));
            }
        };

        let request_id = envelope.request_id;
        let sender = envelope.sender_info();
        if let Some(sender) = &sender {
            self.dht.observe(sender);
        }

        let Some(payload) = envelope.payload else {
            return self.reply(
                request_id,
                error(error_codes::INVALID_MESSAGE, "empty payload".to_string()),
            );
        };
        tracing::debug!(
            "{} #{} from {}",
            payload.kind(),
            request_id,
            sender
                .as_ref()
                .map(|s| s.id.to_string())
                .unwrap_or_else(|| "anonymous".to_string())
        );

        let response = match payload {
            Payload::ChunkRequest(req) => self.handle_chunk_request(req).await,
            Payload::ManifestRequest(req) => self.handle_manifest_request(req).await,
            Payload::SearchRequest(req) => self.handle_search_request(req).await,
            Payload::PingRequest(ping) => {
                Payload::PingResponse(proto::PingResponse { nonce: ping.nonce })
            }
            other => match self.dht.handle_request(sender.as_ref(), &other) {
                Some(reply) => reply,
                None => {
                    tracing::warn!("Unexpected message type: {}", other.kind());
                    error(
                        error_codes::INVALID_MESSAGE,
                        "unexpected message type".to_string(),
                    )
                }
            },
        };

        self.reply(request_id, response)
    }

    /// Read one request from `stream`, answer it, and close
    pub async fn serve_stream(&self, mut stream: H::Stream) {
        let data = match tokio::time::timeout(self.read_timeout, stream.recv()).await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                tracing::debug!("Inbound stream failed before request: {}", e);
                return;
            }
            Err(_) => {
                tracing::debug!("Inbound stream sent nothing within {:?}", self.read_timeout);
                return;
            }
        };

        let reply = self.handle_message(&data).await;
        if let Err(e) = stream.send(reply.to_bytes()).await {
            tracing::debug!("Failed to send reply: {}", e);
        }
        let _ = stream.close().await;
    }

    fn reply(&self, request_id: u64, payload: Payload) -> Envelope {
        Envelope::new(request_id, payload).with_sender(self.dht.local_peer())
    }

    async fn local_record(&self, content_id: &[u8]) -> Result<FileRecord, Payload> {
        let id = ContentId::from_slice(content_id).map_err(|_| {
            error(
                error_codes::INVALID_DATA,
                "invalid content id length".to_string(),
            )
        })?;

        match self.catalog.lookup(&id).await {
            Ok(Some(record)) if record.is_local() => Ok(record),
            Ok(_) => Err(error(
                error_codes::NOT_FOUND,
                format!("{} not held here", id.short()),
            )),
            Err(e) => {
                tracing::error!("Catalog lookup for {} failed: {}", id.short(), e);
                Err(error(error_codes::UNAVAILABLE, "catalog unavailable".to_string()))
            }
        }
    }

    async fn handle_manifest_request(&self, req: proto::ManifestRequest) -> Payload {
        match self.local_record(&req.content_id).await {
            Ok(record) => Payload::ManifestResponse(proto::ManifestResponse {
                record: Some(FileRecordMsg::from(&record)),
            }),
            Err(reply) => reply,
        }
    }

    /// Handle a chunk request. The chunk is re-read from disk and checked
    /// against the manifest before it is sent.
    async fn handle_chunk_request(&self, req: proto::ChunkRequest) -> Payload {
        let record = match self.local_record(&req.content_id).await {
            Ok(record) => record,
            Err(reply) => return reply,
        };
        let Some(descriptor) = record.chunks.get(req.chunk_index as usize).cloned() else {
            return error(
                error_codes::NOT_FOUND,
                format!("chunk {} out of range", req.chunk_index),
            );
        };
        let Some(path) = record.local_path().map(|p| p.to_path_buf()) else {
            return error(error_codes::NOT_FOUND, "not held here".to_string());
        };

        let index = req.chunk_index;
        let id = record.id;
        let read = tokio::task::spawn_blocking(move || read_chunk(&path, &record, index)).await;

        let data = match read {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => {
                tracing::warn!("Chunk {} of {} unreadable: {}", index, id.short(), e);
                return error(error_codes::UNAVAILABLE, "chunk unreadable".to_string());
            }
            Err(e) => {
                tracing::error!("Chunk read task failed: {}", e);
                return error(error_codes::UNAVAILABLE, "chunk unreadable".to_string());
            }
        };

        if let Err(e) = verify_chunk(&data, &descriptor) {
            tracing::warn!("Refusing to serve {} chunk {}: {}", id.short(), index, e);
            return error(error_codes::HASH_MISMATCH, "local copy changed".to_string());
        }

        tracing::debug!("Sending chunk {} of {} ({} bytes)", index, id.short(), data.len());
        Payload::ChunkResponse(proto::ChunkResponse {
            content_id: id.as_bytes().to_vec(),
            chunk_index: index,
            data: data.into(),
        })
    }

    async fn handle_search_request(&self, req: proto::SearchRequest) -> Payload {
        let limit = match req.max_results {
            0 => self.max_search_results,
            n => n.min(self.max_search_results),
        } as usize;

        match self.catalog.search_local(&req.query).await {
            Ok(records) => Payload::SearchResponse(proto::SearchResponse {
                records: records.iter().take(limit).map(FileRecordMsg::from).collect(),
            }),
            Err(e) => {
                tracing::error!("Local search failed: {}", e);
                error(error_codes::UNAVAILABLE, "search unavailable".to_string())
            }
        }
    }
}

fn error(code: u32, message: String) -> Payload {
    Payload::ErrorResponse(proto::ErrorResponse { code, message })
}

/// Accept inbound streams until cancelled, serving each on its own task
pub async fn run_seeder_loop<H: Host>(seeder: Arc<Seeder<H>>, cancel: CancellationToken) {
    tracing::info!("Starting seeder loop on {}", seeder.dht.local_peer().address);
    let host = seeder.dht.host().clone();
    let mut streams = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = host.accept() => match accepted {
                Ok(stream) => {
                    let seeder = seeder.clone();
                    streams.spawn(async move { seeder.serve_stream(stream).await });
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    tracing::error!("Error accepting stream: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            },
            Some(_) = streams.join_next(), if !streams.is_empty() => {}
        }
    }

    streams.abort_all();
    tracing::info!("Seeder loop stopped");
}
