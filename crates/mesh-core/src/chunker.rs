//! Splitting oversized text into chunk packets and reassembling them

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use shared::config::ChunkConfig;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::codec::{Packet, PacketType};
use crate::error::{MeshError, MeshResult};
use crate::ids::{Destination, NodeId};
use crate::scheduler::PeriodicTask;

/// One piece of a chunked message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub message_id: u32,
    pub index: u16,
    pub total: u16,
    pub text: String,
}

impl Chunk {
    /// `chunkIndex u16 | totalChunks u16` ahead of the text
    pub const PREFIX_LEN: usize = 4;

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::PREFIX_LEN + self.text.len());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.extend_from_slice(self.text.as_bytes());
        out
    }

    pub fn decode_payload(message_id: u32, payload: &[u8]) -> MeshResult<Self> {
        if payload.len() < Self::PREFIX_LEN {
            return Err(MeshError::InvalidPayload(format!(
                "chunk payload of {} bytes is shorter than its {} byte prefix",
                payload.len(),
                Self::PREFIX_LEN
            )));
        }
        let index = u16::from_be_bytes([payload[0], payload[1]]);
        let total = u16::from_be_bytes([payload[2], payload[3]]);
        let text = std::str::from_utf8(&payload[Self::PREFIX_LEN..])
            .map_err(|e| MeshError::InvalidPayload(format!("chunk text is not UTF-8: {}", e)))?
            .to_string();

        Ok(Self {
            message_id,
            index,
            total,
            text,
        })
    }

    pub fn to_packet(&self, from: NodeId, to: Destination, ttl: u8) -> Packet {
        Packet::new(
            PacketType::Chunk,
            self.message_id,
            from,
            to,
            ttl,
            self.encode_payload(),
        )
    }

    pub fn from_packet(packet: &Packet) -> MeshResult<Self> {
        if packet.packet_type != PacketType::Chunk {
            return Err(MeshError::InvalidPayload(format!(
                "expected a chunk packet, got {:?}",
                packet.packet_type
            )));
        }
        Self::decode_payload(packet.message_id, &packet.payload)
    }
}

/// Reassembly progress for one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkProgress {
    pub received: u16,
    pub total: u16,
}

/// Outcome of feeding one chunk into the manager
#[derive(Debug)]
pub struct ChunkResult {
    pub complete: bool,
    pub message: Option<String>,
    pub progress: ChunkProgress,
    pub error: Option<MeshError>,
}

impl ChunkResult {
    fn pending(progress: ChunkProgress) -> Self {
        Self {
            complete: false,
            message: None,
            progress,
            error: None,
        }
    }

    fn rejected(error: MeshError) -> Self {
        Self {
            complete: false,
            message: None,
            progress: ChunkProgress::default(),
            error: Some(error),
        }
    }
}

/// Outcome of a chunked send
///
/// `sent` counts the leading chunks that were handed to the transport; a
/// retry can resume from index `sent`.
#[derive(Debug)]
pub struct ChunkSendReport {
    pub sent: usize,
    pub total: usize,
    pub error: Option<MeshError>,
}

impl ChunkSendReport {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.sent == self.total
    }
}

#[derive(Debug)]
struct PendingChunkSet {
    total: u16,
    chunks: HashMap<u16, String>,
    received_at: DateTime<Utc>,
}

impl PendingChunkSet {
    fn progress(&self) -> ChunkProgress {
        ChunkProgress {
            received: self.chunks.len() as u16,
            total: self.total,
        }
    }

    /// Indices are range-checked on insert, so a full map is a complete set
    fn is_complete(&self) -> bool {
        self.chunks.len() == self.total as usize
    }

    fn assemble(&self) -> String {
        (0..self.total)
            .filter_map(|index| self.chunks.get(&index))
            .map(String::as_str)
            .collect()
    }
}

/// Chunk manager holding partially received messages
///
/// Constructed explicitly and owned by the node; several independent
/// managers can coexist in one process.
pub struct ChunkManager {
    config: ChunkConfig,
    pending: DashMap<u32, PendingChunkSet>,
}

impl ChunkManager {
    pub fn new(config: ChunkConfig) -> Self {
        info!(
            max_text_length = config.max_text_length,
            chunk_timeout_secs = config.chunk_timeout_secs,
            "ChunkManager initialized"
        );

        Self {
            config,
            pending: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    fn max_text_length(&self) -> usize {
        self.config.max_text_length.max(1)
    }

    /// True when `text` is longer than one packet may carry
    pub fn needs_chunking(&self, text: &str) -> bool {
        text.chars().count() > self.max_text_length()
    }

    /// Split `text` into ordered chunks of at most `max_text_length` characters
    ///
    /// Text that fits in one packet yields a single chunk with `total == 1`.
    pub fn chunk_message(&self, text: &str, message_id: u32) -> MeshResult<Vec<Chunk>> {
        let limit = self.max_text_length();
        let chars: Vec<char> = text.chars().collect();
        let pieces: Vec<String> = if chars.is_empty() {
            vec![String::new()]
        } else {
            chars.chunks(limit).map(|piece| piece.iter().collect()).collect()
        };

        let total = u16::try_from(pieces.len())
            .ok()
            .filter(|total| *total <= self.config.max_total_chunks)
            .ok_or_else(|| {
                MeshError::InvalidPayload(format!(
                    "message needs {} chunks, limit is {}",
                    pieces.len(),
                    self.config.max_total_chunks
                ))
            })?;

        debug!(message_id, total, length = chars.len(), "Chunked message");

        Ok(pieces
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                message_id,
                index: index as u16,
                total,
                text,
            })
            .collect())
    }

    /// Send each chunk in order through `send`, pausing between chunks
    ///
    /// Stops at the first failure; the failure is returned in the report
    /// unchanged.
    pub async fn send_message_with_chunking<F, Fut>(
        &self,
        text: &str,
        message_id: u32,
        mut send: F,
    ) -> ChunkSendReport
    where
        F: FnMut(Chunk) -> Fut,
        Fut: Future<Output = MeshResult<()>>,
    {
        let chunks = match self.chunk_message(text, message_id) {
            Ok(chunks) => chunks,
            Err(e) => {
                return ChunkSendReport {
                    sent: 0,
                    total: 0,
                    error: Some(e),
                }
            }
        };

        let total = chunks.len();
        let delay = Duration::from_millis(self.config.inter_chunk_delay_ms);
        let mut sent = 0;

        for chunk in chunks {
            if sent > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let index = chunk.index;
            if let Err(e) = send(chunk).await {
                warn!(message_id, index, sent, total, error = %e, "Chunk send failed");
                return ChunkSendReport {
                    sent,
                    total,
                    error: Some(e),
                };
            }
            sent += 1;
        }

        debug!(message_id, total, "All chunks sent");
        ChunkSendReport {
            sent,
            total,
            error: None,
        }
    }

    /// Decode a CHUNK packet and feed it to [`ChunkManager::handle_incoming_chunk`]
    pub fn handle_incoming_packet(&self, packet: &Packet) -> ChunkResult {
        match Chunk::from_packet(packet) {
            Ok(chunk) => self.handle_incoming_chunk(chunk),
            Err(e) => ChunkResult::rejected(e),
        }
    }

    pub fn handle_incoming_chunk(&self, chunk: Chunk) -> ChunkResult {
        self.handle_incoming_chunk_at(chunk, Utc::now())
    }

    /// Store a chunk; completes and forgets the set once every index is present
    pub fn handle_incoming_chunk_at(&self, chunk: Chunk, now: DateTime<Utc>) -> ChunkResult {
        if chunk.total == 0 || chunk.index >= chunk.total {
            return ChunkResult::rejected(MeshError::InvalidPayload(format!(
                "chunk index {} out of range for {} chunks",
                chunk.index, chunk.total
            )));
        }
        if chunk.total > self.config.max_total_chunks {
            return ChunkResult::rejected(MeshError::InvalidPayload(format!(
                "chunk declares {} chunks, limit is {}",
                chunk.total, self.config.max_total_chunks
            )));
        }
        let length = chunk.text.chars().count();
        if length > self.max_text_length() {
            return ChunkResult::rejected(MeshError::InvalidPayload(format!(
                "chunk carries {} characters, limit is {}",
                length,
                self.max_text_length()
            )));
        }

        let message_id = chunk.message_id;
        // Checked before taking the entry lock: `len` locks every shard
        if chunk.total > 1
            && !self.pending.contains_key(&message_id)
            && self.pending.len() >= self.config.max_pending_sets
        {
            warn!(message_id, pending = self.pending.len(), "Too many partial messages, dropping chunk");
            return ChunkResult::rejected(MeshError::CapacityExceeded(format!(
                "{} partial messages already pending",
                self.pending.len()
            )));
        }
        match self.pending.entry(message_id) {
            Entry::Occupied(mut entry) => {
                let set = entry.get_mut();
                if set.total != chunk.total {
                    warn!(
                        message_id,
                        expected = set.total,
                        got = chunk.total,
                        "Chunk total disagrees with pending set"
                    );
                    let progress = set.progress();
                    return ChunkResult {
                        error: Some(MeshError::InvalidPayload(format!(
                            "chunk declares {} chunks but message {} has {}",
                            chunk.total, message_id, set.total
                        ))),
                        ..ChunkResult::pending(progress)
                    };
                }

                set.chunks.insert(chunk.index, chunk.text);
                if set.is_complete() {
                    let (_, set) = entry.remove_entry();
                    Self::completed(message_id, set)
                } else {
                    ChunkResult::pending(set.progress())
                }
            }
            Entry::Vacant(entry) => {
                let mut chunks = HashMap::new();
                chunks.insert(chunk.index, chunk.text);
                let set = PendingChunkSet {
                    total: chunk.total,
                    chunks,
                    received_at: now,
                };

                if set.is_complete() {
                    return Self::completed(message_id, set);
                }
                debug!(message_id, total = chunk.total, "Started chunk reassembly");
                let progress = set.progress();
                entry.insert(set);
                ChunkResult::pending(progress)
            }
        }
    }

    fn completed(message_id: u32, set: PendingChunkSet) -> ChunkResult {
        let message = set.assemble();
        debug!(message_id, total = set.total, "Chunked message reassembled");
        ChunkResult {
            complete: true,
            message: Some(message),
            progress: set.progress(),
            error: None,
        }
    }

    pub fn progress(&self, message_id: u32) -> Option<ChunkProgress> {
        self.pending.get(&message_id).map(|set| set.progress())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Discard partial messages older than the chunk timeout
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let timeout = ChronoDuration::seconds(self.config.chunk_timeout_secs as i64);
        let before = self.pending.len();

        self.pending.retain(|message_id, set| {
            let expired = now.signed_duration_since(set.received_at) > timeout;
            if expired {
                let progress = set.progress();
                warn!(
                    message_id = *message_id,
                    received = progress.received,
                    total = progress.total,
                    "{}",
                    MeshError::ChunkTimeout(*message_id)
                );
            }
            !expired
        });

        before.saturating_sub(self.pending.len())
    }

    /// Run [`ChunkManager::sweep_expired`] on the configured interval
    pub fn start_sweeper(self: &Arc<Self>) -> PeriodicTask {
        let manager = Arc::clone(self);
        PeriodicTask::spawn(
            "chunk-sweep",
            Duration::from_secs(self.config.sweep_interval_secs),
            move || {
                manager.sweep_expired();
            },
        )
    }
}
