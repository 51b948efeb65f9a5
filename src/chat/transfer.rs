//! Chunked file transfer on top of the secure channel.
//!
//! The sender announces a file with `FILE_META`, streams `FILE_CHUNK`s and
//! finishes with `FILE_COMPLETE`. The receiver buffers chunks per transfer and
//! only writes the file once every chunk is present and the SHA-256 digest
//! matches. Failed transfers leave nothing in the download directory.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::chat::error::FileTransferError;
use crate::chat::protocol::{FileChunk, FileId, FileMeta, Payload};

/// Name used when the peer's file name has no usable final component.
const FALLBACK_FILE_NAME: &str = "received_file";

/// A file being sent, yielding its frames in order.
#[derive(Debug)]
pub struct OutgoingTransfer {
    meta: FileMeta,
    data: Vec<u8>,
    chunk_size: usize,
    next: OutgoingStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutgoingStep {
    Meta,
    Chunk(u32),
    Complete,
    Done,
}

impl OutgoingTransfer {
    /// Read `path` and prepare its META, CHUNK and COMPLETE payloads.
    pub async fn open(path: &Path, chunk_size: usize) -> Result<Self, FileTransferError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| FileTransferError::Unreadable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
        Ok(Self::from_bytes(file_name, data, chunk_size))
    }

    pub fn from_bytes(file_name: String, data: Vec<u8>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let total_chunks = data.len().div_ceil(chunk_size) as u32;
        let meta = FileMeta {
            file_id: rand::thread_rng().gen(),
            file_name,
            total_size: data.len() as u64,
            total_chunks,
            digest: Sha256::digest(&data).into(),
        };
        Self {
            meta,
            data,
            chunk_size,
            next: OutgoingStep::Meta,
        }
    }

    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    pub fn file_id(&self) -> FileId {
        self.meta.file_id
    }

    /// Whether `FILE_COMPLETE` has been produced.
    pub fn is_finished(&self) -> bool {
        self.next == OutgoingStep::Done
    }

    /// The next payload to send, or `None` once finished.
    pub fn next_payload(&mut self) -> Option<Payload> {
        let file_id = self.meta.file_id;
        match self.next {
            OutgoingStep::Meta => {
                self.next = if self.meta.total_chunks == 0 {
                    OutgoingStep::Complete
                } else {
                    OutgoingStep::Chunk(0)
                };
                Some(Payload::FileMeta(self.meta.clone()))
            }
            OutgoingStep::Chunk(index) => {
                let start = index as usize * self.chunk_size;
                let end = (start + self.chunk_size).min(self.data.len());
                self.next = if index + 1 >= self.meta.total_chunks {
                    OutgoingStep::Complete
                } else {
                    OutgoingStep::Chunk(index + 1)
                };
                Some(Payload::FileChunk(FileChunk {
                    file_id,
                    index,
                    bytes: self.data[start..end].to_vec(),
                }))
            }
            OutgoingStep::Complete => {
                self.next = OutgoingStep::Done;
                Some(Payload::FileComplete { file_id })
            }
            OutgoingStep::Done => None,
        }
    }
}

/// Receiver-side state of one incoming file.
#[derive(Debug)]
pub struct FileTransferState {
    pub file_id: FileId,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    buffered_bytes: u64,
    expected_digest: [u8; 32],
    last_activity: Instant,
}

impl FileTransferState {
    fn new(meta: FileMeta, now: Instant) -> Self {
        Self {
            file_id: meta.file_id,
            file_name: sanitize_file_name(&meta.file_name),
            total_size: meta.total_size,
            total_chunks: meta.total_chunks,
            chunks: BTreeMap::new(),
            buffered_bytes: 0,
            expected_digest: meta.digest,
            last_activity: now,
        }
    }

    fn received_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total_chunks
    }
}

/// Progress after accepting a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub received: u32,
    pub total: u32,
}

/// A fully received and verified file, not yet written.
#[derive(Debug)]
pub struct VerifiedFile {
    pub file_id: FileId,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Incoming transfers keyed by id.
#[derive(Debug)]
pub struct TransferRegistry {
    timeout: Duration,
    max_file_size: u64,
    incoming: HashMap<FileId, FileTransferState>,
}

impl TransferRegistry {
    /// Track incoming files, refusing announcements above `max_file_size` bytes.
    pub fn new(timeout: Duration, max_file_size: u64) -> Self {
        Self {
            timeout,
            max_file_size,
            incoming: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.incoming.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty()
    }

    pub fn get(&self, file_id: FileId) -> Option<&FileTransferState> {
        self.incoming.get(&file_id)
    }

    /// Start tracking an announced file.
    ///
    /// Nothing is allocated for the transfer until its chunks arrive.
    pub fn on_meta(&mut self, meta: FileMeta, now: Instant) -> Result<(), FileTransferError> {
        if self.incoming.contains_key(&meta.file_id) {
            return Err(FileTransferError::DuplicateTransfer(meta.file_id));
        }
        self.check_announcement(&meta)?;
        debug!(
            file_id = meta.file_id,
            chunks = meta.total_chunks,
            size = meta.total_size,
            "incoming transfer announced"
        );
        self.incoming
            .insert(meta.file_id, FileTransferState::new(meta, now));
        Ok(())
    }

    fn check_announcement(&self, meta: &FileMeta) -> Result<(), FileTransferError> {
        let file_id = meta.file_id;
        let size = meta.total_size;
        let chunks = u64::from(meta.total_chunks);

        if (chunks == 0) != (size == 0) || chunks > size {
            warn!(file_id, chunks, size, "inconsistent file announcement");
            return Err(FileTransferError::InvalidAnnouncement {
                file_id,
                total_size: size,
                total_chunks: meta.total_chunks,
            });
        }
        if size > self.max_file_size {
            warn!(file_id, size, limit = self.max_file_size, "announced file too large");
            return Err(FileTransferError::FileTooLarge {
                file_id,
                size,
                limit: self.max_file_size,
            });
        }
        Ok(())
    }

    /// Buffer a chunk. A repeated index replaces the earlier bytes.
    ///
    /// Errors here abort the transfer.
    pub fn on_chunk(
        &mut self,
        chunk: FileChunk,
        now: Instant,
    ) -> Result<ChunkProgress, FileTransferError> {
        let file_id = chunk.file_id;
        let state = self
            .incoming
            .get_mut(&file_id)
            .ok_or(FileTransferError::UnknownTransfer(file_id))?;

        let index = chunk.index;
        if index >= state.total_chunks {
            let total = state.total_chunks;
            self.incoming.remove(&file_id);
            return Err(FileTransferError::ChunkOutOfRange {
                file_id,
                index: chunk.index,
                total,
            });
        }

        let incoming_len = chunk.bytes.len() as u64;
        let previous_len = state.chunks.get(&index).map_or(0, |c| c.len() as u64);
        let buffered = state.buffered_bytes - previous_len + incoming_len;
        if buffered > state.total_size {
            self.incoming.remove(&file_id);
            return Err(FileTransferError::SizeMismatch { file_id });
        }

        state.chunks.insert(index, chunk.bytes);
        state.buffered_bytes = buffered;
        state.last_activity = now;

        Ok(ChunkProgress {
            received: state.received_count(),
            total: state.total_chunks,
        })
    }

    /// Finish a transfer: check completeness and digest.
    ///
    /// The state is dropped whatever the outcome.
    pub fn on_complete(&mut self, file_id: FileId) -> Result<VerifiedFile, FileTransferError> {
        let state = self
            .incoming
            .remove(&file_id)
            .ok_or(FileTransferError::UnknownTransfer(file_id))?;

        if !state.is_complete() {
            return Err(FileTransferError::IncompleteTransfer {
                file_id,
                received: state.received_count(),
                total: state.total_chunks,
            });
        }

        let mut bytes = Vec::with_capacity(state.buffered_bytes as usize);
        for chunk in state.chunks.into_values() {
            bytes.extend_from_slice(&chunk);
        }

        if bytes.len() as u64 != state.total_size {
            return Err(FileTransferError::SizeMismatch { file_id });
        }
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        if digest != state.expected_digest {
            warn!(file_id, "received file failed digest check");
            return Err(FileTransferError::IntegrityFailure { file_id });
        }

        Ok(VerifiedFile {
            file_id,
            file_name: state.file_name,
            bytes,
        })
    }

    /// Drop transfers idle for longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<FileTransferError> {
        let timeout = self.timeout;
        let stale: Vec<FileId> = self
            .incoming
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        stale
            .into_iter()
            .map(|file_id| {
                self.incoming.remove(&file_id);
                warn!(file_id, "incoming transfer timed out");
                FileTransferError::TransferTimeout { file_id }
            })
            .collect()
    }

    /// Earliest instant at which [`expire`](Self::expire) would drop something.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.incoming
            .values()
            .map(|s| s.last_activity + self.timeout)
            .min()
    }

    /// Abort everything, returning the ids that were in flight.
    pub fn clear(&mut self) -> Vec<FileId> {
        self.incoming.drain().map(|(id, _)| id).collect()
    }
}

/// Write a verified file into `download_dir` and return its path.
///
/// The bytes go to a `.part` file first and are renamed into place.
pub async fn persist_verified(
    download_dir: &Path,
    file: &VerifiedFile,
) -> Result<PathBuf, FileTransferError> {
    tokio::fs::create_dir_all(download_dir).await?;
    let destination = unique_destination(download_dir, &file.file_name).await;

    let mut part_name = destination.as_os_str().to_os_string();
    part_name.push(".part");
    let part_path = PathBuf::from(part_name);

    if let Err(e) = tokio::fs::write(&part_path, &file.bytes).await {
        let _ = tokio::fs::remove_file(&part_path).await;
        return Err(e.into());
    }
    tokio::fs::rename(&part_path, &destination).await?;

    info!(
        file_id = file.file_id,
        path = %destination.display(),
        size = file.bytes.len(),
        "file received"
    );
    Ok(destination)
}

/// Reduce a peer-supplied name to a safe final path component.
pub fn sanitize_file_name(name: &str) -> String {
    let candidate = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if candidate.is_empty() || candidate == "." || candidate == ".." {
        FALLBACK_FILE_NAME.to_string()
    } else {
        candidate
            .chars()
            .map(|c| if c.is_control() { '_' } else { c })
            .collect()
    }
}

/// `name`, then `stem_1.ext`, `stem_2.ext`, ... until a free path is found.
async fn unique_destination(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !tokio::fs::try_exists(&first).await.unwrap_or(false) {
        return first;
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut counter = 1u32;
    loop {
        let candidate = match &extension {
            Some(ext) => dir.join(format!("{}_{}.{}", stem, counter, ext)),
            None => dir.join(format!("{}_{}", stem, counter)),
        };
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        counter += 1;
    }
}
