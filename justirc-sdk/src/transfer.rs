//! Chunked encrypted file transfer.
//!
//! A transfer is a sequence of `image_start` / `image_chunk` / `image_end`
//! frames over the messaging substrate. Every byte of file content and the
//! display filename are encrypted with the recipient's peer session; the
//! envelope exposes only the chunk count, the total size, and an opaque
//! transfer id. Chunks are emitted in order and the receiver relies on
//! envelope order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::{CryptoCore, CryptoError};
use crate::proto::Body;

/// Default chunk size in bytes.
pub const CHUNK_BYTES: usize = 32768;
/// Hard cap on transferable file size.
pub const MAX_FILE_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("a transfer from {0} is already in progress")]
    TransferInProgress(String),
    #[error("unknown transfer {0}")]
    UnknownTransfer(String),
    #[error("file too large: {size} bytes (max {max})")]
    FileTooLarge { size: u64, max: u64 },
    #[error("file is empty")]
    EmptyFile,
    #[error("chunk {got} arrived out of order (expected {expected})")]
    ChunkOutOfOrder { expected: u64, got: u64 },
    #[error("received {actual} bytes but {expected} were advertised")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("bad transfer metadata")]
    BadMetadata,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// File metadata carried inside `image_start`'s `encrypted_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename: String,
    pub file_size: u64,
}

fn new_transfer_id() -> String {
    let mut raw = [0u8; 16];
    OsRng.fill_bytes(&mut raw);
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

/// Sender side of one transfer. Frames are produced one at a time so the
/// caller can pace emission against the image-chunk rate budget.
pub struct OutboundTransfer {
    pub transfer_id: String,
    to_id: String,
    metadata: FileMetadata,
    bytes: Vec<u8>,
    chunk_bytes: usize,
}

impl OutboundTransfer {
    /// Validate and stage a file for sending with the default chunk size.
    pub fn prepare(to_id: &str, filename: &str, bytes: Vec<u8>) -> Result<Self, TransferError> {
        Self::prepare_chunked(to_id, filename, bytes, CHUNK_BYTES)
    }

    pub fn prepare_chunked(
        to_id: &str,
        filename: &str,
        bytes: Vec<u8>,
        chunk_bytes: usize,
    ) -> Result<Self, TransferError> {
        if bytes.is_empty() {
            return Err(TransferError::EmptyFile);
        }
        if bytes.len() as u64 > MAX_FILE_BYTES {
            return Err(TransferError::FileTooLarge {
                size: bytes.len() as u64,
                max: MAX_FILE_BYTES,
            });
        }
        let metadata = FileMetadata {
            filename: filename.to_string(),
            file_size: bytes.len() as u64,
        };
        Ok(Self {
            transfer_id: new_transfer_id(),
            to_id: to_id.to_string(),
            metadata,
            bytes,
            chunk_bytes: chunk_bytes.max(1),
        })
    }

    pub fn total_chunks(&self) -> u64 {
        self.bytes.len().div_ceil(self.chunk_bytes) as u64
    }

    pub fn file_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// The `image_start` frame, with the filename sealed in the metadata.
    pub fn start_frame(
        &self,
        crypto: &mut CryptoCore,
        from_id: &str,
    ) -> Result<Body, TransferError> {
        let metadata =
            serde_json::to_vec(&self.metadata).map_err(|_| TransferError::BadMetadata)?;
        let (encrypted_data, nonce) = crypto.encrypt(&self.to_id, &metadata)?;
        Ok(Body::ImageStart {
            from_id: from_id.to_string(),
            to_id: self.to_id.clone(),
            transfer_id: self.transfer_id.clone(),
            total_chunks: self.total_chunks(),
            file_size: self.file_size(),
            encrypted_data,
            nonce,
        })
    }

    /// The `image_chunk` frame for chunk `n`. Chunks must be emitted in
    /// order, `n` in `[0, total_chunks)`.
    pub fn chunk_frame(
        &self,
        crypto: &mut CryptoCore,
        from_id: &str,
        n: u64,
    ) -> Result<Body, TransferError> {
        if n >= self.total_chunks() {
            return Err(TransferError::UnknownTransfer(self.transfer_id.clone()));
        }
        let start = n as usize * self.chunk_bytes;
        let end = (start + self.chunk_bytes).min(self.bytes.len());
        let (encrypted_data, nonce) = crypto.encrypt(&self.to_id, &self.bytes[start..end])?;
        Ok(Body::ImageChunk {
            from_id: from_id.to_string(),
            to_id: self.to_id.clone(),
            transfer_id: self.transfer_id.clone(),
            chunk_number: n,
            encrypted_data,
            nonce,
        })
    }

    pub fn end_frame(&self, from_id: &str) -> Body {
        Body::ImageEnd {
            from_id: from_id.to_string(),
            to_id: self.to_id.clone(),
            transfer_id: self.transfer_id.clone(),
        }
    }
}

struct InboundState {
    transfer_id: String,
    total_chunks: u64,
    advertised_size: u64,
    metadata: FileMetadata,
    received: Vec<u8>,
    next_chunk: u64,
}

/// A completed inbound transfer.
#[derive(Debug)]
pub struct ReceivedFile {
    pub from_id: String,
    pub metadata: FileMetadata,
    pub bytes: Vec<u8>,
}

/// Receiver side: at most one in-flight transfer per sender. Any decrypt
/// failure or ordering violation aborts the transfer and drops its state.
#[derive(Default)]
pub struct InboundTransfers {
    active: HashMap<String, InboundState>,
}

impl InboundTransfers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle `image_start`. Returns the decrypted metadata.
    pub fn on_start(
        &mut self,
        crypto: &mut CryptoCore,
        from_id: &str,
        transfer_id: &str,
        total_chunks: u64,
        file_size: u64,
        encrypted_data: &str,
        nonce: &str,
    ) -> Result<FileMetadata, TransferError> {
        if self.active.contains_key(from_id) {
            return Err(TransferError::TransferInProgress(from_id.to_string()));
        }
        let metadata_bytes = crypto.decrypt(from_id, encrypted_data, nonce)?;
        let metadata: FileMetadata =
            serde_json::from_slice(&metadata_bytes).map_err(|_| TransferError::BadMetadata)?;
        self.active.insert(
            from_id.to_string(),
            InboundState {
                transfer_id: transfer_id.to_string(),
                total_chunks,
                advertised_size: file_size,
                metadata: metadata.clone(),
                received: Vec::with_capacity(file_size.min(MAX_FILE_BYTES) as usize),
                next_chunk: 0,
            },
        );
        Ok(metadata)
    }

    /// Handle `image_chunk`. Returns progress in `[0, 1]`.
    pub fn on_chunk(
        &mut self,
        crypto: &mut CryptoCore,
        from_id: &str,
        transfer_id: &str,
        chunk_number: u64,
        encrypted_data: &str,
        nonce: &str,
    ) -> Result<f64, TransferError> {
        let state = self
            .active
            .get_mut(from_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        if state.transfer_id != transfer_id {
            return Err(TransferError::UnknownTransfer(transfer_id.to_string()));
        }
        if chunk_number != state.next_chunk {
            let expected = state.next_chunk;
            self.active.remove(from_id);
            return Err(TransferError::ChunkOutOfOrder {
                expected,
                got: chunk_number,
            });
        }
        match crypto.decrypt(from_id, encrypted_data, nonce) {
            Ok(chunk) => {
                state.received.extend_from_slice(&chunk);
                state.next_chunk += 1;
                Ok(state.next_chunk as f64 / state.total_chunks.max(1) as f64)
            }
            Err(e) => {
                self.active.remove(from_id);
                Err(e.into())
            }
        }
    }

    /// Handle `image_end`. Verifies the byte count against the advertised
    /// size and yields the reassembled file.
    pub fn on_end(
        &mut self,
        from_id: &str,
        transfer_id: &str,
    ) -> Result<ReceivedFile, TransferError> {
        let state = self
            .active
            .remove(from_id)
            .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.to_string()))?;
        if state.transfer_id != transfer_id {
            return Err(TransferError::UnknownTransfer(transfer_id.to_string()));
        }
        let actual = state.received.len() as u64;
        if actual != state.advertised_size {
            return Err(TransferError::SizeMismatch {
                expected: state.advertised_size,
                actual,
            });
        }
        Ok(ReceivedFile {
            from_id: from_id.to_string(),
            metadata: state.metadata,
            bytes: state.received,
        })
    }

    /// Drop any in-flight transfer from a sender (disconnect, cancel).
    pub fn cancel(&mut self, from_id: &str) {
        self.active.remove(from_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_cores() -> (CryptoCore, CryptoCore) {
        let mut alice = CryptoCore::generate();
        let mut bob = CryptoCore::generate();
        alice.install_peer("bob", &bob.public_key_b64()).unwrap();
        bob.install_peer("alice", &alice.public_key_b64()).unwrap();
        (alice, bob)
    }

    fn drive_transfer(
        alice: &mut CryptoCore,
        bob: &mut CryptoCore,
        out: &OutboundTransfer,
        inbound: &mut InboundTransfers,
    ) -> ReceivedFile {
        let Body::ImageStart {
            transfer_id,
            total_chunks,
            file_size,
            encrypted_data,
            nonce,
            ..
        } = out.start_frame(alice, "alice").unwrap()
        else {
            panic!("expected image_start");
        };
        inbound
            .on_start(
                bob,
                "alice",
                &transfer_id,
                total_chunks,
                file_size,
                &encrypted_data,
                &nonce,
            )
            .unwrap();
        for n in 0..out.total_chunks() {
            let Body::ImageChunk {
                chunk_number,
                encrypted_data,
                nonce,
                ..
            } = out.chunk_frame(alice, "alice", n).unwrap()
            else {
                panic!("expected image_chunk");
            };
            inbound
                .on_chunk(bob, "alice", &out.transfer_id, chunk_number, &encrypted_data, &nonce)
                .unwrap();
        }
        inbound.on_end("alice", &out.transfer_id).unwrap()
    }

    #[test]
    fn chunk_math() {
        let out = OutboundTransfer::prepare("bob", "f.bin", vec![0u8; 100_000]).unwrap();
        assert_eq!(out.total_chunks(), 4);
        assert_eq!(out.file_size(), 100_000);
        let one = OutboundTransfer::prepare("bob", "f.bin", vec![0u8; 1]).unwrap();
        assert_eq!(one.total_chunks(), 1);
        let exact = OutboundTransfer::prepare("bob", "f.bin", vec![0u8; CHUNK_BYTES]).unwrap();
        assert_eq!(exact.total_chunks(), 1);
    }

    #[test]
    fn full_transfer_roundtrip() {
        let (mut alice, mut bob) = paired_cores();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let out = OutboundTransfer::prepare("bob", "photo.png", data.clone()).unwrap();
        let mut inbound = InboundTransfers::new();
        let file = drive_transfer(&mut alice, &mut bob, &out, &mut inbound);
        assert_eq!(file.bytes, data);
        assert_eq!(file.metadata.filename, "photo.png");
        assert_eq!(file.metadata.file_size, 100_000);
    }

    #[test]
    fn filename_not_visible_in_envelope() {
        let (mut alice, _) = paired_cores();
        let out = OutboundTransfer::prepare("bob", "secret-plans.pdf", vec![1, 2, 3]).unwrap();
        let frame = crate::proto::Frame::new(out.start_frame(&mut alice, "alice").unwrap());
        let line = crate::proto::encode(&frame);
        assert!(!line.contains("secret-plans"));
    }

    #[test]
    fn empty_file_rejected() {
        assert!(matches!(
            OutboundTransfer::prepare("bob", "f", vec![]),
            Err(TransferError::EmptyFile)
        ));
    }

    #[test]
    fn custom_chunk_size_respected() {
        let out = OutboundTransfer::prepare_chunked("bob", "f", vec![0u8; 8], 4).unwrap();
        assert_eq!(out.total_chunks(), 2);
        let out = OutboundTransfer::prepare_chunked("bob", "f", vec![0u8; 9], 4).unwrap();
        assert_eq!(out.total_chunks(), 3);
    }

    #[test]
    fn second_transfer_from_same_sender_rejected() {
        let (mut alice, mut bob) = paired_cores();
        let out1 = OutboundTransfer::prepare("bob", "a", vec![1; 10]).unwrap();
        let out2 = OutboundTransfer::prepare("bob", "b", vec![2; 10]).unwrap();
        let mut inbound = InboundTransfers::new();

        let start = |out: &OutboundTransfer, alice: &mut CryptoCore| {
            match out.start_frame(alice, "alice").unwrap() {
                Body::ImageStart {
                    encrypted_data,
                    nonce,
                    ..
                } => (encrypted_data, nonce),
                _ => unreachable!(),
            }
        };

        let (ed, nonce) = start(&out1, &mut alice);
        inbound
            .on_start(&mut bob, "alice", &out1.transfer_id, 1, 10, &ed, &nonce)
            .unwrap();
        let (ed, nonce) = start(&out2, &mut alice);
        assert!(matches!(
            inbound.on_start(&mut bob, "alice", &out2.transfer_id, 1, 10, &ed, &nonce),
            Err(TransferError::TransferInProgress(_))
        ));
    }

    #[test]
    fn out_of_order_chunk_aborts() {
        let (mut alice, mut bob) = paired_cores();
        let out =
            OutboundTransfer::prepare_chunked("bob", "f", vec![7u8; 64], 16).unwrap();
        let mut inbound = InboundTransfers::new();
        let Body::ImageStart {
            encrypted_data,
            nonce,
            ..
        } = out.start_frame(&mut alice, "alice").unwrap()
        else {
            unreachable!()
        };
        inbound
            .on_start(&mut bob, "alice", &out.transfer_id, 4, 64, &encrypted_data, &nonce)
            .unwrap();

        let Body::ImageChunk {
            encrypted_data,
            nonce,
            ..
        } = out.chunk_frame(&mut alice, "alice", 2).unwrap()
        else {
            unreachable!()
        };
        assert!(matches!(
            inbound.on_chunk(&mut bob, "alice", &out.transfer_id, 2, &encrypted_data, &nonce),
            Err(TransferError::ChunkOutOfOrder { expected: 0, got: 2 })
        ));
        // State was dropped; the end frame no longer resolves.
        assert!(inbound.on_end("alice", &out.transfer_id).is_err());
    }

    #[test]
    fn corrupt_chunk_aborts_and_drops_state() {
        let (mut alice, mut bob) = paired_cores();
        let out = OutboundTransfer::prepare_chunked("bob", "f", vec![9u8; 32], 16).unwrap();
        let mut inbound = InboundTransfers::new();
        let Body::ImageStart {
            encrypted_data,
            nonce,
            ..
        } = out.start_frame(&mut alice, "alice").unwrap()
        else {
            unreachable!()
        };
        inbound
            .on_start(&mut bob, "alice", &out.transfer_id, 2, 32, &encrypted_data, &nonce)
            .unwrap();

        let Body::ImageChunk { nonce, .. } = out.chunk_frame(&mut alice, "alice", 0).unwrap()
        else {
            unreachable!()
        };
        let garbage = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            [0u8; 24],
        );
        assert!(inbound
            .on_chunk(&mut bob, "alice", &out.transfer_id, 0, &garbage, &nonce)
            .is_err());
        assert!(inbound.on_end("alice", &out.transfer_id).is_err());
    }

    #[test]
    fn size_mismatch_detected() {
        let (mut alice, mut bob) = paired_cores();
        let out = OutboundTransfer::prepare_chunked("bob", "f", vec![3u8; 32], 16).unwrap();
        let mut inbound = InboundTransfers::new();
        let Body::ImageStart {
            encrypted_data,
            nonce,
            ..
        } = out.start_frame(&mut alice, "alice").unwrap()
        else {
            unreachable!()
        };
        // Advertise more bytes than will arrive.
        inbound
            .on_start(&mut bob, "alice", &out.transfer_id, 2, 48, &encrypted_data, &nonce)
            .unwrap();
        for n in 0..2 {
            let Body::ImageChunk {
                encrypted_data,
                nonce,
                ..
            } = out.chunk_frame(&mut alice, "alice", n).unwrap()
            else {
                unreachable!()
            };
            inbound
                .on_chunk(&mut bob, "alice", &out.transfer_id, n, &encrypted_data, &nonce)
                .unwrap();
        }
        assert!(matches!(
            inbound.on_end("alice", &out.transfer_id),
            Err(TransferError::SizeMismatch {
                expected: 48,
                actual: 32
            })
        ));
    }
}
