// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! File Transfer State
//!
//! Per-connection bookkeeping for chunked transfers in both directions.
//! Incoming transfers spool into a temp file whose deletion is armed until
//! the transfer completes, so every abnormal exit path removes it by drop.
//! Outgoing transfers hold one acknowledgement signal per chunk index plus
//! a terminal verification signal; dropping the state aborts the sender.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::Path;
use std::time::Duration;

use ring::digest::{Context as DigestContext, SHA256};
use tempfile::TempPath;
use thiserror::Error;
use tokio::sync::oneshot;

use serde_json::Value;

/// Fragment size for outgoing transfers.
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// How long to wait for the peer to acknowledge one chunk.
pub(crate) const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the terminal `transferVerified` message.
pub(crate) const VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Transfer error types.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("i/o error during transfer: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for ack on chunk {index}")]
    AckTimeout { index: u64 },

    #[error("connection closed mid-transfer")]
    ConnectionClosed,
}

/// One entry in a handler's transfer table.
pub(crate) enum TransferState {
    Incoming(IncomingTransfer),
    Outgoing(OutgoingTransfer),
}

/// A transfer the peer is pushing to us.
pub(crate) struct IncomingTransfer {
    /// The `fileTransferInit` payload as received.
    pub meta: Value,
    /// Open spool file; taken on completion.
    pub file: Option<tokio::fs::File>,
    /// Deletes the spool file on drop unless disarmed with `keep()`.
    pub temp: TempPath,
    /// Running SHA-256 over the delivered bytes.
    pub digest: DigestContext,
}

impl IncomingTransfer {
    /// Opens a fresh spool file on the blocking pool.
    pub async fn open(meta: Value) -> io::Result<Self> {
        let named = tokio::task::spawn_blocking(|| {
            tempfile::Builder::new().prefix("airsync_").tempfile()
        })
        .await
        .map_err(|e| io::Error::other(e))??;
        let (file, temp) = named.into_parts();
        Ok(IncomingTransfer {
            meta,
            file: Some(tokio::fs::File::from_std(file)),
            temp,
            digest: DigestContext::new(&SHA256),
        })
    }
}

/// A transfer we are pushing to the peer.
pub(crate) struct OutgoingTransfer {
    /// One ack signal per chunk index, consumed as acks arrive.
    pub acks: HashMap<u64, oneshot::Sender<()>>,
    /// Terminal verification signal.
    pub verified: Option<oneshot::Sender<bool>>,
}

/// Receiver halves held by the transfer driver.
pub(crate) struct OutgoingSignals {
    pub acks: HashMap<u64, oneshot::Receiver<()>>,
    pub verified: oneshot::Receiver<bool>,
}

/// Allocates the signal pair for `total_chunks` chunks.
pub(crate) fn outgoing_channels(total_chunks: u64) -> (OutgoingTransfer, OutgoingSignals) {
    let mut senders = HashMap::with_capacity(total_chunks as usize);
    let mut receivers = HashMap::with_capacity(total_chunks as usize);
    for index in 0..total_chunks {
        let (tx, rx) = oneshot::channel();
        senders.insert(index, tx);
        receivers.insert(index, rx);
    }
    let (verified_tx, verified_rx) = oneshot::channel();
    (
        OutgoingTransfer {
            acks: senders,
            verified: Some(verified_tx),
        },
        OutgoingSignals {
            acks: receivers,
            verified: verified_rx,
        },
    )
}

/// Streaming SHA-256 of a whole file, hex-encoded.
///
/// Blocking; run on the worker pool.
pub(crate) fn hash_file_sync(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = DigestContext::new(&SHA256);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.update(&buf[..n]);
    }
    Ok(hex::encode(context.finish().as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hash_file_matches_known_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        let hash = hash_file_sync(file.path()).unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn outgoing_channels_cover_every_index() {
        let (transfer, signals) = outgoing_channels(3);
        assert_eq!(transfer.acks.len(), 3);
        assert_eq!(signals.acks.len(), 3);
        assert!(transfer.verified.is_some());
    }
}
