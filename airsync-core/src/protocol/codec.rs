// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message Codec
//!
//! Frames a [`Message`] to the text payload of one WebSocket frame:
//! encrypted servers send `base64(nonce || ciphertext || tag)`, no-encrypt
//! servers send the raw JSON. The mode is fixed when the server starts and
//! never changes for its lifetime.

use std::borrow::Cow;
use std::sync::Arc;

use thiserror::Error;

use crate::crypto::{Cipher, CipherError};

use super::message::Message;

/// Codec error types.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Frame failed to decrypt (bad base64, short frame or tag mismatch).
    #[error(transparent)]
    Cipher(#[from] CipherError),

    /// Frame is not a JSON message object.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON framing layered over optional encryption.
#[derive(Clone)]
pub struct MessageCodec {
    cipher: Arc<Cipher>,
    encrypted: bool,
}

impl MessageCodec {
    pub fn new(cipher: Arc<Cipher>, encrypted: bool) -> Self {
        MessageCodec { cipher, encrypted }
    }

    /// Whether outbound frames are encrypted.
    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    /// Serializes a message for the wire.
    pub fn encode(&self, msg: &Message) -> Result<String, CodecError> {
        let json = serde_json::to_string(msg)?;
        if self.encrypted {
            Ok(self.cipher.encrypt(&json)?)
        } else {
            Ok(json)
        }
    }

    /// Decodes one inbound frame.
    ///
    /// In encrypted mode decryption is strict: a tag mismatch surfaces as
    /// [`CodecError::Cipher`] and the caller drops the frame. In no-encrypt
    /// mode an undecryptable frame falls through as-is, so both plaintext
    /// peers and encrypted peers can talk to a debug server.
    pub fn decode(&self, text: &str) -> Result<Message, CodecError> {
        let plaintext: Cow<'_, str> = if self.encrypted {
            Cow::Owned(self.cipher.decrypt(text)?)
        } else {
            match self.cipher.decrypt(text) {
                Ok(decrypted) => Cow::Owned(decrypted),
                Err(_) => Cow::Borrowed(text),
            }
        };
        Ok(serde_json::from_str(&plaintext)?)
    }
}
