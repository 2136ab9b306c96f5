// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod codec;
pub mod message;

pub use codec::{CodecError, MessageCodec};
pub use message::{msg_type, FileChunk, FileChunkAck, Message, TransferVerified};
