// SPDX-FileCopyrightText: 2026 AirSync Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod cipher;

pub use cipher::{Cipher, CipherError, SymmetricKey};
