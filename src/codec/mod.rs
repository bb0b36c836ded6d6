// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod tcp;

#[allow(clippy::cast_possible_truncation)]
fn u16_len(len: usize) -> u16 {
    // This type conversion should always be safe, because the PDU size
    // is limited by the protocol and checked before encoding.
    debug_assert!(len <= u16::MAX.into());
    len as u16
}
