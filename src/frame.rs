// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus TCP frames as forwarded by the gateway.

use std::fmt;

use bytes::Bytes;

/// Correlates a response with its request. Echoed verbatim.
pub type TransactionId = u16;

/// Address of the sub-device behind the gateway. Forwarded unchanged.
pub type UnitId = u8;

/// A Modbus function code is represented by an unsigned 8 bit integer.
pub type FunctionCode = u8;

/// The protocol identifier of Modbus TCP.
pub const PROTOCOL_ID: u16 = 0x0000;

/// Size of the MBAP header including the unit id.
pub const HEADER_SIZE: usize = 7;

/// Maximum request/response PDU size.
///
/// As defined by the Modbus specification.
pub const MAX_PDU_SIZE: usize = 253;

/// Bit that is set in the function code of an exception response.
const EXCEPTION_FLAG: u8 = 0x80;

/// The routing relevant part of the MBAP header.
///
/// The protocol id is always `0` and the length field is derived from
/// the PDU, hence neither is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub transaction_id: TransactionId,
    pub unit_id: UnitId,
}

/// A complete Modbus TCP application data unit.
///
/// The PDU (function code and data) is opaque to the gateway.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub hdr: Header,
    pub pdu: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(hdr: Header, pdu: impl Into<Bytes>) -> Self {
        Self {
            hdr,
            pdu: pdu.into(),
        }
    }

    /// Value of the length field: the unit id plus the PDU.
    #[must_use]
    pub fn length(&self) -> usize {
        self.pdu.len() + 1
    }

    #[must_use]
    pub fn function_code(&self) -> Option<FunctionCode> {
        self.pdu.first().copied()
    }

    #[must_use]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .is_some_and(|code| code & EXCEPTION_FLAG != 0)
    }

    /// Build the exception response for this request.
    ///
    /// The response keeps the transaction id and unit id of the request.
    #[must_use]
    pub fn exception(&self, code: ExceptionCode) -> Self {
        let function = self.function_code().unwrap_or_default();
        Self {
            hdr: self.hdr,
            pdu: Bytes::from(vec![function | EXCEPTION_FLAG, code.into()]),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("transaction_id", &self.hdr.transaction_id)
            .field("unit_id", &self.hdr.unit_id)
            .field("pdu", &HexDump(&self.pdu))
            .finish()
    }
}

/// Formats bytes as space separated hex, e.g. `03 00 6b 00 03`.
pub(crate) struct HexDump<'a>(pub(crate) &'a [u8]);

impl fmt::Debug for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Exception codes the gateway answers with on behalf of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    /// 0x06
    ServerDeviceBusy,
    /// 0x0A
    GatewayPathUnavailable,
    /// 0x0B
    GatewayTargetDevice,
}

impl From<ExceptionCode> for u8 {
    fn from(from: ExceptionCode) -> Self {
        use ExceptionCode::*;
        match from {
            ServerDeviceBusy => 0x06,
            GatewayPathUnavailable => 0x0A,
            GatewayTargetDevice => 0x0B,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ExceptionCode::*;
        let msg = match self {
            ServerDeviceBusy => "Server device busy",
            GatewayPathUnavailable => "Gateway path unavailable",
            GatewayTargetDevice => "Gateway target device failed to respond",
        };
        f.write_str(msg)
    }
}
