// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.

use std::{io, time::Duration};

use thiserror::Error;

use crate::frame::ExceptionCode;

/// A frame that cannot be trusted.
///
/// Framing errors are fatal for the connection they were received on,
/// because the boundaries of subsequent frames are unknown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The protocol identifier of the MBAP header is not `0`.
    #[error("invalid protocol id: {0:#06x}")]
    InvalidProtocolId(u16),

    /// The length field leaves no room for the unit id and a function code.
    #[error("invalid length field: {0}")]
    InvalidLength(u16),

    /// The declared PDU exceeds the configured maximum.
    #[error("PDU size {size} exceeds the maximum of {max} bytes")]
    PduTooLarge { size: usize, max: usize },

    /// The declared length does not match the number of bytes that follow the header.
    #[error("declared length {declared} does not match {actual} received bytes")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Gateway errors.
#[derive(Debug, Error)]
pub enum Error {
    /// A malformed frame was received.
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    /// The request queue has reached its capacity.
    #[error("request queue is full")]
    QueueFull,

    /// The gateway stopped processing requests.
    #[error("gateway is shutting down")]
    ShuttingDown,

    /// No connection to the upstream device could be established.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[source] io::Error),

    /// The upstream device did not answer in time.
    #[error("upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    /// The upstream transaction failed after the request had been sent.
    #[error("upstream transaction failed: {0}")]
    Upstream(#[source] io::Error),

    /// The configuration cannot be used to run a gateway.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// I/O error on a client connection.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The exception code that is reported to a client instead of a response.
    ///
    /// Returns `None` for errors that terminate the client session.
    #[must_use]
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            Self::QueueFull => Some(ExceptionCode::ServerDeviceBusy),
            Self::UpstreamUnavailable(_) => Some(ExceptionCode::GatewayPathUnavailable),
            Self::UpstreamTimeout(_) | Self::Upstream(_) => {
                Some(ExceptionCode::GatewayTargetDevice)
            }
            Self::Frame(_) | Self::ShuttingDown | Self::InvalidConfig(_) | Self::Io(_) => None,
        }
    }
}
