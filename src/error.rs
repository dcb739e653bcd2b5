// Copyright (C) 2024 the rtpush developers
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::Display;
use std::sync::Arc;

use thiserror::Error;

/// An opaque `std::error::Error + Send + Sync + 'static` implementation.
///
/// The focus is on detailed human-readable messages; in most cases they
/// carry enough information (ssrc, sequence number, hex dumps) to find the
/// offending datagram in a packet capture. Use [`Error::kind`] to classify
/// errors programmatically.
#[derive(Clone)]
pub struct Error(pub(crate) Arc<ErrorInt>);

/// Coarse classification of an [`Error`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Datagram too short or header fields inconsistent.
    Malformed,

    /// RTP version other than 2.
    ProtocolViolation,

    /// MPEG-PS pack truncated or carrying an illegal start code.
    PackInvalid,

    /// FU-A fragment run interrupted by a sequence gap or overflow.
    FragmentLost,

    /// A stage received a pipeline item of the wrong variant.
    WrongItemKind,

    /// The RTMP transport observed its connection close.
    ConnectionClosed,

    /// `serve` called on a server that is not in the ready state.
    AlreadyRunning,

    /// The server has begun (or finished) shutting down.
    ServerClosed,

    /// Socket-level failure.
    Io,

    /// The RTMP peer violated the publish protocol.
    Rtmp,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self.0.as_ref() {
            ErrorInt::Malformed { .. } | ErrorInt::SpsInvalid { .. } => ErrorKind::Malformed,
            ErrorInt::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            ErrorInt::PackInvalid { .. } => ErrorKind::PackInvalid,
            ErrorInt::FragmentLost { .. } => ErrorKind::FragmentLost,
            ErrorInt::WrongItemKind { .. } => ErrorKind::WrongItemKind,
            ErrorInt::ConnectionClosed => ErrorKind::ConnectionClosed,
            ErrorInt::AlreadyRunning => ErrorKind::AlreadyRunning,
            ErrorInt::ServerClosed => ErrorKind::ServerClosed,
            ErrorInt::Io { .. } => ErrorKind::Io,
            ErrorInt::RtmpProtocol { .. } => ErrorKind::Rtmp,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Error)]
pub(crate) enum ErrorInt {
    #[error("malformed RTP packet: {reason}")]
    Malformed { reason: &'static str },

    #[error("RTP version must be 2, got {version}")]
    ProtocolViolation { version: u8 },

    #[error("PS pack invalid: {reason}")]
    PackInvalid { reason: &'static str },

    #[error("FU-A fragment run broken at seq {seq:04x}: {reason}")]
    FragmentLost { seq: u16, reason: &'static str },

    #[error("invalid H.264 SPS: {reason}")]
    SpsInvalid { reason: &'static str },

    #[error("{stage} expects {expects} items, got {got}")]
    WrongItemKind {
        stage: &'static str,
        expects: &'static str,
        got: &'static str,
    },

    #[error("RTMP connection closed")]
    ConnectionClosed,

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is closed")]
    ServerClosed,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("RTMP protocol error: {description}")]
    RtmpProtocol { description: String },
}
