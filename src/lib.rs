// Copyright (C) 2024 the rtpush developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! UDP-facing RTP receiver that terminates many concurrent RTP flows,
//! reassembles each flow's payload into a contiguous H.264 elementary
//! stream, repackages it as FLV tags, and forwards them to an RTMP
//! publisher.
//!
//! The building blocks:
//!
//! *   [`server::Server`] owns the UDP socket and demultiplexes datagrams by
//!     SSRC into long-lived [`session::Session`]s.
//! *   Each session delivers packets in sequence-number order through a
//!     chain of [`stage::Stage`]s.
//! *   The bundled stages strip MPEG-PS framing ([`stage::PsDepacketizer`]),
//!     reassemble fragmented NAL units ([`stage::FuaReassembler`]), mux NAL
//!     units into FLV tags ([`stage::FlvMuxer`]), and publish the tags over
//!     RTMP ([`stage::RtmpPublisher`]).
//!
//! ```no_run
//! use rtpush::{server::Server, stage::{FlvMuxer, FuaReassembler, PsDepacketizer, RtmpPublisher, Stage}};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), rtpush::Error> {
//!     let server = Server::new("0.0.0.0:5004".parse().unwrap(), None);
//!     server.serve().await?;
//!     loop {
//!         let session = server.accept().await?;
//!         let name = format!("stream_{:08x}", session.ssrc());
//!         let sink = RtmpPublisher::connect("rtmp://localhost/live", &name).await?;
//!         let mut muxer = FlvMuxer::new();
//!         muxer.attach(Box::new(sink));
//!         let mut fua = FuaReassembler::new();
//!         fua.attach(Box::new(muxer));
//!         let mut ps = PsDepacketizer::new();
//!         ps.attach(Box::new(fua));
//!         session.attach(Box::new(ps));
//!     }
//! }
//! ```

mod error;
mod hex;

pub use error::{Error, ErrorKind};

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err(crate::error::Error(std::sync::Arc::new($e)))
    };
}

macro_rules! wrap {
    ($e:expr) => {
        crate::error::Error(std::sync::Arc::new($e))
    };
}

pub mod flv;
pub mod rtp;
pub mod server;
pub mod session;
pub mod stage;

pub(crate) use error::ErrorInt;
