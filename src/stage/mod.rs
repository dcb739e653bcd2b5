// Copyright (C) 2024 the rtpush developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The payload-transforming pipeline.
//!
//! A session drives a singly-linked chain of [`Stage`]s. Each stage accepts
//! exactly one [`StageItem`] variant, may rewrite the item in place, and may
//! synchronously invoke its downstream zero or more times per input. The
//! whole chain runs on the session's task; the only inter-task boundaries
//! are ingress (socket → session) and egress (the RTMP sink's connection
//! task).

use crate::flv::FlvTag;
use crate::rtp::Packet;
use crate::Error;

mod flv;
mod h264;
mod ps;
mod rtmp;

pub use self::flv::FlvMuxer;
pub use self::h264::FuaReassembler;
pub use self::ps::PsDepacketizer;
pub use self::rtmp::RtmpPublisher;

/// One unit of work flowing through a stage chain.
///
/// Items are passed by `&mut` so a stage can replace the packet's payload
/// and forward the same container repeatedly, and so the pooled receive
/// buffer always comes back to the session. Stages must not retain payload
/// references across calls.
#[derive(Debug)]
pub enum StageItem {
    Packet(Packet),
    Tag(FlvTag),
}

impl StageItem {
    fn variant_name(&self) -> &'static str {
        match self {
            StageItem::Packet(_) => "packet",
            StageItem::Tag(_) => "tag",
        }
    }
}

/// A single link in a processing chain.
pub trait Stage: Send {
    /// Processes one item, possibly invoking the downstream stage.
    ///
    /// A returned error is fatal to the owning session; recoverable
    /// protocol problems are logged and swallowed inside the stage.
    fn process(&mut self, item: &mut StageItem) -> Result<(), Error>;

    /// Replaces the downstream stage, releasing any displaced one.
    fn attach(&mut self, next: Box<dyn Stage>);

    /// Releases resources held by this stage and, recursively, its
    /// downstream chain.
    fn release(&mut self);
}

/// Hands `item` to the downstream stage, if any.
pub(crate) fn forward(
    next: &mut Option<Box<dyn Stage>>,
    item: &mut StageItem,
) -> Result<(), Error> {
    match next {
        Some(stage) => stage.process(item),
        None => Ok(()),
    }
}

/// Replaces `next`, releasing the displaced chain first.
pub(crate) fn replace_next(next: &mut Option<Box<dyn Stage>>, new: Box<dyn Stage>) {
    if let Some(mut old) = next.replace(new) {
        old.release();
    }
}

/// Constructs the error for an item of the wrong variant.
pub(crate) fn wrong_item_kind(
    stage: &'static str,
    expects: &'static str,
    item: &StageItem,
) -> Error {
    wrap!(crate::ErrorInt::WrongItemKind {
        stage,
        expects,
        got: item.variant_name(),
    })
}
