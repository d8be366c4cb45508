//! Step outcomes.

use crate::event::Event;

/// Why [`step`](crate::Decoder::step) stopped.
///
/// A closed set, distinct from [`EventMask`](crate::EventMask): subscription
/// bits are configuration, this is a one-shot return value. Stream errors are
/// not represented here; they surface as `Err(DecodeError)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Parsing finished, or no subscribed milestone can be reached with the
    /// data seen so far. More input may still arrive (trailing metadata);
    /// callers may step again after supplying it unless the stream is closed.
    Complete,
    /// The attached input is exhausted. Release it, re-attach the unconsumed
    /// tail plus new bytes, and step again.
    NeedMoreInput,
    /// A preview image could be produced but no preview sink is attached.
    /// Optional: stepping again without attaching skips the preview.
    NeedPreviewBuffer,
    /// An eighth-resolution image could be produced but no DC sink is
    /// attached. Optional: stepping again without attaching skips it.
    NeedDcBuffer,
    /// The frame needs a primary image sink before decoding can proceed.
    /// Mandatory while `FULL_IMAGE` is subscribed.
    NeedImageBuffer,
    /// The attached JPEG reconstruction buffer is full (or missing).
    NeedJpegOutput,
    /// The attached box buffer is full.
    NeedBoxOutput,
    BasicInfo,
    ColorEncoding,
    PreviewImage,
    Frame,
    DcImage,
    FullImage,
    JpegReconstruction,
    Box,
    FrameProgression,
}

impl Progress {
    /// The milestone event this status reports, if it is one.
    pub fn event(self) -> Option<Event> {
        match self {
            Progress::BasicInfo => Some(Event::BasicInfo),
            Progress::ColorEncoding => Some(Event::ColorEncoding),
            Progress::PreviewImage => Some(Event::PreviewImage),
            Progress::Frame => Some(Event::Frame),
            Progress::DcImage => Some(Event::DcImage),
            Progress::FullImage => Some(Event::FullImage),
            Progress::JpegReconstruction => Some(Event::JpegReconstruction),
            Progress::Box => Some(Event::Box),
            Progress::FrameProgression => Some(Event::FrameProgression),
            _ => None,
        }
    }
}
