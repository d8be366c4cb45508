//! Incremental, resumable front-end for a JPEG XL style image container.
//!
//! The [`Decoder`] is a pause/resume state machine: attach input bytes,
//! call [`step`](Decoder::step) in a loop, and react to the returned
//! [`Progress`] by supplying more input, attaching an output sink, or
//! reading the data a subscribed milestone made available. The
//! [`Encoder`] is the peer
//! with the roles reversed. Actual pixel coding lives behind the
//! [`PixelEngine`] trait; the shipped [`RawEngine`] handles uncompressed
//! sections so the protocol is usable end-to-end without a codec.
//!
//! ```no_run
//! use jxlstream::{Decoder, EventMask, Progress};
//!
//! let mut decoder = Decoder::new();
//! decoder.subscribe(EventMask::BASIC_INFO | EventMask::FULL_IMAGE)?;
//! decoder.set_input(std::fs::read("image.jxl")?).map_err(|r| r.error)?;
//! decoder.close_input();
//! loop {
//!     match decoder.step()? {
//!         Progress::BasicInfo => {
//!             let info = decoder.basic_info()?;
//!             println!("{}x{}", info.xsize, info.ysize);
//!         }
//!         Progress::NeedImageBuffer => {
//!             let format = jxlstream::PixelFormat::new(3, jxlstream::SampleType::U8);
//!             let size = decoder.query_buffer_size(jxlstream::ImageKind::Primary, &format)?;
//!             decoder
//!                 .set_image_buffer(jxlstream::ImageKind::Primary, format, vec![0; size])
//!                 .map_err(|r| r.error)?;
//!         }
//!         Progress::FullImage => {
//!             let pixels = decoder.release_image_buffer(jxlstream::ImageKind::Primary)?;
//!             // ...
//!         }
//!         Progress::Complete => break,
//!         _ => {}
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod codestream;
pub mod container;
pub mod decoder;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod event;
pub mod frame;
mod input;
pub mod metadata;
pub mod progress;
pub mod signature;
pub mod sink;

pub use container::{BoxHeader, BoxType};
pub use decoder::{Decoder, DecoderOptions};
pub use encoder::{EncodeProgress, Encoder, EncoderOptions};
pub use engine::{EngineError, PixelEngine, RawEngine, RenderedImage, SequentialRunner, TaskRunner};
pub use error::{DecodeError, RejectedBuffer, UsageError};
pub use event::{Event, EventMask};
pub use frame::{BlendMode, CropInfo, FrameHeader};
pub use metadata::{
    AnimationInfo, BasicInfo, ColorEncoding, ColorSpace, ExtraChannelInfo, ExtraChannelType,
    Orientation, PixelFormat, PreviewInfo, Primaries, RenderingIntent, SampleType,
    TransferFunction, WhitePoint,
};
pub use progress::Progress;
pub use signature::{sniff, Signature};
pub use sink::{ImageKind, ScanlineSink, SinkRefused, ThreadedSink};
