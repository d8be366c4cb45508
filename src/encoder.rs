//! The peer encoder: metadata and pixel submissions in, a byte stream out.
//!
//! Mirrors the decoder's ownership pattern with the roles reversed: the
//! caller attaches an owned output buffer, [`Encoder::process`] fills it,
//! and `release_output` hands it back with the written count.

use log::debug;

use crate::codestream::{self, MarkerCode};
use crate::container::{self, BoxType};
use crate::error::{RejectedBuffer, UsageError};
use crate::frame::FrameHeader;
use crate::metadata::{BasicInfo, ColorEncoding};
use crate::signature::{CODESTREAM_MAGIC, CONTAINER_SIGNATURE};
use crate::sink::ByteSink;

/// Construction-time encoder configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderOptions {
    /// Emit a boxed container instead of a bare codestream.
    pub container: bool,
    /// Emit an eighth-resolution pass ahead of the full pass so decoders
    /// can show progressive previews.
    pub progressive_passes: bool,
}

/// Why [`Encoder::process`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeProgress {
    /// Everything submitted so far has been emitted; the stream is not
    /// closed, so more frames are expected.
    AwaitingFrames,
    /// The attached output buffer is full (or missing). Release it and
    /// attach a fresh one.
    NeedMoreOutput,
    /// The stream is closed and fully emitted.
    Complete,
}

/// Streaming encoder for bare codestreams and boxed containers.
pub struct Encoder {
    options: EncoderOptions,
    basic_info: Option<BasicInfo>,
    color_encoding: Option<ColorEncoding>,
    /// Codestream bytes accumulated so far (container mode buffers them
    /// until close so the `jxlc` box size is known).
    codestream: Vec<u8>,
    boxes_pre: Vec<u8>,
    boxes_post: Vec<u8>,
    pending: Vec<u8>,
    pending_pos: usize,
    out: ByteSink,
    header_written: bool,
    frames_seen: u64,
    last_frame_seen: bool,
    frames_closed: bool,
}

impl Encoder {
    pub fn new() -> Self {
        Self::with_options(EncoderOptions::default())
    }

    pub fn with_options(options: EncoderOptions) -> Self {
        Self {
            options,
            basic_info: None,
            color_encoding: None,
            codestream: Vec::new(),
            boxes_pre: Vec::new(),
            boxes_post: Vec::new(),
            pending: Vec::new(),
            pending_pos: 0,
            out: ByteSink::default(),
            header_written: false,
            frames_seen: 0,
            last_frame_seen: false,
            frames_closed: false,
        }
    }

    // ------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------

    /// Declare the stream geometry. Must happen before the first frame;
    /// immutable afterwards.
    pub fn set_basic_info(&mut self, info: BasicInfo) -> Result<(), UsageError> {
        if self.header_written || self.basic_info.is_some() {
            return Err(UsageError::AlreadySet);
        }
        info.validate().map_err(|_| UsageError::InvalidArgument)?;
        self.basic_info = Some(info);
        Ok(())
    }

    pub fn set_color_encoding(&mut self, encoding: ColorEncoding) -> Result<(), UsageError> {
        if self.header_written || self.color_encoding.is_some() {
            return Err(UsageError::AlreadySet);
        }
        self.color_encoding = Some(encoding);
        Ok(())
    }

    /// Submit the preview image as raw interleaved samples. Only valid for
    /// streams whose basic info announces a preview, and only before the
    /// first frame.
    pub fn add_preview(&mut self, samples: &[u8]) -> Result<(), UsageError> {
        if self.frames_seen > 0 {
            return Err(UsageError::InvalidArgument);
        }
        let info = self.basic_info.as_ref().ok_or(UsageError::NotAvailable)?;
        let preview = info.preview.ok_or(UsageError::InvalidArgument)?;
        let expected = preview.xsize as usize
            * preview.ysize as usize
            * info.total_channels()
            * info.sample_type().bytes_per_sample();
        if samples.len() != expected {
            return Err(UsageError::InvalidArgument);
        }
        self.write_stream_header()?;
        codestream::write_segment(&mut self.codestream, MarkerCode::Preview, samples)
    }

    /// Submit one frame as raw interleaved samples covering the frame's
    /// region. The header's pass layout is filled in by the encoder.
    pub fn add_frame(&mut self, header: FrameHeader, samples: &[u8]) -> Result<(), UsageError> {
        if self.frames_closed || self.last_frame_seen {
            return Err(UsageError::InvalidArgument);
        }
        let info = self.basic_info.as_ref().ok_or(UsageError::NotAvailable)?;
        if self.color_encoding.is_none() {
            return Err(UsageError::NotAvailable);
        }
        let (w, h) = header.region_size(info);
        let bpp = info.total_channels() * info.sample_type().bytes_per_sample();
        if samples.len() != w as usize * h as usize * bpp {
            return Err(UsageError::InvalidArgument);
        }

        let mut sections: Vec<Vec<u8>> = Vec::new();
        if self.options.progressive_passes {
            sections.push(downsample_by_8(samples, w, h, bpp));
        }
        sections.push(samples.to_vec());

        let mut header = header;
        header.num_passes = sections.len() as u8;
        header.pass_sizes = sections.iter().map(|s| s.len() as u32).collect();

        self.write_stream_header()?;
        let serialized = codestream::serialize_frame_header(&header);
        codestream::write_segment(&mut self.codestream, MarkerCode::FrameHeader, &serialized)?;
        for section in &sections {
            self.codestream.extend_from_slice(section);
        }

        self.frames_seen += 1;
        self.last_frame_seen = header.is_last;
        if !self.options.container {
            self.stage_bare();
        }
        debug!("frame {} encoded, {} passes", self.frames_seen, header.num_passes);
        Ok(())
    }

    /// Queue a metadata box. Boxes submitted before the first frame precede
    /// the codestream; later ones trail it. Container mode only.
    pub fn add_box(&mut self, ty: BoxType, payload: &[u8]) -> Result<(), UsageError> {
        if !self.options.container || self.frames_closed {
            return Err(UsageError::InvalidArgument);
        }
        if matches!(
            ty,
            BoxType::SIGNATURE
                | BoxType::FILE_TYPE
                | BoxType::CODESTREAM
                | BoxType::PARTIAL_CODESTREAM
        ) {
            return Err(UsageError::InvalidArgument);
        }
        // Reconstruction data must precede the codestream on decode.
        if ty == BoxType::JPEG_RECONSTRUCTION && self.frames_seen > 0 {
            return Err(UsageError::InvalidArgument);
        }
        let dest = if self.frames_seen == 0 {
            &mut self.boxes_pre
        } else {
            &mut self.boxes_post
        };
        container::write_box_header(dest, ty, payload.len() as u64);
        dest.extend_from_slice(payload);
        Ok(())
    }

    /// Declare that no further frames or boxes will be submitted. The
    /// stream must end with a frame marked `is_last`.
    pub fn close_frames(&mut self) -> Result<(), UsageError> {
        if self.frames_closed {
            return Err(UsageError::AlreadySet);
        }
        if !self.last_frame_seen {
            return Err(UsageError::InvalidArgument);
        }
        self.frames_closed = true;
        if self.options.container {
            self.assemble_container();
        } else {
            self.stage_bare();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Output ownership
    // ------------------------------------------------------------------

    /// Attach a buffer for the encoder to fill.
    pub fn set_output(&mut self, buf: Vec<u8>) -> Result<(), RejectedBuffer> {
        self.out.set(buf).map_err(Into::into)
    }

    /// Reclaim the output buffer and the count written into it.
    pub fn release_output(&mut self) -> Result<(Vec<u8>, usize), UsageError> {
        self.out.release()
    }

    /// Move pending stream bytes into the attached output buffer.
    pub fn process(&mut self) -> Result<EncodeProgress, UsageError> {
        while self.pending_pos < self.pending.len() {
            let accepted = self.out.write(&self.pending[self.pending_pos..]);
            if accepted == 0 {
                return Ok(EncodeProgress::NeedMoreOutput);
            }
            self.pending_pos += accepted;
        }
        if self.frames_closed {
            Ok(EncodeProgress::Complete)
        } else {
            Ok(EncodeProgress::AwaitingFrames)
        }
    }

    /// Consume the encoder and return all not-yet-emitted stream bytes.
    /// Requires `close_frames()` to have been called.
    pub fn finish(mut self) -> Result<Vec<u8>, UsageError> {
        if !self.frames_closed {
            return Err(UsageError::InvalidArgument);
        }
        Ok(self.pending.split_off(self.pending_pos))
    }

    // ------------------------------------------------------------------
    // Assembly
    // ------------------------------------------------------------------

    fn write_stream_header(&mut self) -> Result<(), UsageError> {
        if self.header_written {
            return Ok(());
        }
        let info = self.basic_info.as_ref().ok_or(UsageError::NotAvailable)?;
        let encoding = self
            .color_encoding
            .as_ref()
            .ok_or(UsageError::NotAvailable)?;
        let mut cs = Vec::new();
        cs.extend_from_slice(&CODESTREAM_MAGIC);
        codestream::write_segment(
            &mut cs,
            MarkerCode::BasicInfo,
            &codestream::serialize_basic_info(info),
        )?;
        codestream::write_segment(
            &mut cs,
            MarkerCode::ColorEncoding,
            &codestream::serialize_color_encoding(encoding),
        )?;
        self.codestream = cs;
        self.header_written = true;
        Ok(())
    }

    /// Bare mode: codestream bytes stream straight to the output queue.
    fn stage_bare(&mut self) {
        self.pending.append(&mut self.codestream);
    }

    fn assemble_container(&mut self) {
        let mut out = Vec::with_capacity(
            CONTAINER_SIGNATURE.len()
                + 20
                + self.boxes_pre.len()
                + self.codestream.len()
                + 8
                + self.boxes_post.len(),
        );
        out.extend_from_slice(&CONTAINER_SIGNATURE);
        let mut ftyp = Vec::with_capacity(12);
        ftyp.extend_from_slice(b"jxl ");
        ftyp.extend_from_slice(&0u32.to_be_bytes());
        ftyp.extend_from_slice(b"jxl ");
        container::write_box_header(&mut out, BoxType::FILE_TYPE, ftyp.len() as u64);
        out.extend_from_slice(&ftyp);
        out.append(&mut self.boxes_pre);
        container::write_box_header(&mut out, BoxType::CODESTREAM, self.codestream.len() as u64);
        out.append(&mut self.codestream);
        out.append(&mut self.boxes_post);
        self.pending = out;
        self.pending_pos = 0;
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-sample every eighth pixel, matching the reference engine's
/// replication upsampling.
fn downsample_by_8(samples: &[u8], w: u32, h: u32, bpp: usize) -> Vec<u8> {
    let dcw = w.div_ceil(8);
    let dch = h.div_ceil(8);
    let mut out = Vec::with_capacity(dcw as usize * dch as usize * bpp);
    for by in 0..dch {
        let y = by as usize * 8;
        for bx in 0..dcw {
            let x = bx as usize * 8;
            let idx = (y * w as usize + x) * bpp;
            out.extend_from_slice(&samples[idx..idx + bpp]);
        }
    }
    out
}
