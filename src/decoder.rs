//! The resumable decoder state machine.
//!
//! [`Decoder::step`] consumes whatever input is attached, advances the
//! parse, and returns a [`Progress`] describing why it stopped: it needs
//! more input, it needs an output buffer, a subscribed milestone was
//! reached, or the stream is done. Suspension happens only at those
//! explicit returns; a step call never yields anywhere else.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace};

use crate::codestream::{self, MarkerCode};
use crate::container::{self, BoxHeader, BoxType};
use crate::engine::{PixelEngine, RawEngine, SequentialRunner, TaskRunner};
use crate::error::{DecodeError, RejectedBuffer, UsageError};
use crate::event::Event;
use crate::event::EventMask;
use crate::frame::FrameHeader;
use crate::input::InputBuffer;
use crate::metadata::{BasicInfo, ColorEncoding, PixelFormat};
use crate::progress::Progress;
use crate::signature::{sniff, Signature};
use crate::sink::{ByteSink, ImageKind, ImageSinks, ScanlineSink, SinkKind, ThreadedSink};

/// Construction-time decoder configuration.
#[derive(Debug, Clone, Copy)]
pub struct DecoderOptions {
    /// When true (the default), cropped frames are composited onto the
    /// canvas and output is always canvas-sized. When false, raw layers are
    /// surfaced as-is and frame buffers are sized from the frame header.
    pub coalescing: bool,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self { coalescing: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamMode {
    Bare,
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CsStage {
    Magic,
    Segments,
    Sections,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkTarget {
    Meta,
    Jpeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoxPhase {
    Header,
    SigPayload,
    FtypBrand { remaining: u64 },
    Skip { remaining: u64 },
    PartialIndex { remaining: u64 },
    CodestreamPayload { remaining: u64, finishes: bool },
    BrobPeek { remaining: u64 },
    Announce { remaining: u64, target: SinkTarget, announced: bool },
    Payload { remaining: u64, target: SinkTarget, deliver: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Duty {
    OfferPreview,
    OfferDc,
    Progression,
    DeliverImage,
    EndFrame,
}

enum CsOutcome {
    Pause(Progress),
    Progressed,
    NeedBytes,
    Idle,
}

/// Outcome of parsing one codestream segment, with the input borrow ended.
enum ParsedSegment {
    Incomplete,
    Info(BasicInfo, usize),
    Color(ColorEncoding, usize),
    Preview(Vec<u8>, usize),
    Frame(FrameHeader, usize),
}

const SIGNATURE_TAIL: [u8; 4] = [0x0D, 0x0A, 0x87, 0x0A];
const FTYP_BRAND: [u8; 4] = *b"jxl ";

/// The resumable decoder front-end.
///
/// Drives an external [`PixelEngine`] tile-by-tile; never decodes samples
/// itself. Exactly one thread may drive the control surface at a time.
pub struct Decoder<E: PixelEngine = RawEngine> {
    options: DecoderOptions,
    engine: E,
    runner: Arc<dyn TaskRunner>,
    subscriptions: EventMask,
    progressive_detail: u32,
    started: bool,
    failed: bool,
    last_progress: Option<Progress>,
    input: InputBuffer,
    mode: Option<StreamMode>,

    // Container demux.
    box_phase: BoxPhase,
    boxes_seen: u64,
    cur_box: Option<BoxHeader>,
    box_inner_type: Option<BoxType>,
    jxlp_next_index: u32,
    codestream_seen: bool,
    codestream_complete: bool,
    staged: Vec<u8>,
    staged_pos: usize,

    // Codestream parse.
    cs_stage: CsStage,
    basic_info: Option<BasicInfo>,
    color_encoding: Option<ColorEncoding>,
    frame_header: Option<FrameHeader>,
    frames_seen: u64,
    skip_remaining: u64,

    // Per-frame progress.
    in_frame: bool,
    skipping: bool,
    engine_active: bool,
    cur_pass: u8,
    pass_total: u8,
    pass_sizes: Vec<u32>,
    pass_remaining: u64,
    image_gate_cleared: bool,
    dc_prompted: bool,
    dc_handled: bool,
    progression_emitted: u32,
    preview_prompted: bool,
    flushed_quality: u32,
    duties: VecDeque<Duty>,
    serial: u64,

    sinks: ImageSinks,
    jpeg_sink: ByteSink,
    box_sink: ByteSink,
}

impl Decoder<RawEngine> {
    pub fn new() -> Self {
        Self::with_options(DecoderOptions::default())
    }

    pub fn with_options(options: DecoderOptions) -> Self {
        Self::with_engine(RawEngine::new(), options)
    }
}

impl Default for Decoder<RawEngine> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: PixelEngine> Decoder<E> {
    /// Build a decoder around a custom pixel engine.
    pub fn with_engine(engine: E, options: DecoderOptions) -> Self {
        Self {
            options,
            engine,
            runner: Arc::new(SequentialRunner),
            subscriptions: EventMask::NONE,
            progressive_detail: 1,
            started: false,
            failed: false,
            last_progress: None,
            input: InputBuffer::default(),
            mode: None,
            box_phase: BoxPhase::Header,
            boxes_seen: 0,
            cur_box: None,
            box_inner_type: None,
            jxlp_next_index: 0,
            codestream_seen: false,
            codestream_complete: false,
            staged: Vec::new(),
            staged_pos: 0,
            cs_stage: CsStage::Magic,
            basic_info: None,
            color_encoding: None,
            frame_header: None,
            frames_seen: 0,
            skip_remaining: 0,
            in_frame: false,
            skipping: false,
            engine_active: false,
            cur_pass: 0,
            pass_total: 0,
            pass_sizes: Vec::new(),
            pass_remaining: 0,
            image_gate_cleared: false,
            dc_prompted: false,
            dc_handled: false,
            progression_emitted: 0,
            preview_prompted: false,
            flushed_quality: 0,
            duties: VecDeque::new(),
            serial: 0,
            sinks: ImageSinks::default(),
            jpeg_sink: ByteSink::default(),
            box_sink: ByteSink::default(),
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions and configuration
    // ------------------------------------------------------------------

    /// Choose which milestones pause `step()`. Valid only before the first
    /// `step()` of a parse; re-subscription is allowed after `reset()` or
    /// `rewind()`.
    pub fn subscribe(&mut self, mask: EventMask) -> Result<(), UsageError> {
        if self.started {
            return Err(UsageError::SubscribeAfterStart);
        }
        self.subscriptions = mask;
        Ok(())
    }

    /// Cap how many `FrameProgression` milestones fire per frame. The
    /// default of 1 fires once, when the eighth-resolution pass lands.
    pub fn set_progressive_detail(&mut self, steps: u32) {
        self.progressive_detail = steps;
    }

    /// Install the parallel dispatch hook used for row delivery.
    pub fn set_task_runner(&mut self, runner: Arc<dyn TaskRunner>) {
        self.runner = runner;
    }

    /// Skip the next `n` frames: their milestones are not reported and no
    /// pixel output is produced for them.
    pub fn skip_frames(&mut self, n: u64) {
        self.skip_remaining += n;
    }

    // ------------------------------------------------------------------
    // Input ownership
    // ------------------------------------------------------------------

    /// Attach input bytes. The decoder owns them until `release_input()`;
    /// after a `NeedMoreInput` pause, release and re-attach the returned
    /// tail with new bytes appended.
    pub fn set_input(&mut self, data: Vec<u8>) -> Result<(), RejectedBuffer> {
        self.input.set(data).map_err(Into::into)
    }

    /// Detach the input and return the unconsumed tail. Consumed bytes are
    /// never asked for again.
    pub fn release_input(&mut self) -> Vec<u8> {
        self.input.release()
    }

    /// Declare that no further input will be attached. Lets the decoder
    /// distinguish a truncated stream from one that is still arriving.
    pub fn close_input(&mut self) {
        self.input.close();
    }

    // ------------------------------------------------------------------
    // Output sinks
    // ------------------------------------------------------------------

    /// Bytes needed for a fixed output buffer of `kind` in `format`.
    ///
    /// Requires basic info; non-coalesced primary output additionally
    /// requires the frame header (crop determines the size).
    pub fn query_buffer_size(
        &self,
        kind: ImageKind,
        format: &PixelFormat,
    ) -> Result<usize, UsageError> {
        let info = self.basic_info.as_ref().ok_or(UsageError::NotAvailable)?;
        let bpp = format.bytes_per_pixel();
        match kind {
            ImageKind::Primary => {
                info.check_format(format, false)?;
                let (w, h) = self.output_size(info)?;
                Ok(w as usize * h as usize * bpp)
            }
            ImageKind::Preview => {
                info.check_format(format, false)?;
                let preview = info.preview.ok_or(UsageError::NotAvailable)?;
                Ok(preview.xsize as usize * preview.ysize as usize * bpp)
            }
            ImageKind::Dc => {
                info.check_format(format, false)?;
                let (w, h) = info.dc_size();
                Ok(w as usize * h as usize * bpp)
            }
            ImageKind::ExtraChannel(i) => {
                if i >= u16::from(info.num_extra_channels()) {
                    return Err(UsageError::InvalidArgument);
                }
                info.check_format(format, true)?;
                let (w, h) = self.output_size(info)?;
                Ok(w as usize * h as usize * bpp)
            }
        }
    }

    fn output_size(&self, info: &BasicInfo) -> Result<(u32, u32), UsageError> {
        if self.options.coalescing {
            return Ok((info.xsize, info.ysize));
        }
        let header = self.frame_header.as_ref().ok_or(UsageError::NotAvailable)?;
        Ok(header.region_size(info))
    }

    /// Attach a fixed output buffer for `kind`. The buffer must be at least
    /// `query_buffer_size(kind, format)` bytes; it is handed back on refusal.
    pub fn set_image_buffer(
        &mut self,
        kind: ImageKind,
        format: PixelFormat,
        buf: Vec<u8>,
    ) -> Result<(), RejectedBuffer> {
        let needed = match self.query_buffer_size(kind, &format) {
            Ok(n) => n,
            Err(error) => return Err(RejectedBuffer { error, buffer: buf }),
        };
        if buf.len() < needed {
            return Err(RejectedBuffer {
                error: UsageError::BufferTooSmall,
                buffer: buf,
            });
        }
        self.sinks
            .attach(kind, SinkKind::Buffer(buf), format, self.current_serial())
            .map_err(|(error, sink)| RejectedBuffer {
                error,
                buffer: match sink {
                    SinkKind::Buffer(buf) => buf,
                    _ => Vec::new(),
                },
            })
    }

    /// Reclaim a fixed output buffer, with whatever was delivered into it.
    pub fn release_image_buffer(&mut self, kind: ImageKind) -> Result<Vec<u8>, UsageError> {
        self.sinks.release_buffer(kind)
    }

    /// Attach a scanline callback sink for `kind`. Mutually exclusive with
    /// a fixed buffer for the same kind.
    pub fn set_scanline_sink(
        &mut self,
        kind: ImageKind,
        format: PixelFormat,
        sink: Arc<dyn ScanlineSink>,
    ) -> Result<(), UsageError> {
        self.query_buffer_size(kind, &format)?;
        self.sinks
            .attach(kind, SinkKind::Scanline(sink), format, self.current_serial())
            .map_err(|(error, _)| error)
    }

    /// Attach a threaded callback sink for `kind`.
    pub fn set_threaded_sink(
        &mut self,
        kind: ImageKind,
        format: PixelFormat,
        sink: Arc<dyn ThreadedSink>,
    ) -> Result<(), UsageError> {
        self.query_buffer_size(kind, &format)?;
        self.sinks
            .attach(kind, SinkKind::Threaded(sink), format, self.current_serial())
            .map_err(|(error, _)| error)
    }

    /// Detach a callback sink. Fixed buffers are detached with
    /// [`release_image_buffer`](Self::release_image_buffer) instead.
    pub fn detach_image_sink(&mut self, kind: ImageKind) -> Result<(), UsageError> {
        self.sinks.detach(kind)
    }

    /// Attach a byte buffer to receive JPEG reconstruction data.
    pub fn set_jpeg_buffer(&mut self, buf: Vec<u8>) -> Result<(), RejectedBuffer> {
        self.jpeg_sink.set(buf).map_err(Into::into)
    }

    /// Reclaim the JPEG reconstruction buffer and the count written into it.
    pub fn release_jpeg_buffer(&mut self) -> Result<(Vec<u8>, usize), UsageError> {
        self.jpeg_sink.release()
    }

    /// Attach a byte buffer to receive the current box payload. Must be
    /// re-attached for each box the caller wants materialized.
    pub fn set_box_buffer(&mut self, buf: Vec<u8>) -> Result<(), RejectedBuffer> {
        self.box_sink.set(buf).map_err(Into::into)
    }

    /// Reclaim the box buffer and the count written into it.
    pub fn release_box_buffer(&mut self) -> Result<(Vec<u8>, usize), UsageError> {
        self.box_sink.release()
    }

    // ------------------------------------------------------------------
    // Accessors (valid at the documented pause points)
    // ------------------------------------------------------------------

    pub fn basic_info(&self) -> Result<&BasicInfo, UsageError> {
        self.basic_info.as_ref().ok_or(UsageError::NotAvailable)
    }

    pub fn color_encoding(&self) -> Result<&ColorEncoding, UsageError> {
        self.color_encoding.as_ref().ok_or(UsageError::NotAvailable)
    }

    pub fn frame_header(&self) -> Result<&FrameHeader, UsageError> {
        self.frame_header.as_ref().ok_or(UsageError::NotAvailable)
    }

    /// Type of the current box. With `decompressed` set, a `brob` box
    /// reports the inner type it wraps.
    pub fn box_type(&self, decompressed: bool) -> Result<BoxType, UsageError> {
        let header = self.cur_box.as_ref().ok_or(UsageError::NotAvailable)?;
        if decompressed && header.ty == BoxType::BROTLI_COMPRESSED {
            return self.box_inner_type.ok_or(UsageError::NotAvailable);
        }
        Ok(header.ty)
    }

    /// Total size of the current box, header included.
    pub fn box_raw_size(&self) -> Result<u64, UsageError> {
        Ok(self
            .cur_box
            .as_ref()
            .ok_or(UsageError::NotAvailable)?
            .total_size())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Full reset: parse state, subscriptions, and progressive detail all
    /// return to their initial values. Attached output buffers survive and
    /// can still be released.
    pub fn reset(&mut self) {
        self.reset_parse();
        self.subscriptions = EventMask::NONE;
        self.progressive_detail = 1;
    }

    /// Restart the parse from the beginning of the stream, keeping
    /// subscriptions and configuration. The caller must resupply input
    /// from the start.
    pub fn rewind(&mut self) {
        self.reset_parse();
    }

    fn reset_parse(&mut self) {
        self.started = false;
        self.failed = false;
        self.last_progress = None;
        self.input.clear();
        self.input.reopen();
        self.mode = None;
        self.box_phase = BoxPhase::Header;
        self.boxes_seen = 0;
        self.cur_box = None;
        self.box_inner_type = None;
        self.jxlp_next_index = 0;
        self.codestream_seen = false;
        self.codestream_complete = false;
        self.staged.clear();
        self.staged_pos = 0;
        self.cs_stage = CsStage::Magic;
        self.basic_info = None;
        self.color_encoding = None;
        self.frame_header = None;
        self.frames_seen = 0;
        self.skip_remaining = 0;
        self.in_frame = false;
        self.skipping = false;
        self.engine_active = false;
        self.cur_pass = 0;
        self.pass_total = 0;
        self.pass_sizes.clear();
        self.pass_remaining = 0;
        self.image_gate_cleared = false;
        self.dc_prompted = false;
        self.dc_handled = false;
        self.progression_emitted = 0;
        self.preview_prompted = false;
        self.flushed_quality = 0;
        self.duties.clear();
        // Invalidate both in-frame and queued sink attachments.
        self.serial += 2;
        self.engine.reset();
    }

    // ------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------

    /// Advance the parse until the next pause point.
    pub fn step(&mut self) -> Result<Progress, DecodeError> {
        if self.failed {
            return Err(DecodeError::Failed);
        }
        self.started = true;
        match self.step_inner() {
            Ok(progress) => {
                self.last_progress = Some(progress);
                Ok(progress)
            }
            Err(error) => {
                self.failed = true;
                Err(error)
            }
        }
    }

    fn step_inner(&mut self) -> Result<Progress, DecodeError> {
        loop {
            if let Some(progress) = self.process_duties()? {
                return Ok(progress);
            }
            if let Some(progress) = self.image_gate() {
                return Ok(progress);
            }
            if self.mode.is_none() {
                match sniff(self.input.available()) {
                    Signature::NotEnoughBytes => {
                        if self.input.is_closed() {
                            return Err(DecodeError::TruncatedStream);
                        }
                        return Ok(Progress::NeedMoreInput);
                    }
                    Signature::Invalid => return Err(DecodeError::InvalidSignature),
                    Signature::Codestream => {
                        debug!("bare codestream detected");
                        self.mode = Some(StreamMode::Bare);
                    }
                    Signature::Container => {
                        debug!("boxed container detected");
                        self.mode = Some(StreamMode::Container);
                    }
                }
                continue;
            }
            match self.cs_work()? {
                CsOutcome::Pause(progress) => return Ok(progress),
                CsOutcome::Progressed => continue,
                CsOutcome::NeedBytes => match self.mode {
                    Some(StreamMode::Bare) => {
                        if self.input.is_closed() {
                            return Err(DecodeError::TruncatedStream);
                        }
                        return Ok(Progress::NeedMoreInput);
                    }
                    _ => {
                        if self.codestream_complete {
                            return Err(DecodeError::TruncatedStream);
                        }
                        if let Some(progress) = self.demux()? {
                            return Ok(progress);
                        }
                    }
                },
                CsOutcome::Idle => match self.mode {
                    Some(StreamMode::Bare) => return Ok(Progress::Complete),
                    _ => {
                        if let Some(progress) = self.demux()? {
                            return Ok(progress);
                        }
                    }
                },
            }
        }
    }

    fn current_serial(&self) -> u64 {
        if self.in_frame {
            self.serial
        } else {
            self.serial + 1
        }
    }

    /// The mandatory primary-buffer gate: while `FULL_IMAGE` is subscribed,
    /// a frame cannot start decoding without a primary sink.
    fn image_gate(&mut self) -> Option<Progress> {
        if !self.in_frame
            || self.skipping
            || self.image_gate_cleared
            || !self.subscriptions.contains(Event::FullImage)
        {
            return None;
        }
        if self
            .sinks
            .has_live(ImageKind::Primary, self.current_serial())
        {
            self.image_gate_cleared = true;
            None
        } else {
            Some(Progress::NeedImageBuffer)
        }
    }

    fn process_duties(&mut self) -> Result<Option<Progress>, DecodeError> {
        while let Some(duty) = self.duties.front().copied() {
            match duty {
                Duty::OfferPreview => {
                    let serial = self.current_serial();
                    if self.sinks.has_live(ImageKind::Preview, serial) {
                        self.duties.pop_front();
                        self.deliver_to_slot(ImageKind::Preview)?;
                        trace!("preview delivered");
                        return Ok(Some(Progress::PreviewImage));
                    }
                    if !self.preview_prompted {
                        self.preview_prompted = true;
                        return Ok(Some(Progress::NeedPreviewBuffer));
                    }
                    // Caller declined: the preview is skipped.
                    self.duties.pop_front();
                }
                Duty::OfferDc => {
                    let serial = self.current_serial();
                    if self.sinks.has_live(ImageKind::Dc, serial) {
                        self.duties.pop_front();
                        self.dc_handled = true;
                        self.deliver_to_slot(ImageKind::Dc)?;
                        return Ok(Some(Progress::DcImage));
                    }
                    if !self.dc_prompted {
                        self.dc_prompted = true;
                        return Ok(Some(Progress::NeedDcBuffer));
                    }
                    self.duties.pop_front();
                    self.dc_handled = true;
                }
                Duty::Progression => {
                    self.duties.pop_front();
                    self.progression_emitted += 1;
                    return Ok(Some(Progress::FrameProgression));
                }
                Duty::DeliverImage => {
                    if !self
                        .sinks
                        .has_live(ImageKind::Primary, self.current_serial())
                    {
                        return Ok(Some(Progress::NeedImageBuffer));
                    }
                    self.duties.pop_front();
                    self.deliver_to_slot(ImageKind::Primary)?;
                    for kind in self.sinks.live_extra_kinds(self.current_serial()) {
                        self.deliver_to_slot(kind)?;
                    }
                    trace!("frame {} delivered", self.frames_seen);
                    return Ok(Some(Progress::FullImage));
                }
                Duty::EndFrame => {
                    self.duties.pop_front();
                    self.sinks.finish_threaded(self.current_serial());
                    let is_last = self.frame_header.as_ref().is_some_and(|h| h.is_last);
                    self.in_frame = false;
                    self.cs_stage = if is_last {
                        debug!("last frame finished");
                        CsStage::Finished
                    } else {
                        CsStage::Segments
                    };
                }
            }
        }
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Codestream parsing
    // ------------------------------------------------------------------

    fn cs_consume(&mut self, n: usize) {
        match self.mode {
            Some(StreamMode::Container) => self.staged_pos += n,
            _ => self.input.consume(n),
        }
    }

    fn cs_work(&mut self) -> Result<CsOutcome, DecodeError> {
        match self.cs_stage {
            CsStage::Magic => {
                let magic = {
                    let avail: &[u8] = match self.mode {
                        Some(StreamMode::Container) => &self.staged[self.staged_pos..],
                        _ => &self.input.data[self.input.pos..],
                    };
                    if avail.len() < 2 {
                        None
                    } else {
                        Some([avail[0], avail[1]])
                    }
                };
                match magic {
                    None => Ok(CsOutcome::NeedBytes),
                    Some(m) if m == crate::signature::CODESTREAM_MAGIC => {
                        self.cs_consume(2);
                        self.cs_stage = CsStage::Segments;
                        Ok(CsOutcome::Progressed)
                    }
                    Some(_) => Err(DecodeError::InvalidSignature),
                }
            }
            CsStage::Segments => self.cs_segment(),
            CsStage::Sections => self.cs_sections(),
            CsStage::Finished => Ok(CsOutcome::Idle),
        }
    }

    fn cs_segment(&mut self) -> Result<CsOutcome, DecodeError> {
        let parsed = {
            let avail: &[u8] = match self.mode {
                Some(StreamMode::Container) => &self.staged[self.staged_pos..],
                _ => &self.input.data[self.input.pos..],
            };
            match codestream::peek_segment(avail)? {
                None => ParsedSegment::Incomplete,
                Some(seg) => match seg.code {
                    MarkerCode::BasicInfo => {
                        ParsedSegment::Info(codestream::parse_basic_info(seg.payload)?, seg.total_len)
                    }
                    MarkerCode::ColorEncoding => ParsedSegment::Color(
                        codestream::parse_color_encoding(seg.payload)?,
                        seg.total_len,
                    ),
                    MarkerCode::Preview => {
                        ParsedSegment::Preview(seg.payload.to_vec(), seg.total_len)
                    }
                    MarkerCode::FrameHeader => ParsedSegment::Frame(
                        codestream::parse_frame_header(seg.payload)?,
                        seg.total_len,
                    ),
                },
            }
        };
        match parsed {
            ParsedSegment::Incomplete => Ok(CsOutcome::NeedBytes),
            ParsedSegment::Info(info, len) => {
                if self.basic_info.is_some() {
                    return Err(DecodeError::DuplicateBasicInfo);
                }
                self.cs_consume(len);
                debug!(
                    "basic info: {}x{}, {} bit",
                    info.xsize, info.ysize, info.bits_per_sample
                );
                self.basic_info = Some(info);
                if self.subscriptions.contains(Event::BasicInfo) {
                    return Ok(CsOutcome::Pause(Progress::BasicInfo));
                }
                Ok(CsOutcome::Progressed)
            }
            ParsedSegment::Color(encoding, len) => {
                if self.basic_info.is_none() || self.color_encoding.is_some() {
                    return Err(DecodeError::InvalidColorEncoding);
                }
                self.cs_consume(len);
                self.color_encoding = Some(encoding);
                if self.subscriptions.contains(Event::ColorEncoding) {
                    return Ok(CsOutcome::Pause(Progress::ColorEncoding));
                }
                Ok(CsOutcome::Progressed)
            }
            ParsedSegment::Preview(payload, len) => {
                let valid = self
                    .basic_info
                    .as_ref()
                    .is_some_and(|info| info.preview.is_some())
                    && self.color_encoding.is_some()
                    && self.frames_seen == 0;
                if !valid {
                    return Err(DecodeError::InvalidMarker);
                }
                self.cs_consume(len);
                if self.subscriptions.contains(Event::PreviewImage) {
                    if let Some(info) = &self.basic_info {
                        self.engine
                            .decode_preview(info, &payload)
                            .map_err(|e| DecodeError::Engine(e.0))?;
                    }
                    self.duties.push_back(Duty::OfferPreview);
                }
                Ok(CsOutcome::Progressed)
            }
            ParsedSegment::Frame(header, len) => {
                if self.color_encoding.is_none() {
                    return Err(DecodeError::InvalidFrameHeader);
                }
                self.cs_consume(len);
                self.begin_frame(header)
            }
        }
    }

    fn begin_frame(&mut self, header: FrameHeader) -> Result<CsOutcome, DecodeError> {
        self.frames_seen += 1;
        self.serial += 1;
        self.in_frame = true;
        self.skipping = self.skip_remaining > 0;
        if self.skipping {
            self.skip_remaining -= 1;
        }
        self.engine_active = !self.skipping
            && (self.subscriptions.contains(Event::FullImage)
                || self.subscriptions.contains(Event::DcImage)
                || self.subscriptions.contains(Event::FrameProgression));
        self.cur_pass = 0;
        self.pass_total = header.num_passes;
        self.pass_sizes = header.pass_sizes.clone();
        self.pass_remaining = u64::from(header.pass_sizes[0]);
        self.image_gate_cleared = false;
        self.dc_prompted = false;
        self.dc_handled = false;
        self.progression_emitted = 0;
        self.flushed_quality = 0;
        if self.engine_active {
            let info = self
                .basic_info
                .as_ref()
                .ok_or(DecodeError::InvalidFrameHeader)?;
            self.engine
                .begin_frame(info, &header, self.options.coalescing)
                .map_err(|e| DecodeError::Engine(e.0))?;
        }
        trace!(
            "frame {}: {} passes, skipping={}",
            self.frames_seen, header.num_passes, self.skipping
        );
        self.frame_header = Some(header);
        self.cs_stage = CsStage::Sections;
        if !self.skipping && self.subscriptions.contains(Event::Frame) {
            return Ok(CsOutcome::Pause(Progress::Frame));
        }
        Ok(CsOutcome::Progressed)
    }

    fn cs_sections(&mut self) -> Result<CsOutcome, DecodeError> {
        if self.pass_remaining > 0 {
            let take = {
                let avail: &[u8] = match self.mode {
                    Some(StreamMode::Container) => &self.staged[self.staged_pos..],
                    _ => &self.input.data[self.input.pos..],
                };
                let take = (avail.len() as u64).min(self.pass_remaining) as usize;
                if take > 0 && self.engine_active {
                    self.engine
                        .push_section(self.cur_pass, &avail[..take])
                        .map_err(|e| DecodeError::Engine(e.0))?;
                }
                take
            };
            if take == 0 {
                return Ok(CsOutcome::NeedBytes);
            }
            self.cs_consume(take);
            self.pass_remaining -= take as u64;
            if self.pass_remaining > 0 {
                return Ok(CsOutcome::Progressed);
            }
        }
        // A full pass section has been consumed.
        if self.engine_active {
            self.engine
                .end_section(self.cur_pass)
                .map_err(|e| DecodeError::Engine(e.0))?;
        }
        let final_pass = self.cur_pass + 1 == self.pass_total;
        if !final_pass {
            if self.engine_active {
                // The legacy DC path only serves full-canvas frames.
                let full_canvas = self.frame_header.as_ref().is_some_and(|h| h.crop.is_none());
                if self.subscriptions.contains(Event::DcImage) && !self.dc_handled && full_canvas {
                    self.duties.push_back(Duty::OfferDc);
                }
                if self.subscriptions.contains(Event::FrameProgression)
                    && self.progression_emitted < self.progressive_detail
                {
                    self.duties.push_back(Duty::Progression);
                }
            }
            self.cur_pass += 1;
            self.pass_remaining = u64::from(self.pass_sizes[self.cur_pass as usize]);
        } else {
            if self.engine_active && self.subscriptions.contains(Event::FullImage) {
                self.duties.push_back(Duty::DeliverImage);
            }
            self.duties.push_back(Duty::EndFrame);
        }
        Ok(CsOutcome::Progressed)
    }

    // ------------------------------------------------------------------
    // Container demultiplexing
    // ------------------------------------------------------------------

    /// Advance the box layer by one unit: a header, or a chunk of payload
    /// routed to its destination.
    fn demux(&mut self) -> Result<Option<Progress>, DecodeError> {
        // Compact the codestream staging area once consumption gets ahead.
        if self.staged_pos >= 64 * 1024 && self.staged_pos * 2 >= self.staged.len() {
            self.staged.drain(..self.staged_pos);
            self.staged_pos = 0;
        }
        let closed = self.input.is_closed();
        match self.box_phase {
            BoxPhase::Header => self.demux_header(closed),
            BoxPhase::SigPayload => {
                let Some(tail) = self.peek4(closed)? else {
                    return Ok(Some(Progress::NeedMoreInput));
                };
                if tail != SIGNATURE_TAIL {
                    return Err(DecodeError::InvalidSignature);
                }
                self.input.consume(4);
                self.box_phase = BoxPhase::Header;
                Ok(None)
            }
            BoxPhase::FtypBrand { remaining } => {
                let Some(brand) = self.peek4(closed)? else {
                    return Ok(Some(Progress::NeedMoreInput));
                };
                if brand != FTYP_BRAND {
                    return Err(DecodeError::InvalidBoxType);
                }
                self.input.consume(4);
                self.box_phase = BoxPhase::Skip {
                    remaining: remaining - 4,
                };
                Ok(None)
            }
            BoxPhase::Skip { remaining } => {
                if remaining == 0 {
                    self.box_phase = BoxPhase::Header;
                    return Ok(None);
                }
                let avail = self.input.remaining();
                if avail == 0 {
                    if closed {
                        return Err(DecodeError::TruncatedStream);
                    }
                    return Ok(Some(Progress::NeedMoreInput));
                }
                let take = (avail as u64).min(remaining) as usize;
                self.input.consume(take);
                self.box_phase = BoxPhase::Skip {
                    remaining: remaining - take as u64,
                };
                Ok(None)
            }
            BoxPhase::PartialIndex { remaining } => {
                let Some(raw) = self.peek4(closed)? else {
                    return Ok(Some(Progress::NeedMoreInput));
                };
                let index = u32::from_be_bytes(raw);
                let sequence = index & 0x7FFF_FFFF;
                let last = index & 0x8000_0000 != 0;
                if sequence != self.jxlp_next_index {
                    return Err(DecodeError::InvalidPartialCodestream);
                }
                self.jxlp_next_index += 1;
                self.input.consume(4);
                self.box_phase = BoxPhase::CodestreamPayload {
                    remaining: remaining - 4,
                    finishes: last,
                };
                Ok(None)
            }
            BoxPhase::CodestreamPayload { remaining, finishes } => {
                if remaining == 0 {
                    if finishes {
                        self.codestream_complete = true;
                        debug!("codestream fully delivered");
                    }
                    self.box_phase = BoxPhase::Header;
                    return Ok(None);
                }
                let avail = self.input.remaining();
                if avail == 0 {
                    if closed {
                        return Err(DecodeError::TruncatedStream);
                    }
                    return Ok(Some(Progress::NeedMoreInput));
                }
                let take = (avail as u64).min(remaining) as usize;
                {
                    let chunk = &self.input.data[self.input.pos..self.input.pos + take];
                    self.staged.extend_from_slice(chunk);
                }
                self.input.consume(take);
                let remaining = remaining - take as u64;
                if remaining == 0 && finishes {
                    self.codestream_complete = true;
                    debug!("codestream fully delivered");
                    self.box_phase = BoxPhase::Header;
                } else {
                    self.box_phase = BoxPhase::CodestreamPayload { remaining, finishes };
                }
                Ok(None)
            }
            BoxPhase::BrobPeek { remaining } => {
                let Some(inner) = self.peek4(closed)? else {
                    return Ok(Some(Progress::NeedMoreInput));
                };
                self.box_inner_type = Some(BoxType(inner));
                self.input.consume(4);
                self.box_phase = BoxPhase::Announce {
                    remaining: remaining - 4,
                    target: SinkTarget::Meta,
                    announced: false,
                };
                Ok(None)
            }
            BoxPhase::Announce {
                remaining,
                target,
                announced,
            } => {
                let subscribed = match target {
                    SinkTarget::Meta => self.subscriptions.contains(Event::Box),
                    SinkTarget::Jpeg => self.subscriptions.contains(Event::JpegReconstruction),
                };
                if subscribed && !announced {
                    self.box_phase = BoxPhase::Announce {
                        remaining,
                        target,
                        announced: true,
                    };
                    return Ok(Some(match target {
                        SinkTarget::Meta => Progress::Box,
                        SinkTarget::Jpeg => Progress::JpegReconstruction,
                    }));
                }
                let deliver = match target {
                    SinkTarget::Meta => self.box_sink.is_attached(),
                    SinkTarget::Jpeg => self.jpeg_sink.is_attached(),
                };
                self.box_phase = BoxPhase::Payload {
                    remaining,
                    target,
                    deliver,
                };
                Ok(None)
            }
            BoxPhase::Payload {
                remaining,
                target,
                deliver,
            } => {
                if remaining == 0 {
                    self.box_phase = BoxPhase::Header;
                    return Ok(None);
                }
                let avail = self.input.remaining();
                if avail == 0 {
                    if closed {
                        return Err(DecodeError::TruncatedStream);
                    }
                    return Ok(Some(Progress::NeedMoreInput));
                }
                let take = (avail as u64).min(remaining) as usize;
                let consumed = if deliver {
                    let accepted = {
                        let chunk = &self.input.data[self.input.pos..self.input.pos + take];
                        match target {
                            SinkTarget::Meta => self.box_sink.write(chunk),
                            SinkTarget::Jpeg => self.jpeg_sink.write(chunk),
                        }
                    };
                    if accepted == 0 {
                        return Ok(Some(match target {
                            SinkTarget::Meta => Progress::NeedBoxOutput,
                            SinkTarget::Jpeg => Progress::NeedJpegOutput,
                        }));
                    }
                    accepted
                } else {
                    take
                };
                self.input.consume(consumed);
                self.box_phase = BoxPhase::Payload {
                    remaining: remaining - consumed as u64,
                    target,
                    deliver,
                };
                Ok(None)
            }
        }
    }

    fn demux_header(&mut self, closed: bool) -> Result<Option<Progress>, DecodeError> {
        let header = container::parse_box_header(self.input.available())?;
        let Some(header) = header else {
            if closed {
                if self.input.remaining() > 0 {
                    return Err(DecodeError::TruncatedStream);
                }
                if !self.codestream_seen {
                    return Err(DecodeError::MissingCodestream);
                }
                if self.cs_stage != CsStage::Finished {
                    return Err(DecodeError::TruncatedStream);
                }
                return Ok(Some(Progress::Complete));
            }
            if self.cs_stage == CsStage::Finished {
                // Whatever follows can only be trailing metadata.
                return Ok(Some(Progress::Complete));
            }
            return Ok(Some(Progress::NeedMoreInput));
        };
        self.input.consume(header.header_size);
        self.boxes_seen += 1;
        trace!("box '{}', {} payload bytes", header.ty, header.payload_size);
        if self.boxes_seen == 1 {
            if header.ty != BoxType::SIGNATURE || header.payload_size != 4 {
                return Err(DecodeError::InvalidSignature);
            }
            self.box_phase = BoxPhase::SigPayload;
            return Ok(None);
        }
        if self.boxes_seen == 2 {
            if header.ty != BoxType::FILE_TYPE || header.payload_size < 4 {
                return Err(DecodeError::InvalidBoxType);
            }
            self.box_phase = BoxPhase::FtypBrand {
                remaining: header.payload_size,
            };
            return Ok(None);
        }
        match header.ty {
            BoxType::CODESTREAM => {
                if self.codestream_complete || self.jxlp_next_index > 0 {
                    return Err(DecodeError::InvalidPartialCodestream);
                }
                self.codestream_seen = true;
                self.box_phase = BoxPhase::CodestreamPayload {
                    remaining: header.payload_size,
                    finishes: true,
                };
            }
            BoxType::PARTIAL_CODESTREAM => {
                if self.codestream_complete {
                    return Err(DecodeError::InvalidPartialCodestream);
                }
                if header.payload_size < 4 {
                    return Err(DecodeError::InvalidBoxSize);
                }
                self.codestream_seen = true;
                self.box_phase = BoxPhase::PartialIndex {
                    remaining: header.payload_size,
                };
            }
            BoxType::JPEG_RECONSTRUCTION => {
                self.cur_box = Some(header);
                self.box_inner_type = None;
                self.box_phase = BoxPhase::Announce {
                    remaining: header.payload_size,
                    target: SinkTarget::Jpeg,
                    announced: false,
                };
            }
            BoxType::EXIF | BoxType::XML | BoxType::JUMBF => {
                self.cur_box = Some(header);
                self.box_inner_type = None;
                self.box_phase = BoxPhase::Announce {
                    remaining: header.payload_size,
                    target: SinkTarget::Meta,
                    announced: false,
                };
            }
            BoxType::BROTLI_COMPRESSED => {
                if header.payload_size < 4 {
                    return Err(DecodeError::InvalidBoxSize);
                }
                self.cur_box = Some(header);
                self.box_inner_type = None;
                self.box_phase = BoxPhase::BrobPeek {
                    remaining: header.payload_size,
                };
            }
            _ => {
                self.box_phase = BoxPhase::Skip {
                    remaining: header.payload_size,
                };
            }
        }
        Ok(None)
    }

    /// Peek 4 input bytes, or report why they are not there.
    fn peek4(&self, closed: bool) -> Result<Option<[u8; 4]>, DecodeError> {
        let avail = self.input.available();
        if avail.len() < 4 {
            if closed {
                return Err(DecodeError::TruncatedStream);
            }
            return Ok(None);
        }
        Ok(Some([avail[0], avail[1], avail[2], avail[3]]))
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Render `kind` at the engine's current fidelity and hand it to the
    /// live sink for the current frame, if any.
    fn deliver_to_slot(&mut self, kind: ImageKind) -> Result<(), DecodeError> {
        enum Delivery {
            Buffer,
            Scanline(Arc<dyn ScanlineSink>),
            Threaded(Arc<dyn ThreadedSink>, bool),
        }

        let serial = self.current_serial();
        let Some(slot) = self.sinks.live(kind, serial) else {
            return Ok(());
        };
        let format = slot.format;
        let delivery = match &slot.sink {
            SinkKind::Buffer(_) => Delivery::Buffer,
            SinkKind::Scanline(sink) => Delivery::Scanline(Arc::clone(sink)),
            SinkKind::Threaded(sink) => Delivery::Threaded(Arc::clone(sink), !slot.begun),
        };

        let image = self
            .engine
            .render(kind, &format)
            .map_err(|e| DecodeError::Engine(e.0))?;
        let runner = Arc::clone(&self.runner);

        match delivery {
            Delivery::Buffer => {
                if let Some(slot) = self.sinks.live(kind, serial) {
                    if let SinkKind::Buffer(buf) = &mut slot.sink {
                        if buf.len() < image.data.len() {
                            return Err(DecodeError::Engine(
                                "attached buffer is smaller than the rendered output".into(),
                            ));
                        }
                        buf[..image.data.len()].copy_from_slice(&image.data);
                    }
                }
            }
            Delivery::Scanline(sink) => {
                runner
                    .run(0, image.height, &|y| sink.on_row(0, y, image.row(y)))
                    .map_err(|e| DecodeError::Engine(e.0))?;
            }
            Delivery::Threaded(sink, needs_begin) => {
                if needs_begin {
                    sink.begin(runner.concurrency().max(1), image.width as usize)
                        .map_err(|e| DecodeError::Engine(e.0))?;
                    if let Some(slot) = self.sinks.live(kind, serial) {
                        slot.begun = true;
                    }
                }
                let workers = (runner.concurrency().max(1) as u32).min(image.height.max(1));
                let height = image.height;
                runner
                    .run(0, workers, &|worker| {
                        let mut y = worker;
                        while y < height {
                            sink.row(worker as usize, 0, y, image.row(y));
                            y += workers;
                        }
                    })
                    .map_err(|e| DecodeError::Engine(e.0))?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Progressive flush
    // ------------------------------------------------------------------

    /// Best-effort partial materialization of the in-progress frame into
    /// the attached primary sink.
    ///
    /// Legal only while the most recent `step()` returned `NeedMoreInput`
    /// with a frame in progress. [`UsageError::NothingToFlush`] is
    /// non-fatal: no improved data is available right now and stepping may
    /// continue unaffected.
    pub fn flush(&mut self) -> Result<(), UsageError> {
        if self.failed
            || !self.in_frame
            || !matches!(self.last_progress, Some(Progress::NeedMoreInput))
        {
            return Err(UsageError::FlushOutsideFrame);
        }
        if !self.engine_active {
            return Err(UsageError::NothingToFlush);
        }
        let quality = self.engine.quality();
        if quality == 0 || quality <= self.flushed_quality {
            return Err(UsageError::NothingToFlush);
        }
        if !self
            .sinks
            .has_live(ImageKind::Primary, self.current_serial())
        {
            return Err(UsageError::NothingToFlush);
        }
        self.deliver_to_slot(ImageKind::Primary)
            .map_err(|_| UsageError::NothingToFlush)?;
        self.flushed_quality = quality;
        trace!("flushed at quality {quality}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SampleType;

    #[test]
    fn step_without_input_needs_more_input() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.step(), Ok(Progress::NeedMoreInput));
        // Still nothing attached; same answer, no crash.
        assert_eq!(decoder.step(), Ok(Progress::NeedMoreInput));
    }

    #[test]
    fn subscribe_is_rejected_mid_parse() {
        let mut decoder = Decoder::new();
        decoder.subscribe(EventMask::BASIC_INFO).unwrap();
        let _ = decoder.step();
        assert_eq!(
            decoder.subscribe(EventMask::ALL),
            Err(UsageError::SubscribeAfterStart)
        );
        decoder.reset();
        decoder.subscribe(EventMask::ALL).unwrap();
    }

    #[test]
    fn queries_before_basic_info_are_usage_errors() {
        let decoder = Decoder::new();
        let format = PixelFormat::new(3, SampleType::U8);
        assert_eq!(
            decoder.query_buffer_size(ImageKind::Primary, &format),
            Err(UsageError::NotAvailable)
        );
        assert_eq!(decoder.basic_info().err(), Some(UsageError::NotAvailable));
        assert_eq!(decoder.box_raw_size(), Err(UsageError::NotAvailable));
    }

    #[test]
    fn flush_outside_a_frame_is_a_usage_error() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.flush(), Err(UsageError::FlushOutsideFrame));
    }

    #[test]
    fn invalid_signature_fails_terminally() {
        let mut decoder = Decoder::new();
        decoder.set_input(vec![0x89, b'P', b'N', b'G']).unwrap();
        assert_eq!(decoder.step(), Err(DecodeError::InvalidSignature));
        assert_eq!(decoder.step(), Err(DecodeError::Failed));
        // Input is still releasable after failure.
        let tail = decoder.release_input();
        assert_eq!(tail, vec![0x89, b'P', b'N', b'G']);
        decoder.reset();
        assert_eq!(decoder.step(), Ok(Progress::NeedMoreInput));
    }
}
