//! The engine seam: the state machine drives a pixel engine, it never
//! decodes samples itself.
//!
//! [`RawEngine`] is the shipped reference engine. It handles uncompressed
//! pass sections (eighth-resolution grids for non-final passes, the full
//! grid for the final pass) so the whole protocol is exercisable without a
//! real codec. A production codec implements [`PixelEngine`] the same way.

use thiserror::Error;

use crate::frame::{BlendMode, CropInfo, FrameHeader};
use crate::metadata::{BasicInfo, PixelFormat, SampleType};
use crate::sink::ImageKind;

/// Failure inside the driven engine. Surfaced to callers as a stream-level
/// error; this layer does not distinguish resource exhaustion from corrupt
/// section data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub(crate) fn msg(text: &str) -> Self {
        Self(text.to_string())
    }
}

/// Caller-supplied parallel task dispatch.
///
/// The decoder uses this to fan row delivery out to worker tasks during a
/// single `step()` call. `run` must execute `task(i)` exactly once for every
/// `i` in `start..end` and return only when all of them completed.
pub trait TaskRunner: Send + Sync {
    /// Upper bound on workers `run` uses; sizes the threaded-sink lifecycle.
    fn concurrency(&self) -> usize {
        1
    }

    fn run(&self, start: u32, end: u32, task: &(dyn Fn(u32) + Sync)) -> Result<(), EngineError>;
}

/// The default runner: everything on the calling thread.
#[derive(Debug, Default)]
pub struct SequentialRunner;

impl TaskRunner for SequentialRunner {
    fn run(&self, start: u32, end: u32, task: &(dyn Fn(u32) + Sync)) -> Result<(), EngineError> {
        for i in start..end {
            task(i);
        }
        Ok(())
    }
}

/// A materialized output surface: tightly packed rows in the requested
/// pixel format.
#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: usize,
    pub data: Vec<u8>,
}

impl RenderedImage {
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.bytes_per_row;
        &self.data[start..start + self.bytes_per_row]
    }
}

/// The external decoding engine driven by the step machine.
///
/// Section bytes are pushed incrementally; `quality` reports how many
/// passes have been integrated for the current frame and must be monotonic
/// within it. `render` materializes the best data available so far.
pub trait PixelEngine: Send {
    fn begin_frame(
        &mut self,
        info: &BasicInfo,
        header: &FrameHeader,
        coalescing: bool,
    ) -> Result<(), EngineError>;

    /// Feed a chunk of pass section bytes. Chunks arrive in stream order.
    fn push_section(&mut self, pass: u8, data: &[u8]) -> Result<(), EngineError>;

    /// All bytes of `pass` have been pushed.
    fn end_section(&mut self, pass: u8) -> Result<(), EngineError>;

    /// Integrated pass count for the current frame.
    fn quality(&self) -> u32;

    fn decode_preview(&mut self, info: &BasicInfo, data: &[u8]) -> Result<(), EngineError>;

    fn render(&mut self, kind: ImageKind, format: &PixelFormat) -> Result<RenderedImage, EngineError>;

    /// Drop all decode state, including the canvas.
    fn reset(&mut self);
}

struct RawFrame {
    region_w: u32,
    region_h: u32,
    crop: Option<CropInfo>,
    blend: BlendMode,
    coalescing: bool,
    num_passes: u8,
    pending: Vec<u8>,
    dc: Option<Vec<u16>>,
    full: Option<Vec<u16>>,
    quality: u32,
}

/// Reference engine for uncompressed pass sections.
///
/// Samples are pixel-interleaved in the stream (color channels first, then
/// extra channels), one byte per sample for 8-bit streams and big-endian
/// pairs for deeper ones. Partial renders upsample the eighth-resolution
/// grid by sample replication.
#[derive(Default)]
pub struct RawEngine {
    canvas_w: u32,
    canvas_h: u32,
    channels: usize,
    num_color: usize,
    stream_bytes: usize,
    out_type: SampleType,
    canvas: Vec<u16>,
    preview: Option<(u32, u32, Vec<u16>)>,
    frame: Option<RawFrame>,
}

impl RawEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_layout(&mut self, info: &BasicInfo) {
        self.canvas_w = info.xsize;
        self.canvas_h = info.ysize;
        self.channels = info.total_channels();
        self.num_color = info.num_color_channels as usize;
        self.out_type = info.sample_type();
        self.stream_bytes = self.out_type.bytes_per_sample();
    }

    fn decode_samples(&self, data: &[u8]) -> Vec<u16> {
        match self.stream_bytes {
            1 => data.iter().map(|&b| b as u16).collect(),
            _ => data
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect(),
        }
    }

    fn section_len(&self, frame: &RawFrame, pass: u8) -> usize {
        let (w, h) = if pass + 1 == frame.num_passes {
            (frame.region_w, frame.region_h)
        } else {
            (frame.region_w.div_ceil(8), frame.region_h.div_ceil(8))
        };
        w as usize * h as usize * self.channels * self.stream_bytes
    }

    fn upsample(&self, dc: &[u16], region_w: u32, region_h: u32) -> Vec<u16> {
        let dcw = region_w.div_ceil(8) as usize;
        let ch = self.channels;
        let mut out = vec![0u16; region_w as usize * region_h as usize * ch];
        for y in 0..region_h as usize {
            let src_row = (y / 8) * dcw;
            for x in 0..region_w as usize {
                let src = (src_row + x / 8) * ch;
                let dst = (y * region_w as usize + x) * ch;
                out[dst..dst + ch].copy_from_slice(&dc[src..src + ch]);
            }
        }
        out
    }

    /// Composite a region grid onto `canvas` at the frame's crop offset,
    /// clipping to the canvas bounds.
    fn compose(&self, canvas: &mut [u16], grid: &[u16], frame: &RawFrame) {
        let ch = self.channels;
        let (x0, y0) = match &frame.crop {
            Some(crop) => (crop.x0 as i64, crop.y0 as i64),
            None => (0, 0),
        };
        for y in 0..frame.region_h as i64 {
            let cy = y0 + y;
            if cy < 0 || cy >= self.canvas_h as i64 {
                continue;
            }
            for x in 0..frame.region_w as i64 {
                let cx = x0 + x;
                if cx < 0 || cx >= self.canvas_w as i64 {
                    continue;
                }
                let src = ((y * frame.region_w as i64 + x) as usize) * ch;
                let dst = ((cy * self.canvas_w as i64 + cx) as usize) * ch;
                match frame.blend {
                    BlendMode::Replace => {
                        canvas[dst..dst + ch].copy_from_slice(&grid[src..src + ch]);
                    }
                    BlendMode::Add => {
                        for c in 0..ch {
                            canvas[dst + c] = canvas[dst + c].saturating_add(grid[src + c]);
                        }
                    }
                }
            }
        }
    }

    /// Pick the best available source surface for image output.
    fn image_source(&self, frame: &RawFrame) -> Result<(u32, u32, Vec<u16>), EngineError> {
        if let Some(full) = &frame.full {
            if frame.coalescing {
                return Ok((self.canvas_w, self.canvas_h, self.canvas.clone()));
            }
            return Ok((frame.region_w, frame.region_h, full.clone()));
        }
        let dc = frame
            .dc
            .as_ref()
            .ok_or_else(|| EngineError::msg("no decoded data for this frame yet"))?;
        let upsampled = self.upsample(dc, frame.region_w, frame.region_h);
        if frame.coalescing {
            let mut scratch = self.canvas.clone();
            self.compose(&mut scratch, &upsampled, frame);
            return Ok((self.canvas_w, self.canvas_h, scratch));
        }
        Ok((frame.region_w, frame.region_h, upsampled))
    }

    /// Pack `take` channels of each pixel into output bytes.
    fn extract(
        &self,
        w: u32,
        h: u32,
        samples: &[u16],
        first_channel: usize,
        format: &PixelFormat,
    ) -> RenderedImage {
        let ch = self.channels;
        let take = format.channels as usize;
        let bpp = format.bytes_per_pixel();
        let bytes_per_row = w as usize * bpp;
        let mut data = Vec::with_capacity(bytes_per_row * h as usize);
        for px in 0..(w as usize * h as usize) {
            let base = px * ch + first_channel;
            for c in 0..take {
                let v = samples[base + c];
                match format.sample_type {
                    SampleType::U8 => data.push(v as u8),
                    SampleType::U16 => data.extend_from_slice(&v.to_ne_bytes()),
                }
            }
        }
        RenderedImage {
            width: w,
            height: h,
            bytes_per_row,
            data,
        }
    }
}

impl PixelEngine for RawEngine {
    fn begin_frame(
        &mut self,
        info: &BasicInfo,
        header: &FrameHeader,
        coalescing: bool,
    ) -> Result<(), EngineError> {
        self.set_layout(info);
        if self.canvas.len() != self.canvas_w as usize * self.canvas_h as usize * self.channels {
            self.canvas =
                vec![0u16; self.canvas_w as usize * self.canvas_h as usize * self.channels];
        }
        let (region_w, region_h) = header.region_size(info);
        self.frame = Some(RawFrame {
            region_w,
            region_h,
            crop: header.crop,
            blend: header.blend_mode,
            coalescing,
            num_passes: header.num_passes,
            pending: Vec::new(),
            dc: None,
            full: None,
            quality: 0,
        });
        Ok(())
    }

    fn push_section(&mut self, _pass: u8, data: &[u8]) -> Result<(), EngineError> {
        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| EngineError::msg("section outside a frame"))?;
        frame.pending.extend_from_slice(data);
        Ok(())
    }

    fn end_section(&mut self, pass: u8) -> Result<(), EngineError> {
        let mut frame = self
            .frame
            .take()
            .ok_or_else(|| EngineError::msg("section outside a frame"))?;
        let expected = self.section_len(&frame, pass);
        if frame.pending.len() != expected {
            let got = frame.pending.len();
            self.frame = Some(frame);
            return Err(EngineError(format!(
                "pass {pass} carries {got} bytes, expected {expected}"
            )));
        }
        let bytes = std::mem::take(&mut frame.pending);
        let grid = self.decode_samples(&bytes);
        if pass + 1 == frame.num_passes {
            if frame.coalescing {
                let mut canvas = std::mem::take(&mut self.canvas);
                self.compose(&mut canvas, &grid, &frame);
                self.canvas = canvas;
            }
            frame.full = Some(grid);
        } else {
            frame.dc = Some(grid);
        }
        frame.quality += 1;
        self.frame = Some(frame);
        Ok(())
    }

    fn quality(&self) -> u32 {
        self.frame.as_ref().map_or(0, |f| f.quality)
    }

    fn decode_preview(&mut self, info: &BasicInfo, data: &[u8]) -> Result<(), EngineError> {
        self.set_layout(info);
        let preview = info
            .preview
            .ok_or_else(|| EngineError::msg("stream has no preview"))?;
        let expected =
            preview.xsize as usize * preview.ysize as usize * self.channels * self.stream_bytes;
        if data.len() != expected {
            return Err(EngineError(format!(
                "preview carries {} bytes, expected {expected}",
                data.len()
            )));
        }
        self.preview = Some((preview.xsize, preview.ysize, self.decode_samples(data)));
        Ok(())
    }

    fn render(&mut self, kind: ImageKind, format: &PixelFormat) -> Result<RenderedImage, EngineError> {
        match kind {
            ImageKind::Preview => {
                let (w, h, samples) = self
                    .preview
                    .clone()
                    .ok_or_else(|| EngineError::msg("no preview decoded"))?;
                Ok(self.extract(w, h, &samples, 0, format))
            }
            ImageKind::Dc => {
                let frame = self
                    .frame
                    .as_ref()
                    .ok_or_else(|| EngineError::msg("no frame in progress"))?;
                if frame.crop.is_some() {
                    return Err(EngineError::msg("DC output is limited to full-canvas frames"));
                }
                let dc = frame
                    .dc
                    .as_ref()
                    .ok_or_else(|| EngineError::msg("no DC pass integrated"))?
                    .clone();
                let (w, h) = (frame.region_w.div_ceil(8), frame.region_h.div_ceil(8));
                Ok(self.extract(w, h, &dc, 0, format))
            }
            ImageKind::Primary => {
                let frame = self
                    .frame
                    .as_ref()
                    .ok_or_else(|| EngineError::msg("no frame in progress"))?;
                let (w, h, samples) = self.image_source(frame)?;
                Ok(self.extract(w, h, &samples, 0, format))
            }
            ImageKind::ExtraChannel(i) => {
                let frame = self
                    .frame
                    .as_ref()
                    .ok_or_else(|| EngineError::msg("no frame in progress"))?;
                let (w, h, samples) = self.image_source(frame)?;
                Ok(self.extract(w, h, &samples, self.num_color + i as usize, format))
            }
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Orientation;

    fn info(w: u32, h: u32) -> BasicInfo {
        BasicInfo {
            xsize: w,
            ysize: h,
            bits_per_sample: 8,
            exponent_bits: 0,
            num_color_channels: 1,
            alpha_premultiplied: false,
            uses_original_profile: false,
            orientation: Orientation::Identity,
            preview: None,
            animation: None,
            extra_channels: Vec::new(),
        }
    }

    fn gray8() -> PixelFormat {
        PixelFormat::new(1, SampleType::U8)
    }

    #[test]
    fn single_pass_frame_renders_the_section_bytes() {
        let mut engine = RawEngine::new();
        let info = info(4, 2);
        let mut header = FrameHeader::full_canvas(true);
        header.pass_sizes = vec![8];
        engine.begin_frame(&info, &header, true).unwrap();

        let samples: Vec<u8> = (10..18).collect();
        engine.push_section(0, &samples[..3]).unwrap();
        engine.push_section(0, &samples[3..]).unwrap();
        engine.end_section(0).unwrap();
        assert_eq!(engine.quality(), 1);

        let image = engine.render(ImageKind::Primary, &gray8()).unwrap();
        assert_eq!((image.width, image.height), (4, 2));
        assert_eq!(image.data, samples);
        assert_eq!(image.row(1), &samples[4..]);
    }

    #[test]
    fn partial_render_upsamples_and_quality_is_monotonic() {
        let mut engine = RawEngine::new();
        let info = info(16, 16);
        let mut header = FrameHeader::full_canvas(true);
        header.num_passes = 2;
        header.pass_sizes = vec![4, 256];
        engine.begin_frame(&info, &header, true).unwrap();
        assert_eq!(engine.quality(), 0);

        // 2x2 DC grid.
        engine.push_section(0, &[1, 2, 3, 4]).unwrap();
        engine.end_section(0).unwrap();
        assert_eq!(engine.quality(), 1);

        let partial = engine.render(ImageKind::Primary, &gray8()).unwrap();
        assert_eq!((partial.width, partial.height), (16, 16));
        // Top-left 8x8 block replicates DC sample 1, top-right sample 2.
        assert_eq!(partial.data[0], 1);
        assert_eq!(partial.data[8], 2);
        assert_eq!(partial.data[16 * 8], 3);
        assert_eq!(partial.data[16 * 8 + 8], 4);

        let full: Vec<u8> = (0..=255).collect();
        engine.push_section(1, &full).unwrap();
        engine.end_section(1).unwrap();
        assert_eq!(engine.quality(), 2);
        let image = engine.render(ImageKind::Primary, &gray8()).unwrap();
        assert_eq!(image.data, full);
    }

    #[test]
    fn section_length_mismatch_is_an_engine_error() {
        let mut engine = RawEngine::new();
        let info = info(4, 4);
        let mut header = FrameHeader::full_canvas(true);
        header.pass_sizes = vec![3];
        engine.begin_frame(&info, &header, true).unwrap();
        engine.push_section(0, &[0, 0, 0]).unwrap();
        assert!(engine.end_section(0).is_err());
    }

    #[test]
    fn cropped_frame_composites_onto_the_canvas() {
        let mut engine = RawEngine::new();
        let info = info(4, 4);

        let mut base = FrameHeader::full_canvas(false);
        base.pass_sizes = vec![16];
        engine.begin_frame(&info, &base, true).unwrap();
        engine.push_section(0, &[9; 16]).unwrap();
        engine.end_section(0).unwrap();

        let mut layer = FrameHeader::full_canvas(true);
        layer.crop = Some(CropInfo {
            x0: 2,
            y0: 2,
            xsize: 2,
            ysize: 2,
        });
        layer.blend_mode = BlendMode::Add;
        layer.pass_sizes = vec![4];
        engine.begin_frame(&info, &layer, true).unwrap();
        engine.push_section(0, &[1, 1, 1, 1]).unwrap();
        engine.end_section(0).unwrap();

        let image = engine.render(ImageKind::Primary, &gray8()).unwrap();
        assert_eq!(image.data[0], 9);
        assert_eq!(image.data[2 * 4 + 2], 10);
        assert_eq!(image.data[3 * 4 + 3], 10);
    }

    #[test]
    fn sequential_runner_covers_the_range() {
        let runner = SequentialRunner;
        let hits = std::sync::Mutex::new(Vec::new());
        runner
            .run(2, 6, &|i| hits.lock().unwrap().push(i))
            .unwrap();
        assert_eq!(*hits.lock().unwrap(), vec![2, 3, 4, 5]);
    }
}
