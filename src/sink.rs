//! Output sinks: caller-supplied destinations for decoded data.
//!
//! Three mutually exclusive delivery modes exist per output kind: a fixed
//! buffer (moved in for the attach→release window), a scanline callback,
//! and a threaded callback with a begin/row/finish lifecycle. A sink
//! attachment is single-use per frame.

use std::sync::Arc;

use thiserror::Error;

use crate::error::UsageError;
use crate::metadata::PixelFormat;

/// Which decoded output a sink receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Primary,
    Preview,
    /// Eighth-resolution image (legacy path).
    Dc,
    ExtraChannel(u16),
}

/// Row-callback sink. Receives 1-row-high strips; the row slice is valid
/// only for the duration of the call.
///
/// Rows for disjoint `y` may be delivered concurrently from worker tasks,
/// so implementations must be thread-safe.
pub trait ScanlineSink: Send + Sync {
    fn on_row(&self, x: u32, y: u32, row: &[u8]);
}

/// Returned by [`ThreadedSink::begin`] to refuse a frame. Fatal for the
/// frame being decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sink refused the frame: {0}")]
pub struct SinkRefused(pub String);

/// Three-phase row sink for multithreaded delivery.
///
/// `begin` is called once before any `row` call for a frame, `row` once per
/// delivered row (possibly concurrently from several workers), and `finish`
/// exactly once after all `row` calls for the frame complete.
pub trait ThreadedSink: Send + Sync {
    fn begin(&self, num_threads: usize, max_row_pixels: usize) -> Result<(), SinkRefused>;
    fn row(&self, thread_id: usize, x: u32, y: u32, row: &[u8]);
    fn finish(&self);
}

pub(crate) enum SinkKind {
    Buffer(Vec<u8>),
    Scanline(Arc<dyn ScanlineSink>),
    Threaded(Arc<dyn ThreadedSink>),
}

impl std::fmt::Debug for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkKind::Buffer(buf) => write!(f, "Buffer({} bytes)", buf.len()),
            SinkKind::Scanline(_) => f.write_str("Scanline"),
            SinkKind::Threaded(_) => f.write_str("Threaded"),
        }
    }
}

pub(crate) struct SinkSlot {
    pub kind: ImageKind,
    pub sink: SinkKind,
    pub format: PixelFormat,
    /// Frame counter at attach time; a slot is live only for that frame.
    pub serial: u64,
    /// Whether `ThreadedSink::begin` ran for the current frame.
    pub begun: bool,
}

/// The set of attached image sinks.
#[derive(Default)]
pub(crate) struct ImageSinks {
    slots: Vec<SinkSlot>,
}

impl ImageSinks {
    /// On refusal the sink is handed back so fixed-buffer memory is never
    /// dropped by the engine.
    pub fn attach(
        &mut self,
        kind: ImageKind,
        sink: SinkKind,
        format: PixelFormat,
        serial: u64,
    ) -> Result<(), (UsageError, SinkKind)> {
        if let Some(existing) = self.slots.iter().find(|s| s.kind == kind) {
            // A stale fixed buffer still holds caller memory; it must be
            // released before a new attachment. Callback slots from earlier
            // frames are simply replaced.
            if existing.serial == serial || matches!(existing.sink, SinkKind::Buffer(_)) {
                let error = match existing.sink {
                    SinkKind::Buffer(_) => UsageError::AlreadySet,
                    _ => UsageError::SinkAlreadyAttached,
                };
                return Err((error, sink));
            }
            self.slots.retain(|s| s.kind != kind);
        }
        self.slots.push(SinkSlot {
            kind,
            sink,
            format,
            serial,
            begun: false,
        });
        Ok(())
    }

    pub fn release_buffer(&mut self, kind: ImageKind) -> Result<Vec<u8>, UsageError> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.kind == kind && matches!(s.sink, SinkKind::Buffer(_)))
            .ok_or(UsageError::NotAttached)?;
        match self.slots.swap_remove(idx).sink {
            SinkKind::Buffer(buf) => Ok(buf),
            _ => Err(UsageError::NotAttached),
        }
    }

    pub fn detach(&mut self, kind: ImageKind) -> Result<(), UsageError> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.kind == kind && !matches!(s.sink, SinkKind::Buffer(_)))
            .ok_or(UsageError::NotAttached)?;
        self.slots.swap_remove(idx);
        Ok(())
    }

    /// The live slot for `kind`, if one was attached for frame `serial`.
    pub fn live(&mut self, kind: ImageKind, serial: u64) -> Option<&mut SinkSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.kind == kind && s.serial == serial)
    }

    pub fn has_live(&self, kind: ImageKind, serial: u64) -> bool {
        self.slots.iter().any(|s| s.kind == kind && s.serial == serial)
    }

    /// Close out every begun threaded sink for `serial`. Called once when a
    /// frame's row deliveries are over.
    pub fn finish_threaded(&mut self, serial: u64) {
        for slot in &mut self.slots {
            if slot.serial == serial && slot.begun {
                if let SinkKind::Threaded(sink) = &slot.sink {
                    sink.finish();
                }
                slot.begun = false;
            }
        }
    }

    /// Live extra-channel kinds attached for `serial`.
    pub fn live_extra_kinds(&self, serial: u64) -> Vec<ImageKind> {
        self.slots
            .iter()
            .filter(|s| s.serial == serial && matches!(s.kind, ImageKind::ExtraChannel(_)))
            .map(|s| s.kind)
            .collect()
    }
}

/// Byte sink for JPEG-reconstruction and box payloads: an owned buffer
/// attached for a fill window, released with its written count.
#[derive(Debug, Default)]
pub(crate) struct ByteSink {
    buf: Vec<u8>,
    written: usize,
    attached: bool,
}

impl ByteSink {
    /// On refusal the buffer is handed back; caller memory is never freed
    /// by the engine.
    pub fn set(&mut self, buf: Vec<u8>) -> Result<(), (UsageError, Vec<u8>)> {
        if self.attached {
            return Err((UsageError::AlreadySet, buf));
        }
        self.buf = buf;
        self.written = 0;
        self.attached = true;
        Ok(())
    }

    pub fn release(&mut self) -> Result<(Vec<u8>, usize), UsageError> {
        if !self.attached {
            return Err(UsageError::NotAttached);
        }
        self.attached = false;
        Ok((std::mem::take(&mut self.buf), std::mem::take(&mut self.written)))
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Copy as much of `data` as fits; returns the number of bytes taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if !self.attached {
            return 0;
        }
        let space = self.buf.len() - self.written;
        let n = space.min(data.len());
        self.buf[self.written..self.written + n].copy_from_slice(&data[..n]);
        self.written += n;
        n
    }
}
