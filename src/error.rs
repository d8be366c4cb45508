use thiserror::Error;

/// Stream-level errors: the input is malformed, truncated, or inconsistent,
/// or the driven pixel engine failed.
///
/// These are terminal for the current parse. Once [`step`](crate::Decoder::step)
/// has returned one of these, every further call returns [`DecodeError::Failed`]
/// until [`reset`](crate::Decoder::reset) is called.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid stream signature")]
    InvalidSignature,
    #[error("Invalid marker")]
    InvalidMarker,
    #[error("Invalid segment length")]
    InvalidSegmentLength,
    #[error("Invalid box type")]
    InvalidBoxType,
    #[error("Invalid box size")]
    InvalidBoxSize,
    #[error("Invalid partial codestream sequence")]
    InvalidPartialCodestream,
    #[error("Truncated stream")]
    TruncatedStream,
    #[error("Invalid basic info")]
    InvalidBasicInfo,
    #[error("Duplicate basic info")]
    DuplicateBasicInfo,
    #[error("Invalid color encoding")]
    InvalidColorEncoding,
    #[error("Invalid frame header")]
    InvalidFrameHeader,
    #[error("Missing codestream")]
    MissingCodestream,
    #[error("Engine failure: {0}")]
    Engine(String),
    #[error("Decoder failed; reset required")]
    Failed,
}

/// Caller contract violations: attaching a sink twice, querying before data
/// is available, mismatched buffer sizes, subscribing mid-parse.
///
/// Reported synchronously by the violating call. The parse position and the
/// engine state are unchanged; the caller can correct the call and continue.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    #[error("Buffer already set")]
    AlreadySet,
    #[error("Buffer not attached")]
    NotAttached,
    #[error("Input was closed")]
    InputClosed,
    #[error("Data not yet available")]
    NotAvailable,
    #[error("Buffer too small")]
    BufferTooSmall,
    #[error("A sink is already attached for this output")]
    SinkAlreadyAttached,
    #[error("Subscriptions are immutable during an active parse")]
    SubscribeAfterStart,
    #[error("No improved data available to flush")]
    NothingToFlush,
    #[error("Flush is only valid while a frame is in progress")]
    FlushOutsideFrame,
    #[error("Invalid argument")]
    InvalidArgument,
}

/// A buffer attachment the engine refused. The buffer is handed back
/// untouched; the engine never frees caller memory, even on refusal.
#[derive(Debug)]
pub struct RejectedBuffer {
    pub error: UsageError,
    pub buffer: Vec<u8>,
}

impl From<(UsageError, Vec<u8>)> for RejectedBuffer {
    fn from((error, buffer): (UsageError, Vec<u8>)) -> Self {
        Self { error, buffer }
    }
}

impl std::fmt::Display for RejectedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for RejectedBuffer {}
