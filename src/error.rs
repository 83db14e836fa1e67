//! Error taxonomy for the pipeline core.
//!
//! The design distinguishes *kinds*, not exception types: every
//! producer loop is a bounded state machine whose only exits are `Eof`,
//! fatal I/O, or cancellation, and every `process()` handles its own errors
//! locally (logged, never unwound across a thread boundary into native
//! code). `PipelineError` gives each of those kinds a name so call sites can
//! match instead of string-sniffing.

use std::fmt;

/// One of the error kinds a stage or the controller can report.
#[derive(Debug)]
pub enum PipelineError {
    /// Source couldn't be opened, codec missing, hardware context refused.
    /// Surfaced to the caller; aborts chain construction.
    InitFailure(String),
    /// `send`/`receive` returned a non-EOF error on a single unit. Logged,
    /// the unit is dropped, and the stage continues.
    TransientDecodeError(String),
    /// The source's read loop returned an error distinct from EOF.
    /// `running` is cleared and the source thread ends.
    FatalReaderError(String),
    /// Clean end of stream. Not a failure: the source terminates but
    /// downstream stages remain live until `stop()`.
    Eof,
    /// A bounded queue evicted an entry under sustained overload. Counted,
    /// never propagated as a hard failure.
    BackpressureOverflow { queue: &'static str, evicted: u64 },
    /// The preview surface was destroyed out from under the sink; frames
    /// are dropped from that point on.
    SurfaceLost,
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::InitFailure(msg) => write!(f, "init failure: {msg}"),
            PipelineError::TransientDecodeError(msg) => {
                write!(f, "transient decode error: {msg}")
            }
            PipelineError::FatalReaderError(msg) => write!(f, "fatal reader error: {msg}"),
            PipelineError::Eof => write!(f, "end of stream"),
            PipelineError::BackpressureOverflow { queue, evicted } => write!(
                f,
                "backpressure overflow on {queue} queue ({evicted} evicted total)"
            ),
            PipelineError::SurfaceLost => write!(f, "preview surface lost"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl PipelineError {
    /// `Eof` and `BackpressureOverflow` are expected operational outcomes,
    /// not failures; everything else is an actual error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::Eof | PipelineError::BackpressureOverflow { .. }
        )
    }

    pub fn init(msg: impl Into<String>) -> Self {
        PipelineError::InitFailure(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eof_and_overflow_are_not_fatal() {
        assert!(!PipelineError::Eof.is_fatal());
        assert!(!PipelineError::BackpressureOverflow {
            queue: "stream_server",
            evicted: 3
        }
        .is_fatal());
    }

    #[test]
    fn init_failure_is_fatal() {
        assert!(PipelineError::init("no such codec").is_fatal());
    }
}
