// Copyright 2025-2026 CEMAXECUTER LLC

pub mod blocks;
pub mod file;

#[cfg(feature = "rtlsdr")]
pub mod rtlsdr;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam::channel::Sender;
use num_complex::Complex32;

/// Wall-clock timestamp attached to sample chunks and blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub sec: u64,
    pub usec: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                sec: d.as_secs(),
                usec: d.subsec_micros(),
            },
            Err(_) => Self::default(),
        }
    }
}

/// A chunk of baseband samples with the wall-clock time of its read.
pub struct SampleChunk {
    pub samples: Vec<Complex32>,
    pub timestamp: Timestamp,
}

/// Cooperative cancellation flag shared between the pipeline, the reader
/// thread and the process signal handler.
///
/// `cancel` only stores a flag, so it is safe to call from a signal
/// context; all state mutation stays on the pipeline thread.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bias-tee command mailbox.
///
/// The pipeline thread posts a request; the reader thread, which owns the
/// tuner handle, applies it between reads.
#[derive(Clone)]
pub struct BiasTeeControl(Arc<AtomicI8>);

const BIAS_NONE: i8 = -1;

impl BiasTeeControl {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI8::new(BIAS_NONE)))
    }

    /// Post a request to switch the bias tee on or off.
    pub fn request(&self, on: bool) {
        self.0.store(on as i8, Ordering::SeqCst);
    }

    /// Take a pending request, if any.
    pub fn take(&self) -> Option<bool> {
        match self.0.swap(BIAS_NONE, Ordering::SeqCst) {
            BIAS_NONE => None,
            v => Some(v != 0),
        }
    }
}

impl Default for BiasTeeControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Error from a sample source. The code becomes the process exit code.
#[derive(Debug)]
pub struct SourceError {
    pub code: i32,
    pub message: String,
}

impl SourceError {
    /// Stream read failure.
    pub fn read<S: Into<String>>(message: S) -> Self {
        Self {
            code: 1,
            message: message.into(),
        }
    }

    /// Device open or configuration failure.
    pub fn device<S: Into<String>>(message: S) -> Self {
        Self {
            code: 2,
            message: message.into(),
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SourceError {}

/// Common trait for all sample sources.
pub trait SampleSource: Send {
    /// Stream sample chunks into the channel until EOF, a cancel request,
    /// or an error. Runs on a dedicated reader thread.
    fn start(&mut self, tx: Sender<SampleChunk>, cancel: &CancelToken)
        -> Result<(), SourceError>;

    /// Sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Tuner centre frequency in Hz.
    fn center_freq(&self) -> u64;

    /// Bias-tee mailbox, for sources that can power a preamp.
    fn bias_tee(&self) -> Option<BiasTeeControl> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_bias_tee_mailbox() {
        let ctl = BiasTeeControl::new();
        assert_eq!(ctl.take(), None);
        ctl.request(true);
        assert_eq!(ctl.take(), Some(true));
        // A request is consumed by take.
        assert_eq!(ctl.take(), None);
        ctl.request(false);
        ctl.request(true);
        // Later requests overwrite earlier ones.
        assert_eq!(ctl.take(), Some(true));
    }
}
