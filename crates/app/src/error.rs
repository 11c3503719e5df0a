use std::fmt;
use std::io;

use corx_sdr::SourceError;

/// Fatal receiver errors.
///
/// Recoverable conditions (tracking loss, a missed beacon, an unsupported
/// bias-tee toggle) are logged and compensated instead of surfacing here.
#[derive(Debug)]
pub enum RxError {
    /// Bad CLI arguments or template file.
    Config(String),

    /// The tuner or input stream failed.
    Source(SourceError),

    /// Writing the output trace failed.
    Format(io::Error),
}

impl RxError {
    /// Process exit code: positive codes are forwarded from the block
    /// source, everything else maps to -1.
    pub fn exit_code(&self) -> i32 {
        match self {
            RxError::Source(e) => e.code,
            _ => -1,
        }
    }
}

impl fmt::Display for RxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RxError::Config(msg) => write!(f, "configuration error: {}", msg),
            RxError::Source(e) => write!(f, "source error: {}", e),
            RxError::Format(e) => write!(f, "output error: {}", e),
        }
    }
}

impl std::error::Error for RxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RxError::Source(e) => Some(e),
            RxError::Format(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SourceError> for RxError {
    fn from(e: SourceError) -> Self {
        RxError::Source(e)
    }
}

impl From<io::Error> for RxError {
    fn from(e: io::Error) -> Self {
        RxError::Format(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(RxError::Config("bad".into()).exit_code(), -1);
        assert_eq!(RxError::Source(SourceError::read("eof")).exit_code(), 1);
        assert_eq!(RxError::Source(SourceError::device("usb")).exit_code(), 2);
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(RxError::Format(io_err).exit_code(), -1);
    }
}
