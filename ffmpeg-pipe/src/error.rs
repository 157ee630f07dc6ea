//! Result codes shared by every adapter.
//!
//! Backend failures surface as `ffmpeg_next::Error` inside `anyhow::Error`.
//! Failures that originate in this crate are [`PipeError`] values, also
//! carried by `anyhow::Error`, so callers can `downcast_ref::<PipeError>()`.

use std::panic::Location;

use ffmpeg_next::Rational;

/// Lifecycle of an adapter. `Stopped` is both the initial and post-cleanup state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Running,
}

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("{adapter} is {state:?}, operation requires {required:?}")]
    InvalidState {
        adapter: &'static str,
        state: Status,
        required: Status,
    },
    #[error("call order violation: {0}")]
    Ordering(&'static str),
    #[error("allocation failed: {0}")]
    Alloc(&'static str),
    #[error("packet time base {actual:?} does not match stream time base {expected:?}")]
    TimeBaseMismatch { expected: Rational, actual: Rational },
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl PipeError {
    /// FFmpeg-style negative error code, for logs and callers that report
    /// numeric status.
    pub fn code(&self) -> i32 {
        use ffmpeg_next::util::error::{EINVAL, ENOMEM, ENOSYS};
        let errno = match self {
            PipeError::InvalidState { .. }
            | PipeError::Ordering(_)
            | PipeError::TimeBaseMismatch { .. } => EINVAL,
            PipeError::Alloc(_) => ENOMEM,
            PipeError::Unsupported(_) => ENOSYS,
        };
        ffmpeg_next::ffi::AVERROR(errno)
    }

    pub fn is_invalid_state(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<PipeError>(),
            Some(PipeError::InvalidState { .. })
        )
    }
}

/// Non-error outcomes of a codec call.
#[derive(Debug)]
pub enum CodecOutput<T> {
    /// One unit was produced.
    Data(T),
    /// The codec needs more input before it can produce output.
    Again,
    /// The codec has been drained.
    Eof,
}

impl<T> CodecOutput<T> {
    pub fn into_data(self) -> Option<T> {
        match self {
            CodecOutput::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, CodecOutput::Eof)
    }

    pub fn is_again(&self) -> bool {
        matches!(self, CodecOutput::Again)
    }
}

/// Builds a state-violation error and records where it was raised.
#[track_caller]
pub(crate) fn invalid_state(
    adapter: &'static str,
    state: Status,
    required: Status,
) -> anyhow::Error {
    let location = Location::caller();
    let err = PipeError::InvalidState {
        adapter,
        state,
        required,
    };
    log::error!(
        "{} {} : {} (code {})",
        location.file(),
        location.line(),
        err,
        err.code()
    );
    err.into()
}

/// Checks the return value of a raw FFmpeg call.
#[track_caller]
pub(crate) fn check(ret: i32, call: &'static str) -> anyhow::Result<i32> {
    if ret < 0 {
        let location = Location::caller();
        log::error!("{} {} : {} returned {}", location.file(), location.line(), call, ret);
        return Err(anyhow::Error::new(ffmpeg_next::Error::from(ret)).context(call));
    }
    Ok(ret)
}

pub(crate) fn is_again(err: &ffmpeg_next::Error) -> bool {
    matches!(err, ffmpeg_next::Error::Other { errno } if *errno == ffmpeg_next::util::error::EAGAIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_is_downcastable() {
        let err = invalid_state("decoder", Status::Stopped, Status::Running);
        assert!(PipeError::is_invalid_state(&err));
        assert!(err.to_string().contains("decoder"));
    }

    #[test]
    fn test_errors_carry_negative_codes() {
        let err = invalid_state("encoder", Status::Running, Status::Stopped);
        let code = err.downcast_ref::<PipeError>().map(PipeError::code);
        assert_eq!(code, Some(ffmpeg_next::ffi::AVERROR(ffmpeg_next::util::error::EINVAL)));
        assert!(PipeError::Alloc("frame").code() < 0);
        assert_ne!(PipeError::Alloc("frame").code(), code.unwrap_or_default());
        assert_eq!(
            ffmpeg_next::Error::from(PipeError::Unsupported("x".to_string()).code()),
            ffmpeg_next::Error::Other {
                errno: ffmpeg_next::util::error::ENOSYS
            }
        );
    }

    #[test]
    fn test_check_keeps_backend_error() {
        let err = check(ffmpeg_next::ffi::AVERROR_EOF, "av_read_frame").unwrap_err();
        assert!(!PipeError::is_invalid_state(&err));
        assert_eq!(
            err.downcast_ref::<ffmpeg_next::Error>(),
            Some(&ffmpeg_next::Error::Eof)
        );
        assert_eq!(check(3, "avio_read").unwrap(), 3);
    }

    #[test]
    fn test_codec_output_helpers() {
        assert_eq!(CodecOutput::Data(5).into_data(), Some(5));
        assert!(CodecOutput::<()>::Eof.is_eof());
        assert!(CodecOutput::<()>::Again.is_again());
        assert_eq!(CodecOutput::<i32>::Again.into_data(), None);
    }
}
