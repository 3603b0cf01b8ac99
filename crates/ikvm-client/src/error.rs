//! Coarse error classification shared by every error type in this crate.
//!
//! Callers that only need to decide "retry, reconnect, or give up" match on
//! [`ErrorCategory`] instead of on each layer's concrete enum.

use std::fmt;

/// Which kind of fault an error represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Socket refused, reset or aborted.  The session is gone.
    Transport,
    /// A bounded wait ran out: handshake, request, send, scan or read.
    Timing,
    /// Bytes arrived that the protocol does not allow.
    Protocol,
    /// A JPEG body failed marker validation.
    Format,
    /// The server understood the request and answered failure or error.
    Rejected,
    /// The MJPEG stream ended mid-frame.
    Lost,
    /// The caller asked for something the current state does not allow.
    Usage,
}

impl ErrorCategory {
    /// `true` for categories where trying again later may succeed.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorCategory::Transport | ErrorCategory::Timing | ErrorCategory::Lost
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::Timing => "timing",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Format => "format",
            ErrorCategory::Rejected => "rejected",
            ErrorCategory::Lost => "lost",
            ErrorCategory::Usage => "usage",
        })
    }
}

/// Implemented by every error type that carries an [`ErrorCategory`].
///
/// Lets code that is generic over its error type, such as the retry loop in
/// [`crate::application::session`], decide whether a failure is worth another
/// attempt.
pub trait Categorize {
    fn category(&self) -> ErrorCategory;
}
