//! Error types for the safepoint and signal core.

use thiserror::Error;

/// Main error type for all QRT setup operations.
///
/// Signal-handler context never surfaces these: per the crate's error
/// policy, handler-context failures are either injected exceptions or
/// process termination.
#[derive(Debug, Error)]
pub enum RtError {
    #[error("sigaction for signal {signal} failed: errno {errno}")]
    HandlerInstall { signal: i32, errno: i32 },

    #[error("sigaltstack failed: errno {errno}")]
    SigAltStack { errno: i32 },

    #[error("signal stack allocation of {size} bytes failed: errno {errno}")]
    StackAlloc { size: usize, errno: i32 },

    #[error("profile timer error: {0}")]
    Timer(String),

    #[error("profile buffer not initialized")]
    ProfileUninitialized,

    #[error("signal listener spawn failed: {0}")]
    ListenerSpawn(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("thread {tid} is not attached")]
    ThreadNotAttached { tid: usize },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for QRT operations
pub type Result<T> = std::result::Result<T, RtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RtError::HandlerInstall {
            signal: 11,
            errno: 22,
        };
        assert!(err.to_string().contains("signal 11"));

        let err = RtError::ThreadNotAttached { tid: 3 };
        assert_eq!(err.to_string(), "thread 3 is not attached");
    }
}
