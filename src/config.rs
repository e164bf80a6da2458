//! Configuration for signal handling and interrupt delivery.

use crate::error::{Result, RtError};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Default per-thread signal stack size. Same as the default task stack
/// size and enough for reasonable finalizers.
pub const SIG_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Configuration for the signal listener and interrupt delivery.
///
/// Most parameters have sensible defaults.
///
/// # Examples
///
/// ```rust
/// use qrt::SignalConfig;
///
/// // Use default configuration
/// let config = SignalConfig::default();
///
/// // Batch jobs usually want the first Ctrl-C to terminate the process
/// let config = SignalConfig {
///     exit_on_sigint: true,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// Treat the first SIGINT as a critical exit request instead of
    /// raising an interrupt exception into thread 0.
    ///
    /// Default: false
    pub exit_on_sigint: bool,

    /// Drop user interrupts entirely.
    ///
    /// Default: false
    pub ignore_sigint: bool,

    /// Duration in seconds of the profile run started by an information
    /// signal when no profile is already running.
    ///
    /// Default: 1.0
    pub profile_peek_duration: f64,

    /// Per-thread signal stack size in bytes. One guard page is added
    /// below the stack.
    ///
    /// Default: 8 MiB
    pub sig_stack_size: usize,

    /// How long the listener waits for a suspended thread to acknowledge
    /// before skipping it.
    ///
    /// Default: 1 s
    pub suspend_timeout: Duration,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            exit_on_sigint: false,
            ignore_sigint: false,
            profile_peek_duration: 1.0,
            sig_stack_size: SIG_STACK_SIZE,
            suspend_timeout: Duration::from_secs(1),
        }
    }
}

impl SignalConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<()> {
        if self.profile_peek_duration <= 0.0 {
            return Err(RtError::Configuration(
                "profile_peek_duration must be positive".to_string(),
            ));
        }
        if self.sig_stack_size < 16 * crate::util::page::page_size() {
            return Err(RtError::Configuration(format!(
                "sig_stack_size {} is too small for signal handling",
                self.sig_stack_size
            )));
        }
        if self.suspend_timeout.is_zero() {
            return Err(RtError::Configuration(
                "suspend_timeout must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}

// Live copies of the settings consulted from the listener and the
// handlers. Written once by `apply`, adjustable at runtime through the
// setters below.
static EXIT_ON_SIGINT: AtomicBool = AtomicBool::new(false);
static IGNORE_SIGINT: AtomicBool = AtomicBool::new(false);
static PROFILE_PEEK_NS: AtomicU64 = AtomicU64::new(1_000_000_000);
static SIG_STACK_SIZE_CFG: AtomicUsize = AtomicUsize::new(SIG_STACK_SIZE);
static SUSPEND_TIMEOUT_MS: AtomicU64 = AtomicU64::new(1_000);

pub(crate) fn apply(config: &SignalConfig) {
    EXIT_ON_SIGINT.store(config.exit_on_sigint, Ordering::Release);
    IGNORE_SIGINT.store(config.ignore_sigint, Ordering::Release);
    PROFILE_PEEK_NS.store(
        (config.profile_peek_duration * 1e9) as u64,
        Ordering::Release,
    );
    SIG_STACK_SIZE_CFG.store(config.sig_stack_size, Ordering::Release);
    SUSPEND_TIMEOUT_MS.store(config.suspend_timeout.as_millis() as u64, Ordering::Release);
}

pub fn set_exit_on_sigint(value: bool) {
    EXIT_ON_SIGINT.store(value, Ordering::Release);
}

pub fn set_ignore_sigint(value: bool) {
    IGNORE_SIGINT.store(value, Ordering::Release);
}

pub(crate) fn exit_on_sigint() -> bool {
    EXIT_ON_SIGINT.load(Ordering::Acquire)
}

pub(crate) fn ignore_sigint() -> bool {
    IGNORE_SIGINT.load(Ordering::Acquire)
}

pub(crate) fn profile_peek_ns() -> u64 {
    PROFILE_PEEK_NS.load(Ordering::Acquire)
}

pub(crate) fn sig_stack_size() -> usize {
    SIG_STACK_SIZE_CFG.load(Ordering::Acquire)
}

pub(crate) fn suspend_timeout() -> Duration {
    Duration::from_millis(SUSPEND_TIMEOUT_MS.load(Ordering::Acquire))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(SignalConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_peek_duration() {
        let config = SignalConfig {
            profile_peek_duration: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_signal_stack() {
        let config = SignalConfig {
            sig_stack_size: 4096,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
