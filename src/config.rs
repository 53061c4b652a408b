//! Runtime configuration.

use std::time::Duration;

pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;

/// Tunables for a [`Runtime`](crate::Runtime).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vmthread::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     debugger_suspend_timeout: Duration::from_millis(100),
///     ..RuntimeConfig::default()
/// };
/// assert_eq!(config.max_thread_id, 0xFFFF);
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size used when a managed thread asks for zero.
    pub default_stack_size: usize,
    /// Bytes at the low end of every stack kept free for overflow handling.
    pub stack_overflow_reserved_bytes: usize,
    /// How long a debugger suspension request polls before giving up.
    pub debugger_suspend_timeout: Duration,
    /// Upper bound on a single back-off sleep while polling for suspension.
    pub max_suspend_backoff: Duration,
    /// Enforce lock levels and suspension assertions.
    pub check_locks: bool,
    /// Hand every decoded reference to the object model for verification.
    pub verify_objects: bool,
    /// Treat unrecognized reference handles as raw object addresses.
    pub work_around_app_jni_bugs: bool,
    /// The runtime is an ahead-of-time compiler; attached threads get no peer.
    pub is_compiler: bool,
    /// Largest thin-lock id handed out by the registry.
    pub max_thread_id: u32,
    /// Approximate memory a shared compile context may use before it is replaced.
    pub compile_context_threshold: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_stack_size: 256 * KB,
            stack_overflow_reserved_bytes: 16 * KB,
            debugger_suspend_timeout: Duration::from_secs(30),
            max_suspend_backoff: Duration::from_millis(500),
            check_locks: cfg!(debug_assertions),
            verify_objects: cfg!(debug_assertions),
            work_around_app_jni_bugs: false,
            is_compiler: false,
            max_thread_id: 0xFFFF,
            compile_context_threshold: 32 * MB,
        }
    }
}
