//! Runtime configuration knobs.

/// The minimum allowable fiber stack size in bytes.
pub const STACK_SIZE_MINIMAL: usize = 16 * 1024;

/// Default fiber stack size in bytes.
pub const STACK_SIZE_DEFAULT: usize = 512 * 1024;

/// Default width of the stack watermark window in bytes.
pub const STACK_WATERMARK_WINDOW: usize = 64 * 1024;

/// Default scratch-region gc threshold in bytes.
pub const REGION_GC_THRESHOLD: usize = 128 * 1024;

/// Configuration for a cord and the fibers it runs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack size of pooled fibers. Any other size marks the fiber as
    /// custom-stack: untracked, unpooled, destroyed on recycle.
    pub stack_size: usize,
    /// Fiber names longer than this are truncated.
    pub fiber_name_max: usize,
    /// Fiber ids up to this value are reserved for the runtime.
    pub reserved_fid_count: u32,
    /// Width of the watermark window near the hot end of a stack.
    pub stack_watermark_window: usize,
    /// `Region::gc` resets below this many used bytes and frees above.
    pub region_gc_threshold: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stack_size: STACK_SIZE_DEFAULT,
            fiber_name_max: 64,
            reserved_fid_count: 100,
            stack_watermark_window: STACK_WATERMARK_WINDOW,
            region_gc_threshold: REGION_GC_THRESHOLD,
        }
    }
}

impl RuntimeConfig {
    /// Create configuration from environment variables, falling back to
    /// the defaults above.
    ///
    /// Recognized variables: `TWINE_STACK_SIZE`, `TWINE_FIBER_NAME_MAX`,
    /// `TWINE_RESERVED_FIDS`, `TWINE_REGION_GC_THRESHOLD`.
    pub fn from_env() -> Self {
        fn read<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.parse().ok())
        }
        let mut config = Self::default();
        if let Some(v) = read::<usize>("TWINE_STACK_SIZE") {
            config.stack_size = v.max(STACK_SIZE_MINIMAL);
        }
        if let Some(v) = read::<usize>("TWINE_FIBER_NAME_MAX") {
            config.fiber_name_max = v;
        }
        if let Some(v) = read::<u32>("TWINE_RESERVED_FIDS") {
            config.reserved_fid_count = v;
        }
        if let Some(v) = read::<usize>("TWINE_REGION_GC_THRESHOLD") {
            config.region_gc_threshold = v;
        }
        config
    }

    /// Set the pooled stack size.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = size.max(STACK_SIZE_MINIMAL);
        self
    }

    /// Set the scratch-region gc threshold.
    pub fn with_region_gc_threshold(mut self, bytes: usize) -> Self {
        self.region_gc_threshold = bytes;
        self
    }
}
