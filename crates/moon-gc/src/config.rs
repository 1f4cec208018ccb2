//! Collector tuning parameters.

/// Heap growth allowed before a new incremental cycle starts, in percent of
/// the live size measured at the end of the previous cycle.
pub const DEFAULT_PAUSE: usize = 200;
/// Collector work per allocated byte, in percent.
pub const DEFAULT_STEP_MULTIPLIER: usize = 100;
/// Log2 of the minimum step granularity in bytes (8 KiB).
pub const DEFAULT_STEP_SIZE_LOG2: u32 = 13;
/// Allocation allowed between minor collections, in percent of the heap.
pub const DEFAULT_MINOR_MULTIPLIER: usize = 20;
/// Heap growth since the last major collection that triggers the next one,
/// in percent.
pub const DEFAULT_MAJOR_MULTIPLIER: usize = 100;

/// Collection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GcMode {
    #[default]
    Incremental,
    Generational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    pub mode: GcMode,
    pub pause: usize,
    pub step_multiplier: usize,
    pub step_size_log2: u32,
    pub minor_multiplier: usize,
    pub major_multiplier: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            mode: GcMode::Incremental,
            pause: DEFAULT_PAUSE,
            step_multiplier: DEFAULT_STEP_MULTIPLIER,
            step_size_log2: DEFAULT_STEP_SIZE_LOG2,
            minor_multiplier: DEFAULT_MINOR_MULTIPLIER,
            major_multiplier: DEFAULT_MAJOR_MULTIPLIER,
        }
    }
}

impl GcConfig {
    #[must_use]
    pub fn incremental() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn generational() -> Self {
        Self {
            mode: GcMode::Generational,
            ..Self::default()
        }
    }

    /// Minimum step size in bytes.
    #[must_use]
    pub const fn step_size(&self) -> usize {
        if self.step_size_log2 >= usize::BITS - 1 {
            usize::MAX >> 1
        } else {
            1 << self.step_size_log2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GcConfig::default();
        assert_eq!(config.mode, GcMode::Incremental);
        assert_eq!(config.pause, 200);
        assert_eq!(config.step_size(), 8 * 1024);
        assert_eq!(GcConfig::generational().mode, GcMode::Generational);
    }

    #[test]
    fn test_step_size_saturates() {
        let config = GcConfig {
            step_size_log2: 200,
            ..GcConfig::default()
        };
        assert_eq!(config.step_size(), usize::MAX >> 1);
    }
}
