//! Heap configuration.

/// Default first collection threshold (1 MiB).
pub const DEFAULT_INITIAL_THRESHOLD: usize = 1024 * 1024;
/// Default target size of a node-pool superblock (8 KiB).
pub const DEFAULT_SUPERBLOCK_BYTES: usize = 8 * 1024;

/// Construction-time settings for a [`Heap`](crate::Heap).
///
/// ```
/// use cellgc::{Heap, HeapConfig};
///
/// let heap = Heap::with_config(HeapConfig {
///     initial_threshold: 64 * 1024,
///     ..HeapConfig::default()
/// });
/// assert_eq!(heap.stats().trigger_level, 64 * 1024);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Allocation level that cues the first collection. The threshold never
    /// falls below this value afterwards.
    pub initial_threshold: usize,
    /// Upper bound on the threshold.
    pub max_threshold: usize,
    /// Target superblock size for the node pools. Each pool fits as many
    /// cells as it can into this many bytes, and at least one.
    pub superblock_bytes: usize,
    /// Run a full collection at every allocation.
    pub torture: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_threshold: DEFAULT_INITIAL_THRESHOLD,
            max_threshold: usize::MAX,
            superblock_bytes: DEFAULT_SUPERBLOCK_BYTES,
            torture: false,
        }
    }
}
