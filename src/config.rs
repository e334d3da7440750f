//! Analyzer tunables

/// Thresholds that steer the rewrite and segmentation passes
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerConfig {
    /// Minimum anchor (max incoming frequency) for a cycle to survive as a
    /// task; colder cycles are folded away by the low-frequency-loop pass
    pub min_anchor: u64,
    /// A parent task whose children are all hierarchies is revoked unless
    /// it has at least this many children
    pub min_child_kernel_exception: usize,
    /// Upper bound on the green set of the bottleneck search
    pub max_bottleneck_size: usize,
    /// Fraction of total block frequency the hot-code pass must cover
    pub hot_threshold: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            min_anchor: 16,
            min_child_kernel_exception: 5,
            max_bottleneck_size: 200,
            hot_threshold: 0.95,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AnalyzerConfig::default();
        assert_eq!(cfg.min_anchor, 16);
        assert_eq!(cfg.min_child_kernel_exception, 5);
        assert_eq!(cfg.max_bottleneck_size, 200);
        assert!((cfg.hot_threshold - 0.95).abs() < 1e-6);
    }
}
