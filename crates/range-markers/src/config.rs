//! Tree configuration.

/// Options that control how a [`MarkerTree`](crate::MarkerTree) maintains itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerTreeConfig {
    /// If `true`, runs the full consistency check after every write operation.
    ///
    /// The check is `O(n)`; keep it off for large trees in release builds.
    pub verify_invariants: bool,
    /// Garbage nodes are purged once released markers exceed `max(1, size / purge_ratio)`.
    pub purge_ratio: usize,
    /// Length (in chars) of the document the tree is created for.
    pub document_len: usize,
}

impl Default for MarkerTreeConfig {
    fn default() -> Self {
        Self {
            verify_invariants: cfg!(debug_assertions),
            purge_ratio: 3,
            document_len: 0,
        }
    }
}

impl MarkerTreeConfig {
    /// Set the initial document length.
    pub fn with_document_len(mut self, document_len: usize) -> Self {
        self.document_len = document_len;
        self
    }

    /// Enable or disable the per-operation consistency check.
    pub fn with_verify_invariants(mut self, verify: bool) -> Self {
        self.verify_invariants = verify;
        self
    }

    /// Set the purge threshold divisor (clamped to at least 1).
    pub fn with_purge_ratio(mut self, ratio: usize) -> Self {
        self.purge_ratio = ratio.max(1);
        self
    }

    /// Number of released markers that triggers a full garbage purge.
    pub(crate) fn purge_threshold(&self, size: usize) -> usize {
        (size / self.purge_ratio.max(1)).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purge_threshold_never_zero() {
        let config = MarkerTreeConfig::default();
        assert_eq!(config.purge_threshold(0), 1);
        assert_eq!(config.purge_threshold(2), 1);
        assert_eq!(config.purge_threshold(30), 10);
    }

    #[test]
    fn test_purge_ratio_clamped() {
        let config = MarkerTreeConfig::default().with_purge_ratio(0);
        assert_eq!(config.purge_ratio, 1);
        assert_eq!(config.purge_threshold(7), 7);
    }
}
