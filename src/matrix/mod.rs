//! Storage Decision Matrix
//!
//! An ordered set of rows describing feasible (drive type, IOPS, size,
//! drive count) tuples with priorities. The matrix is immutable after load;
//! every filter and sort operator returns a fresh copy, so chained filters
//! compose in any order.

mod loader;

pub use loader::{load_matrix, parse_matrix};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// Matrix Row
// =============================================================================

/// One feasible drive configuration band.
///
/// `priority` orders rows for the planner: lower value wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StorageDecisionMatrixRow {
    /// IOPS this row is rated for.
    pub iops: u64,
    /// Lower bound of the IOPS band; when present together with `max_iops`,
    /// IOPS filtering uses range containment instead of `iops >= requested`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_iops: Option<u64>,
    /// Upper bound of the IOPS band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iops: Option<u64>,
    /// Smallest admissible drive size in GiB.
    pub min_size: u64,
    /// Largest admissible drive size in GiB.
    pub max_size: u64,
    /// Provider drive type, e.g. `gp3`, `Premium_LRS`, `pd-ssd`, `pv-20`.
    pub drive_type: String,
    /// Fewest drives of this type one instance may carry.
    pub instance_min_drives: u64,
    /// Most drives of this type one instance may carry.
    pub instance_max_drives: u64,
    /// Preference order, lower is preferred.
    pub priority: u32,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub instance_type: String,
    #[serde(default)]
    pub thin_provisioning: bool,
}

impl StorageDecisionMatrixRow {
    fn validate(&self) -> Result<()> {
        if self.min_size == 0 {
            return Err(Error::Configuration(format!(
                "matrix row for {}: minSize must be positive",
                self.drive_type
            )));
        }
        if self.min_size > self.max_size {
            return Err(Error::Configuration(format!(
                "matrix row for {}: minSize {} exceeds maxSize {}",
                self.drive_type, self.min_size, self.max_size
            )));
        }
        if self.instance_min_drives == 0 || self.instance_min_drives > self.instance_max_drives {
            return Err(Error::Configuration(format!(
                "matrix row for {}: drive count range [{}, {}] is invalid",
                self.drive_type, self.instance_min_drives, self.instance_max_drives
            )));
        }
        if let (Some(lo), Some(hi)) = (self.min_iops, self.max_iops) {
            if lo > hi {
                return Err(Error::Configuration(format!(
                    "matrix row for {}: minIops {} exceeds maxIops {}",
                    self.drive_type, lo, hi
                )));
            }
        }
        Ok(())
    }

    /// Whether the row is rated for at least `iops`.
    ///
    /// Exact-match semantics when the band bounds are absent, range
    /// containment when present.
    pub fn admits_iops(&self, iops: u64) -> bool {
        match (self.min_iops, self.max_iops) {
            (Some(lo), Some(hi)) => lo <= iops && iops <= hi,
            _ => self.iops >= iops,
        }
    }
}

// =============================================================================
// Matrix
// =============================================================================

/// Immutable, ordered collection of decision rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StorageDecisionMatrix {
    pub rows: Vec<StorageDecisionMatrixRow>,
}

impl StorageDecisionMatrix {
    pub fn new(rows: Vec<StorageDecisionMatrixRow>) -> Result<Self> {
        let matrix = Self { rows };
        matrix.validate()?;
        Ok(matrix)
    }

    /// Validate every row's internal bounds.
    pub fn validate(&self) -> Result<()> {
        for row in &self.rows {
            row.validate()?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Rows matching `drive_type`; all rows when `drive_type` is empty.
    pub fn filter_by_drive_type(&self, drive_type: &str) -> Self {
        let rows = self
            .rows
            .iter()
            .filter(|r| drive_type.is_empty() || r.drive_type == drive_type)
            .cloned()
            .collect();
        Self { rows }
    }

    /// Rows rated for at least `iops` (or containing `iops` in their band).
    pub fn filter_by_iops(&self, iops: u64) -> Self {
        let rows = self
            .rows
            .iter()
            .filter(|r| r.admits_iops(iops))
            .cloned()
            .collect();
        Self { rows }
    }

    /// Rows whose size band contains `size` GiB.
    pub fn filter_by_drive_size(&self, size_gib: u64) -> Self {
        let rows = self
            .rows
            .iter()
            .filter(|r| r.min_size <= size_gib && size_gib <= r.max_size)
            .cloned()
            .collect();
        Self { rows }
    }

    /// Rows whose per-instance drive count range contains `count`.
    pub fn filter_by_drive_count(&self, count: u64) -> Self {
        let rows = self
            .rows
            .iter()
            .filter(|r| r.instance_min_drives <= count && count <= r.instance_max_drives)
            .cloned()
            .collect();
        Self { rows }
    }

    /// Rows scoped to `region`; rows with no region always survive.
    pub fn filter_by_region(&self, region: &str) -> Self {
        let rows = self
            .rows
            .iter()
            .filter(|r| region.is_empty() || r.region.is_empty() || r.region == region)
            .cloned()
            .collect();
        Self { rows }
    }

    /// Ascending by rated IOPS. Stable.
    pub fn sort_by_iops(&self) -> Self {
        let mut rows = self.rows.clone();
        rows.sort_by_key(|r| r.iops);
        Self { rows }
    }

    /// Ascending by priority (lower value first). Stable with respect to a
    /// prior IOPS ordering.
    pub fn sort_by_priority(&self) -> Self {
        let mut rows = self.rows.clone();
        rows.sort_by_key(|r| r.priority);
        Self { rows }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn row(
        drive_type: &str,
        iops: u64,
        min_size: u64,
        max_size: u64,
        max_drives: u64,
        priority: u32,
    ) -> StorageDecisionMatrixRow {
        StorageDecisionMatrixRow {
            iops,
            min_iops: None,
            max_iops: None,
            min_size,
            max_size,
            drive_type: drive_type.to_string(),
            instance_min_drives: 1,
            instance_max_drives: max_drives,
            priority,
            region: String::new(),
            instance_type: String::new(),
            thin_provisioning: false,
        }
    }

    fn sample() -> StorageDecisionMatrix {
        StorageDecisionMatrix::new(vec![
            row("gp3", 3000, 1, 16384, 8, 1),
            row("io1", 10000, 4, 16384, 8, 2),
            row("gp2", 1500, 1, 16384, 8, 0),
        ])
        .unwrap()
    }

    #[test]
    fn test_filter_by_drive_type() {
        let m = sample();
        assert_eq!(m.filter_by_drive_type("gp3").len(), 1);
        // Empty type keeps everything
        assert_eq!(m.filter_by_drive_type("").len(), 3);
        assert_eq!(m.filter_by_drive_type("absent").len(), 0);
        // The source is never mutated
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn test_filter_by_iops_exact_match() {
        let m = sample();
        assert_eq!(m.filter_by_iops(2000).len(), 2); // gp3, io1
        assert_eq!(m.filter_by_iops(20000).len(), 0);
    }

    #[test]
    fn test_filter_by_iops_range_containment() {
        let mut r = row("pd-ssd", 5000, 10, 1000, 4, 0);
        r.min_iops = Some(1000);
        r.max_iops = Some(8000);
        let m = StorageDecisionMatrix::new(vec![r]).unwrap();
        assert_eq!(m.filter_by_iops(1000).len(), 1);
        assert_eq!(m.filter_by_iops(8000).len(), 1);
        assert_eq!(m.filter_by_iops(999).len(), 0);
        assert_eq!(m.filter_by_iops(8001).len(), 0);
    }

    #[test]
    fn test_filter_by_size_and_count() {
        let m = sample();
        assert_eq!(m.filter_by_drive_size(3).len(), 2); // io1 needs >= 4
        assert_eq!(m.filter_by_drive_count(9).len(), 0);
        assert_eq!(m.filter_by_drive_count(1).len(), 3);
    }

    #[test]
    fn test_sort_by_priority_stable_after_iops() {
        let m = StorageDecisionMatrix::new(vec![
            row("b", 2000, 1, 100, 1, 1),
            row("a", 1000, 1, 100, 1, 1),
            row("c", 3000, 1, 100, 1, 0),
        ])
        .unwrap();
        let sorted = m.sort_by_iops().sort_by_priority();
        let types: Vec<_> = sorted.rows.iter().map(|r| r.drive_type.as_str()).collect();
        // Priority first, ties keep the IOPS ordering
        assert_eq!(types, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_filter_chain_order_independence() {
        let m = sample();
        let a = m
            .filter_by_drive_type("gp3")
            .filter_by_iops(2000)
            .filter_by_drive_size(100);
        let b = m
            .filter_by_drive_size(100)
            .filter_by_iops(2000)
            .filter_by_drive_type("gp3");
        assert_eq!(a, b);

        let c = m.filter_by_drive_count(2).filter_by_iops(1500);
        let d = m.filter_by_iops(1500).filter_by_drive_count(2);
        assert_eq!(c, d);
    }

    #[test]
    fn test_validation_rejects_inverted_bounds() {
        let bad = row("gp3", 3000, 100, 10, 8, 1);
        assert!(StorageDecisionMatrix::new(vec![bad]).is_err());

        let mut bad = row("gp3", 3000, 10, 100, 8, 1);
        bad.instance_min_drives = 4;
        bad.instance_max_drives = 2;
        assert!(StorageDecisionMatrix::new(vec![bad]).is_err());
    }
}
