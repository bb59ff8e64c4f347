//! Decision-matrix YAML loader
//!
//! Matrices ship as YAML documents with a single `rows` list; field names are
//! lower-camel case and unknown fields are rejected.

use crate::error::Result;
use crate::matrix::StorageDecisionMatrix;
use std::path::Path;
use tracing::info;

/// Parse a matrix from YAML text and validate row bounds.
pub fn parse_matrix(yaml: &str) -> Result<StorageDecisionMatrix> {
    let matrix: StorageDecisionMatrix = serde_yaml::from_str(yaml)?;
    matrix.validate()?;
    Ok(matrix)
}

/// Load a matrix from a YAML file.
pub fn load_matrix(path: &Path) -> Result<StorageDecisionMatrix> {
    let text = std::fs::read_to_string(path)?;
    let matrix = parse_matrix(&text)?;
    info!(
        path = %path.display(),
        rows = matrix.len(),
        "loaded storage decision matrix"
    );
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
rows:
  - iops: 1100
    minSize: 256
    maxSize: 256
    driveType: Premium_LRS
    instanceMinDrives: 1
    instanceMaxDrives: 8
    priority: 0
  - iops: 5000
    minIops: 4000
    maxIops: 6000
    minSize: 1024
    maxSize: 1024
    driveType: Premium_LRS
    instanceMinDrives: 1
    instanceMaxDrives: 8
    priority: 0
    region: eastus
    thinProvisioning: false
"#;

    #[test]
    fn test_parse_sample() {
        let m = parse_matrix(SAMPLE).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.rows[0].drive_type, "Premium_LRS");
        assert_eq!(m.rows[1].min_iops, Some(4000));
        assert_eq!(m.rows[1].region, "eastus");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let bad = r#"
rows:
  - iops: 100
    minSize: 1
    maxSize: 10
    driveType: gp2
    instanceMinDrives: 1
    instanceMaxDrives: 2
    priority: 0
    surprise: true
"#;
        assert!(parse_matrix(bad).is_err());
    }

    #[test]
    fn test_invalid_bounds_rejected() {
        let bad = r#"
rows:
  - iops: 100
    minSize: 100
    maxSize: 10
    driveType: gp2
    instanceMinDrives: 1
    instanceMaxDrives: 2
    priority: 0
"#;
        assert!(parse_matrix(bad).is_err());
    }
}
