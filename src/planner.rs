//! EXT4 output sizing.
//!
//! Strict mode clones the original image geometry exactly, which keeps
//! repacks bit-comparable with the source but fails hard when the edited
//! content no longer fits.  Flexible mode computes a fresh geometry from the
//! content plus a configurable free-space margin.

use crate::error::RomforgeError;

pub const BLOCK_SIZE: u64 = 4096;

/// Inodes held back when checking a strict fit, covering reserved inodes
/// such as lost+found.  The shipped tool variants disagreed on this value
/// (anywhere from 5 to 100); it is fixed here once.
pub const STRICT_INODE_MARGIN: u64 = 16;

/// Extra inodes budgeted in flexible mode beyond the counted files and
/// directories.
const FLEXIBLE_INODE_BUFFER: u64 = 64;

/// Filesystem metadata overhead estimate, as a percentage of content bytes.
const METADATA_OVERHEAD_PERCENT: u64 = 7;

/// Bytes per inode table entry used for the flexible size estimate.
const INODE_TABLE_ENTRY_SIZE: u64 = 256;

/// Default free-space margin for flexible mode.
pub const DEFAULT_OVERHEAD_PERCENT: u32 = 15;

/// Target geometry for one EXT4 build.  Computed once per repack, handed to
/// the image builder, then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizingPlan {
    pub block_count: u64,
    pub inode_count: u64,
    pub block_size: u64,
    /// Feature string of the source image, when cloning its geometry.
    pub source_features: Option<String>,
}

/// Reuses the original block and inode counts exactly.
///
/// Fails with [`RomforgeError::CapacityExceeded`] when the content cannot
/// fit; content exactly filling the image is still a success.
pub fn plan_strict(
    original_block_count: u64,
    original_inode_count: u64,
    content_size: u64,
    content_inode_count: u64,
) -> Result<SizingPlan, RomforgeError> {
    let available_bytes = original_block_count * BLOCK_SIZE;
    if content_size > available_bytes {
        return Err(RomforgeError::CapacityExceeded {
            required: content_size,
            available: available_bytes,
            unit: "bytes",
        });
    }

    let required_inodes = content_inode_count + STRICT_INODE_MARGIN;
    if required_inodes > original_inode_count {
        return Err(RomforgeError::CapacityExceeded {
            required: required_inodes,
            available: original_inode_count,
            unit: "inodes",
        });
    }

    Ok(SizingPlan {
        block_count: original_block_count,
        inode_count: original_inode_count,
        block_size: BLOCK_SIZE,
        source_features: None,
    })
}

/// Computes a fresh geometry sized to the content.
///
/// `overhead_percent` is the user-chosen free-space margin applied on top of
/// the content + metadata estimate.  The result grows monotonically with
/// both `content_size` and `overhead_percent` and is always at least one
/// block.
pub fn plan_flexible(
    content_size: u64,
    file_count: u64,
    dir_count: u64,
    overhead_percent: u32,
) -> SizingPlan {
    let inode_count = file_count + dir_count + FLEXIBLE_INODE_BUFFER;
    let metadata_overhead = content_size * METADATA_OVERHEAD_PERCENT / 100;
    let inode_table = inode_count * INODE_TABLE_ENTRY_SIZE;

    let base = content_size + metadata_overhead + inode_table;
    let total = base * (100 + u64::from(overhead_percent)) / 100;
    let block_count = total.div_ceil(BLOCK_SIZE).max(1);

    SizingPlan {
        block_count,
        inode_count,
        block_size: BLOCK_SIZE,
        source_features: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_exact_fit_succeeds() {
        // content exactly fills the block budget
        let plan = plan_strict(1000, 500, 1000 * BLOCK_SIZE, 100).unwrap();
        assert_eq!(plan.block_count, 1000);
        assert_eq!(plan.inode_count, 500);
        assert_eq!(plan.block_size, BLOCK_SIZE);
    }

    #[test]
    fn test_strict_capacity_rejection_reports_both_sizes() {
        // 1000 blocks of 4096 bytes cannot hold 5 MB
        let err = plan_strict(1000, 8192, 5_000_000, 100).unwrap_err();
        match err {
            RomforgeError::CapacityExceeded {
                required,
                available,
                unit,
            } => {
                assert_eq!(required, 5_000_000);
                assert_eq!(available, 4_096_000);
                assert_eq!(unit, "bytes");
            }
            other => panic!("expected CapacityExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_strict_inode_margin() {
        // margin pushes the requirement over the original inode count
        let err =
            plan_strict(1000, 100, 0, 100 - STRICT_INODE_MARGIN + 1).unwrap_err();
        assert!(matches!(
            err,
            RomforgeError::CapacityExceeded { unit: "inodes", .. }
        ));

        // right at the margin still fits
        assert!(plan_strict(1000, 100, 0, 100 - STRICT_INODE_MARGIN).is_ok());
    }

    #[test]
    fn test_flexible_rounds_up_to_block_boundary() {
        let plan = plan_flexible(1, 1, 0, 0);
        assert_eq!(plan.block_count, 1 + (FLEXIBLE_INODE_BUFFER + 1) * INODE_TABLE_ENTRY_SIZE / BLOCK_SIZE);
        assert_eq!(plan.block_count * BLOCK_SIZE % BLOCK_SIZE, 0);
        assert!(plan.block_count >= 1);
    }

    #[test]
    fn test_flexible_monotonic_in_content_size() {
        let mut previous = 0;
        for content in [0u64, 1, 4095, 4096, 1 << 20, 10 << 20, 1 << 30] {
            let plan = plan_flexible(content, 100, 10, DEFAULT_OVERHEAD_PERCENT);
            assert!(
                plan.block_count >= previous,
                "shrank at content_size={content}"
            );
            previous = plan.block_count;
        }
    }

    #[test]
    fn test_flexible_monotonic_in_overhead_percent() {
        let mut previous = 0;
        for percent in [0u32, 5, 10, 15, 20, 50, 100] {
            let plan = plan_flexible(50 << 20, 1000, 100, percent);
            assert!(plan.block_count >= previous, "shrank at percent={percent}");
            previous = plan.block_count;
        }
    }

    #[test]
    fn test_flexible_inode_budget() {
        let plan = plan_flexible(0, 120, 30, 10);
        assert_eq!(plan.inode_count, 120 + 30 + FLEXIBLE_INODE_BUFFER);
    }
}
