//! Byte-range partitioning for multipart uploads

use crate::presign::MAX_PART_NUMBER;

/// One byte range of the source, uploaded as a single part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub part_number: u32,
    pub offset: u64,
    pub len: u64,
}

impl PartRange {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Effective part size for an object of `total` bytes
///
/// The requested size is raised to the storage minimum, then raised again
/// until the object fits in the part-number space.
pub fn effective_part_size(total: u64, part_size: u64, min_part_size: u64) -> u64 {
    let mut size = part_size.max(min_part_size).max(1);
    let max_parts = MAX_PART_NUMBER as u64;
    if total.div_ceil(size) > max_parts {
        size = total.div_ceil(max_parts);
    }
    size
}

/// Split `total` bytes into ordered parts
///
/// Every part except the last is exactly the effective part size; the last
/// carries the remainder. An empty source still yields one empty part.
pub fn plan_parts(total: u64, part_size: u64, min_part_size: u64) -> Vec<PartRange> {
    let size = effective_part_size(total, part_size, min_part_size);

    if total == 0 {
        return vec![PartRange {
            part_number: 1,
            offset: 0,
            len: 0,
        }];
    }

    let mut parts = Vec::with_capacity(total.div_ceil(size) as usize);
    let mut offset = 0;
    let mut part_number = 1;
    while offset < total {
        let len = size.min(total - offset);
        parts.push(PartRange {
            part_number,
            offset,
            len,
        });
        offset += len;
        part_number += 1;
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_twelve_mib_with_five_mib_minimum() {
        let parts = plan_parts(12 * MIB, 5 * MIB, 5 * MIB);
        let sizes: Vec<u64> = parts.iter().map(|p| p.len).collect();
        assert_eq!(sizes, vec![5 * MIB, 5 * MIB, 2 * MIB]);
        assert_eq!(
            parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_requested_size_clamped_to_minimum() {
        let parts = plan_parts(12 * MIB, MIB, 5 * MIB);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len, 5 * MIB);
    }

    #[test]
    fn test_parts_reconstruct_length() {
        for total in [1, 5 * MIB - 1, 5 * MIB, 5 * MIB + 1, 37 * MIB + 12345] {
            let parts = plan_parts(total, 8 * MIB, 5 * MIB);
            let mut expected_offset = 0;
            for (i, part) in parts.iter().enumerate() {
                assert_eq!(part.offset, expected_offset);
                assert_eq!(part.part_number, i as u32 + 1);
                if i + 1 < parts.len() {
                    assert!(part.len >= 5 * MIB);
                }
                expected_offset = part.end();
            }
            assert_eq!(expected_offset, total);
        }
    }

    #[test]
    fn test_huge_object_fits_part_limit() {
        let total = 100_000 * 5 * MIB;
        let parts = plan_parts(total, 5 * MIB, 5 * MIB);
        assert!(parts.len() <= MAX_PART_NUMBER as usize);
        assert_eq!(parts.last().unwrap().end(), total);
    }

    #[test]
    fn test_empty_source_is_one_empty_part() {
        let parts = plan_parts(0, 5 * MIB, 5 * MIB);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].len, 0);
    }
}
