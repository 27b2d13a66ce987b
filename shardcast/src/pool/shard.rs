//! Contiguous partitioning of the unit list into worker shards.

use std::ops::Range;

/// Split `unit_count` units into `shard_count` contiguous ranges.
///
/// Every range but the last holds `unit_count / shard_count` units; the last
/// one absorbs the remainder. `shard_count` is clamped to `unit_count` so no
/// range is empty.
pub fn partition(unit_count: usize, shard_count: usize) -> Vec<Range<usize>> {
    let shard_count = shard_count.min(unit_count);
    if shard_count == 0 {
        return Vec::new();
    }

    let chunk = unit_count / shard_count;
    (0..shard_count)
        .map(|index| {
            let start = index * chunk;
            let end = if index + 1 == shard_count {
                unit_count
            } else {
                start + chunk
            };
            start..end
        })
        .collect()
}
