//! Range coalescing: turns the zero-cluster bitmap into the minimal batch of
//! deallocate requests.
//!
//! Adjacent zero clusters collapse into one `[start, end)` range; runs
//! shorter than the caller's threshold are skipped. A trailing runt that was
//! marked zero extends the final run by its byte count, but a runt on its
//! own is never emitted: deallocating less than one cluster frees nothing.

use crate::cluster_map::ClusterMap;

/// A half-open byte range `[start, end)` to hand to the deallocate ioctl.
/// `start` is always cluster-aligned; `end` is byte-aligned only when a runt
/// extends the final range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroRange {
    pub start: u64,
    pub end: u64,
}

impl ZeroRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Scans `map` and emits maximal runs of zero clusters as byte ranges.
///
/// `min_run_clusters` suppresses runs shorter than the given cluster count
/// (1 emits every run). Only whole clusters count toward the threshold; runt
/// bytes extend the final range but do not satisfy it.
pub fn coalesce_zero_ranges(
    map: &ClusterMap,
    cluster_size: u64,
    file_size: u64,
    min_run_clusters: u64,
) -> Vec<ZeroRange> {
    let num_clusters = file_size / cluster_size;
    let mut ranges = Vec::new();
    let mut first: Option<u64> = None;

    for i in 0..num_clusters {
        if map.is_zero(i) {
            if first.is_none() {
                first = Some(i);
            }
        } else {
            if let Some(f) = first {
                if i - f >= min_run_clusters {
                    ranges.push(ZeroRange {
                        start: f * cluster_size,
                        end: i * cluster_size,
                    });
                }
            }
            first = None;
        }
    }

    // A marked runt extends the run that reaches end-of-file; a solitary
    // runt is not worth zeroing by itself.
    let mut runt_bytes = file_size % cluster_size;
    if runt_bytes != 0 && !map.is_zero(num_clusters) {
        runt_bytes = 0;
    }
    if let Some(f) = first {
        if num_clusters - f >= min_run_clusters {
            ranges.push(ZeroRange {
                start: f * cluster_size,
                end: num_clusters * cluster_size + runt_bytes,
            });
        }
    }

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster_map::ClusterMap;

    const C: u64 = 4096;

    fn map_with_zero_clusters(file_size: u64, zero_clusters: &[u64]) -> ClusterMap {
        let map = ClusterMap::allocate(C, file_size).unwrap();
        for &k in zero_clusters {
            map.mark_zero(k * C);
        }
        map
    }

    #[test]
    fn all_zero_one_mib_is_one_range() {
        let size = 1024 * 1024;
        let zeros: Vec<u64> = (0..size / C).collect();
        let map = map_with_zero_clusters(size, &zeros);
        let ranges = coalesce_zero_ranges(&map, C, size, 1);
        assert_eq!(ranges, vec![ZeroRange { start: 0, end: size }]);
    }

    #[test]
    fn dense_data_emits_nothing() {
        let size = 12288;
        let map = map_with_zero_clusters(size, &[]);
        assert!(coalesce_zero_ranges(&map, C, size, 1).is_empty());
    }

    #[test]
    fn alternating_clusters_emit_singleton_ranges() {
        // Even clusters zero, odd clusters data, 32 KiB.
        let size = 32 * 1024;
        let map = map_with_zero_clusters(size, &[0, 2, 4, 6]);
        let ranges = coalesce_zero_ranges(&map, C, size, 1);
        assert_eq!(
            ranges,
            vec![
                ZeroRange { start: 0, end: 4096 },
                ZeroRange { start: 8192, end: 12288 },
                ZeroRange { start: 16384, end: 20480 },
                ZeroRange { start: 24576, end: 28672 },
            ]
        );
    }

    #[test]
    fn solitary_runt_is_dropped() {
        // 6000 bytes: cluster 0 is data, the 1904-byte runt is zero.
        let size = 6000;
        let map = ClusterMap::allocate(C, size).unwrap();
        map.mark_zero(4096); // runt cluster
        assert!(coalesce_zero_ranges(&map, C, size, 1).is_empty());
    }

    #[test]
    fn runt_extends_trailing_run() {
        // 9000 bytes, everything zero: one range covering the runt too.
        let size = 9000;
        let map = ClusterMap::allocate(C, size).unwrap();
        map.mark_zero(0);
        map.mark_zero(4096);
        map.mark_zero(8192);
        let ranges = coalesce_zero_ranges(&map, C, size, 1);
        assert_eq!(ranges, vec![ZeroRange { start: 0, end: 9000 }]);
    }

    #[test]
    fn unmarked_runt_leaves_run_cluster_aligned() {
        // Clusters 0..2 zero, runt contains data.
        let size = 2 * C + 100;
        let map = map_with_zero_clusters(size, &[0, 1]);
        let ranges = coalesce_zero_ranges(&map, C, size, 1);
        assert_eq!(ranges, vec![ZeroRange { start: 0, end: 2 * C }]);
    }

    #[test]
    fn min_run_threshold_suppresses_short_runs() {
        // Runs: [0,1] (len 2), [4] (len 1), [6,7,8] (len 3) in 10 clusters.
        let size = 10 * C;
        let map = map_with_zero_clusters(size, &[0, 1, 4, 6, 7, 8]);
        let ranges = coalesce_zero_ranges(&map, C, size, 2);
        assert_eq!(
            ranges,
            vec![
                ZeroRange { start: 0, end: 2 * C },
                ZeroRange { start: 6 * C, end: 9 * C },
            ]
        );
    }

    #[test]
    fn threshold_applies_to_trailing_run() {
        // Single trailing zero cluster under a threshold of 2: suppressed.
        let size = 4 * C;
        let map = map_with_zero_clusters(size, &[3]);
        assert!(coalesce_zero_ranges(&map, C, size, 2).is_empty());
    }

    #[test]
    fn coalescing_is_idempotent() {
        // Rebuilding a map from the emitted ranges and coalescing again
        // yields the same ranges.
        let size = 17 * C + 808;
        let map = map_with_zero_clusters(size, &[0, 1, 2, 5, 9, 10, 14, 15, 16]);
        map.mark_zero(17 * C); // zero runt attached to [14..17)
        let first = coalesce_zero_ranges(&map, C, size, 1);

        let rebuilt = ClusterMap::allocate(C, size).unwrap();
        for r in &first {
            let mut off = r.start;
            while off < r.end {
                rebuilt.mark_zero(off);
                off += C;
            }
        }
        let second = coalesce_zero_ranges(&rebuilt, C, size, 1);
        assert_eq!(first, second);
    }

    #[test]
    fn output_is_a_partition_of_maximal_runs() {
        let size = 64 * C;
        let zeros: Vec<u64> = (0..64).filter(|k| k % 5 != 0).collect();
        let map = map_with_zero_clusters(size, &zeros);
        let ranges = coalesce_zero_ranges(&map, C, size, 1);

        for pair in ranges.windows(2) {
            // Strictly ordered and non-adjacent (adjacent runs would have
            // been merged).
            assert!(pair[0].end < pair[1].start);
        }
        for r in &ranges {
            assert_eq!(r.start % C, 0);
            assert!(!r.is_empty());
            // Every covered cluster is marked; boundary clusters are not.
            let mut off = r.start;
            while off < r.end {
                assert!(map.is_zero(off / C));
                off += C;
            }
            if r.start > 0 {
                assert!(!map.is_zero(r.start / C - 1));
            }
        }
    }
}
