//! Cluster bitmap: one bit per filesystem cluster, set when the cluster was
//! observed to be all zero.
//!
//! The map is written concurrently from IO completion contexts during the
//! analysis phase (atomic bit-set, no bit is ever set twice) and read
//! sequentially afterwards by the range coalescer. Readers during the
//! marking phase are not guaranteed a consistent snapshot; the two phases
//! are separated by an engine drain.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Result, SparseError};

/// Bits per storage word.
const WORD_BITS: u64 = 32;

pub struct ClusterMap {
    file_size: u64,
    /// log2 of the cluster size.
    shift: u32,
    words: Vec<AtomicU32>,
}

impl ClusterMap {
    /// Allocates a map covering `file_size` bytes at `cluster_size`
    /// granularity.
    ///
    /// `cluster_size` must be a power of two ≥ 2. The bit storage is
    /// `(⌊file_size / cluster_size⌋ / 32 + 1)` 32-bit words, which covers
    /// the trailing runt cluster as well. Allocation failure reports
    /// `OutOfMemory`; on 32-bit hosts a map too large for the address space
    /// is refused the same way.
    pub fn allocate(cluster_size: u64, file_size: u64) -> Result<ClusterMap> {
        if cluster_size < 2 || !cluster_size.is_power_of_two() {
            return Err(SparseError::InvalidArgument(
                "cluster size must be a power of two >= 2",
            ));
        }
        let shift = cluster_size.trailing_zeros();

        let num_words = (file_size >> shift) / WORD_BITS + 1;
        let num_words =
            usize::try_from(num_words).map_err(|_| SparseError::OutOfMemory)?;

        let mut words = Vec::new();
        words
            .try_reserve_exact(num_words)
            .map_err(|_| SparseError::OutOfMemory)?;
        words.resize_with(num_words, || AtomicU32::new(0));

        Ok(ClusterMap {
            file_size,
            shift,
            words,
        })
    }

    /// File size the map was allocated for.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Cluster size the map was allocated for.
    pub fn cluster_size(&self) -> u64 {
        1u64 << self.shift
    }

    /// Number of clusters covered, counting a trailing runt as one.
    pub fn num_clusters(&self) -> u64 {
        let whole = self.file_size >> self.shift;
        if self.file_size & (self.cluster_size() - 1) != 0 {
            whole + 1
        } else {
            whole
        }
    }

    /// Marks the cluster containing `byte_offset` as all-zero.
    ///
    /// `byte_offset` must be cluster-aligned and below the file size. The
    /// bit-set is atomic on the containing word, so completion contexts may
    /// call this concurrently.
    pub fn mark_zero(&self, byte_offset: u64) {
        debug_assert_eq!(byte_offset & (self.cluster_size() - 1), 0);
        debug_assert!(byte_offset < self.file_size);

        let bit = byte_offset >> self.shift;
        self.words[(bit / WORD_BITS) as usize]
            .fetch_or(1 << (bit % WORD_BITS), Ordering::Relaxed);
    }

    /// Returns whether `cluster` was marked all-zero.
    pub fn is_zero(&self, cluster: u64) -> bool {
        let word = self.words[(cluster / WORD_BITS) as usize].load(Ordering::Relaxed);
        word & (1 << (cluster % WORD_BITS)) != 0
    }

    /// Writes a diagnostic grid of the map to `w`.
    ///
    /// One digit per cluster (`0` = zero cluster, `1` = data cluster),
    /// grouped by four with a byte-offset label every sixteen groups. The
    /// trailing runt cluster is included.
    pub fn print(&self, w: &mut dyn Write) -> io::Result<()> {
        write!(
            w,
            "{:<18} Cluster size = {}, 0 = empty cluster, 1 = data cluster",
            "File Offset",
            self.cluster_size()
        )?;

        let mut groups: u64 = 0;
        for i in 0..self.num_clusters() {
            if groups % 16 == 0 && i % 4 == 0 {
                write!(w, "\n0x{:016X}", i << self.shift)?;
            }
            if i % 4 == 0 {
                groups += 1;
                write!(w, " ")?;
            }
            write!(w, "{}", if self.is_zero(i) { "0" } else { "1" })?;
        }
        writeln!(w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allocate_rejects_non_power_of_two() {
        assert!(matches!(
            ClusterMap::allocate(0, 4096),
            Err(SparseError::InvalidArgument(_))
        ));
        assert!(matches!(
            ClusterMap::allocate(1, 4096),
            Err(SparseError::InvalidArgument(_))
        ));
        assert!(matches!(
            ClusterMap::allocate(3000, 4096),
            Err(SparseError::InvalidArgument(_))
        ));
    }

    #[test]
    fn allocate_accepts_minimum_power_of_two() {
        let map = ClusterMap::allocate(2, 10).unwrap();
        assert_eq!(map.cluster_size(), 2);
        assert_eq!(map.num_clusters(), 5);
    }

    #[test]
    fn mark_and_test_roundtrip() {
        let map = ClusterMap::allocate(4096, 64 * 4096).unwrap();
        for k in [0u64, 1, 31, 32, 33, 63] {
            assert!(!map.is_zero(k));
            map.mark_zero(k * 4096);
            assert!(map.is_zero(k), "cluster {k} should be marked");
        }
        // Neighbours stay clear.
        assert!(!map.is_zero(2));
        assert!(!map.is_zero(30));
    }

    #[test]
    fn runt_cluster_is_addressable() {
        // 9000 bytes at 4096 clusters: two whole clusters plus a runt.
        let map = ClusterMap::allocate(4096, 9000).unwrap();
        assert_eq!(map.num_clusters(), 3);
        map.mark_zero(8192);
        assert!(map.is_zero(2));
    }

    #[test]
    fn concurrent_marks_are_all_observed() {
        let map = Arc::new(ClusterMap::allocate(4096, 1024 * 4096).unwrap());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                // Each thread marks a disjoint residue class; all bits in
                // every word end up contended.
                let mut k = t;
                while k < 1024 {
                    map.mark_zero(k * 4096);
                    k += 4;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for k in 0..1024u64 {
            assert!(map.is_zero(k), "cluster {k} lost its mark");
        }
    }

    #[test]
    fn print_emits_offset_labels_and_digits() {
        let map = ClusterMap::allocate(4096, 8 * 4096).unwrap();
        map.mark_zero(0);
        map.mark_zero(4 * 4096);

        let mut out = Vec::new();
        map.print(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("File Offset"));
        assert!(text.contains("Cluster size = 4096"));
        assert!(text.contains("0x0000000000000000"));
        // Clusters 0..8: 0 and 4 marked zero, rest are data.
        assert!(text.contains("0111 0111"));
    }

    #[test]
    fn print_includes_runt_digit() {
        let map = ClusterMap::allocate(4096, 4096 + 100).unwrap();
        map.mark_zero(4096);

        let mut out = Vec::new();
        map.print(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        // One row: offset label, then a single group holding the whole
        // cluster (data) and the runt cluster (zero).
        let row = text.lines().last().unwrap();
        let mut tokens = row.split_whitespace();
        assert_eq!(tokens.next(), Some("0x0000000000000000"));
        assert_eq!(tokens.next(), Some("10"));
        assert_eq!(map.num_clusters(), 2);
    }
}
