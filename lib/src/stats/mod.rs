//! Segment-length statistics.
//!
//! Tracks how the distribution of motion-segment lengths changes between the
//! source file and the welded output. Two parallel accumulators share one
//! set of bucket boundaries: *source* is updated when a motion line is first
//! consumed, *target* when a line reaches the output (either verbatim with
//! extrusion, or as a committed arc with the arc's length).
//!
//! The buckets are tuned for FDM toolpaths, where stutter-inducing segments
//! cluster well below one millimeter.

use std::fmt;

/// Bucket boundaries (mm) for the segment-length histogram.
pub const SEGMENT_STATISTIC_LENGTHS: [f64; 12] = [
    0.002, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 20.0, 50.0, 100.0,
];

/// Parallel source/target histogram of segment lengths.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentStatistics {
    boundaries: Vec<f64>,
    // One bucket below the first boundary, one between each pair, one above
    // the last.
    source_counts: Vec<u64>,
    target_counts: Vec<u64>,
    source_total: u64,
    target_total: u64,
}

impl Default for SegmentStatistics {
    fn default() -> Self {
        Self::new(&SEGMENT_STATISTIC_LENGTHS)
    }
}

impl SegmentStatistics {
    /// Create a histogram with the given bucket boundaries (ascending, mm).
    pub fn new(boundaries: &[f64]) -> Self {
        let buckets = boundaries.len() + 1;
        Self {
            boundaries: boundaries.to_vec(),
            source_counts: vec![0; buckets],
            target_counts: vec![0; buckets],
            source_total: 0,
            target_total: 0,
        }
    }

    fn bucket(&self, length: f64) -> usize {
        self.boundaries.partition_point(|b| *b <= length)
    }

    /// Record a segment consumed from the source.
    pub fn update_source(&mut self, length: f64) {
        let idx = self.bucket(length);
        self.source_counts[idx] += 1;
        self.source_total += 1;
    }

    /// Record a segment (or committed arc) reaching the target.
    pub fn update_target(&mut self, length: f64) {
        let idx = self.bucket(length);
        self.target_counts[idx] += 1;
        self.target_total += 1;
    }

    /// Total source segments recorded.
    pub fn source_total(&self) -> u64 {
        self.source_total
    }

    /// Total target segments recorded.
    pub fn target_total(&self) -> u64 {
        self.target_total
    }

    /// Source count for the bucket containing `length`.
    pub fn source_count_for(&self, length: f64) -> u64 {
        self.source_counts[self.bucket(length)]
    }

    /// Target count for the bucket containing `length`.
    pub fn target_count_for(&self, length: f64) -> u64 {
        self.target_counts[self.bucket(length)]
    }

    fn bucket_label(&self, idx: usize) -> String {
        if idx == 0 {
            format!("<= {:>7.3}", self.boundaries[0])
        } else if idx == self.boundaries.len() {
            format!(">= {:>7.3}", self.boundaries[idx - 1])
        } else {
            format!(
                "{:>6.3} to {:>7.3}",
                self.boundaries[idx - 1],
                self.boundaries[idx]
            )
        }
    }
}

impl fmt::Display for SegmentStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>18}  {:>9}  {:>9}  {:>8}",
            "Segment mm", "Source", "Target", "Change"
        )?;
        for idx in 0..self.source_counts.len() {
            let source = self.source_counts[idx];
            let target = self.target_counts[idx];
            if source == 0 && target == 0 {
                continue;
            }
            let change = if source > 0 {
                format!(
                    "{:+.1}%",
                    (target as f64 - source as f64) / source as f64 * 100.0
                )
            } else {
                "new".to_string()
            };
            writeln!(
                f,
                "{:>18}  {:>9}  {:>9}  {:>8}",
                self.bucket_label(idx),
                source,
                target,
                change
            )?;
        }
        write!(
            f,
            "{:>18}  {:>9}  {:>9}",
            "Total", self.source_total, self.target_total
        )
    }
}
