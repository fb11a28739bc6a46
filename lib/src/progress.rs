//! Progress reporting and final results.

use std::fmt;

use crate::stats::SegmentStatistics;

/// A snapshot of welding progress, handed to the progress callback at
/// bounded intervals and returned with the final result.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    /// Source lines consumed so far.
    pub lines_processed: u64,
    /// Lines that carried a command.
    pub gcodes_processed: u64,
    /// Motion lines replaced by arcs.
    pub points_compressed: u64,
    /// Arc commands emitted.
    pub arcs_created: u64,
    /// Arcs accepted under the tightened firmware-compensation demand.
    pub num_firmware_compensations: u32,
    /// Byte position in the source file.
    pub source_file_position: u64,
    /// Total source size in bytes (0 when unknown, e.g. piped input).
    pub source_file_size: u64,
    /// Bytes written to the target so far.
    pub target_file_size: u64,
    /// 0-100, derived from byte positions.
    pub percent_complete: f64,
    /// Wall-clock seconds since processing started.
    pub seconds_elapsed: f64,
    /// Estimated seconds to completion at the current byte rate.
    pub seconds_remaining: f64,
    /// `source_bytes / target_bytes`.
    pub compression_ratio: f64,
    /// `(1 - target/source) * 100`.
    pub compression_percent: f64,
    /// Segment-length histogram snapshot.
    pub segment_statistics: SegmentStatistics,
}

impl Progress {
    /// Fill in the byte-derived ratios from the position fields.
    pub(crate) fn finish_ratios(&mut self) {
        if self.source_file_size > 0 {
            self.percent_complete =
                self.source_file_position as f64 / self.source_file_size as f64 * 100.0;
        }
        if self.source_file_position > 0 && self.target_file_size > 0 {
            self.compression_ratio =
                self.source_file_position as f64 / self.target_file_size as f64;
            self.compression_percent =
                (1.0 - self.target_file_size as f64 / self.source_file_position as f64) * 100.0;
        }
        if self.seconds_elapsed > 0.0 && self.source_file_position > 0 {
            let bytes_per_second = self.source_file_position as f64 / self.seconds_elapsed;
            let remaining = self
                .source_file_size
                .saturating_sub(self.source_file_position);
            self.seconds_remaining = remaining as f64 / bytes_per_second;
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.1}% complete, {:.1}s elapsed, {} lines, {} arcs, {} points compressed, \
             compression ratio {:.2}",
            self.percent_complete,
            self.seconds_elapsed,
            self.lines_processed,
            self.arcs_created,
            self.points_compressed,
            self.compression_ratio
        )
    }
}

/// Outcome of one welding pass.
#[derive(Debug, Clone)]
pub struct WeldResult {
    /// The full input was processed and written.
    pub success: bool,
    /// The progress callback requested cancellation; `success` is false and
    /// the target contains only fully-committed material.
    pub cancelled: bool,
    /// Final progress snapshot.
    pub progress: Progress,
    /// Optional human-readable detail.
    pub message: Option<String>,
}
