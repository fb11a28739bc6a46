//! # arcflow
//!
//! A G-code post-processor that compresses long runs of short linear moves
//! (G0/G1) into single circular arc commands (G2/G3).
//!
//! Slicers commonly approximate curved walls with hundreds of tiny line
//! segments. Replacing those runs with arcs reduces file size and the number
//! of motion commands the firmware has to execute per second, while keeping
//! every emitted path within a configurable geometric tolerance of the
//! original.
//!
//! The pipeline is strictly streaming: one input line is consumed, processed
//! through the modal position tracker and the arc accumulator, and written
//! (or buffered) before the next line is read. Everything that is not a
//! welded arc passes through byte-identical.
//!
//! ## Example
//!
//! ```rust,ignore
//! use arcflow::{Welder, WelderConfig};
//!
//! let config = WelderConfig::default().resolution_mm(0.05);
//! let mut welder = Welder::new(config);
//! let result = welder.process("input.gcode", "output.gcode")?;
//! println!("{} arcs created", result.progress.arcs_created);
//! ```

pub mod arc;
pub mod config;
pub mod geometry;
pub mod parser;
pub mod position;
mod progress;
pub mod stats;
pub mod welder;

pub use arc::{ArcAccumulator, ArcDirection, PrinterPoint};
pub use config::WelderConfig;
pub use geometry::{Circle, CircleFit, Point};
pub use parser::{parse_line, Parameter, ParsedCommand};
pub use position::{ExtruderState, Position, PositionTracker};
pub use progress::{Progress, WeldResult};
pub use stats::{SegmentStatistics, SEGMENT_STATISTIC_LENGTHS};
pub use welder::{UnwrittenCommand, Welder};

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for welding operations.
///
/// Cancellation through the progress callback is *not* an error; it is
/// reported through [`WeldResult::cancelled`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigFile(#[from] serde_json::Error),
}

/// The smallest run (in points, including the starting point) that can be
/// replaced by an arc. A circle is only determined by three points.
pub const DEFAULT_MIN_SEGMENTS: usize = 3;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
