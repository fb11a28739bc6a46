//! arcflow CLI - compress G-code linear moves into arcs
//!
//! Usage:
//!   arcflow-cli input.gcode -o output.gcode [options]
//!   arcflow-cli input.gcode --config welder.json
//!   arcflow-cli input.gcode --resolution-mm 0.03 --allow-3d-arcs

use anyhow::{bail, Context, Result};
use arcflow::{Welder, WelderConfig};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, LevelFilter};
use std::path::PathBuf;

/// Compress runs of G0/G1 moves into G2/G3 arcs within a geometric tolerance
#[derive(Parser, Debug)]
#[command(name = "arcflow-cli")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input G-code file
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output G-code file (default: <input>.arc.gcode)
    #[arg(short, long, value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// Welder configuration file (JSON); explicit flags override it
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Maximum deviation from the source path in mm
    #[arg(long)]
    resolution_mm: Option<f64>,

    /// Relative per-segment length tolerance (0-1)
    #[arg(long)]
    path_tolerance_percent: Option<f64>,

    /// Reject arcs with a radius above this (mm)
    #[arg(long)]
    max_radius_mm: Option<f64>,

    /// Firmware interpolation floor: minimum segments per arc (0 disables)
    #[arg(long)]
    min_arc_segments: Option<u32>,

    /// Firmware interpolation segment length in mm (0 disables)
    #[arg(long)]
    mm_per_arc_segment: Option<f64>,

    /// Treat G90/G91 as also switching the extruder mode
    #[arg(long)]
    g90_influences_extruder: bool,

    /// Permit helical arcs with monotone Z
    #[arg(long)]
    allow_3d_arcs: bool,

    /// Emit arcs at the highest precision observed in the source
    #[arg(long)]
    allow_dynamic_precision: bool,

    /// Decimal places for X/Y/Z/I/J in emitted arcs
    #[arg(long)]
    default_xyz_precision: Option<u8>,

    /// Decimal places for E in emitted arcs
    #[arg(long)]
    default_e_precision: Option<u8>,

    /// Upper bound on run length (downstream parser buffer size)
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Print the segment-length histogram after processing
    #[arg(long)]
    stats: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    /// Resolve the welder configuration: file first, explicit flags on top.
    fn build_config(&self) -> Result<WelderConfig> {
        let mut config = match &self.config {
            Some(path) => WelderConfig::from_file(path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?,
            None => WelderConfig::default(),
        };

        if let Some(v) = self.resolution_mm {
            config.resolution_mm = v;
        }
        if let Some(v) = self.path_tolerance_percent {
            config.path_tolerance_percent = v;
        }
        if let Some(v) = self.max_radius_mm {
            config.max_radius_mm = v;
        }
        if let Some(v) = self.min_arc_segments {
            config.min_arc_segments = v;
        }
        if let Some(v) = self.mm_per_arc_segment {
            config.mm_per_arc_segment = v;
        }
        if self.g90_influences_extruder {
            config.g90_influences_extruder = true;
        }
        if self.allow_3d_arcs {
            config.allow_3d_arcs = true;
        }
        if self.allow_dynamic_precision {
            config.allow_dynamic_precision = true;
        }
        if let Some(v) = self.default_xyz_precision {
            config.default_xyz_precision = v;
        }
        if let Some(v) = self.default_e_precision {
            config.default_e_precision = v;
        }
        if let Some(v) = self.buffer_size {
            config.buffer_size = v;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let config = cli.build_config()?;

    let output_path = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.input.with_extension("arc.gcode"));
    if output_path == cli.input {
        bail!("Output path must differ from the input path");
    }

    info!("Source: {}", cli.input.display());
    info!("Target: {}", output_path.display());

    let source_size = std::fs::metadata(&cli.input)
        .with_context(|| format!("Failed to read input file: {}", cli.input.display()))?
        .len();

    let progress = ProgressBar::new(source_size);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    progress.set_message("Welding arcs...");

    let mut welder = Welder::new(config);
    let bar = progress.clone();
    let result = welder
        .process_with_callback(&cli.input, &output_path, move |p| {
            bar.set_position(p.source_file_position);
            bar.set_message(format!(
                "{} arcs, {} points compressed",
                p.arcs_created, p.points_compressed
            ));
            true
        })
        .context("Welding failed")?;

    progress.finish_and_clear();

    let p = &result.progress;
    println!("Welding complete!");
    println!("  Output: {}", output_path.display());
    println!(
        "  Lines: {} ({} gcodes)",
        p.lines_processed, p.gcodes_processed
    );
    println!("  Arcs created: {}", p.arcs_created);
    println!("  Points compressed: {}", p.points_compressed);
    if p.num_firmware_compensations > 0 {
        println!(
            "  Firmware compensations: {}",
            p.num_firmware_compensations
        );
    }
    println!(
        "  Size: {} -> {} bytes ({:.1}% smaller, ratio {:.2})",
        p.source_file_size, p.target_file_size, p.compression_percent, p.compression_ratio
    );
    println!("  Elapsed: {:.2}s", p.seconds_elapsed);

    if cli.stats {
        println!();
        println!("Segment statistics:");
        println!("{}", p.segment_statistics);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flag_overlay() {
        let cli = Cli::parse_from([
            "arcflow-cli",
            "in.gcode",
            "--resolution-mm",
            "0.02",
            "--allow-3d-arcs",
        ]);
        let config = cli.build_config().unwrap();
        assert!((config.resolution_mm - 0.02).abs() < 1e-12);
        assert!(config.allow_3d_arcs);
        // Untouched values stay at their defaults.
        assert_eq!(config.buffer_size, 1000);
    }
}
