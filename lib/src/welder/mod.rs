//! The welder state machine.
//!
//! [`Welder`] drives the arc accumulator from a stream of G-code lines. It
//! is a two-state machine: *idle* (no open run) and *running* (a candidate
//! arc is growing). Every line is either
//!
//! - consumed into the open run and held in the unwritten buffer,
//! - written through verbatim, or
//! - the trigger for a *commit decision*: emit one G2/G3 replacing the
//!   buffered run, or flush the buffered lines unchanged.
//!
//! Output ordering is strict: non-arc lines appear exactly as and where they
//! did in the source; an arc line replaces its constituent lines at the
//! position of the last one. Processing is synchronous and single-threaded;
//! one line is fully handled and written or buffered before the next is
//! read.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::arc::{ArcAccumulator, PrinterPoint};
use crate::config::WelderConfig;
use crate::geometry::{approx_eq, Point};
use crate::parser::{parse_line, ParsedCommand};
use crate::position::PositionTracker;
use crate::progress::{Progress, WeldResult};
use crate::stats::SegmentStatistics;
use crate::Result;

/// Clock checks are amortized over batches of lines.
const LINES_PER_CLOCK_CHECK: u64 = 1000;

/// Minimum interval between progress notifications.
const NOTIFICATION_PERIOD: Duration = Duration::from_secs(1);

/// A consumed source line that has not yet been written or superseded by an
/// arc.
#[derive(Debug, Clone, PartialEq)]
pub struct UnwrittenCommand {
    /// Original line text.
    pub raw: String,
    /// Extracted comment, used for arc annotation.
    pub comment: String,
    /// Movement length of an extruding move (0 for non-extruding lines);
    /// feeds the target-side segment statistics on flush.
    pub extrusion_length: f64,
}

/// Streaming G-code arc compressor.
pub struct Welder {
    config: WelderConfig,
    arc: ArcAccumulator,
    tracker: PositionTracker,
    unwritten: VecDeque<UnwrittenCommand>,
    stats: SegmentStatistics,

    waiting_for_arc: bool,
    previous_feedrate: f64,
    previous_is_extruder_relative: bool,

    lines_processed: u64,
    gcodes_processed: u64,
    points_compressed: u64,
    arcs_created: u64,
    source_position: u64,
    source_size: u64,
    target_size: u64,
}

impl Welder {
    /// Create a welder with the given configuration.
    pub fn new(config: WelderConfig) -> Self {
        Self {
            arc: ArcAccumulator::new(&config),
            tracker: PositionTracker::new(config.g90_influences_extruder),
            unwritten: VecDeque::new(),
            stats: SegmentStatistics::default(),
            waiting_for_arc: false,
            previous_feedrate: -1.0,
            previous_is_extruder_relative: false,
            lines_processed: 0,
            gcodes_processed: 0,
            points_compressed: 0,
            arcs_created: 0,
            source_position: 0,
            source_size: 0,
            target_size: 0,
            config,
        }
    }

    /// Process a source file into a target file.
    pub fn process<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        source: P,
        target: Q,
    ) -> Result<WeldResult> {
        self.process_paths(source.as_ref(), target.as_ref(), None)
    }

    /// Process a source file into a target file, reporting progress through
    /// `callback`. A `false` return requests cooperative cancellation: the
    /// in-flight line is finished, the open run is committed or discarded
    /// per end-of-stream rules, buffers are flushed, and the result carries
    /// `cancelled = true`.
    pub fn process_with_callback<P: AsRef<Path>, Q: AsRef<Path>>(
        &mut self,
        source: P,
        target: Q,
        mut callback: impl FnMut(&Progress) -> bool,
    ) -> Result<WeldResult> {
        self.process_paths(source.as_ref(), target.as_ref(), Some(&mut callback))
    }

    fn process_paths(
        &mut self,
        source: &Path,
        target: &Path,
        callback: Option<&mut dyn FnMut(&Progress) -> bool>,
    ) -> Result<WeldResult> {
        let source_size = std::fs::metadata(source)?.len();
        let reader = BufReader::new(File::open(source)?);
        let mut writer = BufWriter::new(File::create(target)?);
        // Both files close on drop on every exit path.
        let result = self.process_streams(reader, &mut writer, source_size, callback)?;
        writer.flush()?;
        Ok(result)
    }

    /// Process from any buffered reader into any writer. `source_size` (in
    /// bytes; 0 when unknown) is only used for percent/ETA reporting.
    pub fn process_streams<R: BufRead, W: Write>(
        &mut self,
        mut reader: R,
        writer: &mut W,
        source_size: u64,
        mut callback: Option<&mut dyn FnMut(&Progress) -> bool>,
    ) -> Result<WeldResult> {
        self.config.validate()?;
        self.reset();
        self.source_size = source_size;

        info!(
            "welding: resolution_mm={}, path_tolerance_percent={}, max_radius_mm={}, \
             min_arc_segments={}, mm_per_arc_segment={}, g90_influences_extruder={}, \
             allow_3d_arcs={}, allow_dynamic_precision={}, default_xyz_precision={}, \
             default_e_precision={}, buffer_size={}",
            self.config.resolution_mm,
            self.config.path_tolerance_percent,
            self.config.max_radius_mm,
            self.config.min_arc_segments,
            self.config.mm_per_arc_segment,
            self.config.g90_influences_extruder,
            self.config.allow_3d_arcs,
            self.config.allow_dynamic_precision,
            self.config.default_xyz_precision,
            self.config.default_e_precision,
            self.config.buffer_size
        );

        let start = Instant::now();
        let mut next_update = start + NOTIFICATION_PERIOD;

        self.emit_header(writer)?;

        let mut continue_processing = self.notify(&mut callback, start);

        let mut line = String::new();
        while continue_processing {
            line.clear();
            let bytes = reader.read_line(&mut line)?;
            if bytes == 0 {
                break;
            }
            self.lines_processed += 1;
            self.source_position += bytes as u64;

            let cmd = parse_line(&line);
            let has_gcode = !cmd.is_empty();
            if has_gcode {
                self.gcodes_processed += 1;
            }

            self.process_gcode(writer, cmd, false, false)?;

            if has_gcode
                && self.lines_processed % LINES_PER_CLOCK_CHECK == 0
                && Instant::now() >= next_update
            {
                continue_processing = self.notify(&mut callback, start);
                next_update = Instant::now() + NOTIFICATION_PERIOD;
            }
        }
        let cancelled = !continue_processing;

        if self.waiting_for_arc {
            self.process_gcode(writer, ParsedCommand::default(), true, false)?;
        }
        self.flush_unwritten(writer)?;
        writer.flush()?;

        let progress = self.snapshot(start);
        self.notify(&mut callback, start);

        Ok(WeldResult {
            success: !cancelled,
            cancelled,
            progress,
            message: cancelled.then(|| "cancelled by progress callback".to_string()),
        })
    }

    /// Cumulative source lines consumed.
    pub fn lines_processed(&self) -> u64 {
        self.lines_processed
    }

    /// Cumulative arcs emitted.
    pub fn arcs_created(&self) -> u64 {
        self.arcs_created
    }

    fn reset(&mut self) {
        debug!("welder: resetting all tracking state");
        self.arc = ArcAccumulator::new(&self.config);
        self.tracker = PositionTracker::new(self.config.g90_influences_extruder);
        self.unwritten.clear();
        self.stats = SegmentStatistics::default();
        self.waiting_for_arc = false;
        self.previous_feedrate = -1.0;
        self.previous_is_extruder_relative = false;
        self.lines_processed = 0;
        self.gcodes_processed = 0;
        self.points_compressed = 0;
        self.arcs_created = 0;
        self.source_position = 0;
        self.source_size = 0;
        self.target_size = 0;
    }

    fn snapshot(&self, start: Instant) -> Progress {
        let mut progress = Progress {
            lines_processed: self.lines_processed,
            gcodes_processed: self.gcodes_processed,
            points_compressed: self.points_compressed,
            arcs_created: self.arcs_created,
            num_firmware_compensations: self.arc.get_num_firmware_compensations(),
            source_file_position: self.source_position,
            source_file_size: self.source_size,
            target_file_size: self.target_size,
            seconds_elapsed: start.elapsed().as_secs_f64(),
            segment_statistics: self.stats.clone(),
            ..Default::default()
        };
        progress.finish_ratios();
        progress
    }

    fn notify(
        &self,
        callback: &mut Option<&mut dyn FnMut(&Progress) -> bool>,
        start: Instant,
    ) -> bool {
        let progress = self.snapshot(start);
        match callback {
            Some(cb) => cb(&progress),
            None => {
                info!("{}", progress);
                true
            }
        }
    }

    fn write_line<W: Write>(&mut self, w: &mut W, text: &str) -> Result<()> {
        w.write_all(text.as_bytes())?;
        w.write_all(b"\n")?;
        self.target_size += text.len() as u64 + 1;
        Ok(())
    }

    fn emit_header<W: Write>(&mut self, w: &mut W) -> Result<()> {
        let lines = {
            let c = &self.config;
            let mut lines = vec![
                format!("; Postprocessed by arcflow v{}", crate::VERSION),
                "; Linear moves compressed into G2/G3 arcs".to_string(),
                format!("; resolution={:.2}mm", c.resolution_mm),
                format!("; path_tolerance={:.0}%", c.path_tolerance_percent * 100.0),
                format!("; max_radius={:.2}mm", c.max_radius_mm),
            ];
            if c.g90_influences_extruder {
                lines.push("; g90_influences_extruder=True".to_string());
            }
            if c.firmware_compensation_enabled() {
                lines.push("; firmware_compensation=True".to_string());
                lines.push(format!("; mm_per_arc_segment={:.2}mm", c.mm_per_arc_segment));
                lines.push(format!("; min_arc_segments={}", c.min_arc_segments));
            }
            if c.allow_3d_arcs {
                lines.push("; allow_3d_arcs=True".to_string());
            }
            if c.allow_dynamic_precision {
                lines.push("; allow_dynamic_precision=True".to_string());
            }
            lines.push(format!(
                "; default_xyz_precision={}",
                c.default_xyz_precision
            ));
            lines.push(format!("; default_e_precision={}", c.default_e_precision));
            lines.push(String::new());
            lines
        };
        for text in lines {
            self.write_line(w, &text)?;
        }
        Ok(())
    }

    /// Handle one parsed command. `is_end` runs the end-of-stream commit
    /// decision without consuming a command; `is_reprocess` marks the
    /// single re-issue of a command that terminated a run, so statistics
    /// are not counted twice.
    fn process_gcode<W: Write>(
        &mut self,
        w: &mut W,
        cmd: ParsedCommand,
        is_end: bool,
        is_reprocess: bool,
    ) -> Result<()> {
        if !is_end {
            self.tracker.update(&cmd);
        }
        let cur = self.tracker.current().clone();
        let prev = self.tracker.previous().clone();

        let has_e_changed = cur.extruder.is_extruding || cur.extruder.is_retracting;
        let mut movement_length = 0.0;
        if cur.has_xy_changed {
            movement_length = if self.config.allow_3d_arcs {
                Point::new(prev.x, prev.y, prev.z).distance_3d(&Point::new(cur.x, cur.y, cur.z))
            } else {
                Point::new(prev.x, prev.y, 0.0).distance_2d(&Point::new(cur.x, cur.y, 0.0))
            };
            if has_e_changed && movement_length > 0.0 && !is_reprocess {
                self.stats.update_source(movement_length);
            }
        }

        if self.config.allow_dynamic_precision && cmd.is_linear_move() {
            for p in &cmd.parameters {
                match p.letter {
                    'X' | 'Y' | 'Z' => self.arc.update_xyz_precision(p.decimals),
                    'E' => self.arc.update_e_precision(p.decimals),
                    _ => {}
                }
            }
        }

        let z_axis_ok = self.config.allow_3d_arcs || approx_eq(cur.z, prev.z, 1e-8);
        let eligible = !is_end
            && cmd.is_linear_move()
            && z_axis_ok
            && !cur.offsets_differ(&prev)
            && !cur.is_relative
            && cur.has_xy_changed
            && prev.is_xy_known()
            && (!self.waiting_for_arc
                || cur.extruder.is_extruding
                || (prev.extruder.is_retracting && cur.extruder.is_retracting))
            && cur.is_extruder_relative == prev.is_extruder_relative
            && (!self.waiting_for_arc || prev.f == cur.f)
            && (!self.waiting_for_arc || prev.feature_tag == cur.feature_tag);

        let mut arc_added = false;
        if eligible {
            if !self.waiting_for_arc {
                debug!("welder: starting candidate run from: {}", cmd.raw);
                self.previous_is_extruder_relative = prev.is_extruder_relative;
                self.flush_unwritten(w)?;
                // The previous position seeds the run. It is the terminus of
                // already-written output, so it carries no extrusion.
                self.arc
                    .try_add_point(PrinterPoint::new(prev.x, prev.y, prev.z, 0.0, 0.0));
            }

            let point = PrinterPoint::new(
                cur.x,
                cur.y,
                cur.z,
                cur.extruder.e_relative,
                movement_length,
            );
            arc_added = self.arc.try_add_point(point);
            if arc_added && !self.waiting_for_arc {
                self.waiting_for_arc = true;
                self.previous_feedrate = prev.f;
            }
        } else if !is_end && !cmd.is_empty() {
            debug!("welder: not arc-eligible: {}", cmd.raw);
        }

        // Commit decision: a rejected or non-eligible command terminates the
        // open run one way or the other. Blank no-comment lines are exempt.
        if !arc_added && (is_end || !(cmd.is_empty() && cmd.comment.is_empty())) {
            if self.arc.get_num_segments() < self.arc.min_segments() {
                if self.arc.get_num_segments() != 0 {
                    debug!("welder: not enough segments for an arc, dropping run");
                }
                self.waiting_for_arc = false;
                self.arc.clear();
            } else if self.waiting_for_arc {
                if self.arc.is_shape() {
                    self.points_compressed += (self.arc.get_num_segments() - 1) as u64;
                    self.arcs_created += 1;
                    let commit_feedrate = if is_end { cur.f } else { prev.f };
                    self.write_arc_gcodes(w, commit_feedrate, is_end)?;
                    if !is_end {
                        // Give the terminating command a chance to start a
                        // new run.
                        return self.process_gcode(w, cmd, false, true);
                    }
                    return Ok(());
                }
                debug!("welder: open run is not a valid arc, flushing as lines");
                self.arc.clear();
                self.waiting_for_arc = false;
            }
        }

        if is_end {
            return Ok(());
        }

        if self.waiting_for_arc || !arc_added {
            let extrusion_length = if has_e_changed { movement_length } else { 0.0 };
            self.unwritten.push_back(UnwrittenCommand {
                raw: cmd.raw,
                comment: cmd.comment,
                extrusion_length,
            });
        }
        if !self.waiting_for_arc {
            self.flush_unwritten(w)?;
        }
        Ok(())
    }

    /// Emit the accumulated run as one arc line: annotate, evict the
    /// superseded buffer tail, undo the terminating command, resolve the
    /// feedrate, write, account.
    fn write_arc_gcodes<W: Write>(
        &mut self,
        w: &mut W,
        current_feedrate: f64,
        is_end: bool,
    ) -> Result<()> {
        let comment = self.comment_for_arc();

        // All of the run's motion lines except the starting point are
        // superseded by the arc.
        let evict = self.arc.get_num_segments() - 1;
        assert!(
            self.unwritten.len() >= evict,
            "unwritten buffer underflow: cannot evict {} of {} entries",
            evict,
            self.unwritten.len()
        );
        for _ in 0..evict {
            self.unwritten.pop_back();
        }

        if !is_end {
            // The terminating command must not stay consumed into modal
            // state; it is re-processed after the arc is written.
            self.tracker.undo_last();
        }

        let feedrate =
            if self.previous_feedrate > 0.0 && self.previous_feedrate == current_feedrate {
                0.0
            } else {
                current_feedrate
            };

        let mut gcode = if self.previous_is_extruder_relative {
            self.arc.get_shape_gcode_relative(feedrate)
        } else {
            self.arc
                .get_shape_gcode_absolute(self.tracker.current().extruder.e, feedrate)
        };
        if !comment.is_empty() {
            gcode.push(';');
            gcode.push_str(&comment);
        }
        debug!(
            "welder: arc created from {} segments: {}",
            self.arc.get_num_segments(),
            gcode
        );

        // Anything still buffered precedes the run and keeps source order.
        self.flush_unwritten(w)?;
        self.stats.update_target(self.arc.get_shape_length());
        self.write_line(w, &gcode)?;

        self.waiting_for_arc = false;
        self.arc.clear();
        Ok(())
    }

    /// Concatenate the distinct comments of the lines the arc replaces,
    /// deduplicated adjacently and joined by ` - `.
    fn comment_for_arc(&self) -> String {
        let evict = self.arc.get_num_segments() - 1;
        let start = self.unwritten.len().saturating_sub(evict);
        let mut parts: Vec<&str> = Vec::new();
        for entry in self.unwritten.iter().skip(start) {
            if entry.comment.is_empty() {
                continue;
            }
            if parts.last() == Some(&entry.comment.as_str()) {
                continue;
            }
            parts.push(&entry.comment);
        }
        parts.join(" - ")
    }

    fn flush_unwritten<W: Write>(&mut self, w: &mut W) -> Result<()> {
        while let Some(entry) = self.unwritten.pop_front() {
            if entry.extrusion_length > 0.0 {
                self.stats.update_target(entry.extrusion_length);
            }
            self.write_line(w, &entry.raw)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn weld(config: WelderConfig, input: &str) -> (String, WeldResult) {
        let mut welder = Welder::new(config);
        let mut out = Vec::new();
        let result = welder
            .process_streams(Cursor::new(input), &mut out, input.len() as u64, None)
            .unwrap();
        (String::from_utf8(out).unwrap(), result)
    }

    fn weld_with_callback(
        config: WelderConfig,
        input: &str,
        mut callback: impl FnMut(&Progress) -> bool,
    ) -> (String, WeldResult) {
        let mut welder = Welder::new(config);
        let mut out = Vec::new();
        let result = welder
            .process_streams(
                Cursor::new(input),
                &mut out,
                input.len() as u64,
                Some(&mut callback),
            )
            .unwrap();
        (String::from_utf8(out).unwrap(), result)
    }

    fn arc_lines(output: &str) -> Vec<&str> {
        output
            .lines()
            .filter(|l| l.starts_with("G2 ") || l.starts_with("G3 "))
            .collect()
    }

    /// Chords of a circle around (cx, cy), with relative E proportional to
    /// chord length. Starts at `start_angle`; the caller must already be
    /// positioned there.
    fn chord_lines(
        cx: f64,
        cy: f64,
        r: f64,
        start_angle: f64,
        end_angle: f64,
        n: usize,
        e_per_mm: f64,
        extra: &str,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        let mut prev = (
            cx + r * start_angle.cos(),
            cy + r * start_angle.sin(),
        );
        for i in 1..=n {
            let t = i as f64 / n as f64;
            let a = start_angle + t * (end_angle - start_angle);
            let (x, y) = (cx + r * a.cos(), cy + r * a.sin());
            let len = ((x - prev.0).powi(2) + (y - prev.1).powi(2)).sqrt();
            lines.push(format!(
                "G1 X{:.3} Y{:.3} E{:.5}{}",
                x,
                y,
                e_per_mm * len,
                extra
            ));
            prev = (x, y);
        }
        lines
    }

    fn circle_test_input() -> String {
        let mut lines = vec![
            "G92 X50 Y30".to_string(),
            "M83".to_string(),
            "G1 F1500".to_string(),
        ];
        // 48 chords over 300 degrees of a radius-20 circle at (30, 30),
        // starting at angle 0 = (50, 30).
        lines.extend(chord_lines(
            30.0,
            30.0,
            20.0,
            0.0,
            300f64.to_radians(),
            48,
            0.03,
            "",
        ));
        lines.join("\n") + "\n"
    }

    #[test]
    fn test_square_passes_through() {
        let input = "G28\nG90\nM83\nG1 X0 Y0 F1200\nG1 X10 Y0 E0.3\nG1 X10 Y10 E0.3\nG1 X0 Y10 E0.3\nG1 X0 Y0 E0.3\n";
        let (output, result) = weld(WelderConfig::default(), input);
        assert!(arc_lines(&output).is_empty(), "square must not weld");
        for line in input.lines() {
            assert!(output.contains(line), "missing source line: {}", line);
        }
        assert_eq!(result.progress.arcs_created, 0);
        assert_eq!(result.progress.lines_processed, 8);
        assert_eq!(result.progress.gcodes_processed, 8);
        assert!(result.success);
    }

    #[test]
    fn test_circle_welds_to_single_arc() {
        let input = circle_test_input();
        let (output, result) = weld(WelderConfig::default(), input.as_str());

        let arcs = arc_lines(&output);
        assert_eq!(arcs.len(), 1, "expected one arc:\n{}", output);
        let arc = parse_line(arcs[0]);
        // Counter-clockwise sweep.
        assert_eq!(arc.command, "G3");

        // End point at 300 degrees.
        let (ex, ey) = (
            30.0 + 20.0 * 300f64.to_radians().cos(),
            30.0 + 20.0 * 300f64.to_radians().sin(),
        );
        assert!((arc.parameter('X').unwrap() - ex).abs() < 2e-3);
        assert!((arc.parameter('Y').unwrap() - ey).abs() < 2e-3);

        // I/J point from the start (50, 30) to the center (30, 30), within
        // resolution.
        assert!((arc.parameter('I').unwrap() + 20.0).abs() < 0.05);
        assert!((arc.parameter('J').unwrap() - 0.0).abs() < 0.05);

        // Summed relative extrusion.
        let expected_e: f64 = input
            .lines()
            .filter_map(|l| parse_line(l).parameter('E'))
            .sum();
        assert!((arc.parameter('E').unwrap() - expected_e).abs() < 1e-3);

        // Feedrate was unchanged across the run, so no F is emitted.
        assert!(arc.parameter('F').is_none(), "{}", arcs[0]);

        assert_eq!(result.progress.arcs_created, 1);
        assert_eq!(result.progress.points_compressed, 48);
        assert!(result.success);
        assert!(!result.cancelled);

        // None of the welded chord lines survive.
        assert_eq!(
            output.lines().filter(|l| l.starts_with("G1 X")).count(),
            0
        );
    }

    #[test]
    fn test_feedrate_change_splits_arcs() {
        let mut lines = vec![
            "G92 X50 Y30".to_string(),
            "M83".to_string(),
            "G1 F1500".to_string(),
        ];
        lines.extend(chord_lines(
            30.0,
            30.0,
            20.0,
            0.0,
            150f64.to_radians(),
            24,
            0.03,
            "",
        ));
        let mut second = chord_lines(
            30.0,
            30.0,
            20.0,
            150f64.to_radians(),
            300f64.to_radians(),
            24,
            0.03,
            "",
        );
        second[0].push_str(" F3000");
        lines.extend(second);
        let input = lines.join("\n") + "\n";

        let (output, result) = weld(WelderConfig::default(), input.as_str());
        let arcs = arc_lines(&output);
        assert_eq!(arcs.len(), 2, "{}", output);
        let first = parse_line(arcs[0]);
        let second = parse_line(arcs[1]);
        assert!(first.parameter('F').is_none(), "{}", arcs[0]);
        assert_eq!(second.parameter('F'), Some(3000.0), "{}", arcs[1]);
        assert_eq!(result.progress.arcs_created, 2);
    }

    #[test]
    fn test_helix_welds_with_3d_arcs() {
        let mut lines = vec![
            "G92 X20 Y0 Z0.2".to_string(),
            "M83".to_string(),
            "G1 F1500".to_string(),
        ];
        let n = 36;
        let r = 20.0;
        let mut prev = (r, 0.0, 0.2);
        for i in 1..=n {
            let a = 270f64.to_radians() * i as f64 / n as f64;
            let (x, y, z) = (r * a.cos(), r * a.sin(), 0.2 + 0.01 * i as f64);
            let len = ((x - prev.0).powi(2) + (y - prev.1).powi(2) + (z - prev.2).powi(2)).sqrt();
            lines.push(format!(
                "G1 X{:.3} Y{:.3} Z{:.3} E{:.5}",
                x,
                y,
                z,
                0.03 * len
            ));
            prev = (x, y, z);
        }
        let input = lines.join("\n") + "\n";

        // With 3D arcs: one helical arc with a Z word.
        let (output, _) = weld(WelderConfig::default().allow_3d_arcs(true), input.as_str());
        let arcs = arc_lines(&output);
        assert_eq!(arcs.len(), 1, "{}", output);
        let arc = parse_line(arcs[0]);
        assert!((arc.parameter('Z').unwrap() - (0.2 + 0.01 * n as f64)).abs() < 2e-3);

        // Without 3D arcs: everything passes through unchanged.
        let (output, result) = weld(WelderConfig::default(), input.as_str());
        assert!(arc_lines(&output).is_empty());
        for line in input.lines() {
            assert!(output.contains(line));
        }
        assert_eq!(result.progress.arcs_created, 0);
    }

    #[test]
    fn test_retraction_commits_arc_then_passes_through() {
        let mut lines = vec![
            "G92 X50 Y30".to_string(),
            "M83".to_string(),
            "G1 F1500".to_string(),
        ];
        lines.extend(chord_lines(
            30.0,
            30.0,
            20.0,
            0.0,
            100f64.to_radians(),
            16,
            0.03,
            "",
        ));
        lines.push("G1 E-2.00000".to_string());
        let input = lines.join("\n") + "\n";

        let (output, result) = weld(WelderConfig::default(), input.as_str());
        let arcs = arc_lines(&output);
        assert_eq!(arcs.len(), 1, "{}", output);

        let out_lines: Vec<&str> = output.lines().collect();
        let arc_idx = out_lines.iter().position(|l| l.starts_with("G3")).unwrap();
        let retract_idx = out_lines.iter().position(|l| *l == "G1 E-2.00000").unwrap();
        assert!(
            arc_idx < retract_idx,
            "retraction must follow the committed arc"
        );
        assert_eq!(result.progress.points_compressed, 16);
    }

    #[test]
    fn test_cancellation_from_callback() {
        let input = circle_test_input();
        let (output, result) = weld_with_callback(WelderConfig::default(), input.as_str(), |_| false);
        assert!(result.cancelled);
        assert!(!result.success);
        assert!(result.message.is_some());
        // Only fully-committed material (here: just the header) is written.
        assert!(arc_lines(&output).is_empty());
    }

    #[test]
    fn test_idempotence() {
        let config = WelderConfig::default();
        let input = circle_test_input();
        let (first, _) = weld(config.clone(), input.as_str());
        let (second, result) = weld(config.clone(), first.as_str());

        // A second pass welds nothing (G2/G3 input is not arc-eligible) and
        // reproduces its input behind a fresh header.
        assert_eq!(result.progress.arcs_created, 0);
        let (header, _) = weld(config, "");
        assert_eq!(second, format!("{}{}", header, first));
    }

    #[test]
    fn test_comment_aggregation() {
        let mut lines = vec![
            "G92 X50 Y30".to_string(),
            "M83".to_string(),
            "G1 F1500".to_string(),
        ];
        lines.extend(chord_lines(
            30.0,
            30.0,
            20.0,
            0.0,
            120f64.to_radians(),
            12,
            0.03,
            " ; outer wall",
        ));
        let input = lines.join("\n") + "\n";
        let (output, _) = weld(WelderConfig::default(), input.as_str());
        let arcs = arc_lines(&output);
        assert_eq!(arcs.len(), 1);
        // Identical adjacent comments collapse to one.
        assert!(arcs[0].ends_with(";outer wall"), "{}", arcs[0]);
    }

    #[test]
    fn test_feature_tag_change_splits_run() {
        let mut lines = vec![
            "G92 X50 Y30".to_string(),
            "M83".to_string(),
            "G1 F1500".to_string(),
        ];
        lines.extend(chord_lines(
            30.0,
            30.0,
            20.0,
            0.0,
            120f64.to_radians(),
            16,
            0.03,
            "",
        ));
        lines.push(";TYPE:Internal infill".to_string());
        lines.extend(chord_lines(
            30.0,
            30.0,
            20.0,
            120f64.to_radians(),
            240f64.to_radians(),
            16,
            0.03,
            "",
        ));
        let input = lines.join("\n") + "\n";
        let (output, _) = weld(WelderConfig::default(), input.as_str());
        // The tag comment terminates the first run; both halves weld.
        assert_eq!(arc_lines(&output).len(), 2, "{}", output);
        assert!(output.contains(";TYPE:Internal infill"));
    }

    #[test]
    fn test_absolute_extrusion_arc() {
        let mut lines = vec!["G92 X50 Y30 E0".to_string(), "G1 F1500".to_string()];
        // Absolute E accumulating proportionally to path length.
        let mut e = 0.0;
        let mut prev = (50.0, 30.0);
        for i in 1..=32 {
            let a = 200f64.to_radians() * i as f64 / 32.0;
            let (x, y) = (30.0 + 20.0 * a.cos(), 30.0 + 20.0 * a.sin());
            let len = ((x - prev.0).powi(2) + (y - prev.1).powi(2)).sqrt();
            e += 0.03 * len;
            lines.push(format!("G1 X{:.3} Y{:.3} E{:.5}", x, y, e));
            prev = (x, y);
        }
        let input = lines.join("\n") + "\n";
        let (output, _) = weld(WelderConfig::default(), input.as_str());
        let arcs = arc_lines(&output);
        assert_eq!(arcs.len(), 1, "{}", output);
        // Absolute mode: E carries the final absolute value.
        let arc = parse_line(arcs[0]);
        let final_e: f64 = parse_line(lines.last().unwrap()).parameter('E').unwrap();
        assert!((arc.parameter('E').unwrap() - final_e).abs() < 1e-3);
    }

    #[test]
    fn test_non_motion_lines_pass_through_in_order() {
        let input = "M104 S210\nG28\n; plain comment\nM106 S255\nnot gcode at all\n\nM107\n";
        let (output, result) = weld(WelderConfig::default(), input);
        let tail: Vec<&str> = output
            .lines()
            .skip_while(|l| l.starts_with(';') || l.is_empty())
            .collect();
        // Everything after the header is byte-identical and in order; the
        // plain comment and blank line survive inside the body.
        let body = output
            .split("; default_e_precision=5\n\n")
            .nth(1)
            .unwrap_or("");
        assert_eq!(body, input);
        assert!(!tail.is_empty());
        assert!(result.success);
        // Malformed and blank lines carry no command.
        assert_eq!(result.progress.gcodes_processed, 4);
    }

    #[test]
    fn test_header_contents() {
        let config = WelderConfig::default()
            .allow_3d_arcs(true)
            .firmware_compensation(1.0, 14);
        let (output, _) = weld(config, "");
        assert!(output.contains("; resolution=0.05mm"));
        assert!(output.contains("; path_tolerance=5%"));
        assert!(output.contains("; firmware_compensation=True"));
        assert!(output.contains("; mm_per_arc_segment=1.00mm"));
        assert!(output.contains("; min_arc_segments=14"));
        assert!(output.contains("; allow_3d_arcs=True"));
        assert!(output.contains("; default_xyz_precision=3"));
        assert!(output.contains("; default_e_precision=5"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = WelderConfig::default().path_tolerance_percent(7.0);
        let mut welder = Welder::new(config);
        let mut out = Vec::new();
        assert!(welder
            .process_streams(Cursor::new(""), &mut out, 0, None)
            .is_err());
    }

    #[test]
    fn test_process_files_end_to_end() {
        let dir = std::env::temp_dir();
        let src = dir.join(format!("arcflow_weld_{}.gcode", std::process::id()));
        let dst = dir.join(format!("arcflow_weld_{}.arc.gcode", std::process::id()));
        std::fs::write(&src, circle_test_input()).unwrap();

        let mut welder = Welder::new(WelderConfig::default());
        let result = welder.process(&src, &dst).unwrap();
        assert!(result.success);
        assert!(!result.cancelled);
        assert_eq!(result.progress.source_file_size, result.progress.source_file_position);

        let output = std::fs::read_to_string(&dst).unwrap();
        assert_eq!(arc_lines(&output).len(), 1);

        let _ = std::fs::remove_file(&src);
        let _ = std::fs::remove_file(&dst);
    }

    #[test]
    fn test_segment_statistics_track_compression() {
        let input = circle_test_input();
        let (_, result) = weld(WelderConfig::default(), input.as_str());
        let stats = &result.progress.segment_statistics;
        assert_eq!(stats.source_total(), 48);
        // The 48 chords collapse into one arc-length entry.
        assert_eq!(stats.target_total(), 1);
    }
}
