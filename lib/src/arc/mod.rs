//! Streaming arc accumulator.
//!
//! [`ArcAccumulator`] is the geometric heart of the welder: it consumes
//! successive printer points, maintains a best-fit circle over the run, and
//! answers two questions on every point:
//!
//! 1. `try_add_point` - can the run grow by this point and still be a single
//!    circular arc within tolerance? Rejection leaves the accumulator
//!    untouched, so the caller can immediately commit what it has.
//! 2. `is_shape` - if the run were terminated now, would it make an arc the
//!    firmware can execute faithfully?
//!
//! The fit is the incremental least-squares fit from [`crate::geometry`];
//! growing a run by one point costs one O(1) refit plus an O(n) tolerance
//! sweep over the stored points. The algebraic fit slightly underestimates
//! the radius on short arcs, which the per-point deviation sweep absorbs.

use log::debug;

use crate::config::WelderConfig;
use crate::geometry::{polyline_signed_area, Circle, CircleFit, Point};

/// Sweep direction of a fitted arc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcDirection {
    /// Clockwise arc (G2)
    Clockwise,
    /// Counter-clockwise arc (G3)
    CounterClockwise,
}

impl ArcDirection {
    /// Returns the G-code command for this direction.
    pub fn gcode_command(&self) -> &'static str {
        match self {
            ArcDirection::Clockwise => "G2",
            ArcDirection::CounterClockwise => "G3",
        }
    }
}

/// One vertex of a candidate run. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrinterPoint {
    /// Gcode-space X (mm).
    pub x: f64,
    /// Gcode-space Y (mm).
    pub y: f64,
    /// Gcode-space Z (mm).
    pub z: f64,
    /// Filament delivered since the previous point (mm).
    pub e_relative: f64,
    /// Cartesian distance from the previous point: 2D when 3D arcs are
    /// disabled, 3D otherwise. 0 for a run's starting point.
    pub segment_length: f64,
}

impl PrinterPoint {
    /// Create a new point.
    pub fn new(x: f64, y: f64, z: f64, e_relative: f64, segment_length: f64) -> Self {
        Self {
            x,
            y,
            z,
            e_relative,
            segment_length,
        }
    }

    fn xy(&self) -> Point {
        Point::new(self.x, self.y, 0.0)
    }
}

/// Format an axis value at a given precision, normalizing negative zero so
/// a center offset of -1e-14 does not print as `-0.000`.
fn fmt_axis(value: f64, precision: usize) -> String {
    let s = format!("{:.*}", precision, value);
    if s.starts_with('-') && s[1..].chars().all(|c| c == '0' || c == '.') {
        s[1..].to_string()
    } else {
        s
    }
}

/// Streaming accumulator that grows a run of points while it still fits a
/// single circular arc within tolerance.
#[derive(Debug, Clone)]
pub struct ArcAccumulator {
    // Configuration, immutable after construction.
    min_segments: usize,
    max_segments: usize,
    resolution_mm: f64,
    path_tolerance_percent: f64,
    max_radius_mm: f64,
    min_arc_segments: u32,
    mm_per_arc_segment: f64,
    allow_3d_arcs: bool,
    xyz_precision: u8,
    e_precision: u8,

    // Run state.
    points: Vec<PrinterPoint>,
    fit: CircleFit,
    circle: Option<Circle>,
    shape_length: f64,
    e_total: f64,
    num_firmware_compensations: u32,
}

impl ArcAccumulator {
    /// Create an accumulator from a welder configuration.
    pub fn new(config: &WelderConfig) -> Self {
        Self {
            min_segments: crate::DEFAULT_MIN_SEGMENTS,
            max_segments: config.max_segments(),
            resolution_mm: config.resolution_mm,
            path_tolerance_percent: config.path_tolerance_percent,
            max_radius_mm: config.max_radius_mm,
            min_arc_segments: config.min_arc_segments,
            mm_per_arc_segment: config.mm_per_arc_segment,
            allow_3d_arcs: config.allow_3d_arcs,
            xyz_precision: config.default_xyz_precision,
            e_precision: config.default_e_precision,
            points: Vec::new(),
            fit: CircleFit::new(),
            circle: None,
            shape_length: 0.0,
            e_total: 0.0,
            num_firmware_compensations: 0,
        }
    }

    /// Points closer than half an output ULP collapse in the emitted gcode.
    fn point_epsilon(&self) -> f64 {
        0.5 * 10f64.powi(-(self.xyz_precision as i32))
    }

    /// Number of points in the run, counting the starting point. A run of
    /// `n` points spans `n - 1` motion segments; the welder relies on that
    /// relationship when it evicts buffered lines at commit.
    pub fn get_num_segments(&self) -> usize {
        self.points.len()
    }

    /// Smallest run accepted as an arc.
    pub fn min_segments(&self) -> usize {
        self.min_segments
    }

    /// Total polyline length of the run (mm).
    pub fn get_shape_length(&self) -> f64 {
        self.shape_length
    }

    /// Filament total across the run (mm).
    pub fn get_e_total(&self) -> f64 {
        self.e_total
    }

    /// Cumulative count of arcs accepted under the tightened
    /// firmware-compensation demand. Survives [`clear`](Self::clear).
    pub fn get_num_firmware_compensations(&self) -> u32 {
        self.num_firmware_compensations
    }

    /// Current X/Y/Z emission precision.
    pub fn get_xyz_precision(&self) -> u8 {
        self.xyz_precision
    }

    /// Current E emission precision.
    pub fn get_e_precision(&self) -> u8 {
        self.e_precision
    }

    /// Raise the X/Y/Z emission precision to an observed decimal count.
    pub fn update_xyz_precision(&mut self, decimals: u8) {
        self.xyz_precision = self.xyz_precision.max(decimals.min(6));
    }

    /// Raise the E emission precision to an observed decimal count.
    pub fn update_e_precision(&mut self, decimals: u8) {
        self.e_precision = self.e_precision.max(decimals.min(6));
    }

    /// Empty the run. Configuration and the firmware-compensation counter
    /// are preserved.
    pub fn clear(&mut self) {
        self.points.clear();
        self.fit.clear();
        self.circle = None;
        self.shape_length = 0.0;
        self.e_total = 0.0;
    }

    /// Attempt to extend the run by one point.
    ///
    /// An empty accumulator stores the point as the run's starting vertex
    /// and accepts unconditionally (a single point is not an arc yet).
    /// Otherwise the extended run must pass every tolerance; on any failure
    /// the accumulator is left untouched and `false` is returned.
    pub fn try_add_point(&mut self, p: PrinterPoint) -> bool {
        if self.points.is_empty() {
            self.fit.push(p.x, p.y);
            self.points.push(p);
            return true;
        }

        if self.points.len() >= self.max_segments {
            debug!("arc: run reached max segment count {}", self.max_segments);
            return false;
        }

        let last = *self.points.last().expect("non-empty run");
        let epsilon = self.point_epsilon();
        let chord_2d = last.xy().distance_2d(&p.xy());
        let seg_len = if self.allow_3d_arcs {
            Point::new(last.x, last.y, last.z).distance_3d(&Point::new(p.x, p.y, p.z))
        } else {
            chord_2d
        };

        // Zero-length segments carry no direction and would divide the fit.
        if seg_len < epsilon {
            return false;
        }

        if !self.z_axis_acceptable(&last, &p, epsilon) {
            return false;
        }

        // A two-point run is a bare segment, not an arc hypothesis yet; the
        // circle checks start with the third point.
        if self.points.len() == 1 {
            self.fit.push(p.x, p.y);
            self.push_point(p, seg_len);
            return true;
        }

        let candidate_fit = self.fit.with(p.x, p.y);
        let circle = match candidate_fit.solve() {
            Some(c) => c,
            None => {
                debug!("arc: points are collinear, no circle");
                return false;
            }
        };

        if circle.r > self.max_radius_mm || circle.r < self.resolution_mm {
            debug!("arc: radius {:.3} outside accepted range", circle.r);
            return false;
        }

        // Every vertex must sit on the fitted circle within resolution; this
        // also corrects the algebraic fit's radial bias.
        for q in self.points.iter() {
            if circle.deviation(q.x, q.y).abs() > self.resolution_mm {
                return false;
            }
        }
        if circle.deviation(p.x, p.y).abs() > self.resolution_mm {
            return false;
        }

        if !self.sweep_acceptable(&circle, &p) {
            return false;
        }

        if !self.extrusion_acceptable(&p, seg_len) {
            return false;
        }

        if self.allow_3d_arcs && !self.pitch_acceptable(&p, seg_len, epsilon) {
            return false;
        }

        self.fit = candidate_fit;
        self.circle = Some(circle);
        self.push_point(p, seg_len);
        true
    }

    fn push_point(&mut self, p: PrinterPoint, seg_len: f64) {
        self.shape_length += seg_len;
        self.e_total += p.e_relative;
        self.points.push(p);
    }

    /// Z policy: fixed plane without 3D arcs, single-direction progression
    /// with them. Constant-pitch enforcement lives in `pitch_acceptable`.
    fn z_axis_acceptable(&self, last: &PrinterPoint, p: &PrinterPoint, epsilon: f64) -> bool {
        let dz = p.z - last.z;
        if !self.allow_3d_arcs {
            if dz.abs() > epsilon {
                debug!("arc: z changed without 3d arcs enabled");
                return false;
            }
            return true;
        }
        if dz.abs() <= epsilon {
            return true;
        }
        for pair in self.points.windows(2) {
            let prior_dz = pair[1].z - pair[0].z;
            if prior_dz.abs() > epsilon && prior_dz.signum() != dz.signum() {
                debug!("arc: z direction reversed, not a helix");
                return false;
            }
        }
        true
    }

    /// Arc-length consistency and single-sweep ordering over the extended
    /// run.
    ///
    /// Each vertex is projected onto the fitted circle's angular coordinate;
    /// the angular steps must all wind the same way (a retraced path flips
    /// the step sign without leaving the circle), each chord must match the
    /// arc the circle hypothesis predicts for it, and the total sweep must
    /// stay below a full revolution.
    fn sweep_acceptable(&self, circle: &Circle, p: &PrinterPoint) -> bool {
        let mut total_sweep = 0.0;
        let mut sign = 0.0f64;
        let mut prev: Option<(&PrinterPoint, f64)> = None;
        for q in self.points.iter().chain(std::iter::once(p)) {
            let angle = (q.y - circle.y).atan2(q.x - circle.x);
            if let Some((a, prev_angle)) = prev {
                let mut step = angle - prev_angle;
                if step > std::f64::consts::PI {
                    step -= 2.0 * std::f64::consts::PI;
                } else if step < -std::f64::consts::PI {
                    step += 2.0 * std::f64::consts::PI;
                }

                let chord = a.xy().distance_2d(&q.xy());
                let arc_len = circle.r * step.abs();
                let tolerance = self.resolution_mm.max(self.path_tolerance_percent * chord);
                if (arc_len - chord).abs() > tolerance {
                    debug!(
                        "arc: chord {:.4} disagrees with predicted arc {:.4}",
                        chord, arc_len
                    );
                    return false;
                }

                if step.abs() > 1e-12 {
                    if sign != 0.0 && step.signum() != sign {
                        debug!("arc: sweep direction reversed mid-run");
                        return false;
                    }
                    sign = step.signum();
                }
                total_sweep += step.abs();
            }
            prev = Some((q, angle));
        }

        // The small slack keeps an exactly-closed polygon from slipping
        // through on floating-point rounding.
        if total_sweep >= 2.0 * std::f64::consts::PI - 1e-6 {
            debug!("arc: sweep would self-overlap");
            return false;
        }
        true
    }

    /// An arc replaces every segment with one extrusion-proportional move,
    /// so filament per unit length must be uniform across the run.
    fn extrusion_acceptable(&self, p: &PrinterPoint, seg_len: f64) -> bool {
        let new_total_e = self.e_total + p.e_relative;
        let new_length = self.shape_length + seg_len;
        let mean = new_total_e / new_length;
        let tolerance = self.path_tolerance_percent * mean.abs() + 1e-9;

        let segments = self
            .points
            .iter()
            .skip(1)
            .map(|q| (q.e_relative, q.segment_length))
            .chain(std::iter::once((p.e_relative, seg_len)));
        for (e, len) in segments {
            if len <= 0.0 {
                continue;
            }
            if (e / len - mean).abs() > tolerance {
                debug!("arc: extrusion rate inconsistent across run");
                return false;
            }
        }
        true
    }

    /// Helix pitch must be uniform: Z per unit path length matches across
    /// the run the same way extrusion does.
    fn pitch_acceptable(&self, p: &PrinterPoint, seg_len: f64, epsilon: f64) -> bool {
        let first = self.points.first().expect("non-empty run");
        let total_dz = p.z - first.z;
        if total_dz.abs() <= epsilon {
            return true;
        }
        let mean = total_dz / (self.shape_length + seg_len);
        let tolerance = self.path_tolerance_percent * mean.abs() + 1e-9;

        let mut prev_z = first.z;
        let segments = self
            .points
            .iter()
            .skip(1)
            .map(|q| (q.z, q.segment_length))
            .chain(std::iter::once((p.z, seg_len)));
        for (z, len) in segments {
            if len <= 0.0 {
                continue;
            }
            if ((z - prev_z) / len - mean).abs() > tolerance {
                debug!("arc: helix pitch inconsistent across run");
                return false;
            }
            prev_z = z;
        }
        true
    }

    /// Total sweep angle and arc length of the current run along `circle`.
    fn sweep_and_length(&self, circle: &Circle) -> (f64, f64) {
        let mut sweep = 0.0;
        let mut prev_angle: Option<f64> = None;
        for q in self.points.iter() {
            let angle = (q.y - circle.y).atan2(q.x - circle.x);
            if let Some(pa) = prev_angle {
                let mut step = angle - pa;
                if step > std::f64::consts::PI {
                    step -= 2.0 * std::f64::consts::PI;
                } else if step < -std::f64::consts::PI {
                    step += 2.0 * std::f64::consts::PI;
                }
                sweep += step.abs();
            }
            prev_angle = Some(angle);
        }
        (sweep, sweep * circle.r)
    }

    /// Would the accumulated run, terminated now, make an acceptable arc?
    ///
    /// Takes `&mut self` because accepting a short arc under the tightened
    /// firmware-compensation demand records a compensation event.
    pub fn is_shape(&mut self) -> bool {
        if self.points.len() < self.min_segments {
            return false;
        }
        let circle = match self.circle {
            Some(c) => c,
            None => return false,
        };

        if self.mm_per_arc_segment > 0.0 && self.min_arc_segments > 0 {
            let (sweep, arc_length) = self.sweep_and_length(&circle);
            let min_length = self.mm_per_arc_segment * self.min_arc_segments as f64;
            if arc_length < min_length {
                // The firmware would render this arc with fewer chords than
                // its interpolation floor. Accept only if those coarser
                // chords still stay within resolution.
                let firmware_segments = (arc_length / self.mm_per_arc_segment).floor().max(1.0);
                let sagitta = circle.r * (1.0 - (sweep / (2.0 * firmware_segments)).cos());
                if sagitta > self.resolution_mm {
                    debug!(
                        "arc: firmware interpolation would deviate {:.4}mm, rejecting",
                        sagitta
                    );
                    return false;
                }
                self.num_firmware_compensations += 1;
            }
        }
        true
    }

    /// Sweep direction from the signed area of the run's polyline.
    pub fn direction(&self) -> ArcDirection {
        let pts: Vec<Point> = self.points.iter().map(|p| p.xy()).collect();
        if polyline_signed_area(&pts) < 0.0 {
            ArcDirection::Clockwise
        } else {
            ArcDirection::CounterClockwise
        }
    }

    /// Emit the arc with a relative E value (the run's filament total).
    pub fn get_shape_gcode_relative(&self, feedrate: f64) -> String {
        self.shape_gcode(self.e_total, feedrate)
    }

    /// Emit the arc with an absolute E value supplied by the caller.
    pub fn get_shape_gcode_absolute(&self, absolute_e: f64, feedrate: f64) -> String {
        self.shape_gcode(absolute_e, feedrate)
    }

    fn shape_gcode(&self, e_value: f64, feedrate: f64) -> String {
        let circle = self
            .circle
            .expect("arc gcode requested without a fitted circle");
        let start = self.points.first().expect("non-empty run");
        let end = self.points.last().expect("non-empty run");
        let xyz = self.xyz_precision as usize;

        // Center offsets are measured from the starting point (I/J form;
        // the R form is ambiguous near half circles).
        let i = circle.x - start.x;
        let j = circle.y - start.y;

        let mut gcode = format!(
            "{} X{} Y{}",
            self.direction().gcode_command(),
            fmt_axis(end.x, xyz),
            fmt_axis(end.y, xyz)
        );
        if self.allow_3d_arcs && (end.z - start.z).abs() > self.point_epsilon() {
            gcode.push_str(&format!(" Z{}", fmt_axis(end.z, xyz)));
        }
        gcode.push_str(&format!(" I{} J{}", fmt_axis(i, xyz), fmt_axis(j, xyz)));
        gcode.push_str(&format!(
            " E{}",
            fmt_axis(e_value, self.e_precision as usize)
        ));
        if feedrate > 0.0 {
            gcode.push_str(&format!(" F{:.0}", feedrate));
        }
        gcode
    }
}
