//! Geometry primitives for arc fitting.
//!
//! This module provides the small set of geometric tools the arc accumulator
//! needs:
//! - [`Point`] - a 3D point in gcode space (mm)
//! - [`CircleFit`] - an incremental algebraic least-squares circle fit
//! - [`Circle`] - a fitted circle in the XY plane
//! - [`polyline_signed_area`] - shoelace area, used to pick G2 vs G3
//!
//! ## Circle fitting
//!
//! The fit minimizes the algebraic residual `Σ((xᵢ−a)² + (yᵢ−b)² − r²)²`
//! (Kåsa). With running sums of the coordinate moments the normal equations
//! are a fixed 3×3 solve, so extending the fit by one point is O(1) and
//! re-fitting never iterates. The algebraic fit has a small radial bias on
//! short arcs; callers compensate by re-checking every point against the
//! fitted circle at their own tolerance.

/// A point in gcode space. Coordinates are millimeters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    /// Create a new point.
    #[inline]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Cartesian distance to another point, ignoring Z.
    #[inline]
    pub fn distance_2d(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Cartesian distance to another point, including Z.
    #[inline]
    pub fn distance_3d(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Check if a value is approximately equal to another within epsilon.
#[inline]
pub fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
    (a - b).abs() < epsilon
}

/// A circle in the XY plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    /// Center X (mm).
    pub x: f64,
    /// Center Y (mm).
    pub y: f64,
    /// Radius (mm).
    pub r: f64,
}

impl Circle {
    /// Radial distance of a point from the circle (positive outside,
    /// negative inside).
    #[inline]
    pub fn deviation(&self, px: f64, py: f64) -> f64 {
        let dx = px - self.x;
        let dy = py - self.y;
        (dx * dx + dy * dy).sqrt() - self.r
    }
}

/// Incremental least-squares circle fit over running sums.
///
/// Coordinates are accumulated relative to the first pushed point so the
/// moment sums stay small; typical print coordinates sit a hundred or more
/// millimeters from the origin and cubing them raw costs precision.
#[derive(Debug, Clone, Copy, Default)]
pub struct CircleFit {
    origin_x: f64,
    origin_y: f64,
    n: usize,
    sx: f64,
    sy: f64,
    sxx: f64,
    syy: f64,
    sxy: f64,
    // w = x² + y² in origin-relative coordinates
    sw: f64,
    sxw: f64,
    syw: f64,
}

impl CircleFit {
    /// Create an empty fit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of points accumulated.
    pub fn len(&self) -> usize {
        self.n
    }

    /// True if no points have been accumulated.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Reset to the empty state.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Add a point to the running sums.
    pub fn push(&mut self, px: f64, py: f64) {
        if self.n == 0 {
            self.origin_x = px;
            self.origin_y = py;
        }
        let x = px - self.origin_x;
        let y = py - self.origin_y;
        let w = x * x + y * y;
        self.n += 1;
        self.sx += x;
        self.sy += y;
        self.sxx += x * x;
        self.syy += y * y;
        self.sxy += x * y;
        self.sw += w;
        self.sxw += x * w;
        self.syw += y * w;
    }

    /// Return a copy of this fit extended by one point, without mutating
    /// self. The accumulator uses this to test a candidate before
    /// committing it.
    pub fn with(&self, px: f64, py: f64) -> Self {
        let mut candidate = *self;
        candidate.push(px, py);
        candidate
    }

    /// Solve the normal equations for the best-fit circle.
    ///
    /// Returns `None` for fewer than three points or when the points are
    /// (numerically) collinear.
    pub fn solve(&self) -> Option<Circle> {
        if self.n < 3 {
            return None;
        }
        let n = self.n as f64;

        // Normal equations for minimizing Σ(w + D·x + E·y + F)² where the
        // circle is x² + y² + D·x + E·y + F = 0.
        let a11 = self.sxx;
        let a12 = self.sxy;
        let a13 = self.sx;
        let a22 = self.syy;
        let a23 = self.sy;
        let a33 = n;
        let b1 = -self.sxw;
        let b2 = -self.syw;
        let b3 = -self.sw;

        let det = a11 * (a22 * a33 - a23 * a23) - a12 * (a12 * a33 - a23 * a13)
            + a13 * (a12 * a23 - a22 * a13);
        if det.abs() < 1e-10 {
            // Collinear points have no finite circumcircle.
            return None;
        }

        let d = (b1 * (a22 * a33 - a23 * a23) - a12 * (b2 * a33 - a23 * b3)
            + a13 * (b2 * a23 - a22 * b3))
            / det;
        let e = (a11 * (b2 * a33 - a23 * b3) - b1 * (a12 * a33 - a23 * a13)
            + a13 * (a12 * b3 - b2 * a13))
            / det;
        let f = (a11 * (a22 * b3 - b2 * a23) - a12 * (a12 * b3 - b2 * a13)
            + b1 * (a12 * a23 - a22 * a13))
            / det;

        let cx = -d / 2.0;
        let cy = -e / 2.0;
        let r2 = cx * cx + cy * cy - f;
        if r2 <= 0.0 || !r2.is_finite() {
            return None;
        }

        Some(Circle {
            x: cx + self.origin_x,
            y: cy + self.origin_y,
            r: r2.sqrt(),
        })
    }
}

/// Signed area of the polygon formed by closing an open polyline (shoelace).
///
/// Positive for counter-clockwise winding. For a chorded arc the sign of the
/// closed-polygon area is the sign of the sweep, which maps directly onto
/// G3 (counter-clockwise) vs G2 (clockwise).
pub fn polyline_signed_area(points: &[Point]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut area = 0.0;
    for i in 0..points.len() {
        let p = &points[i];
        let q = &points[(i + 1) % points.len()];
        area += p.x * q.y - q.x * p.y;
    }
    area / 2.0
}
