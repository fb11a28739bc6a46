//! Modal G-code position tracking.
//!
//! The welder needs to know, for every consumed command, the absolute
//! position before and after it, which modal flags were active, and how much
//! filament the move delivered. [`PositionTracker`] is a stepwise function
//! `(state, command) -> state'` over [`Position`], keeping exactly one level
//! of history so the welder can [`PositionTracker::undo_last`] the command
//! that terminated a run before re-processing it.
//!
//! The tracker models a single extruder. `T` commands pass through without
//! switching state; multi-extruder programs are post-processed as if every
//! tool shared one E axis.

use crate::geometry::approx_eq;
use crate::parser::ParsedCommand;

/// Comparison epsilon for modal coordinates.
const POSITION_EPSILON: f64 = 1e-8;

/// Threshold below which an E delta counts as no extrusion.
const E_EPSILON: f64 = 1e-10;

/// Extruder state attached to a [`Position`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ExtruderState {
    /// Absolute E in gcode space (mm of filament).
    pub e: f64,
    /// Filament delivered by the last update (negative while retracting).
    pub e_relative: f64,
    /// True when the last update pushed filament forward.
    pub is_extruding: bool,
    /// True when the last update pulled filament back.
    pub is_retracting: bool,
}

/// A snapshot of the modal printer state after one command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Position {
    /// Absolute axis positions in gcode space (mm).
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Workspace offsets accumulated from G92.
    pub x_offset: f64,
    pub y_offset: f64,
    pub z_offset: f64,
    /// Firmware home offsets (M206).
    pub x_firmware_offset: f64,
    pub y_firmware_offset: f64,
    pub z_firmware_offset: f64,
    /// Active feedrate (mm/min); 0 until first set.
    pub f: f64,
    /// G91 active for XYZ.
    pub is_relative: bool,
    /// M83 (or G91 with `g90_influences_extruder`) active for E.
    pub is_extruder_relative: bool,
    /// The last update moved X or Y.
    pub has_xy_changed: bool,
    /// X and Y have both been established by some command.
    x_known: bool,
    y_known: bool,
    /// Modal feature tag picked up from slicer comments
    /// (`; FEATURE:`/`;TYPE:`).
    pub feature_tag: Option<String>,
    /// Extruder state.
    pub extruder: ExtruderState,
}

impl Position {
    /// True once both X and Y have been established, so a previous position
    /// can safely seed an arc run.
    pub fn is_xy_known(&self) -> bool {
        self.x_known && self.y_known
    }

    /// True when any workspace or firmware offset differs from `other`.
    pub fn offsets_differ(&self, other: &Position) -> bool {
        !approx_eq(self.x_offset, other.x_offset, POSITION_EPSILON)
            || !approx_eq(self.y_offset, other.y_offset, POSITION_EPSILON)
            || !approx_eq(self.z_offset, other.z_offset, POSITION_EPSILON)
            || !approx_eq(self.x_firmware_offset, other.x_firmware_offset, POSITION_EPSILON)
            || !approx_eq(self.y_firmware_offset, other.y_firmware_offset, POSITION_EPSILON)
            || !approx_eq(self.z_firmware_offset, other.z_firmware_offset, POSITION_EPSILON)
    }
}

/// Extract a feature tag from a slicer comment.
///
/// Recognizes the BambuStudio `FEATURE:` and PrusaSlicer/Cura `TYPE:`
/// comment markers.
fn feature_tag_from_comment(comment: &str) -> Option<String> {
    let trimmed = comment.trim();
    for prefix in ["FEATURE:", "TYPE:"] {
        if let Some(head) = trimmed.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(prefix) {
                return Some(trimmed[prefix.len()..].trim().to_string());
            }
        }
    }
    None
}

/// Stepwise modal-state tracker with one level of undo.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    g90_influences_extruder: bool,
    current: Position,
    previous: Position,
    undo: Option<Box<(Position, Position)>>,
}

impl PositionTracker {
    /// Create a tracker in the firmware default state: absolute XYZ,
    /// absolute E, position unknown.
    pub fn new(g90_influences_extruder: bool) -> Self {
        Self {
            g90_influences_extruder,
            current: Position::default(),
            previous: Position::default(),
            undo: None,
        }
    }

    /// State after the most recent update.
    pub fn current(&self) -> &Position {
        &self.current
    }

    /// State before the most recent update.
    pub fn previous(&self) -> &Position {
        &self.previous
    }

    /// Apply one command to the modal state.
    pub fn update(&mut self, cmd: &ParsedCommand) {
        self.undo = Some(Box::new((self.previous.clone(), self.current.clone())));
        self.previous = self.current.clone();

        let (prev_x, prev_y) = (self.previous.x, self.previous.y);
        let cur = &mut self.current;
        cur.has_xy_changed = false;
        cur.extruder.e_relative = 0.0;
        cur.extruder.is_extruding = false;
        cur.extruder.is_retracting = false;

        if !cmd.comment.is_empty() {
            if let Some(tag) = feature_tag_from_comment(&cmd.comment) {
                cur.feature_tag = Some(tag);
            }
        }

        match cmd.command.as_str() {
            "G0" | "G1" => {
                for p in &cmd.parameters {
                    match p.letter {
                        'X' => {
                            cur.x = if cur.is_relative { cur.x + p.value } else { p.value };
                            cur.x_known = true;
                        }
                        'Y' => {
                            cur.y = if cur.is_relative { cur.y + p.value } else { p.value };
                            cur.y_known = true;
                        }
                        'Z' => {
                            cur.z = if cur.is_relative { cur.z + p.value } else { p.value };
                        }
                        'E' => {
                            let new_e = if cur.is_extruder_relative {
                                cur.extruder.e + p.value
                            } else {
                                p.value
                            };
                            cur.extruder.e_relative = new_e - cur.extruder.e;
                            cur.extruder.e = new_e;
                        }
                        'F' => cur.f = p.value,
                        _ => {}
                    }
                }
                cur.has_xy_changed = !approx_eq(cur.x, prev_x, POSITION_EPSILON)
                    || !approx_eq(cur.y, prev_y, POSITION_EPSILON);
                cur.extruder.is_extruding = cur.extruder.e_relative > E_EPSILON;
                cur.extruder.is_retracting = cur.extruder.e_relative < -E_EPSILON;
            }
            "G90" => {
                cur.is_relative = false;
                if self.g90_influences_extruder {
                    cur.is_extruder_relative = false;
                }
            }
            "G91" => {
                cur.is_relative = true;
                if self.g90_influences_extruder {
                    cur.is_extruder_relative = true;
                }
            }
            "M82" => cur.is_extruder_relative = false,
            "M83" => cur.is_extruder_relative = true,
            "G92" => {
                if cmd.parameters.is_empty() {
                    // Bare G92 zeroes every axis.
                    cur.x_offset += cur.x;
                    cur.y_offset += cur.y;
                    cur.z_offset += cur.z;
                    cur.x = 0.0;
                    cur.y = 0.0;
                    cur.z = 0.0;
                    cur.extruder.e = 0.0;
                    cur.x_known = true;
                    cur.y_known = true;
                } else {
                    for p in &cmd.parameters {
                        match p.letter {
                            'X' => {
                                cur.x_offset += cur.x - p.value;
                                cur.x = p.value;
                                cur.x_known = true;
                            }
                            'Y' => {
                                cur.y_offset += cur.y - p.value;
                                cur.y = p.value;
                                cur.y_known = true;
                            }
                            'Z' => {
                                cur.z_offset += cur.z - p.value;
                                cur.z = p.value;
                            }
                            'E' => cur.extruder.e = p.value,
                            _ => {}
                        }
                    }
                }
            }
            "M206" => {
                for p in &cmd.parameters {
                    match p.letter {
                        'X' => cur.x_firmware_offset = p.value,
                        'Y' => cur.y_firmware_offset = p.value,
                        'Z' => cur.z_firmware_offset = p.value,
                        _ => {}
                    }
                }
            }
            "G28" => {
                let axes: Vec<char> = cmd.parameters.iter().map(|p| p.letter).collect();
                let all = axes.is_empty();
                if all || axes.contains(&'X') {
                    cur.x = 0.0;
                    cur.x_known = true;
                }
                if all || axes.contains(&'Y') {
                    cur.y = 0.0;
                    cur.y_known = true;
                }
                if all || axes.contains(&'Z') {
                    cur.z = 0.0;
                }
            }
            _ => {}
        }
    }

    /// Roll back the most recent [`update`](Self::update).
    ///
    /// Used exactly once per arc commit: the command that terminated the run
    /// must not stay consumed into modal state, because the welder re-issues
    /// it afterwards.
    ///
    /// # Panics
    ///
    /// Panics when no update is available to undo; that is a programming
    /// error in the caller.
    pub fn undo_last(&mut self) {
        let (previous, current) = *self
            .undo
            .take()
            .expect("undo_last called without a preceding update");
        self.previous = previous;
        self.current = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_line;

    fn tracker_with(lines: &[&str]) -> PositionTracker {
        let mut t = PositionTracker::new(false);
        for line in lines {
            t.update(&parse_line(line));
        }
        t
    }

    #[test]
    fn test_absolute_moves() {
        let t = tracker_with(&["G28", "G1 X10 Y20 Z0.2 F1500"]);
        let cur = t.current();
        assert_eq!(cur.x, 10.0);
        assert_eq!(cur.y, 20.0);
        assert_eq!(cur.z, 0.2);
        assert_eq!(cur.f, 1500.0);
        assert!(cur.has_xy_changed);
        assert!(cur.is_xy_known());
    }

    #[test]
    fn test_relative_moves() {
        let t = tracker_with(&["G28", "G1 X10 Y10", "G91", "G1 X5 Y-2"]);
        let cur = t.current();
        assert_eq!(cur.x, 15.0);
        assert_eq!(cur.y, 8.0);
        assert!(cur.is_relative);
    }

    #[test]
    fn test_extrusion_tracking_absolute() {
        let t = tracker_with(&["G92 E0", "G1 X10 Y0 E1.5", "G1 X20 Y0 E2.0"]);
        let e = t.current().extruder;
        assert!((e.e - 2.0).abs() < 1e-12);
        assert!((e.e_relative - 0.5).abs() < 1e-12);
        assert!(e.is_extruding);
        assert!(!e.is_retracting);
    }

    #[test]
    fn test_extrusion_tracking_relative() {
        let t = tracker_with(&["M83", "G1 X10 Y0 E0.8", "G1 X20 Y0 E0.4"]);
        let e = t.current().extruder;
        assert!((e.e - 1.2).abs() < 1e-12);
        assert!((e.e_relative - 0.4).abs() < 1e-12);
        assert!(t.current().is_extruder_relative);
    }

    #[test]
    fn test_retraction_detection() {
        let t = tracker_with(&["G92 E0", "G1 X10 Y0 E1.0", "G1 E0.2"]);
        let e = t.current().extruder;
        assert!(e.is_retracting);
        assert!((e.e_relative + 0.8).abs() < 1e-12);
        assert!(!t.current().has_xy_changed);
    }

    #[test]
    fn test_g92_offsets() {
        let t = tracker_with(&["G28", "G1 X50 Y30", "G92 X0 Y0"]);
        let cur = t.current();
        assert_eq!(cur.x, 0.0);
        assert_eq!(cur.x_offset, 50.0);
        assert_eq!(cur.y_offset, 30.0);
        assert!(cur.offsets_differ(t.previous()));
    }

    #[test]
    fn test_g90_influences_extruder() {
        let mut t = PositionTracker::new(true);
        t.update(&parse_line("M83"));
        assert!(t.current().is_extruder_relative);
        t.update(&parse_line("G90"));
        assert!(!t.current().is_extruder_relative);

        let mut t = PositionTracker::new(false);
        t.update(&parse_line("M83"));
        t.update(&parse_line("G90"));
        assert!(t.current().is_extruder_relative);
    }

    #[test]
    fn test_feature_tag() {
        let t = tracker_with(&["G28", ";TYPE:External perimeter", "G1 X5 Y5 E0.1"]);
        assert_eq!(
            t.current().feature_tag.as_deref(),
            Some("External perimeter")
        );
    }

    #[test]
    fn test_undo_last() {
        let mut t = tracker_with(&["G28", "G1 X10 Y0 F1200"]);
        let before = t.current().clone();
        t.update(&parse_line("G1 X20 Y5"));
        assert_eq!(t.current().x, 20.0);
        t.undo_last();
        assert_eq!(t.current(), &before);
        assert_eq!(t.current().x, 10.0);
    }

    #[test]
    #[should_panic(expected = "undo_last")]
    fn test_undo_twice_panics() {
        let mut t = tracker_with(&["G1 X1 Y1"]);
        t.undo_last();
        t.undo_last();
    }

    #[test]
    fn test_position_unknown_until_set() {
        let t = PositionTracker::new(false);
        assert!(!t.current().is_xy_known());
    }
}
