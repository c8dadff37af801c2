//! The DexArm's G-code dialect: line builders and reply parsing.
//!
//! The arm speaks plain line-oriented G-code at 115200 baud and answers
//! every command with a line containing `ok`.  Nothing fancier than that is
//! parsed here; command outcomes are judged only by the presence of a
//! timely ack.

use std::fmt;
use std::str::FromStr;

use crate::position_store::Point;

/// `M1112`: return to the arm's home position (0, 300, 0).
pub const HOME: &str = "M1112";
/// `M1000`: start the suction pump pulling a vacuum.
pub const SUCTION_ON: &str = "M1000";
/// `M1002`: blow the held vacuum off so the blade drops.
pub const SUCTION_RELEASE: &str = "M1002";
/// `M1003`: stop the pump entirely.
pub const PUMP_OFF: &str = "M1003";
/// `M400`: ack only after all buffered moves have finished.
pub const WAIT_FOR_MOVES: &str = "M400";
/// `M114`: report the current Cartesian position.
pub const REPORT_POSITION: &str = "M114";
/// `M84` / `M17`: release / re-engage the steppers for drag teaching.
pub const MOTORS_OFF: &str = "M84";
pub const MOTORS_ON: &str = "M17";
/// `G91` / `G90`: relative vs. absolute positioning, used around jogs.
pub const RELATIVE_MODE: &str = "G91";
pub const ABSOLUTE_MODE: &str = "G90";

/// Front-end modules the arm accepts via `M888`.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum FrontModule {
    PenHolder = 0,
    Laser = 1,
    Pneumatic = 2,
    Printer3d = 3,
}

pub fn select_module(module: FrontModule) -> String {
    format!("M888 P{}", module as u8)
}

/// Absolute move at a fixed feed rate.  Coordinates are emitted with two
/// decimals, matching what the controller echoes back.
pub fn move_to(target: Point, feedrate_mm_min: u32) -> String {
    format!(
        "G1 F{} X{:.2} Y{:.2} Z{:.2}",
        feedrate_mm_min, target.x, target.y, target.z
    )
}

/// Single-axis relative move; callers wrap this in `G91`/`G90`.
pub fn jog(axis: Axis, distance_mm: f64, feedrate_mm_min: u32) -> String {
    format!("G1 F{} {}{:.2}", feedrate_mm_min, axis, distance_mm)
}

pub fn is_ack(line: &str) -> bool {
    line.to_ascii_lowercase().contains("ok")
}

/// Parses an `M114` report of the shape `X:0.00 Y:300.00 Z:0.00 E:0.00`.
/// Unknown fields are ignored; all of X, Y and Z must be present.  Only the
/// first occurrence of each axis counts, so a Marlin-style `Count X:.. Y:..
/// Z:..` step-count trailer never shadows the reported coordinates.
pub fn parse_position_report(line: &str) -> Option<Point> {
    let mut x = None;
    let mut y = None;
    let mut z = None;
    for field in line.split_whitespace() {
        let (axis, value) = match field.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let value: f64 = match value.parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        match axis {
            "X" => x = x.or(Some(value)),
            "Y" => y = y.or(Some(value)),
            "Z" => z = z.or(Some(value)),
            _ => (),
        }
        if x.is_some() && y.is_some() && z.is_some() {
            break;
        }
    }
    Some(Point::new(x?, y?, z?))
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        };
        write!(f, "{letter}")
    }
}

impl FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x" => Ok(Axis::X),
            "y" => Ok(Axis::Y),
            "z" => Ok(Axis::Z),
            other => Err(format!("unknown axis '{other}' (expected x, y or z)")),
        }
    }
}
