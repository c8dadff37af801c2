//! Hardware abstraction for the arm transport.
//!
//! Everything the rest of the crate wants from the arm goes through
//! [`ArmHal`], so the cycle runner and the interactive controls can be
//! exercised against a mock without a serial port in sight.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::gcode::Axis;
use crate::position_store::Point;

#[derive(Error, Debug)]
pub enum HalError {
    #[error("arm is not connected: {0}")]
    NotConnected(String),
    #[error("no ok for '{command}' after {attempts} attempts")]
    CommandTimeout { command: String, attempts: u32 },
    #[error("unexpected reply from arm: '{0}'")]
    BadReply(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type HalResult<T> = Result<T, HalError>;

/// Pneumatic module actuations.  `Release` blows the vacuum off and stops
/// the pump; `PumpOff` stops the pump without the release puff.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SuctionCommand {
    Grab,
    Release,
    PumpOff,
}

#[async_trait]
pub trait ArmHal: Send {
    async fn go_home(&mut self) -> HalResult<()>;

    /// Absolute Cartesian move; resolves once the arm has stopped moving.
    async fn move_to(&mut self, target: Point) -> HalResult<()>;

    async fn send_suction_command(&mut self, command: SuctionCommand) -> HalResult<()>;

    /// Holds position for `period` (pressure settle after grab/release).
    async fn dwell(&mut self, period: Duration) -> HalResult<()>;

    /// Relative single-axis move for manual positioning.
    async fn jog(&mut self, axis: Axis, distance_mm: f64) -> HalResult<()>;

    /// `false` releases the steppers so the arm can be dragged by hand.
    async fn set_motors_enabled(&mut self, enabled: bool) -> HalResult<()>;

    async fn query_position(&mut self) -> HalResult<Point>;
}

/// The one serial link is an exclusively-owned resource: the cycle runner
/// and the interactive controls both go through this gate, so a manual jog
/// can never interleave with an in-progress automated step.
pub type SharedArmHal = Arc<Mutex<Box<dyn ArmHal>>>;

pub fn shared(hal: Box<dyn ArmHal>) -> SharedArmHal {
    Arc::new(Mutex::new(hal))
}
