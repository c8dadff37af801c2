//! Mock arm for tests and `--fake-hw` runs.
//!
//! Every HAL call is appended to a shared journal so tests can assert the
//! exact command sequence a run produced.  Dwells still consume (test)
//! time so pacing behaves like the real thing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use crate::arm_hal::{ArmHal, HalError, HalResult, SuctionCommand};
use crate::gcode::Axis;
use crate::position_store::Point;

/// Where the real arm boots to.
const MOCK_HOME: Point = Point {
    x: 0.0,
    y: 300.0,
    z: 0.0,
};

#[derive(Debug, Clone, PartialEq)]
pub enum MockCommand {
    Home,
    MoveTo(Point),
    Suction(SuctionCommand),
    Dwell(Duration),
    Jog(Axis, f64),
    MotorsEnabled(bool),
    QueryPosition,
}

pub type CommandJournal = Arc<Mutex<Vec<MockCommand>>>;

pub struct ArmHalMock {
    journal: CommandJournal,
    reported_position: Point,
    fail_after: Option<usize>,
}

impl Default for ArmHalMock {
    fn default() -> Self {
        Self {
            journal: Arc::new(Mutex::new(Vec::new())),
            reported_position: MOCK_HOME,
            fail_after: None,
        }
    }
}

impl ArmHalMock {
    /// Handle to the journal; clone it out before boxing the mock.
    pub fn journal(&self) -> CommandJournal {
        self.journal.clone()
    }

    pub fn with_reported_position(mut self, position: Point) -> Self {
        self.reported_position = position;
        self
    }

    /// Makes every command starting with the `n`-th fail as a timeout, for
    /// exercising abort paths.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    fn record(&mut self, command: MockCommand) -> HalResult<()> {
        if let Some(remaining) = &mut self.fail_after {
            if *remaining == 0 {
                return Err(HalError::CommandTimeout {
                    command: format!("{command:?}"),
                    attempts: 1,
                });
            }
            *remaining -= 1;
        }
        debug!("mock arm: {command:?}");
        self.journal.lock().expect("journal lock").push(command);
        Ok(())
    }
}

#[async_trait]
impl ArmHal for ArmHalMock {
    async fn go_home(&mut self) -> HalResult<()> {
        self.record(MockCommand::Home)?;
        self.reported_position = MOCK_HOME;
        Ok(())
    }

    async fn move_to(&mut self, target: Point) -> HalResult<()> {
        self.record(MockCommand::MoveTo(target))?;
        self.reported_position = target;
        Ok(())
    }

    async fn send_suction_command(&mut self, command: SuctionCommand) -> HalResult<()> {
        self.record(MockCommand::Suction(command))
    }

    async fn dwell(&mut self, period: Duration) -> HalResult<()> {
        self.record(MockCommand::Dwell(period))?;
        tokio::time::sleep(period).await;
        Ok(())
    }

    async fn jog(&mut self, axis: Axis, distance_mm: f64) -> HalResult<()> {
        self.record(MockCommand::Jog(axis, distance_mm))?;
        match axis {
            Axis::X => self.reported_position.x += distance_mm,
            Axis::Y => self.reported_position.y += distance_mm,
            Axis::Z => self.reported_position.z += distance_mm,
        }
        Ok(())
    }

    async fn set_motors_enabled(&mut self, enabled: bool) -> HalResult<()> {
        self.record(MockCommand::MotorsEnabled(enabled))
    }

    async fn query_position(&mut self) -> HalResult<Point> {
        self.record(MockCommand::QueryPosition)?;
        Ok(self.reported_position)
    }
}
