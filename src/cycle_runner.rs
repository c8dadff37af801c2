//! Replays the taught positions as a fixed pick-and-place script.
//!
//! The runner is a small four-state machine (Idle, Running, Paused,
//! Stopped) with an explicit cursor into the hook list.  The script itself
//! executes on a spawned tokio task; pause/resume/stop arrive over a watch
//! channel and take effect at the checkpoint between atomic steps, never
//! mid-motion.  Status (state + cursor) is broadcast over a second watch
//! channel so the control surface can follow along.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::arm_hal::{HalError, SharedArmHal, SuctionCommand};
use crate::position_store::{Point, PositionSet};
use crate::settings::CycleSettings;

#[derive(Error, Debug)]
pub enum CycleError {
    #[error("no hooks taught yet")]
    NoHooksTaught,
    #[error("hook {0} is not taught")]
    InvalidHookIndex(usize),
    #[error("pick and pick-approach positions must be taught first")]
    MissingPick,
    #[error("a cycle is already running")]
    AlreadyRunning,
    #[error("hook list and approach list are out of step: {hooks} vs {approaches}")]
    UnpairedHooks { hooks: usize, approaches: usize },
    #[error("cycle task died: {0}")]
    Internal(String),
    #[error(transparent)]
    Hal(#[from] HalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleStatus {
    pub state: RunState,
    pub cursor: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlRequest {
    Run,
    Pause,
    Stop,
}

/// One atomic step of the motion script.  Control requests are honored
/// between steps, so each of these runs to completion once started.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ScriptStep {
    MoveTo(Point),
    Suction(SuctionCommand),
    Dwell(Duration),
}

enum Checkpoint {
    Continue,
    Abort,
}

pub struct CycleRunner {
    hal: SharedArmHal,
    settings: CycleSettings,
    control: Arc<watch::Sender<ControlRequest>>,
    status: Arc<watch::Sender<CycleStatus>>,
    task: Option<JoinHandle<Result<CycleOutcome, CycleError>>>,
}

/// Thin cloneable handle for pause/resume/stop requests, safe to hand to
/// another thread (e.g. a stdin reader) while the runner is awaited.
#[derive(Clone)]
pub struct CycleControls {
    control: Arc<watch::Sender<ControlRequest>>,
}

impl CycleControls {
    pub fn pause(&self) {
        self.control.send_replace(ControlRequest::Pause);
    }

    pub fn resume(&self) {
        self.control.send_replace(ControlRequest::Run);
    }

    /// Requests an abort at the next checkpoint.  The arm is only homed by
    /// [`CycleRunner::stop`], not by this request.
    pub fn request_stop(&self) {
        self.control.send_replace(ControlRequest::Stop);
    }
}

impl CycleRunner {
    pub fn new(hal: SharedArmHal, settings: CycleSettings) -> Self {
        let (control, _) = watch::channel(ControlRequest::Run);
        let (status, _) = watch::channel(CycleStatus {
            state: RunState::Idle,
            cursor: 0,
        });
        Self {
            hal,
            settings,
            control: Arc::new(control),
            status: Arc::new(status),
            task: None,
        }
    }

    pub fn status(&self) -> watch::Receiver<CycleStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> CycleStatus {
        *self.status.borrow()
    }

    pub fn controls(&self) -> CycleControls {
        CycleControls {
            control: self.control.clone(),
        }
    }

    /// Starts a full run over every taught hook.  Legal from Idle or
    /// Stopped; the cursor always restarts at hook 0.
    pub fn start(&mut self, positions: &PositionSet) -> Result<(), CycleError> {
        self.spawn_run(positions, None)
    }

    /// Runs the script against a single hook, for testing a fresh teach.
    pub fn start_single(
        &mut self,
        positions: &PositionSet,
        hook_index: usize,
    ) -> Result<(), CycleError> {
        if hook_index >= positions.hooks.len() {
            return Err(CycleError::InvalidHookIndex(hook_index));
        }
        self.spawn_run(positions, Some(hook_index))
    }

    fn spawn_run(
        &mut self,
        positions: &PositionSet,
        only_hook: Option<usize>,
    ) -> Result<(), CycleError> {
        match self.current_status().state {
            RunState::Idle | RunState::Stopped => (),
            RunState::Running | RunState::Paused => return Err(CycleError::AlreadyRunning),
        }
        if positions.hooks.len() != positions.hook_approaches.len() {
            return Err(CycleError::UnpairedHooks {
                hooks: positions.hooks.len(),
                approaches: positions.hook_approaches.len(),
            });
        }
        if positions.hooks.is_empty() {
            return Err(CycleError::NoHooksTaught);
        }
        let (pick, pick_approach) = match (positions.pick, positions.pick_approach) {
            (Some(pick), Some(approach)) => (pick, approach),
            _ => return Err(CycleError::MissingPick),
        };

        let start_cursor = only_hook.unwrap_or(0);
        self.control.send_replace(ControlRequest::Run);
        self.status.send_replace(CycleStatus {
            state: RunState::Running,
            cursor: start_cursor,
        });
        info!(
            "starting cycle over {} hook(s) at cursor {start_cursor}",
            positions.hooks.len()
        );

        let task = CycleTask {
            hal: self.hal.clone(),
            pick,
            pick_approach,
            hooks: positions.hooks.clone(),
            hook_approaches: positions.hook_approaches.clone(),
            settings: self.settings.clone(),
            control: self.control.subscribe(),
            status: self.status.clone(),
            only_hook,
        };
        self.task = Some(tokio::spawn(task.run()));
        Ok(())
    }

    /// Suspends the run at the next checkpoint; the step in flight always
    /// finishes first.
    pub fn pause(&self) {
        if self.current_status().state != RunState::Running {
            warn!("pause requested but no cycle is running");
            return;
        }
        self.controls().pause();
    }

    pub fn resume(&self) {
        if self.current_status().state != RunState::Paused {
            warn!("resume requested but the cycle is not paused");
            return;
        }
        self.controls().resume();
    }

    /// Waits for the running cycle to finish (or abort).  The state is
    /// Stopped afterwards; call [`stop`](Self::stop) to home the arm and
    /// return to Idle.
    pub async fn wait(&mut self) -> Result<CycleOutcome, CycleError> {
        let handle = match self.task.take() {
            Some(handle) => handle,
            None => return Ok(CycleOutcome::Completed),
        };
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(CycleError::Internal(e.to_string())),
        }
    }

    /// Aborts any in-flight run, then shuts the pump off and issues exactly
    /// one return-home command.  Ends in Idle from any starting state.
    pub async fn stop(&mut self) -> Result<(), CycleError> {
        self.control.send_replace(ControlRequest::Stop);
        if let Some(handle) = self.task.take() {
            match handle.await {
                Ok(Ok(_)) => (),
                Ok(Err(e)) => warn!("run had already failed before stop: {e}"),
                Err(e) => warn!("cycle task died before stop: {e}"),
            }
        }
        let mut hal = self.hal.lock().await;
        hal.send_suction_command(SuctionCommand::PumpOff).await?;
        hal.go_home().await?;
        drop(hal);
        self.status.send_replace(CycleStatus {
            state: RunState::Idle,
            cursor: 0,
        });
        info!("stopped, arm homed");
        Ok(())
    }
}

struct CycleTask {
    hal: SharedArmHal,
    pick: Point,
    pick_approach: Point,
    hooks: Vec<Point>,
    hook_approaches: Vec<Point>,
    settings: CycleSettings,
    control: watch::Receiver<ControlRequest>,
    status: Arc<watch::Sender<CycleStatus>>,
    only_hook: Option<usize>,
}

impl CycleTask {
    async fn run(mut self) -> Result<CycleOutcome, CycleError> {
        let mut cursor = self.only_hook.unwrap_or(0);
        loop {
            match self.run_one_cycle(cursor).await {
                Ok(Checkpoint::Continue) => (),
                Ok(Checkpoint::Abort) => {
                    info!("run aborted at hook {cursor}");
                    self.publish(RunState::Stopped, cursor);
                    return Ok(CycleOutcome::Aborted);
                }
                Err(e) => {
                    error!("run failed at hook {cursor}: {e}");
                    self.publish(RunState::Stopped, cursor);
                    return Err(e);
                }
            }
            if self.only_hook.is_some() {
                break;
            }
            if cursor + 1 == self.hooks.len() && !self.settings.loop_cycle {
                // Leave the cursor on the last serviced hook.
                break;
            }
            cursor = (cursor + 1) % self.hooks.len();
            self.publish(RunState::Running, cursor);
        }
        info!("all hooks serviced");
        self.publish(RunState::Stopped, cursor);
        Ok(CycleOutcome::Completed)
    }

    /// One full blade: pick it up, carry it over, hang it on hook `cursor`.
    async fn run_one_cycle(&mut self, cursor: usize) -> Result<Checkpoint, CycleError> {
        let (hook_approach, hook) = match (
            self.hook_approaches.get(cursor),
            self.hooks.get(cursor),
        ) {
            (Some(approach), Some(hook)) => (*approach, *hook),
            _ => return Err(CycleError::InvalidHookIndex(cursor)),
        };
        let script = [
            ScriptStep::MoveTo(self.pick_approach),
            ScriptStep::MoveTo(self.pick),
            ScriptStep::Suction(SuctionCommand::Grab),
            ScriptStep::Dwell(self.settings.grab_delay()),
            ScriptStep::MoveTo(self.pick_approach),
            ScriptStep::MoveTo(hook_approach),
            ScriptStep::MoveTo(hook),
            ScriptStep::Suction(SuctionCommand::Release),
            ScriptStep::Dwell(self.settings.release_delay()),
            ScriptStep::MoveTo(hook_approach),
        ];
        for step in script {
            if let Checkpoint::Abort = self.checkpoint(cursor).await {
                return Ok(Checkpoint::Abort);
            }
            self.exec_step(step).await?;
        }
        Ok(Checkpoint::Continue)
    }

    /// The only legal cancellation point: parks while paused, reports
    /// whether a stop was requested.
    async fn checkpoint(&mut self, cursor: usize) -> Checkpoint {
        loop {
            let request = *self.control.borrow_and_update();
            match request {
                ControlRequest::Run => {
                    self.publish(RunState::Running, cursor);
                    return Checkpoint::Continue;
                }
                ControlRequest::Stop => return Checkpoint::Abort,
                ControlRequest::Pause => {
                    info!("paused at hook {cursor}");
                    self.publish(RunState::Paused, cursor);
                    if self.control.changed().await.is_err() {
                        // Runner gone; treat as a stop.
                        return Checkpoint::Abort;
                    }
                }
            }
        }
    }

    /// The HAL lock is held per atomic step, so a manual jog from the
    /// control surface can never interleave with one.
    async fn exec_step(&mut self, step: ScriptStep) -> Result<(), CycleError> {
        let mut hal = self.hal.lock().await;
        match step {
            ScriptStep::MoveTo(target) => hal.move_to(target).await?,
            ScriptStep::Suction(command) => hal.send_suction_command(command).await?,
            ScriptStep::Dwell(period) => hal.dwell(period).await?,
        }
        Ok(())
    }

    fn publish(&self, state: RunState, cursor: usize) {
        self.status.send_if_modified(|current| {
            let next = CycleStatus { state, cursor };
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm_hal::shared;
    use crate::arm_hal_mock::{ArmHalMock, CommandJournal, MockCommand};

    fn one_hook_positions() -> PositionSet {
        PositionSet {
            pick: Some(Point::new(150.0, 200.0, -50.0)),
            pick_approach: Some(Point::new(150.0, 200.0, 0.0)),
            hooks: vec![Point::new(-50.0, 280.0, -30.0)],
            hook_approaches: vec![Point::new(-50.0, 280.0, 0.0)],
        }
    }

    fn two_hook_positions() -> PositionSet {
        let mut positions = one_hook_positions();
        positions.hooks.push(Point::new(-80.0, 280.0, -30.0));
        positions.hook_approaches.push(Point::new(-80.0, 280.0, 0.0));
        positions
    }

    fn mock_runner(settings: CycleSettings) -> (CycleRunner, CommandJournal) {
        let mock = ArmHalMock::default();
        let journal = mock.journal();
        (CycleRunner::new(shared(Box::new(mock)), settings), journal)
    }

    fn expected_cycle(positions: &PositionSet, hook: usize) -> Vec<MockCommand> {
        let settings = CycleSettings::default();
        vec![
            MockCommand::MoveTo(positions.pick_approach.unwrap()),
            MockCommand::MoveTo(positions.pick.unwrap()),
            MockCommand::Suction(SuctionCommand::Grab),
            MockCommand::Dwell(settings.grab_delay()),
            MockCommand::MoveTo(positions.pick_approach.unwrap()),
            MockCommand::MoveTo(positions.hook_approaches[hook]),
            MockCommand::MoveTo(positions.hooks[hook]),
            MockCommand::Suction(SuctionCommand::Release),
            MockCommand::Dwell(settings.release_delay()),
            MockCommand::MoveTo(positions.hook_approaches[hook]),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_hook_run_issues_exact_script() {
        let positions = one_hook_positions();
        let (mut runner, journal) = mock_runner(CycleSettings::default());

        runner.start(&positions).unwrap();
        let outcome = runner.wait().await.unwrap();

        assert_eq!(outcome, CycleOutcome::Completed);
        assert_eq!(runner.current_status().state, RunState::Stopped);
        assert_eq!(*journal.lock().unwrap(), expected_cycle(&positions, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_hooks_is_rejected_before_any_motion() {
        let positions = PositionSet {
            pick: Some(Point::new(0.0, 200.0, 0.0)),
            pick_approach: Some(Point::new(0.0, 200.0, 10.0)),
            ..Default::default()
        };
        let (mut runner, journal) = mock_runner(CycleSettings::default());

        assert!(matches!(
            runner.start(&positions),
            Err(CycleError::NoHooksTaught)
        ));
        assert_eq!(runner.current_status().state, RunState::Idle);
        assert!(journal.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_untaught_pick_is_rejected() {
        let mut positions = one_hook_positions();
        positions.pick_approach = None;
        let (mut runner, journal) = mock_runner(CycleSettings::default());

        assert!(matches!(
            runner.start(&positions),
            Err(CycleError::MissingPick)
        ));
        assert!(journal.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_running_is_rejected() {
        let positions = one_hook_positions();
        let (mut runner, _journal) = mock_runner(CycleSettings::default());

        runner.start(&positions).unwrap();
        assert!(matches!(
            runner.start(&positions),
            Err(CycleError::AlreadyRunning)
        ));
        runner.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_preserves_cursor_and_skips_nothing() {
        let positions = two_hook_positions();
        let (mut runner, journal) = mock_runner(CycleSettings::default());

        runner.start(&positions).unwrap();
        // The task has not had a chance to run yet, so this parks it at the
        // very first checkpoint.
        runner.pause();

        let mut status = runner.status();
        while status.borrow_and_update().state != RunState::Paused {
            status.changed().await.unwrap();
        }
        let paused_at = runner.current_status().cursor;
        assert!(journal.lock().unwrap().is_empty());

        runner.resume();
        assert_eq!(runner.current_status().cursor, paused_at);
        assert_eq!(runner.wait().await.unwrap(), CycleOutcome::Completed);

        // Both hooks serviced exactly once, in order.
        let mut expected = expected_cycle(&positions, 0);
        expected.extend(expected_cycle(&positions, 1));
        assert_eq!(*journal.lock().unwrap(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_homes_exactly_once_and_ends_idle() {
        let positions = two_hook_positions();
        let (mut runner, journal) = mock_runner(CycleSettings::default());

        runner.start(&positions).unwrap();
        runner.stop().await.unwrap();

        assert_eq!(runner.current_status().state, RunState::Idle);
        let journal = journal.lock().unwrap();
        assert_eq!(
            *journal,
            vec![
                MockCommand::Suction(SuctionCommand::PumpOff),
                MockCommand::Home,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_a_run_still_homes_once() {
        let (mut runner, journal) = mock_runner(CycleSettings::default());
        runner.stop().await.unwrap();

        assert_eq!(runner.current_status().state, RunState::Idle);
        let homes = journal
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == MockCommand::Home)
            .count();
        assert_eq!(homes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hal_failure_aborts_into_stopped() {
        let positions = one_hook_positions();
        let mock = ArmHalMock::default().failing_after(3);
        let journal = mock.journal();
        let mut runner =
            CycleRunner::new(shared(Box::new(mock)), CycleSettings::default());

        runner.start(&positions).unwrap();
        let result = runner.wait().await;

        assert!(matches!(
            result,
            Err(CycleError::Hal(HalError::CommandTimeout { .. }))
        ));
        assert_eq!(runner.current_status().state, RunState::Stopped);
        assert_eq!(journal.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_cycle_wraps_back_to_hook_zero() {
        let positions = one_hook_positions();
        let settings = CycleSettings {
            loop_cycle: true,
            ..Default::default()
        };
        let (mut runner, journal) = mock_runner(settings);

        runner.start(&positions).unwrap();
        // Let a good stretch of virtual time pass; the dwells pace each
        // cycle, so this covers many wraps.
        tokio::time::sleep(Duration::from_secs(30)).await;
        runner.controls().request_stop();
        assert_eq!(runner.wait().await.unwrap(), CycleOutcome::Aborted);

        let journal = journal.lock().unwrap();
        assert!(journal.len() > 10, "expected more than one cycle");
        let expected = expected_cycle(&positions, 0);
        assert_eq!(journal[10], expected[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_hook_test_mode_targets_only_that_hook() {
        let positions = two_hook_positions();
        let (mut runner, journal) = mock_runner(CycleSettings::default());

        runner.start_single(&positions, 1).unwrap();
        assert_eq!(runner.wait().await.unwrap(), CycleOutcome::Completed);
        assert_eq!(*journal.lock().unwrap(), expected_cycle(&positions, 1));

        assert!(matches!(
            runner.start_single(&positions, 5),
            Err(CycleError::InvalidHookIndex(5))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_run_reports_last_serviced_hook() {
        let positions = two_hook_positions();
        let (mut runner, _journal) = mock_runner(CycleSettings::default());

        runner.start(&positions).unwrap();
        assert_eq!(runner.wait().await.unwrap(), CycleOutcome::Completed);

        let status = runner.current_status();
        assert_eq!(status.state, RunState::Stopped);
        assert_eq!(status.cursor, positions.hooks.len() - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_completed_run() {
        let positions = one_hook_positions();
        let (mut runner, journal) = mock_runner(CycleSettings::default());

        runner.start(&positions).unwrap();
        runner.wait().await.unwrap();
        assert_eq!(runner.current_status().state, RunState::Stopped);

        runner.start(&positions).unwrap();
        runner.wait().await.unwrap();
        assert_eq!(journal.lock().unwrap().len(), 20);
    }
}
