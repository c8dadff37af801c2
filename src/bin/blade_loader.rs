//! Operator CLI for the blade loader.
//!
//! Teach the arm a pick position and a rack of hooks, test individual
//! hooks, then `run` the full cycle.  While a cycle is running, type
//! `pause`, `resume` or `stop` (or `p`/`r`/`s`) followed by Enter.
//!
//! Positions are read from the arm itself (jog or drag it into place
//! first) unless explicit coordinates are given, e.g.
//! `blade-loader set-pick --at 150,200,-50`.

use std::io::BufRead;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{error, info};

use blade_loader::arm_hal::{shared, SharedArmHal, SuctionCommand};
use blade_loader::arm_hal_factory::ArmHalFactory;
use blade_loader::cycle_runner::{CycleOutcome, CycleRunner};
use blade_loader::gcode::Axis;
use blade_loader::position_store::{Point, PositionSet, PositionStore};
use blade_loader::serial_arm_hal::SerialArmHal;
use blade_loader::settings::CycleSettings;

#[derive(Parser, Debug)]
#[clap(name = "blade-loader")]
struct Opts {
    /// Serial port of the arm, e.g. /dev/ttyACM0.
    #[clap(short, long)]
    port: Option<String>,

    /// Use the mock arm even when a port is given.
    #[clap(long)]
    fake_hw: bool,

    #[clap(long, default_value = "blade_positions.json")]
    positions_file: PathBuf,

    #[clap(long, default_value = "loader_settings.json")]
    settings_file: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports that might be the arm.
    ListPorts,
    /// Print the taught positions.
    Show,
    /// Send the arm to its home position.
    Home,
    /// Report the arm's current position.
    Where,
    /// Move one axis by a relative distance in millimeters.
    Jog {
        axis: Axis,
        #[clap(allow_hyphen_values = true)]
        distance_mm: f64,
    },
    /// Release the steppers so the arm can be dragged into position by
    /// hand; `--lock` engages them again.
    Teach {
        #[clap(long)]
        lock: bool,
    },
    /// Store the arm's current position (or `--at x,y,z`) as the pick point.
    SetPick {
        #[clap(long, allow_hyphen_values = true)]
        at: Option<Point>,
    },
    /// Store the hover point above the pick stack.
    SetPickApproach {
        #[clap(long, allow_hyphen_values = true)]
        at: Option<Point>,
    },
    /// Append a hook.  The drop point defaults to the arm's current
    /// position; the approach defaults to the drop point at hover height.
    AddHook {
        #[clap(long, allow_hyphen_values = true)]
        drop: Option<Point>,
        #[clap(long, allow_hyphen_values = true)]
        approach: Option<Point>,
    },
    DeleteHook { index: usize },
    ClearHooks,
    /// Move to the taught pick position.
    GoPick,
    /// Move to a taught hook position.
    GoHook { index: usize },
    /// Suction tests.
    Grab,
    Release,
    PumpOff,
    /// Run one pick-and-place against a single hook.
    TestHook { index: usize },
    /// Run the full cycle over every taught hook.
    Run {
        /// Keep cycling from hook 0 after the last hook.
        #[clap(long = "loop")]
        loop_cycle: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts: Opts = Opts::parse();

    if let Command::ListPorts = opts.command {
        for port in SerialArmHal::list_ports()? {
            println!("{}", port.display());
        }
        return Ok(());
    }

    let mut store = PositionStore::load(&opts.positions_file)?;
    let mut settings = CycleSettings::load_or_default(&opts.settings_file)?;

    if let Command::Show = opts.command {
        print_positions(store.positions());
        return Ok(());
    }
    if let Command::Run { loop_cycle: true } = opts.command {
        settings.loop_cycle = true;
    }

    let factory = ArmHalFactory::new_maybe_mock(opts.fake_hw);
    let hal = shared(factory.create_hal(opts.port.as_deref(), &settings).await?);

    match opts.command {
        Command::ListPorts | Command::Show => unreachable!("handled above"),
        Command::Home => hal.lock().await.go_home().await?,
        Command::Where => {
            let position = hal.lock().await.query_position().await?;
            println!("X:{:.2} Y:{:.2} Z:{:.2}", position.x, position.y, position.z);
        }
        Command::Jog { axis, distance_mm } => {
            hal.lock().await.jog(axis, distance_mm).await?;
        }
        Command::Teach { lock } => {
            hal.lock().await.set_motors_enabled(lock).await?;
            if lock {
                println!("Motors locked.");
            } else {
                println!("Motors released, drag the arm where you want it.");
            }
        }
        Command::SetPick { at } => {
            let point = point_or_current(&hal, at).await?;
            store.set_pick(point)?;
            println!("Pick set to {point:?}");
        }
        Command::SetPickApproach { at } => {
            let point = point_or_current(&hal, at).await?;
            store.set_pick_approach(point)?;
            println!("Pick approach set to {point:?}");
        }
        Command::AddHook { drop, approach } => {
            let drop = point_or_current(&hal, drop).await?;
            let approach = approach.unwrap_or_else(|| {
                // Same spot at hover height; hover defaults to the pick
                // approach's plane.
                let hover_z = store
                    .positions()
                    .pick_approach
                    .map(|p| p.z)
                    .unwrap_or(0.0);
                Point::new(drop.x, drop.y, hover_z)
            });
            let index = store.add_hook(approach, drop)?;
            println!("Hook {index} added: drop {drop:?}, approach {approach:?}");
        }
        Command::DeleteHook { index } => store.delete_hook(index)?,
        Command::ClearHooks => store.clear_hooks()?,
        Command::GoPick => match store.positions().pick {
            Some(pick) => hal.lock().await.move_to(pick).await?,
            None => anyhow::bail!("no pick position taught"),
        },
        Command::GoHook { index } => match store.positions().hook_pair(index) {
            Some((_, hook)) => hal.lock().await.move_to(hook).await?,
            None => anyhow::bail!("hook {index} is not taught"),
        },
        Command::Grab => {
            hal.lock()
                .await
                .send_suction_command(SuctionCommand::Grab)
                .await?
        }
        Command::Release => {
            hal.lock()
                .await
                .send_suction_command(SuctionCommand::Release)
                .await?
        }
        Command::PumpOff => {
            hal.lock()
                .await
                .send_suction_command(SuctionCommand::PumpOff)
                .await?
        }
        Command::TestHook { index } => {
            let mut runner = CycleRunner::new(hal.clone(), settings);
            runner.start_single(store.positions(), index)?;
            let outcome = runner.wait().await;
            runner.stop().await?;
            outcome?;
            println!("Hook {index} test done.");
        }
        Command::Run { .. } => run_cycle(hal.clone(), store.positions(), settings).await?,
    }

    Ok(())
}

async fn point_or_current(hal: &SharedArmHal, at: Option<Point>) -> anyhow::Result<Point> {
    match at {
        Some(point) => Ok(point),
        None => Ok(hal.lock().await.query_position().await?),
    }
}

fn print_positions(positions: &PositionSet) {
    println!("pick:          {:?}", positions.pick);
    println!("pick approach: {:?}", positions.pick_approach);
    for (i, (hook, approach)) in positions
        .hooks
        .iter()
        .zip(&positions.hook_approaches)
        .enumerate()
    {
        println!("hook {i}: drop {hook:?}, approach {approach:?}");
    }
    if positions.hooks.is_empty() {
        println!("(no hooks taught)");
    }
}

async fn run_cycle(
    hal: SharedArmHal,
    positions: &PositionSet,
    settings: CycleSettings,
) -> anyhow::Result<()> {
    let mut runner = CycleRunner::new(hal, settings);
    runner.start(positions)?;

    let controls = runner.controls();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => return,
            };
            match line.trim() {
                "p" | "pause" => controls.pause(),
                "r" | "resume" => controls.resume(),
                "s" | "stop" => {
                    controls.request_stop();
                    return;
                }
                "" => (),
                other => eprintln!("unknown command '{other}' (pause/resume/stop)"),
            }
        }
    });

    println!(
        "Cycle running over {} hook(s); pause/resume/stop + Enter to control.",
        positions.num_hooks()
    );
    let outcome = runner.wait().await;
    runner.stop().await?;
    match outcome {
        Ok(CycleOutcome::Completed) => info!("all hooks loaded"),
        Ok(CycleOutcome::Aborted) => info!("stopped by operator"),
        Err(e) => {
            error!("run aborted: {e}");
            return Err(e.into());
        }
    }
    println!("Done.");
    Ok(())
}
