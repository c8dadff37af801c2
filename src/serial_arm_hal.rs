//! The real arm: G-code over a serial line.
//!
//! Commands are written `\r`-terminated; the controller answers each one
//! with a line containing `ok`.  A command whose ack does not arrive inside
//! [`ACK_TIMEOUT`] is retransmitted a bounded number of times before the
//! whole operation fails with [`HalError::CommandTimeout`].

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace, warn};
use serial2_tokio::SerialPort;
use tokio::time::{sleep, timeout};

use crate::arm_hal::{ArmHal, HalError, HalResult, SuctionCommand};
use crate::gcode;
use crate::gcode::{Axis, FrontModule};
use crate::position_store::Point;
use crate::settings::CycleSettings;

const BAUD_RATE: u32 = 115200;
/// The controller resets when the port opens; give it time to come up.
const BOOT_DELAY: Duration = Duration::from_secs(2);
/// Must cover the slowest scripted move, since `M400` acks only once the
/// arm has stopped.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_SEND_ATTEMPTS: u32 = 3;

/// The slice of the port surface the command pipe needs.  Split out so the
/// ack/retransmit logic can run against a scripted port in tests.
#[async_trait]
trait RawPort: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

#[async_trait]
impl RawPort for SerialPort {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        SerialPort::read(self, buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SerialPort::write(self, buf).await
    }
}

/// Line-oriented command/ack framing over a raw port.
struct CommandPipe<P> {
    port: P,
    read_buf: Vec<u8>,
}

impl<P: RawPort> CommandPipe<P> {
    fn new(port: P) -> Self {
        Self {
            port,
            read_buf: Vec::new(),
        }
    }

    /// Sends one command and waits for its ack, retransmitting on timeout.
    /// Returns the last non-ack line seen, which is the payload for query
    /// commands like `M114`.
    async fn send_command(&mut self, command: &str) -> HalResult<String> {
        for attempt in 1..=MAX_SEND_ATTEMPTS {
            trace!("-> {command}");
            self.write_all(format!("{command}\r").as_bytes()).await?;
            match timeout(ACK_TIMEOUT, self.read_until_ack()).await {
                Ok(result) => return result,
                Err(_) => {
                    warn!("no ok for '{command}' (attempt {attempt}/{MAX_SEND_ATTEMPTS})");
                }
            }
        }
        Err(HalError::CommandTimeout {
            command: command.to_owned(),
            attempts: MAX_SEND_ATTEMPTS,
        })
    }

    async fn write_all(&mut self, bytes: &[u8]) -> HalResult<()> {
        let mut written = 0;
        while written < bytes.len() {
            written += self.port.write(&bytes[written..]).await?;
        }
        Ok(())
    }

    async fn read_until_ack(&mut self) -> HalResult<String> {
        let mut payload = String::new();
        loop {
            let line = self.read_line().await?;
            trace!("<- {line}");
            if gcode::is_ack(&line) {
                return Ok(if payload.is_empty() { line } else { payload });
            }
            if !line.is_empty() {
                payload = line;
            }
        }
    }

    async fn read_line(&mut self) -> HalResult<String> {
        loop {
            if let Some(line) = take_line(&mut self.read_buf) {
                return Ok(line);
            }
            let mut chunk = [0u8; 256];
            let n = self.port.read(&mut chunk).await?;
            if n == 0 {
                return Err(HalError::NotConnected("serial port closed".to_owned()));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }
}

pub struct SerialArmHal {
    pipe: CommandPipe<SerialPort>,
    feedrate_mm_min: u32,
    jog_feedrate_mm_min: u32,
}

impl SerialArmHal {
    /// Opens the port, waits out the controller boot, and selects the
    /// pneumatic front-end module.
    pub async fn connect(port_path: &str, settings: &CycleSettings) -> HalResult<Self> {
        let port = SerialPort::open(port_path, BAUD_RATE)
            .map_err(|e| HalError::NotConnected(format!("{port_path}: {e}")))?;
        let mut hal = Self {
            pipe: CommandPipe::new(port),
            feedrate_mm_min: settings.feedrate_mm_min,
            jog_feedrate_mm_min: settings.jog_feedrate_mm_min,
        };
        sleep(BOOT_DELAY).await;
        hal.pipe
            .send_command(&gcode::select_module(FrontModule::Pneumatic))
            .await?;
        debug!("connected to arm on {port_path}");
        Ok(hal)
    }

    pub fn list_ports() -> HalResult<Vec<PathBuf>> {
        Ok(SerialPort::available_ports()?)
    }
}

/// Pops the first `\n`-terminated line off the buffer, trimmed.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let newline = buf.iter().position(|&b| b == b'\n')?;
    let raw: Vec<u8> = buf.drain(..=newline).collect();
    Some(String::from_utf8_lossy(&raw).trim().to_owned())
}

#[async_trait]
impl ArmHal for SerialArmHal {
    async fn go_home(&mut self) -> HalResult<()> {
        self.pipe.send_command(gcode::HOME).await?;
        self.pipe.send_command(gcode::WAIT_FOR_MOVES).await?;
        Ok(())
    }

    async fn move_to(&mut self, target: Point) -> HalResult<()> {
        self.pipe
            .send_command(&gcode::move_to(target, self.feedrate_mm_min))
            .await?;
        // The move command acks as soon as it is buffered; M400 acks when
        // the arm has actually stopped.
        self.pipe.send_command(gcode::WAIT_FOR_MOVES).await?;
        Ok(())
    }

    async fn send_suction_command(&mut self, command: SuctionCommand) -> HalResult<()> {
        match command {
            SuctionCommand::Grab => {
                self.pipe.send_command(gcode::SUCTION_ON).await?;
            }
            SuctionCommand::Release => {
                self.pipe.send_command(gcode::SUCTION_RELEASE).await?;
                self.pipe.send_command(gcode::PUMP_OFF).await?;
            }
            SuctionCommand::PumpOff => {
                self.pipe.send_command(gcode::PUMP_OFF).await?;
            }
        }
        Ok(())
    }

    async fn dwell(&mut self, period: Duration) -> HalResult<()> {
        sleep(period).await;
        Ok(())
    }

    async fn jog(&mut self, axis: Axis, distance_mm: f64) -> HalResult<()> {
        self.pipe.send_command(gcode::RELATIVE_MODE).await?;
        self.pipe
            .send_command(&gcode::jog(axis, distance_mm, self.jog_feedrate_mm_min))
            .await?;
        self.pipe.send_command(gcode::ABSOLUTE_MODE).await?;
        Ok(())
    }

    async fn set_motors_enabled(&mut self, enabled: bool) -> HalResult<()> {
        let command = if enabled {
            gcode::MOTORS_ON
        } else {
            gcode::MOTORS_OFF
        };
        self.pipe.send_command(command).await?;
        Ok(())
    }

    async fn query_position(&mut self) -> HalResult<Point> {
        let reply = self.pipe.send_command(gcode::REPORT_POSITION).await?;
        gcode::parse_position_report(&reply).ok_or(HalError::BadReply(reply))
    }
}
