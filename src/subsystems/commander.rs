//! # Low level setpoint subsystem
//!
//! This subsystem allows to send low-level setpoint. The setpoints are described as low-level in the sense that they
//! are setting the instant target state. As such they likely need to be send very often to have the crazyflie
//! follow the wanted flight profile.
//!
//! The Crazyflie has a couple of safety mechanisms that one needs to be aware of in order to send setpoints:
//!  - When using the [Commander::setpoint_rpyt()] function, a setpoint with thrust=0 must be sent once to unlock the thrust
//!  - If no setpoint is received for 1 second, the Crazyflie resets roll/pitch/yawrate to 0/0/0 and after 2 seconds
//!    falls back to a lower-priority setpoint which in most case will cut the motors.
//!
//! When the connection is closed, a zero RPYT setpoint is sent so that the motors stop.
//!
//! ``` no_run
//! # use tokio::time::{sleep, Duration};
//! # async fn ramp(crazyflie: crazyflie_crtp::Crazyflie) -> Result<(), Box<dyn std::error::Error>> {
//! // Unlock the commander
//! crazyflie.commander.setpoint_rpyt(0.0, 0.0, 0.0, 0).await?;
//!
//! for thrust in (0..20_000).step_by(1_000) {
//!     crazyflie.commander.setpoint_rpyt(0.0, 0.0, 0.0, thrust).await?;
//!     sleep(Duration::from_millis(100)).await;
//! }
//!
//! crazyflie.commander.setpoint_rpyt(0.0, 0.0, 0.0, 0).await?;
//! # Ok(())
//! # }
//! ```

use flume::Sender;

use crate::crtp::{CrtpPort, Packet};
use crate::Result;

const RPYT_CHANNEL: u8 = 0;
const GENERIC_SETPOINT_CHANNEL: u8 = 0;
const GENERIC_CMD_CHANNEL: u8 = 1;

// Generic setpoint types
const TYPE_STOP: u8 = 0;
const TYPE_POSITION: u8 = 7;
const TYPE_VELOCITY_WORLD: u8 = 8;
const TYPE_HOVER: u8 = 10;

const META_COMMAND_NOTIFY_SETPOINT_STOP: u8 = 0;

/// # Low level setpoint subsystem
///
/// See the [commander module documentation](crate::subsystems::commander) for more context and information.
#[derive(Debug)]
pub struct Commander {
    uplink: Sender<Packet>,
}

impl Commander {
    pub(crate) fn new(uplink: Sender<Packet>) -> Self {
        Self { uplink }
    }

    async fn send(&self, port: CrtpPort, channel: u8, payload: Vec<u8>) -> Result<()> {
        self.uplink
            .send_async(Packet::new(port.into(), channel, payload))
            .await?;
        Ok(())
    }

    async fn send_generic(&self, setpoint_type: u8, values: [f32; 4]) -> Result<()> {
        let mut payload = Vec::with_capacity(1 + 4 * 4);
        payload.push(setpoint_type);
        for value in values {
            payload.extend_from_slice(&value.to_le_bytes());
        }
        self.send(CrtpPort::GenericSetpoint, GENERIC_SETPOINT_CHANNEL, payload)
            .await
    }

    /// Sends a Roll, Pitch, Yawrate, and Thrust setpoint to the Crazyflie.
    ///
    /// By default, unless modified by [parameters](crate::subsystems::param::Param), the arguments are interpreted as:
    /// * `roll` - Desired roll angle (degrees)
    /// * `pitch` - Desired pitch angle (degrees)
    /// * `yawrate` - Desired yaw rate (degrees/second)
    /// * `thrust` - Thrust as a 16-bit value (0 = 0% thrust, 65535 = 100% thrust)
    pub async fn setpoint_rpyt(&self, roll: f32, pitch: f32, yawrate: f32, thrust: u16) -> Result<()> {
        let mut payload = Vec::with_capacity(3 * 4 + 2);
        payload.extend_from_slice(&roll.to_le_bytes());
        // The firmware expects the pitch in the opposite direction
        payload.extend_from_slice(&(-pitch).to_le_bytes());
        payload.extend_from_slice(&yawrate.to_le_bytes());
        payload.extend_from_slice(&thrust.to_le_bytes());

        self.send(CrtpPort::Commander, RPYT_CHANNEL, payload).await
    }

    /// Absolute position setpoint in world coordinates (meters), yaw in degrees
    pub async fn setpoint_position(&self, x: f32, y: f32, z: f32, yaw: f32) -> Result<()> {
        self.send_generic(TYPE_POSITION, [x, y, z, yaw]).await
    }

    /// Velocity setpoint in the world frame (meters/second), yaw rate in degrees/second
    pub async fn setpoint_velocity_world(&self, vx: f32, vy: f32, vz: f32, yawrate: f32) -> Result<()> {
        self.send_generic(TYPE_VELOCITY_WORLD, [vx, vy, vz, yawrate])
            .await
    }

    /// Hover setpoint: body-frame x/y velocity, yaw rate and absolute height above the ground
    pub async fn setpoint_hover(&self, vx: f32, vy: f32, yawrate: f32, zdistance: f32) -> Result<()> {
        self.send_generic(TYPE_HOVER, [vx, vy, yawrate, zdistance])
            .await
    }

    /// Sends a STOP setpoint, immediately stopping the motors. The Crazyflie will lose lift and may fall.
    pub async fn setpoint_stop(&self) -> Result<()> {
        self.send(CrtpPort::GenericSetpoint, GENERIC_SETPOINT_CHANNEL, vec![TYPE_STOP])
            .await
    }

    /// Lowers the priority of the current setpoint, allowing any new setpoint (from any source) to overwrite it.
    ///
    /// * `remain_valid_milliseconds` - Duration for which the current setpoint remains valid (usually 0)
    pub async fn notify_setpoint_stop(&self, remain_valid_milliseconds: u32) -> Result<()> {
        let mut payload = vec![META_COMMAND_NOTIFY_SETPOINT_STOP];
        payload.extend_from_slice(&remain_valid_milliseconds.to_le_bytes());
        self.send(CrtpPort::GenericSetpoint, GENERIC_CMD_CHANNEL, payload)
            .await
    }
}
