//! # Platform services
//!
//! The platform CRTP port hosts a couple of utility services. The lib uses the
//! version channel to fetch the firmware version, the device type and the CRTP
//! protocol version. The protocol version is checked at connection time.

use crate::crtp::{CrtpPort, Packet};
use crate::crtp_utils::{crtp_channel_dispatcher, RequestChannel, RequestTiming};
use crate::{Error, Result};
use flume::{Receiver, Sender};

const VERSION_CHANNEL: u8 = 1;

const VERSION_GET_PROTOCOL: u8 = 0;
const VERSION_GET_FIRMWARE: u8 = 1;
const VERSION_GET_DEVICE_TYPE: u8 = 2;

/// Access to platform services
///
/// See the [platform module documentation](crate::subsystems::platform) for more context and information.
pub struct Platform {
    version_channel: RequestChannel,
}

impl Platform {
    pub(crate) fn new(
        uplink: Sender<Packet>,
        downlink: Receiver<Packet>,
        timing: RequestTiming,
    ) -> Self {
        let (_, version_downlink, _, _) = crtp_channel_dispatcher(downlink);

        Self {
            version_channel: RequestChannel::new(uplink, version_downlink, timing),
        }
    }

    async fn version_request(&self, command: u8) -> Result<Vec<u8>> {
        let request = Packet::new(CrtpPort::Platform.into(), VERSION_CHANNEL, vec![command]);
        let answer = self.version_channel.request(request, 1).await?;

        Ok(answer.get_data()[1..].to_vec())
    }

    /// Fetch the protocol version from Crazyflie
    ///
    /// The protocol version is updated when new message or breaking change are
    /// implemented in the protocol.
    /// see [the crate documentation](crate#compatibility) for more information.
    ///
    /// Compatibility is checked at connection time.
    pub async fn protocol_version(&self) -> Result<u8> {
        self.version_request(VERSION_GET_PROTOCOL)
            .await?
            .first()
            .copied()
            .ok_or_else(|| Error::ProtocolError("Empty protocol version answer".to_owned()))
    }

    /// Fetch the firmware version
    ///
    /// If this firmware is a stable release, the release name will be returned for example ```2021.06```.
    /// If this firmware is a git build, between releases, the number of commit since the last release will be added
    /// for example ```2021.06 +128```.
    pub async fn firmware_version(&self) -> Result<String> {
        let version = self.version_request(VERSION_GET_FIRMWARE).await?;

        Ok(String::from_utf8_lossy(&version).to_string())
    }

    /// Fetch the device type.
    ///
    /// The Crazyflie firmware can run on multiple device. This function returns the name of the device. For example
    /// ```Crazyflie 2.1``` is returned in the case of a Crazyflie 2.1.
    pub async fn device_type_name(&self) -> Result<String> {
        let name = self.version_request(VERSION_GET_DEVICE_TYPE).await?;

        Ok(String::from_utf8_lossy(&name).to_string())
    }
}
