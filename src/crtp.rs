//! # CRTP packet framing
//!
//! Every exchange with the Crazyflie is a CRTP packet: one header byte followed
//! by up to [MAX_PAYLOAD] bytes of data. The header is formatted as:
//!
//! ```text
//!   pppp00cc
//! ```
//!
//! Where bits 0-1 are the channel (c), bits 2-3 are reserved for the link
//! flow-control and bits 4-7 are the port (p).

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{Error, Result};

/// Maximum size of the data part of a CRTP packet
pub const MAX_PAYLOAD: usize = 30;

/// CRTP ports used by the Crazyflie firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CrtpPort {
    /// Text console
    Console = 0,
    /// Parameter subsystem
    Param = 2,
    /// Legacy RPYT commander
    Commander = 3,
    /// Memory subsystem
    Memory = 4,
    /// Log subsystem
    Log = 5,
    /// Localization and emergency stop
    Localization = 6,
    /// Generic setpoints
    GenericSetpoint = 7,
    /// Platform services (version, app channel)
    Platform = 13,
    /// Link layer services and null packets
    LinkControl = 15,
}

/// # CRTP packet
///
/// The port is stored on 4 bits and the channel on 2 bits, the constructor
/// masks out anything above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    port: u8,
    channel: u8,
    data: Vec<u8>,
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(port: {}, ch: {}, data: {:02x?})",
            self.port, self.channel, self.data
        )
    }
}

impl Packet {
    /// Create a packet, the port and channel are truncated to their header width
    pub fn new(port: u8, channel: u8, data: Vec<u8>) -> Self {
        Packet {
            port: port & 0x0F,
            channel: channel & 0x03,
            data,
        }
    }

    /// Decode a packet as received from a link: header byte then data
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (header, data) = bytes
            .split_first()
            .ok_or_else(|| Error::ProtocolError("Empty CRTP packet".to_owned()))?;

        if data.len() > MAX_PAYLOAD {
            return Err(Error::PacketTooLarge(data.len()));
        }

        Ok(Packet {
            port: (header & 0xF0) >> 4,
            channel: header & 0x03,
            data: data.to_vec(),
        })
    }

    /// Encode the packet as it is sent on a link
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.data.len());
        bytes.push(self.header());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Header byte: `pppp00cc`
    pub fn header(&self) -> u8 {
        (self.port << 4) | self.channel
    }

    /// True if the data part fits in a CRTP packet
    pub fn is_data_size_valid(&self) -> bool {
        self.data.len() <= MAX_PAYLOAD
    }

    pub fn get_port(&self) -> u8 {
        self.port
    }

    pub fn get_channel(&self) -> u8 {
        self.channel
    }

    pub fn get_data(&self) -> &Vec<u8> {
        &self.data
    }

    /// Well-known port of this packet, `None` for unassigned port numbers
    pub fn port(&self) -> Option<CrtpPort> {
        CrtpPort::try_from(self.port).ok()
    }
}

impl From<crazyflie_link::Packet> for Packet {
    fn from(packet: crazyflie_link::Packet) -> Self {
        Packet::new(
            packet.get_port(),
            packet.get_channel(),
            packet.get_data().to_vec(),
        )
    }
}

impl From<Packet> for crazyflie_link::Packet {
    fn from(packet: Packet) -> Self {
        crazyflie_link::Packet::new(packet.port, packet.channel, packet.data)
    }
}
