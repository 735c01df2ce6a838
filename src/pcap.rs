//! # Link traffic capture
//!
//! All packets going through a link can be mirrored in a pcap file that can
//! then be opened in Wireshark with a CRTP dissector. The capture is enabled
//! by setting [Config::pcap_log](crate::Config::pcap_log), or the
//! `CRTP_PCAP_LOG` environment variable when using [Config::from_env()](crate::Config::from_env).
//!
//! Each record contains a small pseudo header describing the link followed by
//! the raw CRTP packet:
//!
//! ```text
//! | link type | receive | address ... | channel | device id | CRTP header | CRTP data ... |
//! ```

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::crtp::Packet;
use crate::{Error, Result};

/// pcap 2.4, little endian, snaplen 65535, link type 162 (user 15)
const GLOBAL_HEADER: [u8; 24] = [
    0xD4, 0xC3, 0xB2, 0xA1, // magic
    0x02, 0x00, // version major
    0x04, 0x00, // version minor
    0x00, 0x00, 0x00, 0x00, // thiszone
    0x00, 0x00, 0x00, 0x00, // sigfigs
    0xFF, 0xFF, 0x00, 0x00, // snaplen
    0xA2, 0x00, 0x00, 0x00, // network
];

const MAGIC: u32 = 0xA1B2C3D4;

// Largest snapshot length accepted when reading, as libpcap
const MAX_SNAPLEN: u32 = 262_144;

/// Kind of link a captured packet went through
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum LinkType {
    /// Crazyradio
    Radio = 1,
    /// Direct USB connection to the Crazyflie
    Usb = 2,
}

/// Pcap capture writer
///
/// The writer is shared between all links opened from the same
/// [LinkContext](crate::link::LinkContext), records are written and flushed
/// one at a time.
pub struct PcapLog {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl PcapLog {
    /// Create, or truncate, a capture file and write the pcap global header
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        info!("Opening pcap capture {}", path.as_ref().display());
        let file = File::create(path)?;
        Self::new(BufWriter::new(file))
    }

    /// Start a capture on any writer
    pub fn new(mut writer: impl Write + Send + 'static) -> Result<Self> {
        writer.write_all(&GLOBAL_HEADER)?;
        writer.flush()?;

        Ok(Self {
            writer: Mutex::new(Box::new(writer)),
        })
    }

    /// Append one CRTP packet to the capture
    ///
    /// `receive` is true for packets coming from the Crazyflie.
    pub fn log_crtp(
        &self,
        link_type: LinkType,
        receive: bool,
        devid: u8,
        address: &[u8],
        channel: u8,
        packet: &Packet,
    ) -> Result<()> {
        let mut record = Vec::with_capacity(4 + address.len() + 1 + packet.get_data().len());
        record.push(link_type.into());
        record.push(receive as u8);
        record.extend_from_slice(address);
        record.push(channel);
        record.push(devid);
        record.extend_from_slice(&packet.to_bytes());

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let length = record.len() as u32;

        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(&(now.as_secs() as u32).to_le_bytes());
        header.extend_from_slice(&now.subsec_micros().to_le_bytes());
        header.extend_from_slice(&length.to_le_bytes());
        header.extend_from_slice(&length.to_le_bytes());

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::SystemError("pcap writer lock poisoned".to_owned()))?;
        writer.write_all(&header)?;
        writer.write_all(&record)?;
        writer.flush()?;

        Ok(())
    }

    /// Same as [PcapLog::log_crtp()], a failure is only reported in the log
    pub(crate) fn log_crtp_or_warn(
        &self,
        link_type: LinkType,
        receive: bool,
        devid: u8,
        address: &[u8],
        channel: u8,
        packet: &Packet,
    ) {
        if let Err(e) = self.log_crtp(link_type, receive, devid, address, channel, packet) {
            warn!("Failed to write pcap record: {}", e);
        }
    }
}

/// One record of a capture file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcapRecord {
    /// Capture time since the unix epoch
    pub timestamp: Duration,
    /// Record content
    pub data: Vec<u8>,
}

/// CRTP record, as written by [PcapLog]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtpRecord {
    pub link_type: LinkType,
    /// True for packets coming from the Crazyflie
    pub receive: bool,
    pub address: Vec<u8>,
    pub channel: u8,
    pub devid: u8,
    pub packet: Packet,
}

impl PcapRecord {
    /// Decode the record as a CRTP capture record
    ///
    /// The length of the address is not stored in the file and needs to be
    /// known by the reader: 5 bytes for radio links, the length of the
    /// hex-decoded serial number for USB links.
    ///
    /// Returns `None` if the record is too short or the link type is unknown.
    pub fn crtp(&self, address_len: usize) -> Option<CrtpRecord> {
        let data = &self.data;
        if data.len() < 2 + address_len + 2 + 1 {
            return None;
        }

        let link_type = LinkType::try_from(data[0]).ok()?;
        let receive = data[1] != 0;
        let address = data[2..2 + address_len].to_vec();
        let channel = data[2 + address_len];
        let devid = data[3 + address_len];
        let packet = Packet::from_bytes(&data[4 + address_len..]).ok()?;

        Some(CrtpRecord {
            link_type,
            receive,
            address,
            channel,
            devid,
            packet,
        })
    }
}

/// Reader for capture files
///
/// Iterates over the records of a pcap file. Both byte orders are accepted.
pub struct PcapReader<R> {
    reader: R,
    big_endian: bool,
    snaplen: u32,
    link_type: u32,
}

impl PcapReader<File> {
    /// Open a capture file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(File::open(path)?)
    }
}

impl<R: Read> PcapReader<R> {
    /// Read and validate the pcap global header
    pub fn new(mut reader: R) -> Result<Self> {
        let mut header = [0u8; 24];
        reader.read_exact(&mut header)?;

        let magic = [header[0], header[1], header[2], header[3]];
        let big_endian = if u32::from_le_bytes(magic) == MAGIC {
            false
        } else if u32::from_be_bytes(magic) == MAGIC {
            true
        } else {
            return Err(Error::ProtocolError(format!(
                "Not a pcap file, magic {:02x?}",
                magic
            )));
        };

        let mut pcap = Self {
            reader,
            big_endian,
            snaplen: 0,
            link_type: 0,
        };
        pcap.snaplen = pcap.decode_u32(&header[16..20]).min(MAX_SNAPLEN);
        pcap.link_type = pcap.decode_u32(&header[20..24]);

        Ok(pcap)
    }

    /// Link layer type from the global header, 162 for CRTP captures
    pub fn link_type(&self) -> u32 {
        self.link_type
    }

    fn decode_u32(&self, bytes: &[u8]) -> u32 {
        let bytes = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if self.big_endian {
            u32::from_be_bytes(bytes)
        } else {
            u32::from_le_bytes(bytes)
        }
    }

    fn read_record(&mut self) -> Result<Option<PcapRecord>> {
        let mut header = [0u8; 16];
        match self.reader.read_exact(&mut header) {
            Ok(()) => (),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let ts_sec = self.decode_u32(&header[0..4]);
        let ts_usec = self.decode_u32(&header[4..8]);
        let incl_len = self.decode_u32(&header[8..12]);
        if incl_len > self.snaplen {
            return Err(Error::ProtocolError(format!(
                "Capture record of {} bytes, longer than the snapshot length {}",
                incl_len, self.snaplen
            )));
        }

        let mut data = vec![0u8; incl_len as usize];
        self.reader.read_exact(&mut data)?;

        Ok(Some(PcapRecord {
            timestamp: Duration::from_secs(ts_sec as u64) + Duration::from_micros(ts_usec as u64),
            data,
        }))
    }
}

impl<R: Read> Iterator for PcapReader<R> {
    type Item = Result<PcapRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_record().transpose()
    }
}
