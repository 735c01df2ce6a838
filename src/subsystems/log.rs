//! # Log subsystem
//!
//! The Crazyflie log subsystem allows to asynchronously log the value of exposed Crazyflie variables from the ground.
//!
//! At connection time, a Table Of Content (TOC) of the log variable is fetched from the Crazyflie which allows to
//! log variables using their names. To log variable a [LogBlock] needs to be created. The variable to be logged are
//! added to the LogBlock and then the LogBlock can be started returning a LogStream that will yield the log datas.
//!
//! ```no_run
//! # use crazyflie_crtp::{Crazyflie, Error};
//! # use crazyflie_crtp::subsystems::log::LogPeriod;
//! # async fn example(cf: &Crazyflie) -> Result<(), Error> {
//! let mut block = cf.log.create_block().await?;
//!
//! block.add_variable("stateEstimate.roll").await?;
//! block.add_variable("stateEstimate.pitch").await?;
//! block.add_variable("stateEstimate.yaw").await?;
//!
//! let stream = block.start(LogPeriod::from_millis(100)?).await?;
//!
//! while let Ok(data) = stream.next().await {
//!     println!("Yaw is {:?}", data.data["stateEstimate.yaw"]);
//! }
//! # Ok(())
//! # };
//! ```

use crate::crtp::{CrtpPort, Packet};
use crate::crtp_utils::{crtp_channel_dispatcher, RequestChannel, RequestTiming};
use crate::toc::{fetch_toc, Toc, TocCache};
use crate::{Error, Result, Value, ValueType};
use flume as channel;
use futures::lock::Mutex;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::convert::{TryFrom, TryInto};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

const LOG_PORT: u8 = CrtpPort::Log as u8;

const CONTROL_CHANNEL: u8 = 1;

const DELETE_BLOCK: u8 = 2;
const START_BLOCK: u8 = 3;
const STOP_BLOCK: u8 = 4;
const RESET: u8 = 5;
const CREATE_BLOCK_V2: u8 = 6;
const APPEND_BLOCK_V2: u8 = 7;

// Firmware error code of a missing block
const ENOENT: u8 = 2;

const MAX_BLOCK_ID: u8 = 254;

fn not_found(name: &str) -> Error {
    Error::LogError(format!("Log variable {} not found", name))
}

/// Send a control command and check the error code of the answer: `[command, block id, error]`
async fn control_request(
    control: &RequestChannel,
    payload: Vec<u8>,
    pattern_len: usize,
    action: &str,
) -> Result<()> {
    let answer = control
        .request(Packet::new(LOG_PORT, CONTROL_CHANNEL, payload), pattern_len)
        .await?;

    match answer.get_data().get(2) {
        Some(0) => Ok(()),
        Some(error) => Err(Error::LogError(format!(
            "Error when {}: {}",
            action, error
        ))),
        None => Err(Error::ProtocolError(
            "Malformed Log control packet".to_owned(),
        )),
    }
}

type DataChannels = Arc<Mutex<BTreeMap<u8, channel::Sender<Packet>>>>;

/// Crazyflie Log subsystem
///
/// See the [log module documentation](crate::subsystems::log) for more context and information.
pub struct Log {
    control: Arc<RequestChannel>,
    toc: Arc<Toc<LogItemInfo>>,
    data_channels: DataChannels,
    active_blocks: Mutex<BTreeMap<u8, Weak<()>>>,
    data_task: JoinHandle<()>,
}

impl Log {
    pub(crate) async fn new(
        downlink: channel::Receiver<Packet>,
        uplink: channel::Sender<Packet>,
        toc_cache: &dyn TocCache,
        timing: RequestTiming,
    ) -> Result<Self> {
        let (toc_downlink, control_downlink, data_downlink, _) =
            crtp_channel_dispatcher(downlink);

        let toc_channel = RequestChannel::new(uplink.clone(), toc_downlink, timing);
        let toc = Arc::new(fetch_toc(LOG_PORT, &toc_channel, toc_cache).await?);

        let control = Arc::new(RequestChannel::new(uplink, control_downlink, timing));

        // Blocks left by a previous connection are removed
        control_request(&control, vec![RESET], 1, "resetting log").await?;

        let data_channels = DataChannels::default();
        let data_task = tokio::spawn(data_dispatcher(data_downlink, data_channels.clone()));

        Ok(Self {
            control,
            toc,
            data_channels,
            active_blocks: Mutex::new(BTreeMap::new()),
            data_task,
        })
    }

    /// Get the names of all the log variables
    ///
    /// The names contain group and name of the log variable formated as
    /// "group.name".
    pub fn names(&self) -> Vec<String> {
        self.toc.keys().cloned().collect()
    }

    /// Return the type of a log variable or an Error if the variable does not exist.
    pub fn get_type(&self, name: &str) -> Result<ValueType> {
        Ok(self
            .toc
            .get(name)
            .ok_or_else(|| not_found(name))?
            .1
            .item_type)
    }

    /// Delete the blocks whose [LogBlock] has been dropped
    async fn cleanup_blocks(&self, active_blocks: &mut BTreeMap<u8, Weak<()>>) -> Result<()> {
        let dropped: Vec<u8> = active_blocks
            .iter()
            .filter(|(_, canary)| canary.upgrade().is_none())
            .map(|(id, _)| *id)
            .collect();

        // A delete the firmware never answered keeps its id reserved and is
        // retried the next time, other ids are still allocated
        for block_id in dropped {
            debug!("Deleting dropped log block {}", block_id);
            let delete = Packet::new(LOG_PORT, CONTROL_CHANNEL, vec![DELETE_BLOCK, block_id]);
            match self.control.request(delete, 2).await {
                Ok(answer) => match answer.get_data().get(2) {
                    Some(0) | Some(&ENOENT) => (),
                    error => warn!("Error when deleting log block {}: {:?}", block_id, error),
                },
                Err(Error::Disconnected) => return Err(Error::Disconnected),
                Err(e) => {
                    warn!("Failed to delete log block {}: {}", block_id, e);
                    continue;
                }
            }

            active_blocks.remove(&block_id);
            self.data_channels.lock().await.remove(&block_id);
        }

        Ok(())
    }

    /// Create an empty log block
    ///
    /// Up to 255 blocks can exist at the same time. Blocks are deleted in the
    /// Crazyflie after their [LogBlock] is dropped, the next time a block is created.
    pub async fn create_block(&self) -> Result<LogBlock> {
        let mut active_blocks = self.active_blocks.lock().await;
        self.cleanup_blocks(&mut active_blocks).await?;

        let block_id = (0..=MAX_BLOCK_ID)
            .find(|id| !active_blocks.contains_key(id))
            .ok_or_else(|| Error::LogError("No more block ID available!".into()))?;

        control_request(
            &self.control,
            vec![CREATE_BLOCK_V2, block_id],
            2,
            "creating block",
        )
        .await?;

        let (tx, rx) = channel::unbounded();
        self.data_channels.lock().await.insert(block_id, tx);

        let canary = Arc::new(());
        active_blocks.insert(block_id, Arc::downgrade(&canary));

        Ok(LogBlock {
            _canary: canary,
            toc: Arc::downgrade(&self.toc),
            control: Arc::downgrade(&self.control),
            block_id,
            variables: Vec::new(),
            data_channel: rx,
        })
    }
}

impl Drop for Log {
    fn drop(&mut self) {
        self.data_task.abort();
    }
}

async fn data_dispatcher(data_downlink: channel::Receiver<Packet>, data_channels: DataChannels) {
    while let Ok(packet) = data_downlink.recv_async().await {
        let Some(&block_id) = packet.get_data().first() else {
            continue;
        };

        let mut data_channels = data_channels.lock().await;
        if let Some(channel) = data_channels.get(&block_id) {
            if channel.send_async(packet).await.is_err() {
                data_channels.remove(&block_id);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LogItemInfo {
    item_type: ValueType,
}

impl TryFrom<u8> for LogItemInfo {
    type Error = Error;

    fn try_from(log_type: u8) -> Result<Self> {
        let item_type = match log_type {
            1 => ValueType::U8,
            2 => ValueType::U16,
            3 => ValueType::U32,
            4 => ValueType::I8,
            5 => ValueType::I16,
            6 => ValueType::I32,
            7 => ValueType::F32,
            8 => ValueType::F16,
            _ => {
                return Err(Error::ProtocolError(format!(
                    "Invalid log item type: {}",
                    log_type
                )))
            }
        };

        Ok(LogItemInfo { item_type })
    }
}

impl TryFrom<LogItemInfo> for u8 {
    type Error = Error;

    fn try_from(info: LogItemInfo) -> Result<u8> {
        let value = match info.item_type {
            ValueType::U8 => 1,
            ValueType::U16 => 2,
            ValueType::U32 => 3,
            ValueType::I8 => 4,
            ValueType::I16 => 5,
            ValueType::I32 => 6,
            ValueType::F32 => 7,
            ValueType::F16 => 8,
            _ => {
                return Err(Error::LogError(format!(
                    "Value type {:?} not handled by log",
                    info.item_type
                )))
            }
        };
        Ok(value)
    }
}

/// Log block, a set of variables logged together
pub struct LogBlock {
    _canary: Arc<()>,
    toc: Weak<Toc<LogItemInfo>>,
    control: Weak<RequestChannel>,
    block_id: u8,
    variables: Vec<(String, ValueType)>,
    data_channel: channel::Receiver<Packet>,
}

impl LogBlock {
    /// Id of the block in the Crazyflie
    pub fn id(&self) -> u8 {
        self.block_id
    }

    /// Start log block and return a stream to read  the value
    ///
    /// Since a log-block cannot be modified after being started, this function
    /// consumes the logblock object and return a `LogStream`. The function
    /// [stop()](struct.LogStream.html#method.stop) can be called on the LogStream to get back the logblock object.
    ///
    /// This function is failable. It can fail if there is a protocol error or an error
    /// reported by the Crazyflie. In such case, the LogBlock object will be dropped and the block will be deleted in
    /// the Crazyflie
    pub async fn start(self, period: LogPeriod) -> Result<LogStream> {
        let control = self.control.upgrade().ok_or(Error::Disconnected)?;

        control_request(
            &control,
            vec![START_BLOCK, self.block_id, period.0],
            2,
            "starting block",
        )
        .await?;

        Ok(LogStream { log_block: self })
    }

    /// Add variable to the log block
    ///
    /// A packet will be sent to the Crazyflie to add the variable. The variable is logged in the same format as
    /// it is stored in the Crazyflie (ie. there is no conversion done)
    ///
    /// This function can fail if the variable is not found in the toc or of the Crazyflie returns an error
    /// The most common error reported by the Crazyflie would be if the log block is already too full.
    pub async fn add_variable(&mut self, name: &str) -> Result<()> {
        let toc = self.toc.upgrade().ok_or(Error::Disconnected)?;
        let (variable_id, info) = toc.get(name).ok_or(Error::VariableNotFound)?;
        let control = self.control.upgrade().ok_or(Error::Disconnected)?;

        let mut payload = vec![APPEND_BLOCK_V2, self.block_id, (*info).try_into()?];
        payload.extend_from_slice(&variable_id.to_le_bytes());

        control_request(&control, payload, 2, "appending variable to block").await?;

        self.variables.push((name.to_owned(), info.item_type));

        Ok(())
    }
}

/// Started [LogBlock], yields the logged values
pub struct LogStream {
    log_block: LogBlock,
}

impl LogStream {
    /// Stops the log block from streaming
    ///
    /// This method consumes the stream and returns back the log block object so that it can be started again later
    /// with a different period.
    ///
    /// This function can only fail on unexpected protocol error. If it does, the log block is dropped and will be
    /// cleaned-up next time a log block is created.
    pub async fn stop(self) -> Result<LogBlock> {
        let control = self
            .log_block
            .control
            .upgrade()
            .ok_or(Error::Disconnected)?;

        control_request(
            &control,
            vec![STOP_BLOCK, self.log_block.block_id],
            2,
            "stopping block",
        )
        .await?;

        Ok(self.log_block)
    }

    /// Get the next log data from the log block stream
    ///
    /// This function will return an error if the Crazyflie gets disconnected.
    pub async fn next(&self) -> Result<LogData> {
        let packet = self
            .log_block
            .data_channel
            .recv_async()
            .await
            .map_err(|_| Error::Disconnected)?;

        self.decode_packet(&packet.get_data()[1..])
    }

    fn decode_packet(&self, data: &[u8]) -> Result<LogData> {
        decode_log_data(&self.log_block.variables, data)
    }
}

/// Decode `[timestamp u24, values...]`
fn decode_log_data(variables: &[(String, ValueType)], data: &[u8]) -> Result<LogData> {
    let expected_length = 3 + variables
        .iter()
        .map(|(_, value_type)| value_type.byte_length())
        .sum::<usize>();
    if data.len() < expected_length {
        warn!(
            "Log data too short: {} bytes, {} expected",
            data.len(),
            expected_length
        );
        return Err(Error::ProtocolError("Log data packet too short".to_owned()));
    }

    let timestamp = u32::from_le_bytes([data[0], data[1], data[2], 0]);

    let mut index = 3;
    let mut log_data = HashMap::new();
    for (name, value_type) in variables {
        let byte_length = value_type.byte_length();
        log_data.insert(
            name.clone(),
            Value::from_le_bytes(&data[index..(index + byte_length)], *value_type)?,
        );
        index += byte_length;
    }

    Ok(LogData {
        timestamp,
        data: log_data,
    })
}

/// One sample of a log block
#[derive(Debug)]
pub struct LogData {
    /// Crazyflie time of the sample, in milliseconds
    pub timestamp: u32,
    pub data: HashMap<String, Value>,
}

/// Log block period, from 10ms to 2550ms in steps of 10ms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPeriod(u8);

impl LogPeriod {
    pub fn from_millis(millis: u64) -> Result<Self> {
        Duration::from_millis(millis).try_into()
    }
}

impl TryFrom<Duration> for LogPeriod {
    type Error = Error;

    fn try_from(value: Duration) -> Result<Self> {
        let period_ms = value.as_millis();
        if !(10..=2550).contains(&period_ms) {
            return Err(Error::LogError(
                "Invalid log period, should be between 10ms and 2550ms".to_owned(),
            ));
        }
        Ok(LogPeriod((period_ms / 10) as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_bounds() {
        assert_eq!(LogPeriod::from_millis(10).unwrap(), LogPeriod(1));
        assert_eq!(LogPeriod::from_millis(2550).unwrap(), LogPeriod(255));
        assert!(LogPeriod::from_millis(9).is_err());
        assert!(LogPeriod::from_millis(2551).is_err());
    }

    #[test]
    fn timestamp_is_24_bits_little_endian() {
        let variables = vec![("pm.vbat".to_owned(), ValueType::F32)];
        let mut data = vec![0x01, 0x02, 0x03];
        data.extend_from_slice(&3.7f32.to_le_bytes());

        let log_data = decode_log_data(&variables, &data).unwrap();
        assert_eq!(log_data.timestamp, 0x030201);
        assert_eq!(log_data.data["pm.vbat"], Value::F32(3.7));
    }

    #[test]
    fn short_data_is_an_error() {
        let variables = vec![("pm.vbat".to_owned(), ValueType::F32)];
        assert!(decode_log_data(&variables, &[0, 0, 0, 1]).is_err());
    }

    #[test]
    fn log_types_round_trip() {
        for code in 1..=8u8 {
            let info = LogItemInfo::try_from(code).unwrap();
            assert_eq!(u8::try_from(info).unwrap(), code);
        }
        assert!(LogItemInfo::try_from(9).is_err());
    }
}
