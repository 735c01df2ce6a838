//! # Parameter subsystem
//!
//! The Crazyflie exposes a param subsystem that allows to easily declare parameter
//! variables in the Crazyflie and to discover, read and write them from the ground.
//!
//! Variables are defined in a table of content that is downloaded upon connection.
//! Each param variable have a unique name composed from a group and a variable name.
//! Functions that accesses variables, take a `name` parameter that accepts a string
//! in the format "group.variable"
//!
//! During connection, the full param table of content is downloaded from the
//! Crazyflie and the extended type of the parameters that have one is fetched to
//! know which parameters can be stored in EEPROM (persistent parameters).
//! Parameter values are loaded on-demand when first accessed via `get()`.
//! If a variable value is modified by the Crazyflie during runtime, it sends a
//! packet with the new value which updates the local value cache.

use crate::crtp::{CrtpPort, Packet};
use crate::crtp_utils::{crtp_channel_dispatcher, RequestChannel, RequestTiming};
use crate::toc::{fetch_toc, Toc, TocCache};
use crate::{Error, Result};
use crate::{Value, ValueType};
use flume as channel;
use futures::lock::Mutex;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    convert::{TryFrom, TryInto},
    sync::Arc,
};
use tokio::task::JoinHandle;

const PARAM_PORT: u8 = CrtpPort::Param as u8;

const READ_CHANNEL: u8 = 1;
const WRITE_CHANNEL: u8 = 2;
const MISC_CHANNEL: u8 = 3;

const MISC_SET_BY_NAME: u8 = 0;
const MISC_VALUE_UPDATED: u8 = 1;
const MISC_PERSISTENT_STORE: u8 = 3;
const MISC_PERSISTENT_GET_STATE: u8 = 4;
const MISC_PERSISTENT_CLEAR: u8 = 5;
const MISC_GET_EXTENDED_TYPE_V2: u8 = 7;
const MISC_GET_DEFAULT_VALUE_V2: u8 = 8;

const ENOENT: u8 = 0x02;

const EXTENDED_PERSISTENT: u8 = 0x01;

/// State of a persistent parameter
#[derive(Debug, Clone)]
pub struct PersistentParamState {
    /// True if a value is currently stored in EEPROM
    pub is_stored: bool,
    /// The firmware's default value for this parameter
    pub default_value: Value,
    /// The value stored in EEPROM (if is_stored is true)
    pub stored_value: Option<Value>,
}

#[derive(Debug, Clone, Copy)]
enum DefaultValueCache {
    Value(Value),
    /// ENOENT from the firmware
    Unsupported,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ParamItemInfo {
    item_type: ValueType,
    writable: bool,
    has_extended_type: bool,
}

fn type_code(value_type: ValueType) -> u8 {
    match value_type {
        ValueType::U8 => 0x08,
        ValueType::U16 => 0x09,
        ValueType::U32 => 0x0A,
        ValueType::U64 => 0x0B,
        ValueType::I8 => 0x00,
        ValueType::I16 => 0x01,
        ValueType::I32 => 0x02,
        ValueType::I64 => 0x03,
        ValueType::F16 => 0x05,
        ValueType::F32 => 0x06,
        ValueType::F64 => 0x07,
    }
}

impl TryFrom<u8> for ParamItemInfo {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(Self {
            item_type: match value & 0x0f {
                0x08 => ValueType::U8,
                0x09 => ValueType::U16,
                0x0A => ValueType::U32,
                0x0B => ValueType::U64,
                0x00 => ValueType::I8,
                0x01 => ValueType::I16,
                0x02 => ValueType::I32,
                0x03 => ValueType::I64,
                0x05 => ValueType::F16,
                0x06 => ValueType::F32,
                0x07 => ValueType::F64,
                _ => {
                    return Err(Error::ParamError(format!(
                        "Type error in TOC: type {} is unknown",
                        value & 0x0f
                    )))
                }
            },
            writable: (value & (1 << 6)) == 0,
            has_extended_type: (value & (1 << 4)) != 0,
        })
    }
}

#[derive(Debug)]
enum WatchFilter {
    All,
    Group(String),
    Param(String),
}

impl WatchFilter {
    fn matches(&self, name: &str) -> bool {
        match self {
            WatchFilter::All => true,
            WatchFilter::Group(group) => {
                name.split_once('.').map(|(g, _)| g) == Some(group.as_str())
            }
            WatchFilter::Param(param) => name == param.as_str(),
        }
    }
}

type ParamChangeWatchers = Arc<
    Mutex<
        Vec<(
            WatchFilter,
            futures::channel::mpsc::UnboundedSender<(String, Value)>,
        )>,
    >,
>;

async fn notify_watchers(watchers: &ParamChangeWatchers, name: &str, value: Value) {
    let mut watchers = watchers.lock().await;

    // Watchers whose stream has been dropped are removed
    watchers.retain(|(filter, watcher)| {
        !filter.matches(name) || watcher.unbounded_send((name.to_owned(), value)).is_ok()
    });
}

fn not_found(name: &str) -> Error {
    Error::ParamError(format!("Parameter {} not found", name))
}

fn param_id_request(command: u8, param_id: u16) -> Packet {
    let mut data = vec![command];
    data.extend_from_slice(&param_id.to_le_bytes());
    Packet::new(PARAM_PORT, MISC_CHANNEL, data)
}

/// # Access to the Crazyflie Param Subsystem
///
/// This struct provide methods to interact with the parameter subsystem. See the
/// [param module documentation](crate::subsystems::param) for more context and information.
pub struct Param {
    read_channel: RequestChannel,
    write_channel: RequestChannel,
    misc_channel: RequestChannel,
    toc: Arc<Toc<ParamItemInfo>>,
    values: Arc<Mutex<HashMap<String, Option<Value>>>>,
    default_values: Mutex<HashMap<String, DefaultValueCache>>,
    persistent: HashSet<String>,
    watchers: ParamChangeWatchers,
    misc_task: JoinHandle<()>,
}

impl Param {
    pub(crate) async fn new(
        downlink: channel::Receiver<Packet>,
        uplink: channel::Sender<Packet>,
        toc_cache: &dyn TocCache,
        timing: RequestTiming,
    ) -> Result<Self> {
        let (toc_downlink, read_downlink, write_downlink, misc_downlink) =
            crtp_channel_dispatcher(downlink);

        let toc_channel = RequestChannel::new(uplink.clone(), toc_downlink, timing);
        let toc: Arc<Toc<ParamItemInfo>> =
            Arc::new(fetch_toc(PARAM_PORT, &toc_channel, toc_cache).await?);

        let values = Arc::new(Mutex::new(
            toc.keys().map(|name| (name.clone(), None)).collect::<HashMap<_, _>>(),
        ));
        let watchers = ParamChangeWatchers::default();

        // Value updates are handled here, other MISC answers go to the MISC correlator
        let (misc_cmd_tx, misc_cmd_rx) = channel::unbounded();
        let misc_task = tokio::spawn(misc_loop(
            misc_downlink,
            misc_cmd_tx,
            toc.clone(),
            values.clone(),
            watchers.clone(),
        ));

        let mut param = Self {
            read_channel: RequestChannel::new(uplink.clone(), read_downlink, timing),
            write_channel: RequestChannel::new(uplink.clone(), write_downlink, timing),
            misc_channel: RequestChannel::new(uplink, misc_cmd_rx, timing),
            toc,
            values,
            default_values: Mutex::new(HashMap::new()),
            persistent: HashSet::new(),
            watchers,
            misc_task,
        };

        param.persistent = param.fetch_persistent().await;

        Ok(param)
    }

    /// Ask the extended type of every parameter flagged as extended in the TOC
    async fn fetch_persistent(&self) -> HashSet<String> {
        let mut persistent = HashSet::new();

        for (name, (_, info)) in self.toc.iter() {
            if !info.has_extended_type {
                continue;
            }

            match self.get_extended_type(name).await {
                Ok(extended_type) if extended_type & EXTENDED_PERSISTENT != 0 => {
                    persistent.insert(name.clone());
                }
                Ok(_) => (),
                Err(e) => warn!("Cannot get extended type of {}: {}", name, e),
            }
        }

        debug!("{} persistent parameters", persistent.len());

        persistent
    }

    fn item(&self, name: &str) -> Result<&(u16, ParamItemInfo)> {
        self.toc.get(name).ok_or_else(|| not_found(name))
    }

    async fn read_value(&self, param_id: u16, param_type: ValueType) -> Result<Value> {
        let request = Packet::new(PARAM_PORT, READ_CHANNEL, param_id.to_le_bytes().into());
        let answer = self.read_channel.request(request, 2).await?;

        // [id u16, status, value...]
        let data = answer.get_data();
        match data.get(2) {
            Some(0) => Value::from_le_bytes(&data[3..], param_type),
            Some(error) => Err(Error::ParamError(format!(
                "Error reading parameter {}: error code {}",
                param_id, error
            ))),
            None => Err(Error::ProtocolError(
                "Parameter read answer too short".to_owned(),
            )),
        }
    }

    async fn update_value(&self, name: &str, value: Value) {
        if let Some(v) = self.values.lock().await.get_mut(name) {
            *v = Some(value);
        }
        notify_watchers(&self.watchers, name, value).await;
    }

    /// Get the names of all the parameters
    ///
    /// The names contain group and name of the parameter variable formatted as
    /// "group.name".
    pub fn names(&self) -> Vec<String> {
        self.toc.keys().cloned().collect()
    }

    /// Return the type of a parameter variable or an Error if the parameter does not exist.
    pub fn get_type(&self, name: &str) -> Result<ValueType> {
        Ok(self.item(name)?.1.item_type)
    }

    /// Return true if he parameter variable is writable. False otherwise.
    ///
    /// Return an error if the parameter does not exist.
    pub fn is_writable(&self, name: &str) -> Result<bool> {
        Ok(self.item(name)?.1.writable)
    }

    /// Return true if the parameter can be stored in EEPROM
    ///
    /// The information is fetched from the Crazyflie at connection time.
    /// Return an error if the parameter does not exist.
    pub fn is_persistent(&self, name: &str) -> Result<bool> {
        self.item(name)?;
        Ok(self.persistent.contains(name))
    }

    /// Set a parameter value.
    ///
    /// This function will set the variable value and wait for confirmation from the
    /// Crazyflie. If the set is successful `Ok(())` is returned, otherwise the
    /// error code reported by the Crazyflie is returned in the error.
    ///
    /// This function accepts any primitive type as well as the [Value](crate::Value) type. The
    /// type of the param variable is checked at runtime and must match the type
    /// given to the function, either the direct primitive type or the type
    /// contained in the `Value` enum. For example, to write a u16 value, both lines are valid:
    ///
    /// ```no_run
    /// # use crazyflie_crtp::{Crazyflie, Value, Error};
    /// # async fn example(cf: &Crazyflie) -> Result<(), Error> {
    /// cf.param.set("example.param", 42u16).await?;  // From primitive
    /// cf.param.set("example.param", Value::U16(42)).await?;  // From Value
    /// # Ok(())
    /// # };
    /// ```
    ///
    /// Return an error in case of type mismatch, if the variable is read-only or if it does not exist.
    pub async fn set<T: Into<Value>>(&self, name: &str, value: T) -> Result<()> {
        let value: Value = value.into();
        let (param_id, param_info) = self.item(name)?;

        if !param_info.writable {
            return Err(Error::ParamError(format!(
                "Parameter {} is read-only",
                name
            )));
        }

        if param_info.item_type != value.into() {
            return Err(Error::ParamError(format!(
                "Parameter {} is type {:?}, cannot set with value {:?}",
                name, param_info.item_type, value
            )));
        }

        let mut request_data = Vec::from(param_id.to_le_bytes());
        let value_bytes: Vec<u8> = value.into();
        request_data.extend_from_slice(&value_bytes);
        let request = Packet::new(PARAM_PORT, WRITE_CHANNEL, request_data);

        let answer = self.write_channel.request(request, 2).await?;

        // The firmware echoes the value on success and an error code otherwise
        let echoed = &answer.get_data()[2..];
        if echoed == value_bytes.as_slice() {
            self.update_value(name, value).await;
            Ok(())
        } else {
            match echoed.first() {
                Some(error_code) => Err(Error::ParamError(format!(
                    "Error setting parameter: parameter error code {}",
                    error_code
                ))),
                None => Err(Error::ProtocolError(
                    "Parameter write answer has no value nor error code".to_owned(),
                )),
            }
        }
    }

    /// Set a parameter by name without needing the TOC
    ///
    /// The name is sent to the Crazyflie, this works even with parameters
    /// missing from the downloaded TOC. No confirmation is waited for, a cached
    /// value of the parameter is dropped so that the next [Param::get] reads it again.
    /// If the parameter is in the TOC, its type must match the value.
    pub async fn set_by_name<T: Into<Value>>(&self, name: &str, value: T) -> Result<()> {
        let value: Value = value.into();
        let (group, variable) = name
            .split_once('.')
            .ok_or_else(|| Error::ParamError(format!("Invalid parameter name {}", name)))?;

        if let Some((_, info)) = self.toc.get(name) {
            if info.item_type != value.into() {
                return Err(Error::ParamError(format!(
                    "Parameter {} is type {:?}, cannot set with value {:?}",
                    name, info.item_type, value
                )));
            }
        }

        let mut data = vec![MISC_SET_BY_NAME];
        data.extend_from_slice(group.as_bytes());
        data.push(0);
        data.extend_from_slice(variable.as_bytes());
        data.push(0);
        data.push(type_code(value.into()));
        data.append(&mut value.into());

        let packet = Packet::new(PARAM_PORT, MISC_CHANNEL, data);
        if !packet.is_data_size_valid() {
            return Err(Error::PacketTooLarge(packet.get_data().len()));
        }

        self.misc_channel.send(packet).await?;

        // Not confirmed, the next get reads the value back
        if let Some(cached) = self.values.lock().await.get_mut(name) {
            *cached = None;
        }

        Ok(())
    }

    /// Get param value
    ///
    /// Get value of a parameter. The first access will fetch the value from the
    /// Crazyflie. Subsequent accesses are served from a local cache and are quick.
    ///
    /// Similarly to the `set` function above, the type of the param must match
    /// the return parameter. For example to get a u16 param:
    /// ```no_run
    /// # use crazyflie_crtp::{Crazyflie, Value, Error};
    /// # async fn example(cf: &Crazyflie) -> Result<(), Error> {
    /// let example: u16 = cf.param.get("example.param").await?;  // To primitive
    /// dbg!(example);  // 42
    /// let example: Value = cf.param.get("example.param").await?;  // To Value
    /// dbg!(example);  // Value::U16(42)
    /// # Ok(())
    /// # };
    /// ```
    ///
    /// Return an error in case of type mismatch or if the variable does not exist.
    pub async fn get<T: TryFrom<Value>>(&self, name: &str) -> Result<T>
    where
        <T as TryFrom<Value>>::Error: std::fmt::Debug,
    {
        let cached = *self
            .values
            .lock()
            .await
            .get(name)
            .ok_or_else(|| not_found(name))?;

        let value = match cached {
            Some(v) => v,
            None => self.refresh(name).await?,
        };

        value
            .try_into()
            .map_err(|e| Error::ParamError(format!("Type error reading param: {:?}", e)))
    }

    /// Read a parameter from the Crazyflie, bypassing the local cache
    pub async fn refresh(&self, name: &str) -> Result<Value> {
        let (param_id, param_info) = self.item(name)?;
        let value = self.read_value(*param_id, param_info.item_type).await?;

        self.update_value(name, value).await;

        Ok(value)
    }

    /// Read all the parameters from the Crazyflie
    ///
    /// Watchers are notified of every value read.
    pub async fn refresh_all(&self) -> Result<()> {
        for name in self.toc.keys() {
            self.refresh(name).await?;
        }
        Ok(())
    }

    /// Set a parameter from a f64 potentially loosing data
    ///
    /// This function is a forgiving version of the `set` function. It allows
    /// to set any parameter of any type from a `f64` value. Since there is no
    /// type or value check, loss of information can happen, see
    /// [Value::from_f64_lossy()].
    ///
    /// Returns an error if the param does not exists.
    pub async fn set_lossy(&self, name: &str, value: f64) -> Result<()> {
        let param_type = self.get_type(name)?;

        self.set(name, Value::from_f64_lossy(param_type, value))
            .await
    }

    /// Get a parameter as a `f64` independently of the parameter type
    ///
    /// A `u64` parameter cannot be accurately represented in a `f64`.
    ///
    /// Returns an error if the param does not exists.
    pub async fn get_lossy(&self, name: &str) -> Result<f64> {
        let value: Value = self.get(name).await?;

        Ok(value.to_f64_lossy())
    }

    async fn watch(
        &self,
        filter: WatchFilter,
    ) -> futures::channel::mpsc::UnboundedReceiver<(String, Value)> {
        let (tx, rx) = futures::channel::mpsc::unbounded();

        self.watchers.lock().await.push((filter, tx));

        rx
    }

    /// Get notified for all parameter value change
    ///
    /// This function returns an async stream that will generate a tuple containing
    /// the name of the variable that has changed (in the form of group.name)
    /// and its new value.
    ///
    /// There can be three reasons for a parameter to change:
    ///  - The parameter was changed by a call to [Param::set()]. The
    ///    notification will be generated when the Crazyflie confirms the parameter
    ///    has been set.
    ///  - The parameter value has been read from the Crazyflie.
    ///  - It is a parameter change in the Crazyflie itself. The Crazyflie
    ///    will send notification packet for every internal parameter change.
    pub async fn watch_change(&self) -> impl futures::Stream<Item = (String, Value)> + use<> {
        self.watch(WatchFilter::All).await
    }

    /// Same as [Param::watch_change()] for the parameters of one group
    pub async fn watch_group(&self, group: &str) -> impl futures::Stream<Item = (String, Value)> + use<> {
        self.watch(WatchFilter::Group(group.to_owned())).await
    }

    /// Same as [Param::watch_change()] for one parameter
    pub async fn watch_param(&self, name: &str) -> impl futures::Stream<Item = (String, Value)> + use<> {
        self.watch(WatchFilter::Param(name.to_owned())).await
    }

    /// Get the extended type flags of a parameter from the firmware
    ///
    /// Returns a bitfield of extended type flags. Currently defined flags:
    /// - `0x01`: PERSISTENT - parameter can be stored in EEPROM
    ///
    /// Returns an error if the parameter does not exist or has no extended type.
    pub async fn get_extended_type(&self, name: &str) -> Result<u8> {
        let (param_id, _) = self.item(name)?;

        let answer = self
            .misc_channel
            .request(param_id_request(MISC_GET_EXTENDED_TYPE_V2, *param_id), 3)
            .await?;

        // Success: [cmd, id u16, status 0, extended type], error: [cmd, id u16, error]
        match answer.get_data()[3..] {
            [0x00, extended_type, ..] => Ok(extended_type),
            [ENOENT] => Err(Error::ParamError(format!(
                "Parameter '{}' does not have extended type info",
                name
            ))),
            [error_code] => Err(Error::ParamError(format!(
                "Failed to get extended type for '{}': error code {}",
                name, error_code
            ))),
            _ => Err(Error::ProtocolError(format!(
                "Malformed extended type answer for '{}'",
                name
            ))),
        }
    }

    /// Get the default value of a parameter as defined in the firmware
    ///
    /// This retrieves the default value that the parameter has in the firmware,
    /// regardless of whether a different value has been stored in EEPROM.
    /// Answers are cached, including the parameters not supporting it.
    pub async fn get_default_value(&self, name: &str) -> Result<Value> {
        let unsupported = || {
            Error::ParamError(format!(
                "Parameter '{}' does not support get_default_value (read-only or invalid)",
                name
            ))
        };

        if let Some(cached) = self.default_values.lock().await.get(name) {
            return match cached {
                DefaultValueCache::Value(v) => Ok(*v),
                DefaultValueCache::Unsupported => Err(unsupported()),
            };
        }

        let (param_id, param_info) = self.item(name)?;

        let answer = self
            .misc_channel
            .request(param_id_request(MISC_GET_DEFAULT_VALUE_V2, *param_id), 3)
            .await?;

        let data = answer.get_data();
        let cache_entry = match data.get(3..) {
            Some([ENOENT]) => DefaultValueCache::Unsupported,
            Some([error_code]) => {
                return Err(Error::ParamError(format!(
                    "Failed to get default value for '{}': error code {}",
                    name, error_code
                )))
            }
            Some([0x00, value @ ..]) => {
                DefaultValueCache::Value(Value::from_le_bytes(value, param_info.item_type)?)
            }
            _ => {
                return Err(Error::ProtocolError(format!(
                    "Malformed default value answer for '{}'",
                    name
                )))
            }
        };

        self.default_values
            .lock()
            .await
            .insert(name.to_owned(), cache_entry);

        match cache_entry {
            DefaultValueCache::Value(v) => Ok(v),
            DefaultValueCache::Unsupported => Err(unsupported()),
        }
    }

    async fn persistent_request(&self, command: u8, name: &str) -> Result<Packet> {
        let (param_id, _) = self.item(name)?;

        if !self.is_persistent(name)? {
            return Err(Error::ParamError(format!(
                "Parameter '{}' is not persistent",
                name
            )));
        }

        let answer = self
            .misc_channel
            .request(param_id_request(command, *param_id), 3)
            .await?;

        if answer.get_data().len() < 4 {
            return Err(Error::ProtocolError(format!(
                "Persistent parameter answer too short: {} bytes",
                answer.get_data().len()
            )));
        }

        Ok(answer)
    }

    /// Get the complete state of a persistent parameter
    ///
    /// This retrieves comprehensive information about a persistent parameter:
    /// - Whether a value is currently stored in EEPROM
    /// - The firmware's default value
    /// - The stored value (if one exists)
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example(cf: &crazyflie_crtp::Crazyflie) -> crazyflie_crtp::Result<()> {
    /// let state = cf.param.persistent_get_state("ring.effect").await?;
    ///
    /// println!("Default value: {:?}", state.default_value);
    /// if let Some(stored) = state.stored_value {
    ///     println!("Stored value: {:?}", stored);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn persistent_get_state(&self, name: &str) -> Result<PersistentParamState> {
        let item_type = self.get_type(name)?;
        let answer = self
            .persistent_request(MISC_PERSISTENT_GET_STATE, name)
            .await?;
        let data = answer.get_data();

        // [cmd, id u16, status, default value, stored value if status is 1]
        let is_stored = match data[3] {
            0x00 => false,
            0x01 => true,
            ENOENT => {
                return Err(Error::ParamError(format!(
                    "Parameter ID for '{}' is invalid or doesn't exist in firmware (ENOENT)",
                    name
                )));
            }
            status => {
                return Err(Error::ProtocolError(format!(
                    "Unexpected status code {} in persistent_get_state response for '{}'",
                    status, name
                )));
            }
        };

        let size = item_type.byte_length();
        let expected_length = 4 + if is_stored { 2 * size } else { size };
        if data.len() < expected_length {
            return Err(Error::ProtocolError(format!(
                "Persistent state answer too short: expected {} bytes, got {}",
                expected_length,
                data.len()
            )));
        }

        let default_value = Value::from_le_bytes(&data[4..4 + size], item_type)?;
        let stored_value = if is_stored {
            Some(Value::from_le_bytes(&data[4 + size..4 + 2 * size], item_type)?)
        } else {
            None
        };

        Ok(PersistentParamState {
            is_stored,
            default_value,
            stored_value,
        })
    }

    /// Store the current value of a persistent parameter to EEPROM.
    ///
    /// The stored value is used as the parameter value on subsequent boots.
    pub async fn persistent_store(&self, name: &str) -> Result<()> {
        let answer = self.persistent_request(MISC_PERSISTENT_STORE, name).await?;

        match answer.get_data()[3] {
            0x00 => Ok(()),
            ENOENT => Err(Error::ParamError(format!(
                "Failed to store parameter '{}' to EEPROM (storage write failed)",
                name
            ))),
            status => Err(Error::ProtocolError(format!(
                "Unexpected status code {} in persistent_store response for '{}'",
                status, name
            ))),
        }
    }

    /// Clear the stored value of a persistent parameter from EEPROM.
    ///
    /// The parameter reverts to the firmware default on subsequent boots.
    pub async fn persistent_clear(&self, name: &str) -> Result<()> {
        let answer = self.persistent_request(MISC_PERSISTENT_CLEAR, name).await?;

        match answer.get_data()[3] {
            0x00 => Ok(()),
            ENOENT => Err(Error::ParamError(format!(
                "Failed to clear parameter '{}' from EEPROM (storage delete failed)",
                name
            ))),
            status => Err(Error::ProtocolError(format!(
                "Unexpected status code {} in persistent_clear response for '{}'",
                status, name
            ))),
        }
    }
}

impl Drop for Param {
    fn drop(&mut self) {
        self.misc_task.abort();
    }
}

async fn misc_loop(
    misc_downlink: channel::Receiver<Packet>,
    misc_cmd_tx: channel::Sender<Packet>,
    toc: Arc<Toc<ParamItemInfo>>,
    values: Arc<Mutex<HashMap<String, Option<Value>>>>,
    watchers: ParamChangeWatchers,
) {
    while let Ok(pk) = misc_downlink.recv_async().await {
        let data = pk.get_data();

        if data.first() != Some(&MISC_VALUE_UPDATED) {
            if misc_cmd_tx.send_async(pk).await.is_err() {
                return;
            }
            continue;
        }

        // [1, id u16, value]
        if data.len() < 3 {
            warn!("Malformed param update: {}", pk);
            continue;
        }
        let param_id = u16::from_le_bytes([data[1], data[2]]);

        let Some((name, (_, info))) = toc.iter().find(|(_, (id, _))| *id == param_id) else {
            warn!("Param update for unknown id {}", param_id);
            continue;
        };

        match Value::from_le_bytes(&data[3..], info.item_type) {
            Ok(value) => {
                if let Some(v) = values.lock().await.get_mut(name) {
                    *v = Some(value);
                }
                notify_watchers(&watchers, name, value).await;
            }
            Err(_) => warn!("Malformed param update for {}", name),
        }
    }
}
