// Simulated Crazyflie firmware behind an in-memory link
//
// Answers the platform, param and log protocols the way the firmware does and
// records every packet it receives so tests can check what the lib sent.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crazyflie_crtp::{Config, Error, Link, LinkOpener, Packet, Result};
use tokio::sync::Notify;

pub const SIM_URI: &str = "sim://0";

const CONSOLE_PORT: u8 = 0;
const PARAM_PORT: u8 = 2;
const LOG_PORT: u8 = 5;
const PLATFORM_PORT: u8 = 13;

const ENOENT: u8 = 2;
const EACCES: u8 = 13;
const EEXIST: u8 = 17;
const EINVAL: u8 = 22;

const PARAM_READ_ONLY: u8 = 0x40;
const PARAM_EXTENDED: u8 = 0x10;

/// Fast timing so that lost requests do not slow the tests down
///
/// Also enables the lib logs, shown with `RUST_LOG=debug` on failing tests.
pub fn test_config() -> Config {
    let _ = env_logger::builder().is_test(true).try_init();

    Config {
        request_timeout_ms: 20,
        request_retries: 3,
        ..Config::default()
    }
}

#[derive(Debug, Clone)]
pub struct SimParam {
    pub group: &'static str,
    pub name: &'static str,
    /// TOC type byte, flags included
    pub type_code: u8,
    pub value: Vec<u8>,
    pub default: Vec<u8>,
    pub stored: Option<Vec<u8>>,
    pub extended: Option<u8>,
}

impl SimParam {
    fn new(group: &'static str, name: &'static str, type_code: u8, value: Vec<u8>) -> Self {
        Self {
            group,
            name,
            type_code,
            default: value.clone(),
            value,
            stored: None,
            extended: None,
        }
    }

    fn extended(mut self, extended: u8) -> Self {
        self.type_code |= PARAM_EXTENDED;
        self.extended = Some(extended);
        self
    }

    fn is_persistent(&self) -> bool {
        self.extended.map(|e| e & 0x01 != 0).unwrap_or(false)
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.group, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct SimLogVariable {
    pub group: &'static str,
    pub name: &'static str,
    pub log_type: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimLogBlock {
    pub variables: Vec<u16>,
    pub period: Option<u8>,
}

#[derive(Debug)]
pub struct Firmware {
    pub protocol_version: u8,
    pub params: Vec<SimParam>,
    pub param_toc_crc: u32,
    pub log_variables: Vec<SimLogVariable>,
    pub log_toc_crc: u32,
    pub log_blocks: BTreeMap<u8, SimLogBlock>,
    pub received: Vec<Packet>,
    pub toc_item_requests: usize,
    pub default_value_requests: usize,
    pub log_resets: usize,
    /// Number of upcoming packets to silently ignore
    pub drop_next: usize,
}

impl Default for Firmware {
    fn default() -> Self {
        Self {
            protocol_version: 6,
            params: vec![
                SimParam::new("ring", "effect", 0x08, vec![6]).extended(0x01),
                SimParam::new("ring", "fadeTime", 0x06, 0.5f32.to_le_bytes().to_vec()),
                SimParam::new("stabilizer", "estimator", 0x08, vec![1]),
                SimParam::new(
                    "firmware",
                    "revision0",
                    0x0A | PARAM_READ_ONLY,
                    0xDEADBEEFu32.to_le_bytes().to_vec(),
                ),
                SimParam::new("kalman", "resetEstimation", 0x08, vec![0]).extended(0x00),
                SimParam::new("pid_rate", "roll_kp", 0x06, 250.0f32.to_le_bytes().to_vec())
                    .extended(0x01),
                SimParam::new("motorPowerSet", "m1", 0x09, 0u16.to_le_bytes().to_vec()),
            ],
            param_toc_crc: 0x1234ABCD,
            log_variables: vec![
                SimLogVariable {
                    group: "stateEstimate",
                    name: "roll",
                    log_type: 7,
                },
                SimLogVariable {
                    group: "stateEstimate",
                    name: "pitch",
                    log_type: 7,
                },
                SimLogVariable {
                    group: "pm",
                    name: "vbat",
                    log_type: 7,
                },
                SimLogVariable {
                    group: "pm",
                    name: "state",
                    log_type: 4,
                },
                SimLogVariable {
                    group: "motor",
                    name: "m1",
                    log_type: 2,
                },
            ],
            log_toc_crc: 0x89ABCDEF,
            log_blocks: BTreeMap::new(),
            received: Vec::new(),
            toc_item_requests: 0,
            default_value_requests: 0,
            log_resets: 0,
            drop_next: 0,
        }
    }
}

fn toc_answer(data: &[u8], items: &[(u8, &str, &str)], crc32: u32) -> Option<Vec<u8>> {
    match data {
        [3] => {
            let mut answer = vec![3];
            answer.extend((items.len() as u16).to_le_bytes());
            answer.extend(crc32.to_le_bytes());
            Some(answer)
        }
        [2, lo, hi] => {
            let index = u16::from_le_bytes([*lo, *hi]) as usize;
            let (item_type, group, name) = items.get(index)?;
            let mut answer = vec![2, *lo, *hi, *item_type];
            answer.extend(group.as_bytes());
            answer.push(0);
            answer.extend(name.as_bytes());
            answer.push(0);
            Some(answer)
        }
        _ => None,
    }
}

impl Firmware {
    pub fn param_id(&self, name: &str) -> Option<u16> {
        self.params
            .iter()
            .position(|p| p.full_name() == name)
            .map(|i| i as u16)
    }

    fn handle(&mut self, packet: &Packet) -> Option<Packet> {
        self.received.push(packet.clone());

        if self.drop_next > 0 {
            self.drop_next -= 1;
            return None;
        }

        let (port, channel) = (packet.get_port(), packet.get_channel());
        let data = packet.get_data().as_slice();

        let answer = match (port, channel) {
            (PLATFORM_PORT, 1) => self.platform_version(data),
            (PARAM_PORT, 0) => {
                self.count_toc_item(data);
                let items: Vec<_> = self
                    .params
                    .iter()
                    .map(|p| (p.type_code, p.group, p.name))
                    .collect();
                toc_answer(data, &items, self.param_toc_crc)
            }
            (PARAM_PORT, 1) => self.param_read(data),
            (PARAM_PORT, 2) => self.param_write(data),
            (PARAM_PORT, 3) => self.param_misc(data),
            (LOG_PORT, 0) => {
                self.count_toc_item(data);
                let items: Vec<_> = self
                    .log_variables
                    .iter()
                    .map(|v| (v.log_type, v.group, v.name))
                    .collect();
                toc_answer(data, &items, self.log_toc_crc)
            }
            (LOG_PORT, 1) => self.log_control(data),
            _ => None,
        };

        answer.map(|data| Packet::new(port, channel, data))
    }

    fn count_toc_item(&mut self, data: &[u8]) {
        if data.first() == Some(&2) {
            self.toc_item_requests += 1;
        }
    }

    fn platform_version(&self, data: &[u8]) -> Option<Vec<u8>> {
        let &command = data.first()?;
        let mut answer = vec![command];
        match command {
            0 => answer.push(self.protocol_version),
            1 => answer.extend(b"2024.2 +12"),
            2 => answer.extend(b"Crazyflie 2.1"),
            _ => return None,
        }
        Some(answer)
    }

    fn param_read(&self, data: &[u8]) -> Option<Vec<u8>> {
        let [lo, hi] = data else { return None };
        let id = u16::from_le_bytes([*lo, *hi]) as usize;

        let mut answer = vec![*lo, *hi];
        match self.params.get(id) {
            Some(param) => {
                answer.push(0);
                answer.extend(&param.value);
            }
            None => answer.push(ENOENT),
        }
        Some(answer)
    }

    fn param_write(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let (id_bytes, value) = (data.get(..2)?, data.get(2..)?);
        let id = u16::from_le_bytes([id_bytes[0], id_bytes[1]]) as usize;

        let mut answer = id_bytes.to_vec();
        match self.params.get_mut(id) {
            None => answer.push(ENOENT),
            Some(param) if param.type_code & PARAM_READ_ONLY != 0 => answer.push(EACCES),
            Some(param) if param.value.len() != value.len() => answer.push(EINVAL),
            Some(param) => {
                param.value = value.to_vec();
                answer.extend(value);
            }
        }
        Some(answer)
    }

    fn param_misc(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let (&command, rest) = data.split_first()?;

        if command == 0 {
            return self.param_set_by_name(rest);
        }

        let id_bytes = rest.get(..2)?;
        let id = u16::from_le_bytes([id_bytes[0], id_bytes[1]]) as usize;
        let mut answer = vec![command, id_bytes[0], id_bytes[1]];

        if command == 8 {
            self.default_value_requests += 1;
        }

        let Some(param) = self.params.get_mut(id) else {
            answer.push(ENOENT);
            return Some(answer);
        };

        match command {
            // Get extended type
            7 => match param.extended {
                Some(extended) => answer.extend([0, extended]),
                None => answer.push(ENOENT),
            },
            // Get default value
            8 => {
                if param.type_code & PARAM_READ_ONLY != 0 {
                    answer.push(ENOENT);
                } else {
                    answer.push(0);
                    answer.extend(&param.default);
                }
            }
            // Persistent get state
            4 if param.is_persistent() => match &param.stored {
                Some(stored) => {
                    answer.push(1);
                    answer.extend(&param.default);
                    answer.extend(stored);
                }
                None => {
                    answer.push(0);
                    answer.extend(&param.default);
                }
            },
            // Persistent store
            3 if param.is_persistent() => {
                param.stored = Some(param.value.clone());
                answer.push(0);
            }
            // Persistent clear
            5 if param.is_persistent() => {
                param.stored = None;
                answer.push(0);
            }
            3..=5 => answer.push(ENOENT),
            _ => return None,
        }

        Some(answer)
    }

    fn param_set_by_name(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let mut parts = data.splitn(3, |b| *b == 0);
        let (group, name, tail) = (parts.next()?, parts.next()?, parts.next()?);
        let (_type_code, value) = tail.split_first()?;

        let mut answer = vec![0];
        answer.extend(group);
        answer.push(0);
        answer.extend(name);
        answer.push(0);

        match self
            .params
            .iter_mut()
            .find(|p| p.group.as_bytes() == group && p.name.as_bytes() == name)
        {
            Some(param) => {
                param.value = value.to_vec();
                answer.push(0);
            }
            None => answer.push(ENOENT),
        }

        Some(answer)
    }

    fn log_control(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let (&command, rest) = data.split_first()?;

        // Reset
        if command == 5 {
            self.log_blocks.clear();
            self.log_resets += 1;
            return Some(vec![5, 0, 0]);
        }

        let &block_id = rest.first()?;
        let status = match command {
            // Create
            6 => {
                if self.log_blocks.contains_key(&block_id) {
                    EEXIST
                } else {
                    self.log_blocks.insert(block_id, SimLogBlock::default());
                    0
                }
            }
            // Append
            7 => match (self.log_blocks.get_mut(&block_id), rest.get(2..4)) {
                (Some(block), Some(id)) => {
                    block.variables.push(u16::from_le_bytes([id[0], id[1]]));
                    0
                }
                (None, _) => ENOENT,
                (_, None) => EINVAL,
            },
            // Start
            3 => match self.log_blocks.get_mut(&block_id) {
                Some(block) => {
                    block.period = rest.get(1).copied();
                    0
                }
                None => ENOENT,
            },
            // Stop
            4 => match self.log_blocks.get_mut(&block_id) {
                Some(block) => {
                    block.period = None;
                    0
                }
                None => ENOENT,
            },
            // Delete
            2 => match self.log_blocks.remove(&block_id) {
                Some(_) => 0,
                None => ENOENT,
            },
            _ => return None,
        };

        Some(vec![command, block_id, status])
    }
}

struct LinkState {
    downlink: Mutex<Option<flume::Sender<Packet>>>,
    reason: Mutex<Option<String>>,
    closed: Notify,
}

impl LinkState {
    fn push(&self, packet: Packet) {
        if let Some(downlink) = self.downlink.lock().unwrap().as_ref() {
            let _ = downlink.send(packet);
        }
    }

    fn close(&self, reason: &str) {
        self.downlink.lock().unwrap().take();
        {
            let mut current = self.reason.lock().unwrap();
            if current.is_none() {
                *current = Some(reason.to_owned());
            }
        }
        self.closed.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.reason.lock().unwrap().is_some()
    }
}

/// Handle on the simulated Crazyflie, clones share the same firmware
#[derive(Clone, Default)]
pub struct SimulatedCrazyflie {
    firmware: Arc<Mutex<Firmware>>,
    current_link: Arc<Mutex<Option<Arc<LinkState>>>>,
    opened_links: Arc<Mutex<usize>>,
}

impl SimulatedCrazyflie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_firmware(configure: impl FnOnce(&mut Firmware)) -> Self {
        let sim = Self::new();
        sim.configure(configure);
        sim
    }

    pub fn configure<T>(&self, configure: impl FnOnce(&mut Firmware) -> T) -> T {
        let mut firmware = self.firmware.lock().unwrap();
        configure(&mut firmware)
    }

    /// Open a new link to the simulated Crazyflie
    pub fn link(&self, needs_resending: bool) -> MockLink {
        let (tx, rx) = flume::unbounded();
        let state = Arc::new(LinkState {
            downlink: Mutex::new(Some(tx)),
            reason: Mutex::new(None),
            closed: Notify::new(),
        });

        *self.current_link.lock().unwrap() = Some(state.clone());
        *self.opened_links.lock().unwrap() += 1;

        MockLink {
            firmware: self.firmware.clone(),
            state,
            downlink: rx,
            needs_resending,
        }
    }

    pub fn opener(&self, needs_resending: bool) -> SimulatedOpener {
        SimulatedOpener {
            sim: self.clone(),
            needs_resending,
        }
    }

    pub fn opened_links(&self) -> usize {
        *self.opened_links.lock().unwrap()
    }

    fn emit(&self, port: u8, channel: u8, data: Vec<u8>) {
        if let Some(link) = self.current_link.lock().unwrap().as_ref() {
            link.push(Packet::new(port, channel, data));
        }
    }

    /// Packets received by the firmware on a port and channel
    pub fn received_on(&self, port: u8, channel: u8) -> Vec<Packet> {
        self.configure(|fw| {
            fw.received
                .iter()
                .filter(|p| p.get_port() == port && p.get_channel() == channel)
                .cloned()
                .collect()
        })
    }

    pub fn param_value(&self, name: &str) -> Option<Vec<u8>> {
        self.configure(|fw| {
            fw.params
                .iter()
                .find(|p| p.full_name() == name)
                .map(|p| p.value.clone())
        })
    }

    /// Change a parameter in the firmware and send the update notification
    pub fn update_param(&self, name: &str, value: Vec<u8>) {
        let id = self.configure(|fw| {
            let id = fw.param_id(name).expect("unknown simulated param");
            fw.params[id as usize].value = value.clone();
            id
        });

        let mut data = vec![1];
        data.extend(id.to_le_bytes());
        data.extend(value);
        self.emit(PARAM_PORT, 3, data);
    }

    pub fn send_log_data(&self, block_id: u8, timestamp: u32, values: &[u8]) {
        let mut data = vec![block_id];
        data.extend(&timestamp.to_le_bytes()[..3]);
        data.extend(values);
        self.emit(LOG_PORT, 2, data);
    }

    pub fn console_print(&self, text: &str) {
        self.emit(CONSOLE_PORT, 0, text.as_bytes().to_vec());
    }

    pub fn log_block(&self, block_id: u8) -> Option<SimLogBlock> {
        self.configure(|fw| fw.log_blocks.get(&block_id).cloned())
    }

    pub fn toc_item_requests(&self) -> usize {
        self.configure(|fw| fw.toc_item_requests)
    }

    pub fn default_value_requests(&self) -> usize {
        self.configure(|fw| fw.default_value_requests)
    }

    /// Simulate a lost connection, the link closes with `reason`
    pub fn lose_connection(&self, reason: &str) {
        if let Some(link) = self.current_link.lock().unwrap().as_ref() {
            link.close(reason);
        }
    }
}

pub struct MockLink {
    firmware: Arc<Mutex<Firmware>>,
    state: Arc<LinkState>,
    downlink: flume::Receiver<Packet>,
    needs_resending: bool,
}

#[async_trait]
impl Link for MockLink {
    async fn send_packet(&self, packet: Packet) -> Result<()> {
        if !packet.is_data_size_valid() {
            return Err(Error::PacketTooLarge(packet.get_data().len()));
        }
        if self.state.is_closed() {
            return Err(Error::Disconnected);
        }

        let answer = self.firmware.lock().unwrap().handle(&packet);
        if let Some(answer) = answer {
            self.state.push(answer);
        }

        Ok(())
    }

    async fn recv_packet(&self) -> Result<Packet> {
        self.downlink
            .recv_async()
            .await
            .map_err(|_| Error::Disconnected)
    }

    async fn close(&self) {
        self.state.close("Link closed");
    }

    async fn wait_close(&self) -> String {
        loop {
            let closed = self.state.closed.notified();
            let reason = self.state.reason.lock().unwrap().clone();
            if let Some(reason) = reason {
                return reason;
            }
            closed.await;
        }
    }

    fn needs_resending(&self) -> bool {
        self.needs_resending
    }
}

pub struct SimulatedOpener {
    sim: SimulatedCrazyflie,
    needs_resending: bool,
}

#[async_trait]
impl LinkOpener for SimulatedOpener {
    async fn open(&self, uri: &str) -> Result<Box<dyn Link>> {
        if uri != SIM_URI {
            return Err(Error::InvalidUri(uri.to_owned()));
        }

        Ok(Box::new(self.sim.link(self.needs_resending)))
    }
}
