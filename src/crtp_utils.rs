//! Various CRTP utils used by the lib
//!
//! These functionalities are currently all private, some might be useful for the user code as well, lets make them
//! public when needed.

use crate::crtp::Packet;
use crate::link::Link;
use crate::{Config, Error, Result};
use async_trait::async_trait;
use flume as channel;
use flume::{Receiver, Sender};
use futures::lock::Mutex;
use log::debug;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub(crate) struct CrtpDispatch {
    link: Arc<dyn Link>,
    port_channels: BTreeMap<u8, Sender<Packet>>,
    disconnect: Arc<AtomicBool>,
}

impl CrtpDispatch {
    pub fn new(link: Arc<dyn Link>, disconnect: Arc<AtomicBool>) -> Self {
        CrtpDispatch {
            link,
            port_channels: BTreeMap::new(),
            disconnect,
        }
    }

    /// Receiver for all packets of one port, `None` if the port is already taken
    #[allow(clippy::map_entry)]
    pub fn get_port_receiver(&mut self, port: u8) -> Option<Receiver<Packet>> {
        if self.port_channels.contains_key(&port) {
            None
        } else {
            let (tx, rx) = channel::unbounded();
            self.port_channels.insert(port, tx);
            Some(rx)
        }
    }

    pub fn run(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            while !self.disconnect.load(Relaxed) {
                match tokio::time::timeout(Duration::from_millis(200), self.link.recv_packet())
                    .await
                {
                    Ok(Ok(packet)) => {
                        if let Some(channel) = self.port_channels.get(&packet.get_port()) {
                            let _ = channel.send_async(packet).await;
                        }
                    }
                    Err(_) => continue,
                    Ok(Err(_)) => {
                        debug!("Link closed, stopping downlink dispatcher");
                        self.disconnect.store(true, Relaxed);
                        return;
                    }
                }
            }
        })
    }
}

#[async_trait]
pub(crate) trait WaitForPacket {
    async fn wait_packet(&self, port: u8, channel: u8, data_prefix: &[u8]) -> Result<Packet>;
}

#[async_trait]
impl WaitForPacket for channel::Receiver<Packet> {
    async fn wait_packet(&self, port: u8, channel: u8, data_prefix: &[u8]) -> Result<Packet> {
        let mut pk = self.recv_async().await.ok().ok_or(Error::Disconnected)?;

        loop {
            if pk.get_port() == port
                && pk.get_channel() == channel
                && pk.get_data().starts_with(data_prefix)
            {
                break;
            }
            pk = self.recv_async().await.ok().ok_or(Error::Disconnected)?;
        }

        Ok(pk)
    }
}

/// Split a port downlink into its 4 channels
pub(crate) fn crtp_channel_dispatcher(
    downlink: channel::Receiver<Packet>,
) -> (
    Receiver<Packet>,
    Receiver<Packet>,
    Receiver<Packet>,
    Receiver<Packet>,
) {
    let (tx0, rx0) = channel::unbounded();
    let (tx1, rx1) = channel::unbounded();
    let (tx2, rx2) = channel::unbounded();
    let (tx3, rx3) = channel::unbounded();
    let senders = [tx0, tx1, tx2, tx3];

    tokio::spawn(async move {
        while let Ok(pk) = downlink.recv_async().await {
            // The channel is 2 bits wide
            let _ = senders[pk.get_channel() as usize & 0x03]
                .send_async(pk)
                .await;
        }
    });

    (rx0, rx1, rx2, rx3)
}

/// Resend policy of a [RequestChannel]
#[derive(Debug, Clone, Copy)]
pub(crate) struct RequestTiming {
    timeout: Duration,
    retries: u32,
    resend: bool,
}

impl RequestTiming {
    pub fn new(config: &Config, needs_resending: bool) -> Self {
        Self {
            timeout: config.request_timeout(),
            retries: config.request_retries,
            resend: needs_resending,
        }
    }
}

/// Request/response correlator for one CRTP channel
///
/// A reply is matched with its request by comparing the first bytes of the
/// payload, the request's leading bytes act as the lock pattern. Only one
/// request is in flight per channel at a time.
pub(crate) struct RequestChannel {
    uplink: Sender<Packet>,
    downlink: Mutex<Receiver<Packet>>,
    timing: RequestTiming,
}

impl RequestChannel {
    pub fn new(uplink: Sender<Packet>, downlink: Receiver<Packet>, timing: RequestTiming) -> Self {
        Self {
            uplink,
            downlink: Mutex::new(downlink),
            timing,
        }
    }

    /// Send a packet without waiting for any answer
    pub async fn send(&self, packet: Packet) -> Result<()> {
        self.uplink.send_async(packet).await?;
        Ok(())
    }

    /// Send a request and wait for the reply starting with the same `pattern_len` bytes
    pub async fn request(&self, packet: Packet, pattern_len: usize) -> Result<Packet> {
        let downlink = self.downlink.lock().await;

        // Late answers to previous requests
        while downlink.try_recv().is_ok() {}

        let pattern_len = pattern_len.min(packet.get_data().len());
        let pattern = packet.get_data()[..pattern_len].to_vec();
        let (port, channel) = (packet.get_port(), packet.get_channel());

        if !self.timing.resend {
            self.uplink.send_async(packet).await?;
            let timeout = self.timing.timeout * (self.timing.retries + 1);
            return tokio::time::timeout(timeout, downlink.wait_packet(port, channel, &pattern))
                .await
                .map_err(|_| Error::Timeout)?;
        }

        for attempt in 0..=self.timing.retries {
            if attempt > 0 {
                debug!("No answer, resending {} (attempt {})", packet, attempt);
            }
            self.uplink.send_async(packet.clone()).await?;

            if let Ok(answer) = tokio::time::timeout(
                self.timing.timeout,
                downlink.wait_packet(port, channel, &pattern),
            )
            .await
            {
                return answer;
            }
        }

        Err(Error::Timeout)
    }
}
