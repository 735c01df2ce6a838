//! # Communication links
//!
//! A link carries CRTP packets between the lib and one Crazyflie. Two kinds of
//! link are supported:
//!  - `radio://` URIs use a Crazyradio through the [crazyflie-link] crate
//!  - `usb://<n>` URIs talk directly to the n-th Crazyflie connected over USB
//!
//! Links are opened from a [LinkContext]. The context also holds the optional
//! pcap capture shared by all the links it opens.
//!
//! [crazyflie-link]: https://crates.io/crates/crazyflie-link

mod radio;
mod usb;

pub use radio::RadioLink;
pub use usb::UsbLink;

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::crtp::Packet;
use crate::pcap::PcapLog;
use crate::{Config, Result};

/// A connected packet link to a Crazyflie
#[async_trait]
pub trait Link: Send + Sync {
    /// Send a packet to the Crazyflie
    ///
    /// Fails with [Error::PacketTooLarge](crate::Error::PacketTooLarge) if the
    /// payload is above 30 bytes and [Error::Disconnected](crate::Error::Disconnected)
    /// if the link is closed.
    async fn send_packet(&self, packet: Packet) -> Result<()>;

    /// Receive the next packet from the Crazyflie
    async fn recv_packet(&self) -> Result<Packet>;

    /// Close the link and wait for it to be fully closed
    async fn close(&self);

    /// Wait for the link to close, returns the reason for closing
    async fn wait_close(&self) -> String;

    /// True if the link can silently lose packets and requests must be resent
    fn needs_resending(&self) -> bool;
}

/// Opens links from URIs
#[async_trait]
pub trait LinkOpener: Send + Sync {
    /// Open a link to the given URI
    async fn open(&self, uri: &str) -> Result<Box<dyn Link>>;
}

/// Link context, opens radio and USB links
///
/// Must be created from within a tokio runtime.
pub struct LinkContext {
    radio: crazyflie_link::LinkContext,
    pcap: Option<Arc<PcapLog>>,
}

impl Default for LinkContext {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkContext {
    /// Create a link context without capture
    pub fn new() -> Self {
        Self {
            radio: crazyflie_link::LinkContext::new(),
            pcap: None,
        }
    }

    /// Create a link context, opening the pcap capture if configured
    pub fn with_config(config: &Config) -> Result<Self> {
        let pcap = match &config.pcap_log {
            Some(path) => Some(Arc::new(PcapLog::create(path)?)),
            None => None,
        };

        Ok(Self {
            radio: crazyflie_link::LinkContext::new(),
            pcap,
        })
    }

    /// Scan for Crazyflies
    ///
    /// The radio is scanned on the given address and the USB Crazyflies are
    /// appended to the result.
    pub async fn scan(&self, address: [u8; 5]) -> Result<Vec<String>> {
        let mut found = self.radio.scan(address).await?;
        found.extend(UsbLink::scan().await?);

        debug!("Scan found {:?}", found);

        Ok(found)
    }
}

#[async_trait]
impl LinkOpener for LinkContext {
    async fn open(&self, uri: &str) -> Result<Box<dyn Link>> {
        if uri.starts_with(usb::URI_SCHEME) {
            Ok(Box::new(UsbLink::open(uri, self.pcap.clone()).await?))
        } else {
            let connection = self.radio.open_link(uri).await?;
            Ok(Box::new(RadioLink::new(connection, uri, self.pcap.clone())?))
        }
    }
}
