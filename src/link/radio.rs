use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::crtp::Packet;
use crate::link::Link;
use crate::pcap::{LinkType, PcapLog};
use crate::{Error, Result};

const DEFAULT_ADDRESS: [u8; 5] = [0xE7; 5];

/// Radio parameters extracted from `radio://<index>/<channel>/<datarate>[/<address>]`
#[derive(Debug, Clone, PartialEq, Eq)]
struct RadioUri {
    index: u8,
    channel: u8,
    address: Vec<u8>,
}

impl RadioUri {
    // Query parameters like `?safelink=0` only matter to the radio driver
    fn parse(uri: &str) -> Result<Self> {
        let invalid = || Error::InvalidUri(uri.to_owned());

        let url = Url::parse(uri).map_err(|_| invalid())?;
        if url.scheme() != "radio" {
            return Err(invalid());
        }

        let index = url
            .host_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(invalid)?;

        let mut segments = url.path_segments().ok_or_else(invalid)?;
        let channel = segments
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(invalid)?;
        let _datarate = segments.next();
        let address = match segments.next() {
            Some(address) if address.len() > 10 => return Err(invalid()),
            Some(address) if !address.is_empty() => {
                hex::decode(format!("{:0>10}", address)).map_err(|_| invalid())?
            }
            _ => DEFAULT_ADDRESS.to_vec(),
        };

        Ok(Self {
            index,
            channel,
            address,
        })
    }
}

/// # Radio link
///
/// Wraps a [crazyflie-link](crazyflie_link) connection. Radio packets can be
/// lost so requests are resent on this link.
pub struct RadioLink {
    connection: crazyflie_link::Connection,
    uri: RadioUri,
    pcap: Option<Arc<PcapLog>>,
}

impl RadioLink {
    /// Wrap an open radio connection
    ///
    /// The URI is only used to describe the link in the capture file, it is
    /// only parsed when a capture is active.
    pub fn new(
        connection: crazyflie_link::Connection,
        uri: &str,
        pcap: Option<Arc<PcapLog>>,
    ) -> Result<Self> {
        let uri = match pcap {
            Some(_) => RadioUri::parse(uri)?,
            None => RadioUri {
                index: 0,
                channel: 0,
                address: DEFAULT_ADDRESS.to_vec(),
            },
        };

        Ok(Self {
            connection,
            uri,
            pcap,
        })
    }

    fn capture(&self, receive: bool, packet: &Packet) {
        if let Some(pcap) = &self.pcap {
            pcap.log_crtp_or_warn(
                LinkType::Radio,
                receive,
                self.uri.index,
                &self.uri.address,
                self.uri.channel,
                packet,
            );
        }
    }
}

#[async_trait]
impl Link for RadioLink {
    async fn send_packet(&self, packet: Packet) -> Result<()> {
        if !packet.is_data_size_valid() {
            return Err(Error::PacketTooLarge(packet.get_data().len()));
        }
        self.capture(false, &packet);
        self.connection.send_packet(packet.into()).await?;
        Ok(())
    }

    async fn recv_packet(&self) -> Result<Packet> {
        let packet: Packet = self.connection.recv_packet().await?.into();
        self.capture(true, &packet);
        Ok(packet)
    }

    async fn close(&self) {
        self.connection.close().await;
    }

    async fn wait_close(&self) -> String {
        self.connection.wait_close().await
    }

    fn needs_resending(&self) -> bool {
        true
    }
}
