use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rusb::{Device, DeviceDescriptor, DeviceHandle, GlobalContext};

use crate::crtp::Packet;
use crate::link::Link;
use crate::pcap::{LinkType, PcapLog};
use crate::{Error, Result};

pub(crate) const URI_SCHEME: &str = "usb://";

const VENDOR_ID: u16 = 0x0483;
const PRODUCT_ID: u16 = 0x5740;
const MANUFACTURER: &str = "Bitcraze AB";

const INTERFACE: u8 = 0;
const ENDPOINT_OUT: u8 = 0x01;
const ENDPOINT_IN: u8 = 0x81;
const TRANSFER_SIZE: usize = 64;
const TRANSFER_TIMEOUT: Duration = Duration::from_millis(20);

// Vendor request enabling CRTP over USB
const CONTROL_REQUEST_TYPE: u8 = 64;
const CONTROL_CRTP_ENABLE: u8 = 0x01;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

fn find_crazyflies() -> Result<Vec<(Device<GlobalContext>, DeviceDescriptor)>> {
    let mut found = Vec::new();

    for device in rusb::devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };

        if descriptor.vendor_id() != VENDOR_ID || descriptor.product_id() != PRODUCT_ID {
            continue;
        }

        let handle = match device.open() {
            Ok(h) => h,
            Err(e) => {
                debug!("Cannot open USB device {:?}: {}", device, e);
                continue;
            }
        };

        match handle.read_manufacturer_string_ascii(&descriptor) {
            Ok(manufacturer) if manufacturer == MANUFACTURER => found.push((device, descriptor)),
            _ => continue,
        }
    }

    Ok(found)
}

fn parse_uri(uri: &str) -> Result<usize> {
    uri.strip_prefix(URI_SCHEME)
        .and_then(|index| index.parse().ok())
        .ok_or_else(|| Error::InvalidUri(uri.to_owned()))
}

/// # USB link
///
/// Direct connection to a Crazyflie plugged on USB. The USB transfer is
/// reliable so requests are never resent on this link.
pub struct UsbLink {
    uplink: flume::Sender<Packet>,
    downlink: flume::Receiver<Packet>,
    disconnect_channel: flume::Receiver<()>,
    disconnect: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
    serial: String,
}

impl UsbLink {
    /// List the URIs of the Crazyflies connected over USB
    pub async fn scan() -> Result<Vec<String>> {
        let found = tokio::task::spawn_blocking(find_crazyflies).await??;

        Ok((0..found.len())
            .map(|i| format!("{}{}", URI_SCHEME, i))
            .collect())
    }

    /// Open the link to `usb://<n>`, the n-th Crazyflie found by [UsbLink::scan()]
    pub async fn open(uri: &str, pcap: Option<Arc<PcapLog>>) -> Result<Self> {
        let index = parse_uri(uri)?;
        let uri = uri.to_owned();

        let (handle, serial, devid) = tokio::task::spawn_blocking(move || {
            let (device, descriptor) = find_crazyflies()?
                .into_iter()
                .nth(index)
                .ok_or(Error::InvalidUri(uri))?;

            let handle = device.open()?;
            if handle.claim_interface(INTERFACE).is_err() {
                handle.set_active_configuration(1)?;
                handle.claim_interface(INTERFACE)?;
            }

            handle.write_control(
                CONTROL_REQUEST_TYPE,
                CONTROL_CRTP_ENABLE,
                0x01,
                0x01,
                &[],
                CONTROL_TIMEOUT,
            )?;

            let serial = handle
                .read_serial_number_string_ascii(&descriptor)
                .unwrap_or_default();

            Ok::<_, Error>((handle, serial, device.port_number()))
        })
        .await??;

        info!("Connected to USB Crazyflie {}", serial);

        let address = hex::decode(&serial).unwrap_or_else(|_| serial.as_bytes().to_vec());

        let (uplink, uplink_recv) = flume::unbounded();
        let (downlink_send, downlink) = flume::unbounded();
        let (disconnect_channel_tx, disconnect_channel) = flume::bounded(0);
        let disconnect = Arc::new(AtomicBool::new(false));
        let reason = Arc::new(Mutex::new(None));

        let io = UsbIo {
            handle,
            uplink: uplink_recv,
            downlink: downlink_send,
            disconnect: disconnect.clone(),
            capture: pcap.map(|pcap| UsbCapture {
                pcap,
                address,
                devid,
            }),
        };

        let io_reason = reason.clone();
        tokio::task::spawn_blocking(move || {
            let closing_reason = io.run();
            debug!("USB link closed: {}", closing_reason);
            if let Ok(mut reason) = io_reason.lock() {
                *reason = Some(closing_reason);
            }
            drop(disconnect_channel_tx);
        });

        Ok(Self {
            uplink,
            downlink,
            disconnect_channel,
            disconnect,
            reason,
            serial,
        })
    }

    /// Serial number of the connected Crazyflie
    pub fn serial(&self) -> &str {
        &self.serial
    }
}

#[async_trait]
impl Link for UsbLink {
    async fn send_packet(&self, packet: Packet) -> Result<()> {
        if !packet.is_data_size_valid() {
            return Err(Error::PacketTooLarge(packet.get_data().len()));
        }
        self.uplink.send_async(packet).await?;
        Ok(())
    }

    async fn recv_packet(&self) -> Result<Packet> {
        Ok(self.downlink.recv_async().await?)
    }

    async fn close(&self) {
        self.disconnect.store(true, Relaxed);
        let _ = self.disconnect_channel.recv_async().await;
    }

    async fn wait_close(&self) -> String {
        // The IO thread drops the other side when it exits
        let _ = self.disconnect_channel.recv_async().await;
        self.reason
            .lock()
            .ok()
            .and_then(|reason| reason.clone())
            .unwrap_or_else(|| "Still connected!".to_owned())
    }

    fn needs_resending(&self) -> bool {
        false
    }
}

impl Drop for UsbLink {
    fn drop(&mut self) {
        self.disconnect.store(true, Relaxed);
    }
}

struct UsbCapture {
    pcap: Arc<PcapLog>,
    address: Vec<u8>,
    devid: u8,
}

impl UsbCapture {
    fn log(&self, receive: bool, packet: &Packet) {
        self.pcap
            .log_crtp_or_warn(LinkType::Usb, receive, self.devid, &self.address, 0, packet);
    }
}

struct UsbIo {
    handle: DeviceHandle<GlobalContext>,
    uplink: flume::Receiver<Packet>,
    downlink: flume::Sender<Packet>,
    disconnect: Arc<AtomicBool>,
    capture: Option<UsbCapture>,
}

impl UsbIo {
    fn run(mut self) -> String {
        let mut buffer = [0u8; TRANSFER_SIZE];

        loop {
            if self.disconnect.load(Relaxed) {
                self.shutdown();
                return "Connection closed".to_owned();
            }

            match self
                .handle
                .read_bulk(ENDPOINT_IN, &mut buffer, TRANSFER_TIMEOUT)
            {
                Ok(0) | Err(rusb::Error::Timeout) => (),
                Ok(n) => match Packet::from_bytes(&buffer[..n]) {
                    Ok(packet) => {
                        if let Some(capture) = &self.capture {
                            capture.log(true, &packet);
                        }
                        if self.downlink.send(packet).is_err() {
                            self.shutdown();
                            return "Connection closed".to_owned();
                        }
                    }
                    Err(e) => warn!("Dropping malformed USB packet: {}", e),
                },
                Err(e) => {
                    warn!("USB read error: {}", e);
                    return "Crazyflie disconnected".to_owned();
                }
            }

            while let Ok(packet) = self.uplink.try_recv() {
                if let Some(capture) = &self.capture {
                    capture.log(false, &packet);
                }
                if let Err(e) =
                    self.handle
                        .write_bulk(ENDPOINT_OUT, &packet.to_bytes(), TRANSFER_TIMEOUT)
                {
                    debug!("USB write error ignored: {}", e);
                }
            }
        }
    }

    fn shutdown(&mut self) {
        let _ = self.handle.write_control(
            CONTROL_REQUEST_TYPE,
            CONTROL_CRTP_ENABLE,
            0x01,
            0x00,
            &[],
            CONTROL_TIMEOUT,
        );
        let _ = self.handle.release_interface(INTERFACE);
    }
}
