use crate::subsystems::commander::Commander;
use crate::subsystems::console::Console;
use crate::subsystems::log::Log;
use crate::subsystems::param::Param;
use crate::subsystems::platform::Platform;

use crate::crtp::{CrtpPort, Packet};
use crate::crtp_utils::{CrtpDispatch, RequestTiming};
use crate::link::{Link, LinkOpener};
use crate::toc::TocCache;
use crate::{Config, Error, Result, SUPPORTED_PROTOCOL_VERSION};
use flume as channel;
use futures::lock::Mutex;
use log::{debug, info};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

/// # The Crazyflie
///
/// This struct is one-time use: Creating it will connect to a Crazyflie and once disconnected, either as requested
/// by the lib user or as a result of a connection loss, the object cannot be reconnected. A new one need to be created
/// to connect again.
///
/// See the [crate root documentation](crate) for more context and information.
pub struct Crazyflie {
    /// Log subsystem access
    pub log: Log,
    /// Parameter subsystem access
    pub param: Param,
    /// Commander/setpoint subsystem access
    pub commander: Commander,
    /// Console subsystem access
    pub console: Console,
    /// Platform services
    pub platform: Platform,
    uplink_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    disconnect: Arc<AtomicBool>,
    link: Arc<dyn Link>,
    connected_at: SystemTime,
}

impl Crazyflie {
    /// Open a Crazyflie connection to a given URI
    ///
    /// This function opens a link to the given URI and calls [Crazyflie::connect_from_link()] to connect the Crazyflie.
    ///
    /// An error is returned either if the link cannot be opened or if the Crazyflie connection fails.
    pub async fn connect_from_uri(
        link_opener: &dyn LinkOpener,
        uri: &str,
        toc_cache: impl TocCache + 'static,
        config: Config,
    ) -> Result<Self> {
        let link = link_opener.open(uri).await?;

        Self::connect_from_link(link, toc_cache, config).await
    }

    /// Connect a Crazyflie using an existing link
    ///
    /// The protocol version of the Crazyflie is checked, then the log and param
    /// table of contents are fetched, from the cache when possible.
    ///
    /// This function will return an error if anything goes wrong in the connection process.
    pub async fn connect_from_link(
        link: Box<dyn Link>,
        toc_cache: impl TocCache + 'static,
        config: Config,
    ) -> Result<Self> {
        let disconnect = Arc::new(AtomicBool::new(false));
        let link: Arc<dyn Link> = Arc::from(link);
        let timing = RequestTiming::new(&config, link.needs_resending());

        // Downlink dispatcher
        let mut dispatcher = CrtpDispatch::new(link.clone(), disconnect.clone());

        // Uplink queue
        let (uplink, rx) = channel::unbounded::<Packet>();
        let disconnect_uplink = disconnect.clone();
        let link_uplink = link.clone();
        let uplink_task = tokio::spawn(async move {
            while !disconnect_uplink.load(Relaxed) {
                match tokio::time::timeout(Duration::from_millis(100), rx.recv_async()).await {
                    Ok(Ok(pk)) => {
                        if link_uplink.send_packet(pk).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => (),
                    Ok(Err(flume::RecvError::Disconnected)) => return,
                }
            }
            // Packets queued before the disconnection, like the final setpoint
            while let Ok(pk) = rx.try_recv() {
                if link_uplink.send_packet(pk).await.is_err() {
                    return;
                }
            }
        });

        // Each port is only requested once so none of these can be taken already
        let mut port_receiver = |port: CrtpPort| {
            dispatcher
                .get_port_receiver(port.into())
                .ok_or_else(|| Error::SystemError(format!("Port {:?} already in use", port)))
        };
        let console_downlink = port_receiver(CrtpPort::Console)?;
        let param_downlink = port_receiver(CrtpPort::Param)?;
        let log_downlink = port_receiver(CrtpPort::Log)?;
        let platform_downlink = port_receiver(CrtpPort::Platform)?;

        let console = Console::new(console_downlink);
        let commander = Commander::new(uplink.clone());
        let platform = Platform::new(uplink.clone(), platform_downlink, timing);

        // Start the downlink packet dispatcher
        let dispatch_task = dispatcher.run();

        let protocol_version = match platform.protocol_version().await {
            Ok(version) => version,
            Err(e) => return Err(abort_connection(&disconnect, link.as_ref(), e).await),
        };
        debug!("Crazyflie protocol version {}", protocol_version);
        if protocol_version < SUPPORTED_PROTOCOL_VERSION {
            let e = Error::ProtocolVersionNotSupported;
            return Err(abort_connection(&disconnect, link.as_ref(), e).await);
        }

        // Initialize log and param in parallel
        let toc_cache: &dyn TocCache = &toc_cache;
        let (log, param) = futures::join!(
            Log::new(log_downlink, uplink.clone(), toc_cache, timing),
            Param::new(param_downlink, uplink.clone(), toc_cache, timing)
        );
        let (log, param) = match (log, param) {
            (Ok(log), Ok(param)) => (log, param),
            (Err(e), _) | (_, Err(e)) => {
                return Err(abort_connection(&disconnect, link.as_ref(), e).await)
            }
        };

        info!(
            "Connected, {} log variables and {} parameters",
            log.names().len(),
            param.names().len()
        );

        Ok(Crazyflie {
            log,
            param,
            commander,
            console,
            platform,
            uplink_task: Mutex::new(Some(uplink_task)),
            dispatch_task: Mutex::new(Some(dispatch_task)),
            disconnect,
            link,
            connected_at: SystemTime::now(),
        })
    }

    /// Disconnect the Crazyflie
    ///
    /// The Connection can be ended in two ways: either by dropping the [Crazyflie] object or by calling this
    /// disconnect() function. Once this function return, the Crazyflie is fully disconnected.
    ///
    /// A zero thrust setpoint is sent before closing the link so that the motors stop.
    ///
    /// Once disconnected, any methods that uses the communication to the Crazyflie will return the error
    /// [Error::Disconnected]
    pub async fn disconnect(&self) {
        if !self.disconnect.load(Relaxed) {
            let _ = self.commander.setpoint_rpyt(0.0, 0.0, 0.0, 0).await;
        }

        // Set disconnect to true, will make both uplink and dispatcher task quit
        self.disconnect.store(true, Relaxed);

        // Wait for both task to finish
        if let Some(uplink_task) = self.uplink_task.lock().await.take() {
            let _ = uplink_task.await;
        }
        if let Some(dispatch_task) = self.dispatch_task.lock().await.take() {
            let _ = dispatch_task.await;
        }

        self.link.close().await;
    }

    /// Wait for the Crazyflie to be disconnected
    ///
    /// This function waits for the Crazyflie link to close and for the Crazyflie to fully disconnect. It returns
    /// a string describing the reason for the disconnection.
    ///
    /// One intended use if to call and block on this function from an async task to detect a disconnection and, for
    /// example, update the state of a GUI.
    pub async fn wait_disconnect(&self) -> String {
        let reason = self.link.wait_close().await;

        self.disconnect().await;

        reason
    }

    /// True until the connection is closed or lost
    pub fn is_connected(&self) -> bool {
        !self.disconnect.load(Relaxed)
    }

    /// Time at which the connection was established
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }
}

/// Stop the background tasks and close the link of a failed connection
async fn abort_connection(disconnect: &AtomicBool, link: &dyn Link, error: Error) -> Error {
    disconnect.store(true, Relaxed);
    link.close().await;
    error
}

impl Drop for Crazyflie {
    fn drop(&mut self) {
        self.disconnect.store(true, Relaxed);
    }
}
