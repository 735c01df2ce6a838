//! # Synchronous API
//!
//! [SyncCrazyflie] wraps a [Crazyflie] connection and a tokio runtime so that
//! the lib can be used from code that is not async. Connection, disconnection
//! and parameter access become blocking calls:
//!
//! ```no_run
//! # fn example() -> crazyflie_crtp::Result<()> {
//! use crazyflie_crtp::SyncCrazyflie;
//!
//! let mut scf = SyncCrazyflie::new("usb://0")?;
//! scf.open_link()?;
//!
//! let effect: u8 = scf.get_param("ring.effect")?;
//! scf.set_param("ring.effect", effect + 1)?;
//!
//! scf.close_link();
//! # Ok(())
//! # }
//! ```
//!
//! Log variables are read with a [SyncLogger], an iterator over the samples of
//! a log block:
//!
//! ```no_run
//! # fn example(scf: &crazyflie_crtp::SyncCrazyflie) -> crazyflie_crtp::Result<()> {
//! use crazyflie_crtp::subsystems::log::LogPeriod;
//!
//! let logger = scf.start_logger(&["pm.vbat"], LogPeriod::from_millis(100)?)?;
//! for sample in logger.take(10) {
//!     println!("{:?}", sample?.data["pm.vbat"]);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The functions of this module block the calling thread and must not be called
//! from within an async runtime.

use std::future::Future;
use std::sync::Arc;

use log::{info, warn};

use crate::link::{LinkContext, LinkOpener};
use crate::subsystems::log::{LogData, LogPeriod, LogStream};
use crate::toc::{InMemoryTocCache, TocCache};
use crate::{Config, Crazyflie, Error, Result, Value};

/// Blocking wrapper around a [Crazyflie] connection
///
/// The link can be opened and closed many times, a new [Crazyflie] connection
/// is made every time. TOCs are cached between connections. Dropping the
/// object closes the link.
pub struct SyncCrazyflie {
    uri: String,
    opener: Box<dyn LinkOpener>,
    toc_cache: Arc<dyn TocCache>,
    config: Config,
    crazyflie: Option<Crazyflie>,
    // Dropped last, the connection tasks run on it
    runtime: tokio::runtime::Runtime,
}

impl SyncCrazyflie {
    /// Prepare a connection to `uri` using radio or USB links
    ///
    /// The configuration is read from the environment, see [Config::from_env()].
    pub fn new(uri: &str) -> Result<Self> {
        let runtime = Self::build_runtime()?;
        let config = Config::from_env();

        let opener = {
            let _guard = runtime.enter();
            LinkContext::with_config(&config)?
        };

        Ok(Self {
            uri: uri.to_owned(),
            opener: Box::new(opener),
            toc_cache: Arc::new(InMemoryTocCache::new()),
            config,
            crazyflie: None,
            runtime,
        })
    }

    /// Prepare a connection to `uri` using a custom link opener and TOC cache
    pub fn with_opener(
        uri: &str,
        opener: impl LinkOpener + 'static,
        toc_cache: impl TocCache + 'static,
        config: Config,
    ) -> Result<Self> {
        Ok(Self {
            uri: uri.to_owned(),
            opener: Box::new(opener),
            toc_cache: Arc::new(toc_cache),
            config,
            crazyflie: None,
            runtime: Self::build_runtime()?,
        })
    }

    fn build_runtime() -> Result<tokio::runtime::Runtime> {
        Ok(tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Connect to the Crazyflie and wait for the connection to be ready
    ///
    /// Returns [Error::LinkAlreadyOpen] if the link is already open, otherwise
    /// the error that made the connection fail.
    pub fn open_link(&mut self) -> Result<()> {
        if self.is_link_open() {
            return Err(Error::LinkAlreadyOpen);
        }

        let crazyflie = self.runtime.block_on(Crazyflie::connect_from_uri(
            self.opener.as_ref(),
            &self.uri,
            self.toc_cache.clone(),
            self.config.clone(),
        ))?;
        info!("Link open to {}", self.uri);

        self.crazyflie = Some(crazyflie);

        Ok(())
    }

    /// Disconnect from the Crazyflie, does nothing if the link is not open
    pub fn close_link(&mut self) {
        if let Some(crazyflie) = self.crazyflie.take() {
            self.runtime.block_on(crazyflie.disconnect());
            info!("Link to {} closed", self.uri);
        }
    }

    /// True if the link is open and the connection has not been lost
    pub fn is_link_open(&self) -> bool {
        self.crazyflie
            .as_ref()
            .map(|cf| cf.is_connected())
            .unwrap_or(false)
    }

    /// The connected Crazyflie, to use with [SyncCrazyflie::block_on()]
    pub fn cf(&self) -> Result<&Crazyflie> {
        self.crazyflie.as_ref().ok_or(Error::Disconnected)
    }

    /// Run a future on the connection runtime and wait for its result
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Blocking version of [Param::get()](crate::subsystems::param::Param::get)
    pub fn get_param<T: TryFrom<Value>>(&self, name: &str) -> Result<T>
    where
        <T as TryFrom<Value>>::Error: std::fmt::Debug,
    {
        let cf = self.cf()?;
        self.block_on(cf.param.get(name))
    }

    /// Blocking version of [Param::set()](crate::subsystems::param::Param::set)
    pub fn set_param<T: Into<Value>>(&self, name: &str, value: T) -> Result<()> {
        let cf = self.cf()?;
        self.block_on(cf.param.set(name, value))
    }

    /// Create and start a log block with `variables`, sampled every `period`
    ///
    /// The returned [SyncLogger] borrows the connection, the link cannot be
    /// closed while it is alive.
    pub fn start_logger(&self, variables: &[&str], period: LogPeriod) -> Result<SyncLogger<'_>> {
        let cf = self.cf()?;
        let stream = self.block_on(async {
            let mut block = cf.log.create_block().await?;
            for name in variables {
                block.add_variable(name).await?;
            }
            block.start(period).await
        })?;

        Ok(SyncLogger {
            scf: self,
            stream: Some(stream),
        })
    }

    /// Block until the connection is lost or closed, returns the reason
    pub fn wait_disconnect(&self) -> Result<String> {
        let cf = self.cf()?;
        Ok(self.block_on(cf.wait_disconnect()))
    }
}

impl Drop for SyncCrazyflie {
    fn drop(&mut self) {
        self.close_link();
    }
}

/// Blocking iterator over the samples of a running log block
///
/// Each call to `next()` waits for the next sample. The iteration ends when
/// the connection is lost. Dropping the logger stops the block, it is deleted
/// from the Crazyflie the next time a block is created.
pub struct SyncLogger<'a> {
    scf: &'a SyncCrazyflie,
    stream: Option<LogStream>,
}

impl SyncLogger<'_> {
    /// True until the connection is lost
    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl Iterator for SyncLogger<'_> {
    type Item = Result<LogData>;

    fn next(&mut self) -> Option<Self::Item> {
        let stream = self.stream.as_ref()?;
        let cf = self.scf.cf().ok()?;

        let sample = self.scf.block_on(async {
            tokio::select! {
                sample = stream.next() => Some(sample),
                _ = cf.wait_disconnect() => None,
            }
        });

        match sample {
            None | Some(Err(Error::Disconnected)) => {
                self.stream = None;
                None
            }
            sample => sample,
        }
    }
}

impl Drop for SyncLogger<'_> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if self.scf.is_link_open() {
                if let Err(e) = self.scf.block_on(stream.stop()) {
                    warn!("Failed to stop log block: {}", e);
                }
            }
        }
    }
}
