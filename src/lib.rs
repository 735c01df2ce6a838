//! # Crazyflie CRTP library
//!
//! This crate allows to connect, communicate with and control the Crazyflie over CRTP, the Crazyflie
//! communication protocol. Links are opened either over a Crazyradio, using the [crazyflie-link] crate, or directly
//! over USB.
//!
//! ## Status
//!
//! The Crazyflie functionalities are implemented in subsystems. The current status is:
//!
//! | Subsystem | Support |
//! |-----------|---------|
//! | Commander | Partial (RPYT, position, velocity, hover) |
//! | Console | Full |
//! | Log | Full (V2) |
//! | Param | Full (V2, including persistent parameters) |
//! | Platform | Partial (versions) |
//!
//! ## Compatibility
//!
//! This crate is compatible with Crazyflie protocol version >= 4. This means Crazyflie firmware release >= 2018.08.
//!
//! ## Usage
//!
//! The basic procedure to use the lib is:
//!  - Find the link URI to connect, either by scanning or as a config or user input
//!  - Create a Crazyflie object from the URI or a connected Link, this will connect to the Crazyflie and initializes
//!    the subsystems
//!  - Subsystems are available as public fields of the [Crazyflie] struct.
//!  - Use the subsystems in the Crazyflie object to control the Crazyflie
//!  - Drop the Crazyflie object or call [Crazyflie::disconnect()]
//!
//! All subsystems functions are only taking an un-mutable reference to self (`&self`), the intention is for the
//! Crazyflie object to be shared between tasks using `Arc<>`.
//!
//! For example:
//! ``` no_run
//! # async fn test() -> Result<(), Box<dyn std::error::Error>> {
//! use crazyflie_crtp::{Config, Crazyflie, LinkContext, NoTocCache};
//!
//! let config = Config::from_env();
//! let link_context = LinkContext::with_config(&config)?;
//!
//! // Scan for Crazyflies on the default address
//! let found = link_context.scan([0xE7; 5]).await?;
//!
//! if let Some(uri) = found.first() {
//!     let cf = Crazyflie::connect_from_uri(&link_context, uri, NoTocCache, config).await?;
//!
//!     println!("List of params variables: ");
//!     for name in cf.param.names() {
//!         println!(" - {}", name);
//!     }
//!
//!     println!("List of log variables: ");
//!     for name in cf.log.names() {
//!         println!(" - {}", name);
//!     }
//!
//!     cf.disconnect().await;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Code that is not async can use [SyncCrazyflie] instead.
//!
//! ## Packet capture
//!
//! When [Config::pcap_log] is set, for example from the `CRTP_PCAP_LOG` environment variable, all the packets
//! going through the links are written to a pcap file. See the [pcap] module.
//!
//! [crazyflie-link]: https://crates.io/crates/crazyflie-link

mod config;
mod crazyflie;
pub mod crtp;
mod crtp_utils;
mod error;
pub mod link;
pub mod pcap;
pub mod subsystems;
mod sync;
pub mod toc;
mod value;

pub use crate::config::{Config, PCAP_LOG_ENV};
pub use crate::crazyflie::Crazyflie;
pub use crate::crtp::{CrtpPort, Packet};
pub use crate::error::{Error, Result};
pub use crate::link::{Link, LinkContext, LinkOpener};
pub use crate::sync::{SyncCrazyflie, SyncLogger};
pub use crate::toc::{FileTocCache, InMemoryTocCache, NoTocCache, TocCache};
pub use crate::value::{Value, ValueType};

/// Supported protocol version
///
/// see [the crate documentation](crate#compatibility) for more information.
pub const SUPPORTED_PROTOCOL_VERSION: u8 = 4;
