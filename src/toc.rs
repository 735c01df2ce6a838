//! # Table of content
//!
//! The log and param subsystems describe their variables in a table of content
//! (TOC) that is downloaded at connection time. Downloading a full TOC takes
//! one request per variable, so TOCs can be cached: the Crazyflie announces a
//! CRC32 of its TOC and a TOC already seen with the same CRC is loaded from a
//! [TocCache] instead.
//!
//! Three caches are provided:
//!  - [NoTocCache] never caches anything
//!  - [InMemoryTocCache] lives as long as the program, clones share the same content
//!  - [FileTocCache] stores every TOC as a JSON file in a directory

use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crtp::Packet;
use crate::crtp_utils::RequestChannel;
use crate::{Error, Result};

const TOC_CHANNEL: u8 = 0;
const TOC_GET_ITEM_V2: u8 = 2;
const TOC_INFO_V2: u8 = 3;

/// Storage for downloaded TOCs, keyed by the TOC CRC32
///
/// The cache only stores strings: the TOC is serialized to JSON by the lib.
pub trait TocCache: Send + Sync {
    /// Get the TOC with this CRC, if known
    fn get_toc(&self, crc32: u32) -> Option<String>;

    /// Store a TOC, failures are not reported
    fn store_toc(&self, crc32: u32, toc: &str);
}

impl<T: TocCache + ?Sized> TocCache for Arc<T> {
    fn get_toc(&self, crc32: u32) -> Option<String> {
        (**self).get_toc(crc32)
    }

    fn store_toc(&self, crc32: u32, toc: &str) {
        (**self).store_toc(crc32, toc)
    }
}

/// Cache that never stores anything, TOCs are downloaded at every connection
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTocCache;

impl TocCache for NoTocCache {
    fn get_toc(&self, _crc32: u32) -> Option<String> {
        None
    }

    fn store_toc(&self, _crc32: u32, _toc: &str) {}
}

/// In-memory cache
///
/// Cloning the cache gives access to the same storage, so one cache can be
/// used by many connections.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTocCache {
    cache: Arc<RwLock<HashMap<u32, String>>>,
}

impl InMemoryTocCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    /// Number of cached TOCs
    pub fn len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TocCache for InMemoryTocCache {
    fn get_toc(&self, crc32: u32) -> Option<String> {
        self.cache.read().ok()?.get(&crc32).cloned()
    }

    fn store_toc(&self, crc32: u32, toc: &str) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(crc32, toc.to_owned());
        }
    }
}

/// File cache
///
/// Every TOC is stored in `<directory>/<CRC32>.json`, with the CRC written as
/// 8 uppercase hex digits. Loaded TOCs are also kept in memory.
#[derive(Debug, Clone)]
pub struct FileTocCache {
    directory: Arc<PathBuf>,
    memory: InMemoryTocCache,
}

impl FileTocCache {
    /// Use `directory` as cache, it is created if it does not exist
    pub fn new(directory: impl AsRef<Path>) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        Ok(Self {
            directory: Arc::new(directory),
            memory: InMemoryTocCache::new(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, crc32: u32) -> PathBuf {
        self.directory.join(format!("{:08X}.json", crc32))
    }

    /// Remove all the cached TOCs, from memory and from disk
    pub fn clear(&self) -> Result<()> {
        self.memory.clear();

        for entry in fs::read_dir(&*self.directory)?.flatten() {
            let path = entry.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                fs::remove_file(path)?;
            }
        }

        Ok(())
    }

    /// Number of TOCs loaded in memory
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}

impl TocCache for FileTocCache {
    fn get_toc(&self, crc32: u32) -> Option<String> {
        if let Some(toc) = self.memory.get_toc(crc32) {
            return Some(toc);
        }

        let toc = fs::read_to_string(self.file_path(crc32)).ok()?;
        self.memory.store_toc(crc32, &toc);
        Some(toc)
    }

    fn store_toc(&self, crc32: u32, toc: &str) {
        self.memory.store_toc(crc32, toc);

        let path = self.file_path(crc32);
        if let Err(e) = fs::write(&path, toc) {
            warn!("Cannot write TOC cache file {}: {}", path.display(), e);
        }
    }
}

/// TOC of a subsystem: "group.name" to (variable id, item info)
pub(crate) type Toc<T> = BTreeMap<String, (u16, T)>;

pub(crate) async fn fetch_toc<T>(
    port: u8,
    toc_channel: &RequestChannel,
    cache: &dyn TocCache,
) -> Result<Toc<T>>
where
    T: TryFrom<u8, Error = Error> + Serialize + DeserializeOwned,
{
    let answer = toc_channel
        .request(Packet::new(port, TOC_CHANNEL, vec![TOC_INFO_V2]), 1)
        .await?;
    let data = answer.get_data();
    if data.len() < 7 {
        return Err(Error::ProtocolError(format!(
            "TOC info answer too short: {} bytes",
            data.len()
        )));
    }

    let toc_len = u16::from_le_bytes([data[1], data[2]]);
    let crc32 = u32::from_le_bytes([data[3], data[4], data[5], data[6]]);

    if let Some(cached) = cache.get_toc(crc32) {
        match serde_json::from_str::<Toc<T>>(&cached) {
            Ok(toc) => {
                debug!("TOC of port {} loaded from cache ({:08X})", port, crc32);
                return Ok(toc);
            }
            Err(e) => warn!("Ignoring unreadable cached TOC {:08X}: {}", crc32, e),
        }
    }

    info!("Fetching TOC of port {}, {} items", port, toc_len);

    let mut toc = BTreeMap::new();

    for index in 0..toc_len {
        let mut request = vec![TOC_GET_ITEM_V2];
        request.extend_from_slice(&index.to_le_bytes());

        let answer = toc_channel
            .request(Packet::new(port, TOC_CHANNEL, request), 3)
            .await?;
        let (id, name, item) = decode_item::<T>(answer.get_data())?;
        toc.insert(name, (id, item));
    }

    match serde_json::to_string(&toc) {
        Ok(json) => cache.store_toc(crc32, &json),
        Err(e) => warn!("Cannot serialize TOC for caching: {}", e),
    }

    Ok(toc)
}

/// Decode a TOC item answer: `[cmd, id u16, type, group\0name\0]`
fn decode_item<T>(data: &[u8]) -> Result<(u16, String, T)>
where
    T: TryFrom<u8, Error = Error>,
{
    if data.len() < 4 {
        return Err(Error::ProtocolError(format!(
            "TOC item answer too short: {} bytes",
            data.len()
        )));
    }

    let id = u16::from_le_bytes([data[1], data[2]]);
    let item = T::try_from(data[3])?;

    let mut strings = data[4..].split(|b| *b == 0);
    let (group, name) = match (strings.next(), strings.next()) {
        (Some(group), Some(name)) if !group.is_empty() && !name.is_empty() => (group, name),
        _ => {
            return Err(Error::ProtocolError(format!(
                "Malformed TOC item {}",
                id
            )))
        }
    };

    Ok((
        id,
        format!(
            "{}.{}",
            String::from_utf8_lossy(group),
            String::from_utf8_lossy(name)
        ),
        item,
    ))
}
