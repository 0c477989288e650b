//! Name-service registry.
//!
//! Entries map names to proxy/host/link endpoints: each carries an id, a
//! type bitmask, the endpoint's 128-bit address, and optionally the
//! connection string a transport needs to reach it. The registry persists
//! as a JSON file and rewrites it on every mutation.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::err::{Error, Result};
use crate::io::cs::ConnectionString;
use crate::io::reference::Reference;

/// Entry type bits.
pub mod entry_type {
    pub const HUB: u32 = 0x1;
    pub const HOST: u32 = 0x2;
    pub const PROXY: u32 = 0x4;
    pub const LINK: u32 = 0x8;
    pub const STARTUP: u32 = 0x10;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NsEntry {
    pub id: String,
    pub name: String,
    pub entry_type: u32,
    #[serde(default)]
    pub index: u32,
    /// Entry record version, bumped by whoever mutates the registry.
    #[serde(default)]
    pub version: u32,
    pub addr: Reference,
    #[serde(default)]
    pub cs: Option<String>,
}

impl NsEntry {
    /// Proxy entry reachable through `cs`, addressed by a fresh reference.
    pub fn new_proxy(name: &str, cs: &ConnectionString) -> NsEntry {
        NsEntry {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_owned(),
            entry_type: entry_type::PROXY,
            index: 0,
            version: 0,
            addr: Reference::random(),
            cs: Some(cs.to_string()),
        }
    }

    /// Link entry for a stream endpoint, as minted by open requests.
    pub fn new_link(stream_id: Reference, cs: &ConnectionString) -> NsEntry {
        NsEntry {
            id: uuid::Uuid::new_v4().to_string(),
            name: stream_id.to_string(),
            entry_type: entry_type::LINK,
            index: 0,
            version: 0,
            addr: stream_id,
            cs: Some(cs.to_string()),
        }
    }

    /// The endpoint's 128-bit address.
    pub fn addr(&self) -> Reference {
        self.addr
    }

    /// Parsed connection string, if the entry carries one.
    pub fn cs(&self) -> Result<ConnectionString> {
        self.cs.as_deref().ok_or(Error::NotFound)?.parse()
    }
}

/// JSON-file-backed entry store.
pub struct NsRegistry {
    path: Option<PathBuf>,
    entries: Mutex<Vec<NsEntry>>,
}

impl NsRegistry {
    /// In-memory registry with no backing file.
    pub fn new() -> NsRegistry {
        NsRegistry {
            path: None,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Load from `path`; a missing file is an empty registry.
    pub fn open(path: &Path) -> Result<NsRegistry> {
        let entries = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                warn!(path = %path.display(), err = %e, "bad registry file");
                Error::InvalidFormat
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(_) => return Err(Error::DiskIo),
        };
        debug!(path = %path.display(), "registry loaded");
        Ok(NsRegistry {
            path: Some(path.to_owned()),
            entries: Mutex::new(entries),
        })
    }

    fn persist(&self, entries: &[NsEntry]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(entries).map_err(|_| Error::Fault)?;
        std::fs::write(path, text).map_err(|_| Error::DiskIo)
    }

    pub fn add(&self, entry: NsEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.id == entry.id) {
            return Err(Error::AlreadyExists);
        }
        entries.push(entry);
        self.persist(&entries)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Err(Error::NotFound);
        }
        self.persist(&entries)
    }

    pub fn by_name(&self, name: &str) -> Option<NsEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.name == name)
            .cloned()
    }

    pub fn by_addr(&self, addr: &Reference) -> Option<NsEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.addr == *addr)
            .cloned()
    }

    pub fn by_type(&self, mask: u32) -> Vec<NsEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.entry_type & mask != 0)
            .cloned()
            .collect()
    }
}

impl Default for NsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
