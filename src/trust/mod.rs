//! Trust store: the peers we are willing to talk to.
//!
//! Entries are keyed by fingerprint and stored as TOML:
//!
//! ```toml
//! [hosts.3f2a...]
//! endpoint = "abcdef.onion:34567"
//! display_name = "alice"
//! ```
//!
//! The store is shared behind an `Arc` by every connection attempt. Reads take
//! the read lock; each mutation takes the write lock, persists the new map
//! atomically and only then makes it visible.

mod migrate;

pub use migrate::{marker_path, MigrationOutcome, MIGRATED_SUFFIX};

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::crypto::Fingerprint;

/// Errors returned by trust store operations. None of them leave side effects.
#[derive(Error, Debug)]
pub enum TrustStoreError {
    #[error("Fingerprint already trusted: {0}")]
    DuplicateFingerprint(Fingerprint),

    #[error("Unknown fingerprint: {0}")]
    UnknownFingerprint(Fingerprint),

    #[error("No trusted host at endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("Invalid endpoint '{0}': expected host:port or name.onion[:port]")]
    InvalidEndpoint(String),

    #[error("Config directory not found. Unable to determine home directory.")]
    NoConfigDir,

    #[error("Trust store lock poisoned")]
    Poisoned,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("Legacy trust store parse error: {0}")]
    LegacyParseError(#[from] serde_json::Error),
}

/// A trusted peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustEntry {
    pub fingerprint: Fingerprint,
    pub endpoint: String,
    pub display_name: Option<String>,
}

impl TrustEntry {
    /// Display name, or the first 8 hex characters of the fingerprint.
    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => self.fingerprint.short(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct HostRecord {
    endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
}

/// On-disk layout.
#[derive(Serialize, Deserialize, Debug, Default)]
struct TrustFile {
    #[serde(default)]
    hosts: BTreeMap<String, HostRecord>,
}

type EntryMap = BTreeMap<Fingerprint, TrustEntry>;

/// Fingerprint-keyed store of trusted peers.
#[derive(Debug)]
pub struct TrustStore {
    path: Option<PathBuf>,
    entries: RwLock<EntryMap>,
}

impl TrustStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TrustStoreError> {
        let path = path.into();
        let entries = read_store_file(&path)?;
        debug!(path = %path.display(), hosts = entries.len(), "trust store opened");
        Ok(Self {
            path: Some(path),
            entries: RwLock::new(entries),
        })
    }

    /// Open the store at the default location.
    pub fn open_default() -> Result<Self, TrustStoreError> {
        let path = crate::chat::config::trust_store_path().ok_or(TrustStoreError::NoConfigDir)?;
        Self::open(path)
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<TrustEntry> {
        self.read().ok()?.get(fingerprint).cloned()
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.lookup(fingerprint).is_some()
    }

    /// All entries, ordered by label.
    pub fn list(&self) -> Vec<TrustEntry> {
        let mut entries: Vec<TrustEntry> = match self.read() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        entries.sort_by_key(|e| (e.label().to_lowercase(), e.fingerprint));
        entries
    }

    pub fn len(&self) -> usize {
        self.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Case-insensitive lookup by display name.
    pub fn find_by_name(&self, name: &str) -> Option<TrustEntry> {
        self.read()
            .ok()?
            .values()
            .find(|e| {
                e.display_name
                    .as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(name.trim()))
            })
            .cloned()
    }

    pub fn find_by_endpoint(&self, endpoint: &str) -> Option<TrustEntry> {
        self.read()
            .ok()?
            .values()
            .find(|e| e.endpoint.eq_ignore_ascii_case(endpoint.trim()))
            .cloned()
    }

    /// Label for a peer: its display name, else the short fingerprint.
    pub fn peer_label(&self, fingerprint: &Fingerprint) -> String {
        self.lookup(fingerprint)
            .map(|e| e.label())
            .unwrap_or_else(|| fingerprint.short())
    }

    /// Trust a new peer.
    pub fn add(
        &self,
        fingerprint: Fingerprint,
        endpoint: &str,
        display_name: Option<&str>,
    ) -> Result<TrustEntry, TrustStoreError> {
        let endpoint = validate_endpoint(endpoint)?;
        let entry = TrustEntry {
            fingerprint,
            endpoint,
            display_name: normalize_name(display_name),
        };

        let mut entries = self.write()?;
        if entries.contains_key(&fingerprint) {
            return Err(TrustStoreError::DuplicateFingerprint(fingerprint));
        }
        let mut next = entries.clone();
        next.insert(fingerprint, entry.clone());
        self.commit(&mut entries, next)?;

        info!(fingerprint = %fingerprint.short(), endpoint = %entry.endpoint, "trusted host added");
        Ok(entry)
    }

    /// Like [`add`](Self::add) but parses the fingerprint string.
    pub fn add_host(&self, endpoint: &str, fingerprint: &str) -> Result<TrustEntry, TrustStoreError> {
        self.add(parse_fingerprint(fingerprint)?, endpoint, None)
    }

    /// Stop trusting a peer.
    pub fn remove(&self, fingerprint: &Fingerprint) -> Result<TrustEntry, TrustStoreError> {
        let mut entries = self.write()?;
        let mut next = entries.clone();
        let removed = next
            .remove(fingerprint)
            .ok_or(TrustStoreError::UnknownFingerprint(*fingerprint))?;
        self.commit(&mut entries, next)?;

        info!(fingerprint = %fingerprint.short(), "trusted host removed");
        Ok(removed)
    }

    /// Remove the entry whose endpoint matches.
    pub fn remove_by_endpoint(&self, endpoint: &str) -> Result<TrustEntry, TrustStoreError> {
        let fingerprint = self
            .find_by_endpoint(endpoint)
            .map(|e| e.fingerprint)
            .ok_or_else(|| TrustStoreError::UnknownEndpoint(endpoint.to_string()))?;
        self.remove(&fingerprint)
    }

    /// Set or replace a peer's display name.
    pub fn rename(&self, fingerprint: &Fingerprint, name: &str) -> Result<(), TrustStoreError> {
        let mut entries = self.write()?;
        let mut next = entries.clone();
        let entry = next
            .get_mut(fingerprint)
            .ok_or(TrustStoreError::UnknownFingerprint(*fingerprint))?;
        entry.display_name = normalize_name(Some(name));
        self.commit(&mut entries, next)?;

        info!(fingerprint = %fingerprint.short(), "trusted host renamed");
        Ok(())
    }

    /// Insert entries that are not present yet. Existing entries win.
    ///
    /// Returns `(imported, skipped)`.
    pub(crate) fn merge_missing(
        &self,
        incoming: Vec<TrustEntry>,
    ) -> Result<(usize, usize), TrustStoreError> {
        let mut entries = self.write()?;
        let mut next = entries.clone();
        let mut imported = 0;
        let mut skipped = 0;
        for entry in incoming {
            if next.contains_key(&entry.fingerprint) {
                skipped += 1;
            } else {
                next.insert(entry.fingerprint, entry);
                imported += 1;
            }
        }
        if imported > 0 {
            self.commit(&mut entries, next)?;
        }
        Ok((imported, skipped))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, EntryMap>, TrustStoreError> {
        self.entries.read().map_err(|_| TrustStoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, EntryMap>, TrustStoreError> {
        self.entries.write().map_err(|_| TrustStoreError::Poisoned)
    }

    /// Persist `next`, then publish it. On error the visible map is unchanged.
    fn commit(&self, current: &mut EntryMap, next: EntryMap) -> Result<(), TrustStoreError> {
        if let Some(path) = &self.path {
            write_store_file(path, &next)?;
        }
        *current = next;
        Ok(())
    }
}

/// Parse a user-supplied fingerprint.
pub fn parse_fingerprint(input: &str) -> Result<Fingerprint, TrustStoreError> {
    input
        .parse()
        .map_err(|_| TrustStoreError::InvalidFingerprint(input.trim().to_string()))
}

/// Check an endpoint and return its normalized form.
///
/// Accepts `name.onion`, `name.onion:port`, or `host:port` with a port in
/// 1..=65535.
pub fn validate_endpoint(endpoint: &str) -> Result<String, TrustStoreError> {
    let endpoint = endpoint.trim();
    let invalid = || TrustStoreError::InvalidEndpoint(endpoint.to_string());

    if endpoint.is_empty() || endpoint.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let lowered = endpoint.to_ascii_lowercase();
    if lowered.ends_with(".onion") {
        return if lowered.len() > ".onion".len() {
            Ok(lowered)
        } else {
            Err(invalid())
        };
    }

    let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
    let host_is_valid = !host.is_empty()
        && ((host.starts_with('[') && host.ends_with(']')) || !host.contains(':'));
    let port_is_valid = port.parse::<u16>().map(|p| p != 0).unwrap_or(false);
    if !host_is_valid || !port_is_valid {
        return Err(invalid());
    }

    if host.to_ascii_lowercase().ends_with(".onion") {
        Ok(lowered)
    } else {
        Ok(endpoint.to_string())
    }
}

fn normalize_name(name: Option<&str>) -> Option<String> {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

fn read_store_file(path: &Path) -> Result<EntryMap, TrustStoreError> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let content = fs::read_to_string(path)?;
    let file: TrustFile = toml::from_str(&content)?;

    let mut entries = BTreeMap::new();
    for (key, record) in file.hosts {
        let fingerprint = parse_fingerprint(&key)?;
        entries.insert(
            fingerprint,
            TrustEntry {
                fingerprint,
                endpoint: record.endpoint,
                display_name: record.display_name,
            },
        );
    }
    Ok(entries)
}

/// Write via a temp file and rename so readers never see a torn file.
fn write_store_file(path: &Path, entries: &EntryMap) -> Result<(), TrustStoreError> {
    let file = TrustFile {
        hosts: entries
            .values()
            .map(|e| {
                (
                    e.fingerprint.to_hex(),
                    HostRecord {
                        endpoint: e.endpoint.clone(),
                        display_name: e.display_name.clone(),
                    },
                )
            })
            .collect(),
    };
    let content = toml::to_string_pretty(&file)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut tmp = options.open(&tmp_path)?;
    tmp.write_all(content.as_bytes())?;
    tmp.sync_all()?;
    drop(tmp);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use tempfile::tempdir;

    fn fingerprint() -> Fingerprint {
        Identity::generate().fingerprint()
    }

    #[test]
    fn test_add_and_lookup() {
        let store = TrustStore::in_memory();
        let fp = fingerprint();

        store.add(fp, "127.0.0.1:34567", Some("alice")).unwrap();

        let entry = store.lookup(&fp).unwrap();
        assert_eq!(entry.endpoint, "127.0.0.1:34567");
        assert_eq!(entry.label(), "alice");
        assert!(store.contains(&fp));
    }

    #[test]
    fn test_duplicate_fingerprint_rejected() {
        let store = TrustStore::in_memory();
        let fp = fingerprint();
        store.add(fp, "10.0.0.1:34567", None).unwrap();

        let result = store.add(fp, "10.0.0.2:34567", Some("other"));
        assert!(matches!(result, Err(TrustStoreError::DuplicateFingerprint(f)) if f == fp));
        assert_eq!(store.lookup(&fp).unwrap().endpoint, "10.0.0.1:34567");
    }

    #[test]
    fn test_rename_unknown_fingerprint() {
        let store = TrustStore::in_memory();
        let result = store.rename(&fingerprint(), "bob");
        assert!(matches!(result, Err(TrustStoreError::UnknownFingerprint(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove() {
        let store = TrustStore::in_memory();
        let fp = fingerprint();
        store.add(fp, "host.example:4000", None).unwrap();

        let removed = store.remove(&fp).unwrap();
        assert_eq!(removed.fingerprint, fp);
        assert!(store.lookup(&fp).is_none());
        assert!(matches!(
            store.remove(&fp),
            Err(TrustStoreError::UnknownFingerprint(_))
        ));
    }

    #[test]
    fn test_remove_by_endpoint() {
        let store = TrustStore::in_memory();
        let fp = fingerprint();
        store
            .add(fp, "abcdefghijklmnop.onion", Some("carol"))
            .unwrap();

        assert!(matches!(
            store.remove_by_endpoint("nowhere.onion"),
            Err(TrustStoreError::UnknownEndpoint(_))
        ));
        let removed = store.remove_by_endpoint("ABCDEFGHIJKLMNOP.onion").unwrap();
        assert_eq!(removed.fingerprint, fp);
    }

    #[test]
    fn test_label_falls_back_to_short_fingerprint() {
        let store = TrustStore::in_memory();
        let fp = fingerprint();
        store.add(fp, "127.0.0.1:1", None).unwrap();

        assert_eq!(store.peer_label(&fp), fp.to_hex()[..8]);
        store.rename(&fp, "dave").unwrap();
        assert_eq!(store.peer_label(&fp), "dave");
        assert_eq!(store.find_by_name("DAVE").unwrap().fingerprint, fp);
    }

    #[test]
    fn test_add_host_validates_input() {
        let store = TrustStore::in_memory();
        assert!(matches!(
            store.add_host("127.0.0.1:34567", "not-hex"),
            Err(TrustStoreError::InvalidFingerprint(_))
        ));
        assert!(matches!(
            store.add_host("127.0.0.1", &fingerprint().to_hex()),
            Err(TrustStoreError::InvalidEndpoint(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint("127.0.0.1:34567").is_ok());
        assert!(validate_endpoint("example.org:1").is_ok());
        assert!(validate_endpoint("[::1]:8080").is_ok());
        assert!(validate_endpoint("abc.onion").is_ok());
        assert_eq!(validate_endpoint("ABC.onion:80").unwrap(), "abc.onion:80");

        assert!(validate_endpoint("").is_err());
        assert!(validate_endpoint(".onion").is_err());
        assert!(validate_endpoint("127.0.0.1").is_err());
        assert!(validate_endpoint("127.0.0.1:0").is_err());
        assert!(validate_endpoint("127.0.0.1:65536").is_err());
        assert!(validate_endpoint("::1:80").is_err());
        assert!(validate_endpoint("abc.onion:99999").is_err());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts.toml");
        let fp = fingerprint();

        {
            let store = TrustStore::open(&path).unwrap();
            store.add(fp, "192.168.1.5:34567", Some("erin")).unwrap();
        }

        let reopened = TrustStore::open(&path).unwrap();
        let entry = reopened.lookup(&fp).unwrap();
        assert_eq!(entry.display_name.as_deref(), Some("erin"));

        reopened.rename(&fp, "erin2").unwrap();
        let again = TrustStore::open(&path).unwrap();
        assert_eq!(again.peer_label(&fp), "erin2");

        again.remove(&fp).unwrap();
        assert!(TrustStore::open(&path).unwrap().is_empty());
    }

    #[test]
    fn test_file_format_is_keyed_by_fingerprint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts.toml");
        let fp = fingerprint();

        TrustStore::open(&path)
            .unwrap()
            .add(fp, "127.0.0.1:34567", Some("frank"))
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains(&format!("[hosts.{}]", fp.to_hex())));
        assert!(content.contains("endpoint = \"127.0.0.1:34567\""));
        assert!(content.contains("display_name = \"frank\""));
    }

    #[test]
    fn test_list_sorted_by_label() {
        let store = TrustStore::in_memory();
        store.add(fingerprint(), "h1:1", Some("zed")).unwrap();
        store.add(fingerprint(), "h2:1", Some("amy")).unwrap();

        let labels: Vec<String> = store.list().iter().map(TrustEntry::label).collect();
        assert_eq!(labels, vec!["amy", "zed"]);
    }
}
