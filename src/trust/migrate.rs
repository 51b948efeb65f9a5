//! One-time import of the legacy JSON trust store.
//!
//! Older releases kept trusted hosts as
//! `{"hosts": {endpoint: fingerprint}, "nicknames": {fingerprint: name}}`.
//! Migration merges those entries into the TOML store without overwriting
//! anything already there, then renames the legacy file to
//! `<legacy>.migrated`. Running it again finds no legacy file and does nothing.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use super::{parse_fingerprint, validate_endpoint, TrustEntry, TrustStore, TrustStoreError};

/// Suffix appended to the legacy file once it has been imported.
pub const MIGRATED_SUFFIX: &str = "migrated";

#[derive(Deserialize, Debug, Default)]
struct LegacyTrustFile {
    #[serde(default)]
    hosts: BTreeMap<String, String>,
    #[serde(default)]
    nicknames: BTreeMap<String, String>,
}

/// What a call to [`TrustStore::migrate`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// No legacy file and no marker.
    NothingToMigrate,
    /// The marker exists; a previous run already imported the file.
    AlreadyMigrated,
    Migrated {
        imported: usize,
        /// Entries already present in the current store, or unparseable.
        skipped: usize,
    },
}

impl TrustStore {
    /// Import the legacy store at `old_path` into the TOML store at `new_path`.
    ///
    /// Safe to call on every start-up.
    pub fn migrate(old_path: &Path, new_path: &Path) -> Result<MigrationOutcome, TrustStoreError> {
        let marker = marker_path(old_path);

        if !old_path.exists() {
            return Ok(if marker.exists() {
                MigrationOutcome::AlreadyMigrated
            } else {
                MigrationOutcome::NothingToMigrate
            });
        }

        let content = fs::read_to_string(old_path)?;
        let legacy: LegacyTrustFile = serde_json::from_str(&content)?;
        let (entries, invalid) = legacy_entries(legacy);

        let store = TrustStore::open(new_path)?;
        let (imported, existing) = store.merge_missing(entries)?;

        fs::rename(old_path, &marker)?;

        let skipped = existing + invalid;
        info!(
            from = %old_path.display(),
            to = %new_path.display(),
            imported,
            skipped,
            "legacy trust store migrated"
        );
        Ok(MigrationOutcome::Migrated { imported, skipped })
    }
}

/// `<old_path>.migrated`
pub fn marker_path(old_path: &Path) -> PathBuf {
    let mut name = old_path.as_os_str().to_os_string();
    name.push(".");
    name.push(MIGRATED_SUFFIX);
    PathBuf::from(name)
}

/// Convert legacy records, returning the valid entries and the count of
/// rejected ones. When several endpoints name one fingerprint the first
/// endpoint in sorted order wins.
fn legacy_entries(legacy: LegacyTrustFile) -> (Vec<TrustEntry>, usize) {
    let nicknames: BTreeMap<String, String> = legacy
        .nicknames
        .into_iter()
        .map(|(fp, name)| (fp.trim().to_ascii_lowercase(), name))
        .collect();

    let mut entries: BTreeMap<_, TrustEntry> = BTreeMap::new();
    let mut invalid = 0;

    for (endpoint, fingerprint) in legacy.hosts {
        let parsed = parse_fingerprint(&fingerprint)
            .and_then(|fp| validate_endpoint(&endpoint).map(|ep| (fp, ep)));
        let (fingerprint, endpoint) = match parsed {
            Ok(pair) => pair,
            Err(e) => {
                warn!(%endpoint, error = %e, "skipping invalid legacy trust entry");
                invalid += 1;
                continue;
            }
        };

        if entries.contains_key(&fingerprint) {
            invalid += 1;
            continue;
        }

        let display_name = nicknames
            .get(&fingerprint.to_hex())
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        entries.insert(
            fingerprint,
            TrustEntry {
                fingerprint,
                endpoint,
                display_name,
            },
        );
    }

    (entries.into_values().collect(), invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Fingerprint, Identity};
    use tempfile::tempdir;

    fn fp() -> Fingerprint {
        Identity::generate().fingerprint()
    }

    fn write_legacy(path: &Path, hosts: &[(&str, Fingerprint)], nicknames: &[(Fingerprint, &str)]) {
        let hosts: BTreeMap<String, String> = hosts
            .iter()
            .map(|(ep, fp)| (ep.to_string(), fp.to_hex()))
            .collect();
        let nicknames: BTreeMap<String, String> = nicknames
            .iter()
            .map(|(fp, n)| (fp.to_hex(), n.to_string()))
            .collect();
        let json = serde_json::json!({ "hosts": hosts, "nicknames": nicknames });
        fs::write(path, serde_json::to_string_pretty(&json).unwrap()).unwrap();
    }

    #[test]
    fn test_nothing_to_migrate() {
        let dir = tempdir().unwrap();
        let outcome = TrustStore::migrate(
            &dir.path().join("known_hosts.json"),
            &dir.path().join("known_hosts.toml"),
        )
        .unwrap();
        assert_eq!(outcome, MigrationOutcome::NothingToMigrate);
        assert!(!dir.path().join("known_hosts.toml").exists());
    }

    #[test]
    fn test_migration_preserves_nicknames_and_leaves_marker() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("known_hosts.json");
        let new = dir.path().join("known_hosts.toml");
        let (a, b) = (fp(), fp());
        write_legacy(
            &old,
            &[("aaaa.onion:34567", a), ("10.0.0.2:34567", b)],
            &[(a, "alice")],
        );

        let outcome = TrustStore::migrate(&old, &new).unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                imported: 2,
                skipped: 0
            }
        );
        assert!(!old.exists());
        assert!(marker_path(&old).exists());

        let store = TrustStore::open(&new).unwrap();
        assert_eq!(store.lookup(&a).unwrap().display_name.as_deref(), Some("alice"));
        assert_eq!(store.lookup(&b).unwrap().endpoint, "10.0.0.2:34567");
        assert_eq!(store.lookup(&b).unwrap().display_name, None);
    }

    #[test]
    fn test_migration_does_not_overwrite_existing_entries() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("known_hosts.json");
        let new = dir.path().join("known_hosts.toml");
        let a = fp();

        TrustStore::open(&new)
            .unwrap()
            .add(a, "192.168.0.9:34567", Some("newer"))
            .unwrap();
        write_legacy(&old, &[("10.0.0.1:34567", a)], &[(a, "older")]);

        let outcome = TrustStore::migrate(&old, &new).unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                imported: 0,
                skipped: 1
            }
        );

        let entry = TrustStore::open(&new).unwrap().lookup(&a).unwrap();
        assert_eq!(entry.endpoint, "192.168.0.9:34567");
        assert_eq!(entry.display_name.as_deref(), Some("newer"));
    }

    #[test]
    fn test_migration_twice_equals_once() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("known_hosts.json");
        let new = dir.path().join("known_hosts.toml");
        write_legacy(&old, &[("h.example:1", fp()), ("x.onion", fp())], &[]);

        TrustStore::migrate(&old, &new).unwrap();
        let after_once = fs::read_to_string(&new).unwrap();

        let outcome = TrustStore::migrate(&old, &new).unwrap();
        assert_eq!(outcome, MigrationOutcome::AlreadyMigrated);
        assert_eq!(fs::read_to_string(&new).unwrap(), after_once);
    }

    #[test]
    fn test_invalid_legacy_entries_are_skipped() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("known_hosts.json");
        let new = dir.path().join("known_hosts.toml");
        let good = fp();
        fs::write(
            &old,
            format!(
                r#"{{"hosts": {{"1.2.3.4:34567": "{}", "5.6.7.8:34567": "zzzz", "nohost": "{}"}}}}"#,
                good.to_hex(),
                fp().to_hex()
            ),
        )
        .unwrap();

        let outcome = TrustStore::migrate(&old, &new).unwrap();
        assert_eq!(
            outcome,
            MigrationOutcome::Migrated {
                imported: 1,
                skipped: 2
            }
        );
        assert!(TrustStore::open(&new).unwrap().contains(&good));
    }

    #[test]
    fn test_corrupt_legacy_file_is_left_in_place() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("known_hosts.json");
        fs::write(&old, "{ not json").unwrap();

        let result = TrustStore::migrate(&old, &dir.path().join("known_hosts.toml"));
        assert!(matches!(result, Err(TrustStoreError::LegacyParseError(_))));
        assert!(old.exists());
    }
}
