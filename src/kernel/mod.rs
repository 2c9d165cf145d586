//! Kernel: durable state for funcbox.
//!
//! Two pieces of state survive a restart:
//! - Registry mutations (uploads, activations, deletes)
//! - The execution ledger
//!
//! One WAL, written before anything becomes visible. Without a data
//! directory the kernel runs purely in memory and the WAL is skipped.

pub mod error;
pub mod ledger;
pub mod wal;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::LedgerConfig;
use crate::registry::types::FunctionVersion;
use error::{KernelError, KernelResult};
use ledger::{ExecutionRecord, Ledger};
use wal::{EntryType, Wal, WalEntry};

/// A registry mutation recovered from the WAL, handed to the registry to
/// rebuild its map.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Uploaded(FunctionVersion),
    Activated(Activation),
    Deleted(Deletion),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    pub name: String,
    pub incarnation: u64,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deletion {
    pub name: String,
    pub incarnation: u64,
}

fn entry<T: Serialize>(entry_type: EntryType, payload: &T) -> KernelResult<WalEntry> {
    Ok(WalEntry::new(entry_type, serde_json::to_vec(payload)?))
}

/// The kernel: the WAL plus the ledger, with atomic cross-store operations.
pub struct Kernel {
    wal: Option<Mutex<Wal>>,
    ledger: Ledger,
    recovered: Mutex<Vec<RegistryEvent>>,
    data_dir: Option<PathBuf>,
}

impl Kernel {
    /// Open or create the kernel at the given data directory.
    /// Replays the WAL: ledger entries are applied here, registry entries
    /// are kept for [`Kernel::take_recovered`].
    pub fn open(data_dir: &Path, config: LedgerConfig) -> KernelResult<Self> {
        std::fs::create_dir_all(data_dir)?;

        let wal = Wal::open(&data_dir.join("funcbox.wal"))?;
        let ledger = Ledger::new(config);
        let mut recovered = Vec::new();

        let entries = wal.replay()?;
        let total = entries.len();
        for entry in &entries {
            if let Err(e) = apply_wal_entry(entry, &ledger, &mut recovered) {
                warn!("skipping undecodable {:?} WAL entry: {e}", entry.entry_type);
            }
        }
        info!(
            path = %wal.path().display(),
            entries = total,
            "kernel recovered"
        );

        Ok(Self {
            wal: Some(Mutex::new(wal)),
            ledger,
            recovered: Mutex::new(recovered),
            data_dir: Some(data_dir.to_path_buf()),
        })
    }

    /// A kernel with no durable storage.
    pub fn in_memory(config: LedgerConfig) -> Self {
        Self {
            wal: None,
            ledger: Ledger::new(config),
            recovered: Mutex::new(Vec::new()),
            data_dir: None,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    /// Registry mutations recovered at open. Returns them once.
    pub fn take_recovered(&self) -> Vec<RegistryEvent> {
        std::mem::take(&mut *lock(&self.recovered))
    }

    fn append(&self, entry: &WalEntry) -> KernelResult<()> {
        match &self.wal {
            Some(wal) => lock(wal).append(entry),
            None => Ok(()),
        }
    }

    fn append_batch(&self, entries: &[WalEntry]) -> KernelResult<()> {
        match &self.wal {
            Some(wal) => lock(wal).append_batch(entries),
            None => Ok(()),
        }
    }

    /// Persist a new function version. The caller publishes it afterwards.
    pub fn log_upload(&self, version: &FunctionVersion) -> KernelResult<()> {
        self.append(&entry(EntryType::FunctionUploaded, version)?)
    }

    /// Persist a change of active version.
    pub fn log_activate(&self, activation: &Activation) -> KernelResult<()> {
        self.append(&entry(EntryType::FunctionActivated, activation)?)
    }

    /// Atomic delete: registry record removed + ledger purged.
    pub fn delete_function(&self, deletion: &Deletion) -> KernelResult<()> {
        let batch = vec![
            entry(EntryType::FunctionDeleted, deletion)?,
            entry(EntryType::LedgerPurged, deletion)?,
        ];
        // WAL first, then apply to state
        self.append_batch(&batch)?;
        self.ledger.purge(&deletion.name, deletion.incarnation);
        Ok(())
    }

    /// Append an execution record. Storage trouble is logged, never
    /// returned: the caller's result does not depend on the ledger.
    pub fn record(&self, record: ExecutionRecord) {
        if !self.ledger.accepts(&record) {
            return;
        }
        let logged = entry(EntryType::ExecutionRecorded, &record).and_then(|e| self.append(&e));
        if let Err(e) = logged {
            warn!(name = %record.name, id = %record.id, "execution record not persisted: {e}");
        }
        self.ledger.insert(record);
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Data directory path, if durable.
    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }
}

/// Apply one replayed entry.
fn apply_wal_entry(
    entry: &WalEntry,
    ledger: &Ledger,
    recovered: &mut Vec<RegistryEvent>,
) -> KernelResult<()> {
    let payload = &entry.payload;
    match entry.entry_type {
        EntryType::FunctionUploaded => {
            recovered.push(RegistryEvent::Uploaded(serde_json::from_slice(payload)?));
        }
        EntryType::FunctionActivated => {
            recovered.push(RegistryEvent::Activated(serde_json::from_slice(payload)?));
        }
        EntryType::FunctionDeleted => {
            recovered.push(RegistryEvent::Deleted(serde_json::from_slice(payload)?));
        }
        EntryType::ExecutionRecorded => {
            let record: ExecutionRecord = serde_json::from_slice(payload)?;
            ledger.insert(record);
        }
        EntryType::LedgerPurged => {
            let deletion: Deletion = serde_json::from_slice(payload)?;
            ledger.purge(&deletion.name, deletion.incarnation);
        }
        EntryType::AtomicBatch => {
            return Err(KernelError::InvalidData("nested batch".into()));
        }
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ledger::RecordOutcome;
    use crate::registry::types::ParameterSchema;
    use chrono::Utc;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn version(name: &str, incarnation: u64, n: u32) -> FunctionVersion {
        FunctionVersion {
            name: name.into(),
            version: n,
            source: "def process(p):\n    return 1\n".into(),
            description: String::new(),
            parameters: ParameterSchema::new(),
            created_at: Utc::now(),
            incarnation,
            program: None,
        }
    }

    fn record(name: &str, incarnation: u64) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            id: Uuid::new_v4(),
            name: name.into(),
            version: 1,
            incarnation,
            parameters: serde_json::json!({}),
            outcome: RecordOutcome::Success {
                value: serde_json::json!(1),
            },
            duration_ms: 0,
            peak_memory: 0,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn kernel_opens_and_creates_dirs() {
        let dir = TempDir::new().unwrap();
        let kernel = Kernel::open(&dir.path().join("data"), LedgerConfig::default()).unwrap();
        assert!(kernel.is_durable());
        assert!(dir.path().join("data/funcbox.wal").exists());
    }

    #[test]
    fn kernel_crash_recovery() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");

        {
            let kernel = Kernel::open(&data_dir, LedgerConfig::default()).unwrap();
            kernel.log_upload(&version("sq", 1, 1)).unwrap();
            kernel.log_upload(&version("sq", 1, 2)).unwrap();
            kernel
                .log_activate(&Activation {
                    name: "sq".into(),
                    incarnation: 1,
                    version: 1,
                })
                .unwrap();
            kernel.record(record("sq", 1));
            kernel.record(record("sq", 1));
        }

        let kernel = Kernel::open(&data_dir, LedgerConfig::default()).unwrap();
        let events = kernel.take_recovered();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], RegistryEvent::Uploaded(v) if v.version == 2));
        assert!(matches!(&events[2], RegistryEvent::Activated(a) if a.version == 1));
        assert_eq!(kernel.ledger().count("sq"), 2);
        assert!(kernel.take_recovered().is_empty());
    }

    #[test]
    fn delete_cascade_survives_restart() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        let deletion = Deletion {
            name: "sq".into(),
            incarnation: 1,
        };

        {
            let kernel = Kernel::open(&data_dir, LedgerConfig::default()).unwrap();
            kernel.log_upload(&version("sq", 1, 1)).unwrap();
            kernel.record(record("sq", 1));
            kernel.delete_function(&deletion).unwrap();
            assert_eq!(kernel.ledger().count("sq"), 0);
            // late completion from the deleted incarnation
            kernel.record(record("sq", 1));
            assert_eq!(kernel.ledger().count("sq"), 0);
        }

        let kernel = Kernel::open(&data_dir, LedgerConfig::default()).unwrap();
        assert_eq!(kernel.ledger().count("sq"), 0);
        let events = kernel.take_recovered();
        assert!(matches!(events.last(), Some(RegistryEvent::Deleted(d)) if *d == deletion));
    }

    #[test]
    fn in_memory_kernel_keeps_ledger() {
        let kernel = Kernel::in_memory(LedgerConfig::default());
        assert!(!kernel.is_durable());
        kernel.record(record("sq", 1));
        assert_eq!(kernel.ledger().count("sq"), 1);
        assert!(kernel.data_dir().is_none());
    }
}
