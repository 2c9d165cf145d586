//! Function registry: versioned, name-indexed store of validated functions.
//!
//! The global map only hands out slots. Each slot serializes its own
//! mutations behind an async gate and publishes immutable
//! [`FunctionRecord`] snapshots, so readers never wait on a writer that is
//! validating or persisting.

pub mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::kernel::error::KernelError;
use crate::kernel::{Activation, Deletion, Kernel, RegistryEvent};
use crate::lang::Program;
use crate::policy::{Validator, Verdict, Violation};
use types::{FunctionRecord, FunctionSummary, FunctionVersion, ParameterSchema, VersionSummary};

/// Longest accepted function name.
pub const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("source rejected with {} violation(s)", .0.len())]
    ValidationFailed(Vec<Violation>),

    #[error("invalid function name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("function '{0}' not found")]
    NotFound(String),

    #[error("function '{name}' has no version {version}")]
    VersionNotFound { name: String, version: u32 },

    #[error("storage failure: {0}")]
    Storage(#[from] KernelError),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            RegistryError::InvalidName { .. } => ErrorKind::InvalidName,
            RegistryError::NotFound(_) | RegistryError::VersionNotFound { .. } => {
                ErrorKind::NotFound
            }
            RegistryError::Storage(_) => ErrorKind::StorageError,
        }
    }
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Check a function name: 1 to 128 characters of `[A-Za-z0-9_.-]`.
pub fn check_name(name: &str) -> RegistryResult<()> {
    let invalid = |reason: String| RegistryError::InvalidName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("name is empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(invalid(format!("longer than {MAX_NAME_LEN} characters")));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(invalid(format!("character {c:?} is not allowed")));
    }
    Ok(())
}

enum SlotState {
    /// Created for an upload that has not published yet.
    Vacant,
    Live(Arc<FunctionRecord>),
    /// Deleted. A retired slot is never reused.
    Retired,
}

struct Slot {
    gate: tokio::sync::Mutex<()>,
    state: RwLock<SlotState>,
}

impl Slot {
    fn new(state: SlotState) -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            state: RwLock::new(state),
        }
    }

    fn live(&self) -> Option<Arc<FunctionRecord>> {
        match &*read(&self.state) {
            SlotState::Live(record) => Some(record.clone()),
            SlotState::Vacant | SlotState::Retired => None,
        }
    }

    fn is_retired(&self) -> bool {
        matches!(&*read(&self.state), SlotState::Retired)
    }

    fn publish(&self, state: SlotState) {
        *write(&self.state) = state;
    }
}

pub struct Registry {
    validator: Validator,
    kernel: Arc<Kernel>,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    incarnations: AtomicU64,
}

impl Registry {
    /// Build the registry from whatever the kernel recovered.
    ///
    /// Replayed sources are compiled again under the current policy. A
    /// version that no longer passes is kept in the history but cannot
    /// run.
    pub fn open(validator: Validator, kernel: Arc<Kernel>) -> Self {
        let mut records: HashMap<String, FunctionRecord> = HashMap::new();
        let mut last_incarnation = 0;

        for event in kernel.take_recovered() {
            match event {
                RegistryEvent::Uploaded(mut version) => {
                    last_incarnation = last_incarnation.max(version.incarnation);
                    version.program = compile(&validator, &version);
                    let version = Arc::new(version);
                    let next = match records.get(&version.name) {
                        Some(record) if record.incarnation == version.incarnation => {
                            if version.version != record.latest() + 1 {
                                warn!(
                                    name = %version.name,
                                    version = version.version,
                                    "skipping out-of-order version in WAL"
                                );
                                continue;
                            }
                            record.with_version(version.clone())
                        }
                        _ => FunctionRecord {
                            name: version.name.clone(),
                            incarnation: version.incarnation,
                            versions: vec![version.clone()],
                            active: version.version,
                        },
                    };
                    records.insert(version.name.clone(), next);
                }
                RegistryEvent::Activated(Activation {
                    name,
                    incarnation,
                    version,
                }) => {
                    if let Some(record) = records.get_mut(&name) {
                        if record.incarnation == incarnation && record.version(version).is_some() {
                            record.active = version;
                        }
                    }
                }
                RegistryEvent::Deleted(Deletion { name, incarnation }) => {
                    if records.get(&name).is_some_and(|r| r.incarnation == incarnation) {
                        records.remove(&name);
                    }
                }
            }
        }

        if !records.is_empty() {
            info!(functions = records.len(), "registry restored");
        }
        let slots = records
            .into_iter()
            .map(|(name, record)| (name, Arc::new(Slot::new(SlotState::Live(Arc::new(record))))))
            .collect();

        Self {
            validator,
            kernel,
            slots: RwLock::new(slots),
            incarnations: AtomicU64::new(last_incarnation + 1),
        }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    fn slot(&self, name: &str) -> Option<Arc<Slot>> {
        read(&self.slots).get(name).cloned()
    }

    fn slot_or_insert(&self, name: &str) -> Arc<Slot> {
        if let Some(slot) = self.slot(name) {
            return slot;
        }
        write(&self.slots)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Slot::new(SlotState::Vacant)))
            .clone()
    }

    /// Validate `source` and store it as the next version of `name`, which
    /// becomes active. Nothing is visible unless the WAL write succeeded.
    pub async fn upload(
        &self,
        name: &str,
        source: &str,
        description: &str,
        parameters: ParameterSchema,
    ) -> RegistryResult<Arc<FunctionVersion>> {
        check_name(name)?;
        let program = match self.validator.validate(source) {
            Verdict::Accepted(program) => Arc::new(program),
            Verdict::Rejected(violations) => {
                debug!(name, violations = violations.len(), "upload rejected");
                return Err(RegistryError::ValidationFailed(violations));
            }
        };

        loop {
            let slot = self.slot_or_insert(name);
            let _gate = slot.gate.lock().await;
            if slot.is_retired() {
                // deleted while we waited; the map already holds a fresh slot
                continue;
            }

            let current = slot.live();
            let (incarnation, number) = match &current {
                Some(record) => (record.incarnation, record.latest() + 1),
                None => (self.incarnations.fetch_add(1, Ordering::SeqCst), 1),
            };
            let version = Arc::new(FunctionVersion {
                name: name.to_string(),
                version: number,
                source: source.to_string(),
                description: description.to_string(),
                parameters,
                created_at: Utc::now(),
                incarnation,
                program: Some(program),
            });

            self.kernel.log_upload(&version)?;

            let record = match current {
                Some(record) => record.with_version(version.clone()),
                None => FunctionRecord {
                    name: name.to_string(),
                    incarnation,
                    versions: vec![version.clone()],
                    active: number,
                },
            };
            slot.publish(SlotState::Live(Arc::new(record)));
            info!(name, version = number, incarnation, "function uploaded");
            return Ok(version);
        }
    }

    /// Current snapshot of `name`.
    pub fn record(&self, name: &str) -> RegistryResult<Arc<FunctionRecord>> {
        self.slot(name)
            .and_then(|slot| slot.live())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// The requested version of `name`, or its active one.
    pub fn resolve(&self, name: &str, version: Option<u32>) -> RegistryResult<Arc<FunctionVersion>> {
        let record = self.record(name)?;
        let wanted = version.unwrap_or(record.active);
        record
            .version(wanted)
            .cloned()
            .ok_or_else(|| RegistryError::VersionNotFound {
                name: name.to_string(),
                version: wanted,
            })
    }

    /// Every live function, sorted by name.
    pub fn list(&self) -> Vec<FunctionSummary> {
        let slots: Vec<Arc<Slot>> = read(&self.slots).values().cloned().collect();
        let mut out: Vec<FunctionSummary> = slots
            .iter()
            .filter_map(|slot| slot.live())
            .map(|record| record.summary())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// All versions of `name`, oldest first.
    pub fn versions(&self, name: &str) -> RegistryResult<Vec<VersionSummary>> {
        Ok(self.record(name)?.version_summaries())
    }

    /// Make `version` the one executed when no version is given.
    pub async fn activate(&self, name: &str, version: u32) -> RegistryResult<Arc<FunctionVersion>> {
        let not_found = || RegistryError::NotFound(name.to_string());
        let slot = self.slot(name).ok_or_else(not_found)?;
        let _gate = slot.gate.lock().await;
        let record = slot.live().ok_or_else(not_found)?;
        let target = record
            .version(version)
            .cloned()
            .ok_or_else(|| RegistryError::VersionNotFound {
                name: name.to_string(),
                version,
            })?;

        if record.active != version {
            self.kernel.log_activate(&Activation {
                name: name.to_string(),
                incarnation: record.incarnation,
                version,
            })?;
            let mut next = (*record).clone();
            next.active = version;
            slot.publish(SlotState::Live(Arc::new(next)));
            info!(name, version, "active version changed");
        }
        Ok(target)
    }

    /// Remove `name` with all its versions and purge its execution history.
    pub async fn delete(&self, name: &str) -> RegistryResult<()> {
        let not_found = || RegistryError::NotFound(name.to_string());
        let slot = self.slot(name).ok_or_else(not_found)?;
        let _gate = slot.gate.lock().await;
        let record = slot.live().ok_or_else(not_found)?;

        self.kernel.delete_function(&Deletion {
            name: name.to_string(),
            incarnation: record.incarnation,
        })?;
        slot.publish(SlotState::Retired);

        let mut slots = write(&self.slots);
        if slots.get(name).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
            slots.remove(name);
        }
        info!(name, incarnation = record.incarnation, "function deleted");
        Ok(())
    }
}

fn compile(validator: &Validator, version: &FunctionVersion) -> Option<Arc<Program>> {
    match validator.validate(&version.source) {
        Verdict::Accepted(program) => Some(Arc::new(program)),
        Verdict::Rejected(violations) => {
            warn!(
                name = %version.name,
                version = version.version,
                violations = violations.len(),
                "stored version no longer passes policy; it will not run"
            );
            None
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LedgerConfig, PolicyConfig};
    use tempfile::TempDir;

    const SQUARE: &str = "def process(params):\n    return params['n'] ** 2\n";
    const CUBE: &str = "def process(params):\n    return params['n'] ** 3\n";

    fn registry() -> Registry {
        Registry::open(
            Validator::default(),
            Arc::new(Kernel::in_memory(LedgerConfig::default())),
        )
    }

    #[test]
    fn names_are_checked() {
        assert!(check_name("square_v2.final-1").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("has space").is_err());
        assert!(check_name("../etc").is_err());
        assert!(check_name(&"a".repeat(MAX_NAME_LEN)).is_ok());
        assert!(check_name(&"a".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn versions_are_contiguous_and_latest_is_active() {
        let registry = registry();
        let v1 = registry.upload("sq", SQUARE, "square", ParameterSchema::new()).await.unwrap();
        let v2 = registry.upload("sq", CUBE, "cube", ParameterSchema::new()).await.unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));
        assert_eq!(v1.incarnation, v2.incarnation);

        assert_eq!(registry.resolve("sq", None).unwrap().version, 2);
        assert_eq!(registry.resolve("sq", Some(1)).unwrap().source, SQUARE);
        assert!(matches!(
            registry.resolve("sq", Some(3)),
            Err(RegistryError::VersionNotFound { version: 3, .. })
        ));

        let versions = registry.versions("sq").unwrap();
        assert_eq!(versions.len(), 2);
        assert!(!versions[0].active && versions[1].active);
    }

    #[tokio::test]
    async fn rejected_upload_is_invisible() {
        let registry = registry();
        let err = registry
            .upload("bad", "import os\ndef process(p):\n    return 1\n", "", ParameterSchema::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
        assert!(matches!(registry.record("bad"), Err(RegistryError::NotFound(_))));
        assert!(registry.list().is_empty());

        let err = registry.upload("bad name", SQUARE, "", ParameterSchema::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidName);
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let registry = registry();
        for name in ["zeta", "alpha", "mid"] {
            registry.upload(name, SQUARE, "", ParameterSchema::new()).await.unwrap();
        }
        let names: Vec<String> = registry.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn activate_repoints_the_default() {
        let registry = registry();
        registry.upload("sq", SQUARE, "", ParameterSchema::new()).await.unwrap();
        registry.upload("sq", CUBE, "", ParameterSchema::new()).await.unwrap();

        let active = registry.activate("sq", 1).await.unwrap();
        assert_eq!(active.version, 1);
        assert_eq!(registry.resolve("sq", None).unwrap().version, 1);
        assert_eq!(registry.list()[0].active_version, 1);
        assert_eq!(registry.list()[0].latest_version, 2);

        assert!(registry.activate("sq", 9).await.is_err());
        assert!(registry.activate("nope", 1).await.is_err());

        // a new upload becomes active again
        let v3 = registry.upload("sq", SQUARE, "", ParameterSchema::new()).await.unwrap();
        assert_eq!(registry.resolve("sq", None).unwrap().version, v3.version);
    }

    #[tokio::test]
    async fn delete_then_reupload_starts_over() {
        let registry = registry();
        let old = registry.upload("sq", SQUARE, "", ParameterSchema::new()).await.unwrap();
        registry.upload("sq", CUBE, "", ParameterSchema::new()).await.unwrap();

        registry.delete("sq").await.unwrap();
        assert!(matches!(registry.resolve("sq", None), Err(RegistryError::NotFound(_))));
        assert!(matches!(registry.delete("sq").await, Err(RegistryError::NotFound(_))));

        let fresh = registry.upload("sq", CUBE, "", ParameterSchema::new()).await.unwrap();
        assert_eq!(fresh.version, 1);
        assert!(fresh.incarnation > old.incarnation);
    }

    #[tokio::test]
    async fn concurrent_uploads_get_distinct_versions() {
        let registry = Arc::new(registry());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.upload("sq", SQUARE, "", ParameterSchema::new()).await.unwrap().version
            }));
        }
        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=16).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let open = || {
            let kernel = Kernel::open(dir.path(), LedgerConfig::default()).unwrap();
            Registry::open(Validator::default(), Arc::new(kernel))
        };

        let (deleted_incarnation, kept_incarnation) = {
            let registry = open();
            let gone = registry.upload("gone", SQUARE, "", ParameterSchema::new()).await.unwrap();
            registry.upload("sq", SQUARE, "first", ParameterSchema::new()).await.unwrap();
            let kept = registry.upload("sq", CUBE, "second", ParameterSchema::new()).await.unwrap();
            registry.activate("sq", 1).await.unwrap();
            registry.delete("gone").await.unwrap();
            (gone.incarnation, kept.incarnation)
        };

        let registry = open();
        assert!(registry.record("gone").is_err());
        let record = registry.record("sq").unwrap();
        assert_eq!(record.versions.len(), 2);
        assert_eq!(record.active, 1);
        assert_eq!(record.incarnation, kept_incarnation);
        assert!(record.versions.iter().all(|v| v.program.is_some()));

        // incarnations keep increasing across restarts
        let again = registry.upload("gone", SQUARE, "", ParameterSchema::new()).await.unwrap();
        assert_eq!(again.version, 1);
        assert!(again.incarnation > deleted_incarnation.max(kept_incarnation));
    }

    #[tokio::test]
    async fn replayed_source_is_recompiled_under_current_policy() {
        let dir = TempDir::new().unwrap();
        let helper = "def double(x):\n    return x * 2\n\ndef process(params):\n    return double(params['n'])\n";
        {
            let kernel = Kernel::open(dir.path(), LedgerConfig::default()).unwrap();
            let registry = Registry::open(Validator::default(), Arc::new(kernel));
            registry.upload("dbl", helper, "", ParameterSchema::new()).await.unwrap();
        }

        let strict = Validator::new(PolicyConfig {
            allow_helpers: false,
            ..PolicyConfig::default()
        });
        let kernel = Kernel::open(dir.path(), LedgerConfig::default()).unwrap();
        let registry = Registry::open(strict, Arc::new(kernel));
        let version = registry.resolve("dbl", None).unwrap();
        assert!(version.program.is_none());
    }
}
