//! Registry data model: parameter schemas, immutable versions, records.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lang::Program;

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    #[serde(alias = "str")]
    String,
    #[serde(alias = "int")]
    Integer,
    #[serde(alias = "number")]
    Float,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "array")]
    List,
    #[serde(alias = "dict", alias = "object")]
    Mapping,
}

impl std::fmt::Display for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Float => "float",
            ParameterType::Boolean => "boolean",
            ParameterType::List => "list",
            ParameterType::Mapping => "mapping",
        };
        f.write_str(s)
    }
}

/// One declared parameter. Its name is the key it is stored under in the
/// [`ParameterSchema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    #[serde(rename = "type")]
    pub kind: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ParameterSpec {
    pub fn required(kind: ParameterType) -> Self {
        Self {
            kind,
            required: true,
            description: String::new(),
        }
    }

    pub fn optional(kind: ParameterType) -> Self {
        Self {
            kind,
            required: false,
            description: String::new(),
        }
    }
}

/// Parameter name → spec, ordered by name. Serialized as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSchema(BTreeMap<String, ParameterSpec>);

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.0.insert(name.into(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterSpec)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, ParameterSpec)> for ParameterSchema {
    fn from_iter<I: IntoIterator<Item = (String, ParameterSpec)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An immutable, validated version of a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionVersion {
    pub name: String,
    pub version: u32,
    pub source: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: ParameterSchema,
    pub created_at: DateTime<Utc>,
    /// Lifetime of the record this version belongs to.
    pub incarnation: u64,
    /// Compiled form. `None` when a replayed source no longer passes policy.
    #[serde(skip)]
    pub program: Option<Arc<Program>>,
}

impl FunctionVersion {
    pub fn summary(&self, active: bool) -> VersionSummary {
        VersionSummary {
            name: self.name.clone(),
            version: self.version,
            description: self.description.clone(),
            parameters: self.parameters.clone(),
            created_at: self.created_at,
            active,
        }
    }
}

/// All versions stored under one name during one incarnation.
///
/// Records are never edited in place: the registry publishes a new
/// snapshot on every change.
#[derive(Debug, Clone)]
pub struct FunctionRecord {
    pub name: String,
    pub incarnation: u64,
    /// Ordered by version, contiguous from 1.
    pub versions: Vec<Arc<FunctionVersion>>,
    pub active: u32,
}

impl FunctionRecord {
    pub fn version(&self, version: u32) -> Option<&Arc<FunctionVersion>> {
        let index = usize::try_from(version).ok()?.checked_sub(1)?;
        self.versions.get(index)
    }

    pub fn active_version(&self) -> Option<&Arc<FunctionVersion>> {
        self.version(self.active)
    }

    pub fn latest(&self) -> u32 {
        self.versions.last().map(|v| v.version).unwrap_or(0)
    }

    /// Snapshot with `version` appended and made active.
    pub fn with_version(&self, version: Arc<FunctionVersion>) -> Self {
        let mut versions = self.versions.clone();
        let active = version.version;
        versions.push(version);
        Self {
            name: self.name.clone(),
            incarnation: self.incarnation,
            versions,
            active,
        }
    }

    pub fn summary(&self) -> FunctionSummary {
        let active = self.active_version();
        FunctionSummary {
            name: self.name.clone(),
            active_version: self.active,
            latest_version: self.latest(),
            description: active.map(|v| v.description.clone()).unwrap_or_default(),
            updated_at: self.versions.last().map(|v| v.created_at),
        }
    }

    pub fn version_summaries(&self) -> Vec<VersionSummary> {
        self.versions
            .iter()
            .map(|v| v.summary(v.version == self.active))
            .collect()
    }
}

/// Listing entry for one function name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSummary {
    pub name: String,
    pub active_version: u32,
    pub latest_version: u32,
    pub description: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Listing entry for one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub name: String,
    pub version: u32,
    pub description: String,
    pub parameters: ParameterSchema,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}
