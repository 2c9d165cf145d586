//! Boundary facade: the operations an external adapter calls, and the
//! JSON envelopes it answers with.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::{ExecutionLimits, FuncboxConfig};
use crate::error::ErrorKind;
use crate::kernel::error::KernelError;
use crate::kernel::ledger::{ExecutionRecord, RecordOutcome};
use crate::kernel::Kernel;
use crate::policy::{Validator, Violation};
use crate::registry::types::{FunctionSummary, FunctionVersion, ParameterSchema, VersionSummary};
use crate::registry::{Registry, RegistryError};
use crate::sandbox::Sandbox;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The function ran (or its parameters were checked) and failed.
    #[error("{detail}")]
    Execution { kind: ErrorKind, detail: String },
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Registry(e) => e.kind(),
            ServiceError::Execution { kind, .. } => *kind,
        }
    }

    /// Policy violations behind a rejected upload.
    pub fn violations(&self) -> &[Violation] {
        match self {
            ServiceError::Registry(RegistryError::ValidationFailed(v)) => v,
            _ => &[],
        }
    }
}

impl From<KernelError> for ServiceError {
    fn from(e: KernelError) -> Self {
        ServiceError::Registry(RegistryError::Storage(e))
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// A new function version, as submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: ParameterSchema,
}

/// Response shape shared by every adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Success {
        result: serde_json::Value,
    },
    Uploaded {
        name: String,
        version: u32,
    },
    Failure {
        error: String,
        kind: ErrorKind,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        violations: Vec<Violation>,
    },
}

impl Envelope {
    pub fn success(result: serde_json::Value) -> Self {
        Envelope::Success { result }
    }

    pub fn uploaded(version: &FunctionVersion) -> Self {
        Envelope::Uploaded {
            name: version.name.clone(),
            version: version.version,
        }
    }

    pub fn failure(error: &ServiceError) -> Self {
        Envelope::Failure {
            error: error.to_string(),
            kind: error.kind(),
            violations: error.violations().to_vec(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Envelope::Failure { .. })
    }
}

impl From<ServiceResult<serde_json::Value>> for Envelope {
    fn from(result: ServiceResult<serde_json::Value>) -> Self {
        match result {
            Ok(value) => Envelope::success(value),
            Err(e) => Envelope::failure(&e),
        }
    }
}

pub struct FunctionService {
    config: FuncboxConfig,
    registry: Registry,
    sandbox: Sandbox,
}

impl FunctionService {
    /// Open the service. With `storage.data_dir` set, state is replayed
    /// from and persisted to the WAL in that directory.
    pub fn open(config: FuncboxConfig) -> ServiceResult<Self> {
        let kernel = match &config.storage.data_dir {
            Some(dir) => Kernel::open(dir, config.ledger.clone())?,
            None => Kernel::in_memory(config.ledger.clone()),
        };
        let registry = Registry::open(Validator::new(config.policy.clone()), Arc::new(kernel));
        let sandbox = Sandbox::new(config.sandbox.clone());
        info!(
            durable = registry.kernel().is_durable(),
            timeout_secs = config.sandbox.timeout_secs,
            memory_limit_bytes = config.sandbox.memory_limit_bytes,
            "function service ready"
        );
        Ok(Self {
            config,
            registry,
            sandbox,
        })
    }

    pub fn config(&self) -> &FuncboxConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Validate without storing. Empty when the source is acceptable.
    pub fn check(&self, source: &str) -> Vec<Violation> {
        self.registry.validator().validate(source).violations().to_vec()
    }

    pub async fn upload(&self, request: UploadRequest) -> ServiceResult<Arc<FunctionVersion>> {
        Ok(self
            .registry
            .upload(
                &request.name,
                &request.source,
                &request.description,
                request.parameters,
            )
            .await?)
    }

    /// Run `name` (its active version unless `version` is given) under the
    /// configured ceilings.
    pub async fn execute(
        &self,
        name: &str,
        version: Option<u32>,
        parameters: &serde_json::Value,
    ) -> ServiceResult<serde_json::Value> {
        self.execute_with_limits(name, version, parameters, &self.config.sandbox.limits())
            .await
    }

    /// Like [`FunctionService::execute`] with explicit ceilings.
    pub async fn execute_with_limits(
        &self,
        name: &str,
        version: Option<u32>,
        parameters: &serde_json::Value,
        limits: &ExecutionLimits,
    ) -> ServiceResult<serde_json::Value> {
        let target = self.registry.resolve(name, version)?;

        let started_at = Utc::now();
        let execution = self.sandbox.run(&target, parameters, limits).await;
        let finished_at = Utc::now();

        let outcome = RecordOutcome::from(execution.outcome);
        let kernel = self.registry.kernel();
        kernel.record(ExecutionRecord {
            id: Uuid::new_v4(),
            name: target.name.clone(),
            version: target.version,
            incarnation: target.incarnation,
            parameters: kernel.ledger().summarize(parameters),
            outcome: outcome.clone(),
            duration_ms: u64::try_from(execution.duration.as_millis()).unwrap_or(u64::MAX),
            peak_memory: execution.peak_memory,
            started_at,
            finished_at,
        });

        match outcome {
            RecordOutcome::Success { value } => Ok(value),
            RecordOutcome::Failure { kind, detail } => Err(ServiceError::Execution { kind, detail }),
        }
    }

    pub fn list(&self) -> Vec<FunctionSummary> {
        self.registry.list()
    }

    pub fn versions(&self, name: &str) -> ServiceResult<Vec<VersionSummary>> {
        Ok(self.registry.versions(name)?)
    }

    /// Execution records of the live function `name`, oldest first.
    pub fn history(&self, name: &str) -> ServiceResult<Vec<ExecutionRecord>> {
        self.registry.record(name)?;
        Ok(self
            .registry
            .kernel()
            .ledger()
            .query(name)
            .map(|record| (*record).clone())
            .collect())
    }

    pub async fn activate(&self, name: &str, version: u32) -> ServiceResult<VersionSummary> {
        let target = self.registry.activate(name, version).await?;
        Ok(target.summary(true))
    }

    pub async fn delete(&self, name: &str) -> ServiceResult<()> {
        Ok(self.registry.delete(name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> FunctionService {
        FunctionService::open(FuncboxConfig::default()).unwrap()
    }

    fn upload(name: &str, source: &str) -> UploadRequest {
        UploadRequest {
            name: name.into(),
            source: source.into(),
            description: String::new(),
            parameters: ParameterSchema::new(),
        }
    }

    #[tokio::test]
    async fn execute_records_history() {
        let service = service();
        service
            .upload(upload("sq", "def process(params):\n    return params['n'] * params['n']\n"))
            .await
            .unwrap();

        assert_eq!(service.execute("sq", None, &json!({"n": 5})).await.unwrap(), json!(25));
        let err = service.execute("sq", None, &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeError);

        let history = service.history("sq").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].outcome, RecordOutcome::Success { value: json!(25) });
        assert_eq!(history[0].parameters, json!({"n": 5}));
        assert!(matches!(
            history[1].outcome,
            RecordOutcome::Failure { kind: ErrorKind::RuntimeError, .. }
        ));
        assert!(history[0].finished_at >= history[0].started_at);
    }

    #[tokio::test]
    async fn unknown_function_is_not_recorded() {
        let service = service();
        let err = service.execute("ghost", None, &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(service.registry().kernel().ledger().count("ghost"), 0);
        assert_eq!(service.history("ghost").unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn envelopes_have_the_documented_shape() {
        let service = service();
        let version = service
            .upload(upload("one", "def process(params):\n    return 1\n"))
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(Envelope::uploaded(&version)).unwrap(),
            json!({"name": "one", "version": 1})
        );

        let ok: Envelope = service.execute("one", None, &json!({})).await.into();
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"result": 1}));

        let missing: Envelope = service.execute("two", None, &json!({})).await.into();
        let value = serde_json::to_value(&missing).unwrap();
        assert_eq!(value["kind"], json!("NotFound"));
        assert!(value["error"].as_str().unwrap().contains("two"));
        assert!(value.get("violations").is_none());

        let rejected = service
            .upload(upload("bad", "import os\ndef process(params):\n    return 1\n"))
            .await
            .unwrap_err();
        let value = serde_json::to_value(Envelope::failure(&rejected)).unwrap();
        assert_eq!(value["kind"], json!("ValidationFailed"));
        assert_eq!(value["violations"][0]["kind"], json!("import"));
        assert!(value["violations"][0]["construct"].as_str().unwrap().contains("import os"));
    }

    #[tokio::test]
    async fn activate_returns_summary() {
        let service = service();
        service.upload(upload("f", "def process(params):\n    return 1\n")).await.unwrap();
        service.upload(upload("f", "def process(params):\n    return 2\n")).await.unwrap();
        let summary = service.activate("f", 1).await.unwrap();
        assert!(summary.active);
        assert_eq!(summary.version, 1);
        assert_eq!(service.execute("f", None, &json!({})).await.unwrap(), json!(1));
        assert_eq!(service.execute("f", Some(2), &json!({})).await.unwrap(), json!(2));
    }

    #[test]
    fn check_reports_all_violations() {
        let service = service();
        assert!(service.check("def process(params):\n    return 1\n").is_empty());
        let violations = service.check("import os\nimport sys\ndef process(params):\n    return open('x')\n");
        assert!(violations.len() >= 3);
    }
}
