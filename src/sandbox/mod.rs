//! Sandbox executor: runs one function version under time and memory
//! ceilings.
//!
//! Each invocation gets a fresh interpreter on its own OS thread. Values
//! never cross the thread boundary: parameters go in as JSON and the result
//! comes back as JSON. A tokio supervisor races the worker against the
//! timeout; when the timeout wins it raises the cancellation flag, which the
//! interpreter observes at its next step.

pub mod builtins;
pub mod error;
pub mod interp;
pub mod meter;
pub mod methods;
pub mod ops;
pub mod params;
pub mod value;

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::{ExecutionLimits, SandboxConfig};
use crate::lang::ast::Program;
use crate::registry::types::FunctionVersion;
use error::Fault;
use interp::Interp;
use meter::Meter;

/// How long the supervisor waits for a cancelled worker to unwind.
const JOIN_GRACE: Duration = Duration::from_secs(2);

/// How one execution ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail")]
pub enum Outcome {
    Success(serde_json::Value),
    ParameterError(String),
    TimeoutError(String),
    MemoryLimitError(String),
    RuntimeError(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Variant name, as it appears in envelopes and the ledger.
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "Success",
            Outcome::ParameterError(_) => "ParameterError",
            Outcome::TimeoutError(_) => "TimeoutError",
            Outcome::MemoryLimitError(_) => "MemoryLimitError",
            Outcome::RuntimeError(_) => "RuntimeError",
        }
    }

    /// Failure message, `None` on success.
    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Success(_) => None,
            Outcome::ParameterError(m)
            | Outcome::TimeoutError(m)
            | Outcome::MemoryLimitError(m)
            | Outcome::RuntimeError(m) => Some(m),
        }
    }
}

/// Result of [`Sandbox::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub outcome: Outcome,
    pub duration: Duration,
    /// High-water mark of interpreter memory, in bytes.
    pub peak_memory: usize,
}

/// What the worker thread sends back.
struct Report {
    outcome: Outcome,
    peak: usize,
}

/// Counts a worker thread as live until its closure returns.
struct LiveWorker(Arc<AtomicUsize>);

impl LiveWorker {
    fn enter(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count.clone())
    }
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Sandbox {
    config: SandboxConfig,
    live: Arc<AtomicUsize>,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Worker threads started by this sandbox that have not finished yet.
    /// Zero whenever no [`Sandbox::run`] is in flight, unless a worker
    /// outlived its join grace.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Run `version` against `parameters`.
    pub async fn run(
        &self,
        version: &FunctionVersion,
        parameters: &serde_json::Value,
        limits: &ExecutionLimits,
    ) -> Execution {
        let started = Instant::now();
        let finish = |outcome: Outcome, peak_memory: usize| Execution {
            outcome,
            duration: started.elapsed(),
            peak_memory,
        };

        let Some(program) = version.program.clone() else {
            return finish(
                Outcome::RuntimeError(format!(
                    "version {} of '{}' is not executable under the current policy",
                    version.version, version.name
                )),
                0,
            );
        };
        let argument = match params::check(
            &version.parameters,
            parameters,
            self.config.unknown_parameters,
        ) {
            Ok(map) => serde_json::Value::Object(map),
            Err(problems) => return finish(Outcome::ParameterError(problems.join("; ")), 0),
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = oneshot::channel::<Report>();
        let job = Job {
            program,
            argument,
            limits: *limits,
            max_depth: self.config.max_call_depth,
            cancel: cancel.clone(),
        };
        let live = LiveWorker::enter(&self.live);
        let spawned = std::thread::Builder::new()
            .name(format!("funcbox-{}", version.name))
            .stack_size(self.config.stack_size_bytes)
            .spawn(move || {
                let _live = live;
                // the supervisor may have stopped listening
                let _ = tx.send(job.execute());
            });
        let worker = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                warn!(name = %version.name, error = %e, "failed to start sandbox thread");
                return finish(
                    Outcome::RuntimeError(format!("failed to start sandbox thread: {e}")),
                    0,
                );
            }
        };

        let mut peak = 0;
        let mut timed_out = false;
        let outcome = match tokio::time::timeout(limits.timeout, &mut rx).await {
            Ok(Ok(report)) => {
                peak = report.peak;
                report.outcome
            }
            Ok(Err(_)) => Outcome::RuntimeError("sandbox worker exited without a result".into()),
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                timed_out = true;
                Outcome::TimeoutError(timeout_message(limits.timeout))
            }
        };

        // The worker is always joined. A worker stuck past the grace period
        // finishes in the background and stays counted in `live_workers`.
        let join = tokio::task::spawn_blocking(move || worker.join());
        match tokio::time::timeout(JOIN_GRACE, join).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(_))) => warn!(name = %version.name, "sandbox thread panicked outside the interpreter"),
            Ok(Err(e)) => warn!(name = %version.name, error = %e, "sandbox join task failed"),
            Err(_) => warn!(
                name = %version.name,
                grace_ms = JOIN_GRACE.as_millis() as u64,
                live_workers = self.live_workers(),
                "sandbox thread still running after cancellation"
            ),
        }
        if timed_out {
            if let Ok(report) = rx.try_recv() {
                peak = report.peak;
            }
        }

        let execution = finish(outcome, peak);
        debug!(
            name = %version.name,
            version = version.version,
            outcome = execution.outcome.kind(),
            duration_ms = execution.duration.as_millis() as u64,
            peak_memory = execution.peak_memory,
            "execution finished"
        );
        execution
    }
}

fn timeout_message(timeout: Duration) -> String {
    format!(
        "execution exceeded the time limit of {:.3}s",
        timeout.as_secs_f64()
    )
}

/// Everything the worker thread needs, all of it `Send`.
struct Job {
    program: Arc<Program>,
    argument: serde_json::Value,
    limits: ExecutionLimits,
    max_depth: usize,
    cancel: Arc<AtomicBool>,
}

impl Job {
    fn execute(self) -> Report {
        let deadline = Instant::now()
            .checked_add(self.limits.timeout)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365));
        let meter = Meter::new(self.limits.memory_bytes, self.cancel, deadline);
        let program = self.program;
        let argument = self.argument;
        let max_depth = self.max_depth;

        let result = {
            let meter = Rc::clone(&meter);
            panic::catch_unwind(AssertUnwindSafe(move || {
                let mut interp = Interp::new(Rc::clone(&meter), max_depth);
                let result = value::from_json(&meter, &argument)
                    .and_then(|arg| interp.run(&program, arg))
                    .and_then(|result| value::to_json(&result, &meter));
                meter.sweep();
                result
            }))
        };
        meter.sweep();

        let outcome = match result {
            Ok(Ok(json)) => Outcome::Success(json),
            Ok(Err(Fault::Timeout)) => Outcome::TimeoutError(timeout_message(self.limits.timeout)),
            Ok(Err(fault @ Fault::Memory { .. })) => Outcome::MemoryLimitError(fault.to_string()),
            Ok(Err(Fault::Raised(raised))) => Outcome::RuntimeError(raised.to_string()),
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown cause".into());
                Outcome::RuntimeError(format!("interpreter fault: {detail}"))
            }
        };
        Report {
            outcome,
            peak: meter.peak(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Validator, Verdict};
    use crate::registry::types::{ParameterSchema, ParameterSpec, ParameterType};
    use chrono::Utc;

    fn version(source: &str, parameters: ParameterSchema) -> FunctionVersion {
        let program = match Validator::default().validate(source) {
            Verdict::Accepted(program) => Arc::new(program),
            Verdict::Rejected(v) => panic!("rejected: {v:?}"),
        };
        FunctionVersion {
            name: "test".into(),
            version: 1,
            source: source.into(),
            description: String::new(),
            parameters,
            created_at: Utc::now(),
            incarnation: 1,
            program: Some(program),
        }
    }

    fn limits(timeout_ms: u64, memory_bytes: usize) -> ExecutionLimits {
        ExecutionLimits {
            timeout: Duration::from_millis(timeout_ms),
            memory_bytes,
        }
    }

    fn sandbox() -> Sandbox {
        Sandbox::new(SandboxConfig::default())
    }

    const SQUARE: &str = "def process(parameters):\n    n = parameters['number']\n    return n * n\n";

    #[tokio::test]
    async fn squares_five() {
        let v = version(SQUARE, ParameterSchema::new());
        let run = sandbox()
            .run(&v, &serde_json::json!({"number": 5}), &limits(5000, 16 << 20))
            .await;
        assert_eq!(run.outcome, Outcome::Success(serde_json::json!(25)));
        assert!(run.peak_memory > 0);
    }

    #[tokio::test]
    async fn infinite_loop_times_out() {
        let v = version(
            "def process(p):\n    while True:\n        pass\n",
            ParameterSchema::new(),
        );
        let started = Instant::now();
        let run = sandbox()
            .run(&v, &serde_json::json!({}), &limits(200, 16 << 20))
            .await;
        assert!(matches!(run.outcome, Outcome::TimeoutError(_)), "{:?}", run.outcome);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn timed_out_workers_are_joined_before_returning() {
        let sandbox = sandbox();
        for source in [
            "def process(p):\n    while True:\n        pass\n",
            "def process(p):\n    sleep(30)\n    return 1\n",
        ] {
            let v = version(source, ParameterSchema::new());
            let run = sandbox
                .run(&v, &serde_json::json!({}), &limits(200, 64 << 20))
                .await;
            assert!(matches!(run.outcome, Outcome::TimeoutError(_)), "{:?}", run.outcome);
            assert_eq!(sandbox.live_workers(), 0, "{source}");
        }
        let v = version(SQUARE, ParameterSchema::new());
        sandbox
            .run(&v, &serde_json::json!({"number": 2}), &limits(5000, 16 << 20))
            .await;
        assert_eq!(sandbox.live_workers(), 0);
    }

    #[tokio::test]
    async fn sleeping_past_the_limit_times_out() {
        let v = version("def process(p):\n    sleep(30)\n    return 1\n", ParameterSchema::new());
        let run = sandbox()
            .run(&v, &serde_json::json!({}), &limits(100, 16 << 20))
            .await;
        assert!(matches!(run.outcome, Outcome::TimeoutError(_)));
        assert!(run.duration < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn allocation_hits_the_memory_ceiling() {
        let v = version(
            "def process(p):\n    s = 'x'\n    while True:\n        s = s + s\n",
            ParameterSchema::new(),
        );
        let run = sandbox()
            .run(&v, &serde_json::json!({}), &limits(5000, 4 << 20))
            .await;
        assert!(matches!(run.outcome, Outcome::MemoryLimitError(_)), "{:?}", run.outcome);
        assert!(run.peak_memory <= 4 << 20);
    }

    #[tokio::test]
    async fn deep_recursion_is_a_runtime_error() {
        let v = version(
            "def down(n):\n    return down(n + 1)\n\ndef process(p):\n    return down(0)\n",
            ParameterSchema::new(),
        );
        let run = sandbox()
            .run(&v, &serde_json::json!({}), &limits(5000, 16 << 20))
            .await;
        match run.outcome {
            Outcome::RuntimeError(message) => assert!(message.contains("RecursionError")),
            other => panic!("{other:?}"),
        }
    }

    #[tokio::test]
    async fn runtime_error_names_class_and_line() {
        let v = version(
            "def process(p):\n    total = 0\n    return p['n'] / total\n",
            ParameterSchema::new(),
        );
        let run = sandbox()
            .run(&v, &serde_json::json!({"n": 1}), &limits(5000, 16 << 20))
            .await;
        match run.outcome {
            Outcome::RuntimeError(message) => {
                assert!(message.starts_with("ZeroDivisionError"), "{message}");
                assert!(message.ends_with("(line 3)"), "{message}");
            }
            other => panic!("{other:?}"),
        }
    }

    #[tokio::test]
    async fn schema_violations_are_parameter_errors() {
        let schema =
            ParameterSchema::new().with("number", ParameterSpec::required(ParameterType::Integer));
        let v = version(SQUARE, schema);
        let run = sandbox()
            .run(&v, &serde_json::json!({"number": "many"}), &limits(5000, 16 << 20))
            .await;
        assert!(matches!(run.outcome, Outcome::ParameterError(_)));

        let run = sandbox()
            .run(&v, &serde_json::json!({"number": "6"}), &limits(5000, 16 << 20))
            .await;
        assert_eq!(run.outcome, Outcome::Success(serde_json::json!(36)));
    }

    #[tokio::test]
    async fn deeply_nested_containers_are_freed_without_recursion() {
        let sources = [
            "def process(p):\n    a = []\n    for i in range(300000):\n        a = [a]\n    return 1\n",
            "def process(p):\n    a = []\n    for i in range(300000):\n        a = [a]\n    a = None\n    return 2\n",
            "def process(p):\n    d = {}\n    for i in range(200000):\n        d = {'next': d}\n    return 3\n",
            "def process(p):\n    g = lambda: 0\n    for i in range(60000):\n        g = (lambda h: lambda: h)(g)\n    return 4\n",
        ];
        for (n, source) in sources.iter().enumerate() {
            let v = version(source, ParameterSchema::new());
            let run = sandbox()
                .run(&v, &serde_json::json!({}), &limits(60_000, 100 << 20))
                .await;
            assert_eq!(run.outcome, Outcome::Success(serde_json::json!(n + 1)), "{source}");
        }
    }

    #[tokio::test]
    async fn returning_a_deep_chain_is_a_runtime_error() {
        let v = version(
            "def process(p):\n    a = []\n    for i in range(300000):\n        a = [a]\n    return a\n",
            ParameterSchema::new(),
        );
        let run = sandbox()
            .run(&v, &serde_json::json!({}), &limits(60_000, 100 << 20))
            .await;
        assert!(matches!(run.outcome, Outcome::RuntimeError(_)), "{:?}", run.outcome);
    }

    #[tokio::test]
    async fn concurrent_runs_are_independent() {
        let v = Arc::new(version(SQUARE, ParameterSchema::new()));
        let sandbox = Arc::new(sandbox());
        let mut handles = Vec::new();
        for n in 0..8 {
            let v = v.clone();
            let sandbox = sandbox.clone();
            handles.push(tokio::spawn(async move {
                sandbox
                    .run(&v, &serde_json::json!({"number": n}), &limits(5000, 16 << 20))
                    .await
            }));
        }
        for (n, handle) in handles.into_iter().enumerate() {
            let run = handle.await.unwrap();
            assert_eq!(run.outcome, Outcome::Success(serde_json::json!(n * n)));
        }
    }

    #[test]
    fn outcome_serializes_with_a_status_tag() {
        let json = serde_json::to_value(Outcome::TimeoutError("slow".into())).unwrap();
        assert_eq!(json, serde_json::json!({"status": "TimeoutError", "detail": "slow"}));
    }
}
