//! Scriptable fakes for the transform engine and schema discovery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use lakeshift_catalog::SchemaDescription;
use lakeshift_core::storage::{StorageBackend, WritePrecondition};
use lakeshift_flow::{Error, Result, SchemaDiscovery, TransformJobRunner, TransformOutcome};

/// What the next transform run does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScript {
    /// Convert every input record.
    Succeed,
    /// Report a job failure with `detail`.
    Fail {
        /// Failure detail reported by the job.
        detail: String,
    },
    /// Succeed but drop `missing` records.
    Partial {
        /// Records left out of the output.
        missing: u64,
    },
    /// Succeed but write nothing.
    EmptyOutput,
    /// Sleep before succeeding.
    Delay(Duration),
    /// The job cannot be started at all.
    Unavailable,
}

/// Transform runner that counts JSON lines under its input and writes one
/// columnar output object next to it.
///
/// Runs follow the queued scripts in order, then [`RunScript::Succeed`].
pub struct ScriptedTransformRunner {
    storage: Arc<dyn StorageBackend>,
    scripts: Mutex<VecDeque<RunScript>>,
    inputs: Mutex<Vec<String>>,
}

impl std::fmt::Debug for ScriptedTransformRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransformRunner")
            .field("scripts", &self.scripts)
            .finish_non_exhaustive()
    }
}

impl ScriptedTransformRunner {
    /// Creates a runner over `storage`.
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            scripts: Mutex::new(VecDeque::new()),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Queues the behavior of a future run.
    pub fn script(&self, script: RunScript) {
        self.scripts.lock().expect("lock").push_back(script);
    }

    /// Returns the input locations of every run so far.
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().expect("lock").clone()
    }

    /// Output prefix the runner uses for `input`.
    pub fn output_of(input: &str) -> String {
        format!("{}-output/", input.trim_end_matches('/'))
    }

    async fn count_records(&self, input: &str) -> Result<u64> {
        let mut records = 0;
        for meta in self.storage.list(input).await? {
            let data = self.storage.get(&meta.path).await?;
            records += String::from_utf8_lossy(&data)
                .lines()
                .filter(|line| !line.trim().is_empty())
                .count() as u64;
        }
        Ok(records)
    }
}

#[async_trait]
impl TransformJobRunner for ScriptedTransformRunner {
    async fn run(
        &self,
        dataset_location: &str,
        _schema: &SchemaDescription,
    ) -> Result<TransformOutcome> {
        self.inputs
            .lock()
            .expect("lock")
            .push(dataset_location.to_string());
        let script = self
            .scripts
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(RunScript::Succeed);
        let write_output = script != RunScript::EmptyOutput;

        let missing = match script {
            RunScript::Fail { detail } => return Ok(TransformOutcome::Failure { detail }),
            RunScript::Unavailable => {
                return Err(Error::external("transform runner", "job could not be started"));
            }
            RunScript::Delay(delay) => {
                tokio::time::sleep(delay).await;
                0
            }
            RunScript::Partial { missing } => missing,
            RunScript::Succeed | RunScript::EmptyOutput => 0,
        };

        let records = self.count_records(dataset_location).await?;
        let output_location = Self::output_of(dataset_location);
        if write_output {
            self.storage
                .put(
                    &format!("{output_location}part-0.parquet"),
                    Bytes::from_static(b"PAR1"),
                    WritePrecondition::None,
                )
                .await?;
        }
        Ok(TransformOutcome::Success {
            output_location,
            records_processed: records.saturating_sub(missing),
        })
    }
}

/// Discovery service with canned proposals and controllable scope visibility.
#[derive(Debug, Default)]
pub struct FakeDiscovery {
    proposals: Mutex<HashMap<String, SchemaDescription>>,
    polls: Mutex<HashMap<String, u32>>,
    visible_after: AtomicU32,
    fail_register: AtomicBool,
    register_calls: AtomicUsize,
    hold: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
}

impl FakeDiscovery {
    /// Creates a discovery fake whose scopes become visible on the first poll.
    pub fn new() -> Self {
        Self::default()
    }

    /// Proposes `schema` for objects under `location`.
    pub fn propose(&self, location: impl Into<String>, schema: SchemaDescription) {
        self.proposals
            .lock()
            .expect("lock")
            .insert(location.into(), schema);
    }

    /// Makes a registered scope invisible for the first `polls` polls.
    pub fn visible_after(&self, polls: u32) {
        self.visible_after.store(polls, Ordering::SeqCst);
    }

    /// Makes `register_scope` fail until called again with `false`.
    pub fn fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    /// Returns how many times `register_scope` was called.
    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    /// Returns the registered scopes, sorted.
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.polls.lock().expect("lock").keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Parks the next `register_scope` call.
    ///
    /// Returns `(entered, gate)`: `entered` is notified once the call is
    /// parked, and the call continues after `gate` is notified.
    pub fn hold_register_scope(&self) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        *self.hold.lock().expect("lock") = Some((Arc::clone(&entered), Arc::clone(&gate)));
        (entered, gate)
    }
}

#[async_trait]
impl SchemaDiscovery for FakeDiscovery {
    async fn propose_schema(&self, family: &str, location: &str) -> Result<SchemaDescription> {
        self.proposals
            .lock()
            .expect("lock")
            .get(location)
            .cloned()
            .ok_or_else(|| {
                Error::external(
                    "discovery",
                    format!("no schema inferred for {family} at {location}"),
                )
            })
    }

    async fn register_scope(&self, location: &str) -> Result<()> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let hold = self.hold.lock().expect("lock").take();
        if let Some((entered, gate)) = hold {
            entered.notify_one();
            gate.notified().await;
        }
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(Error::external("discovery", "scope registration rejected"));
        }
        self.polls
            .lock()
            .expect("lock")
            .entry(location.to_string())
            .or_insert(0);
        Ok(())
    }

    async fn scope_registered(&self, location: &str) -> Result<bool> {
        let threshold = self.visible_after.load(Ordering::SeqCst);
        let mut polls = self.polls.lock().expect("lock");
        Ok(match polls.get_mut(location) {
            Some(seen) => {
                *seen += 1;
                *seen > threshold
            }
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeshift_core::MemoryBackend;

    #[tokio::test]
    async fn runner_counts_lines_and_writes_output() {
        let storage = Arc::new(MemoryBackend::new());
        storage
            .put("in/a.json", Bytes::from("{}\n{}\n\n{}\n"), WritePrecondition::None)
            .await
            .expect("seed");
        let runner = ScriptedTransformRunner::new(storage.clone());
        let schema = SchemaDescription::new("weather", 1, Vec::new()).expect("schema");

        runner.script(RunScript::Partial { missing: 1 });
        let partial = runner.run("in/", &schema).await.expect("run");
        assert_eq!(
            partial,
            TransformOutcome::Success {
                output_location: "in-output/".into(),
                records_processed: 2,
            }
        );
        let full = runner.run("in/", &schema).await.expect("run");
        assert!(matches!(full, TransformOutcome::Success { records_processed: 3, .. }));
        assert!(storage.get("in-output/part-0.parquet").await.is_ok());
        assert_eq!(runner.inputs().len(), 2);
    }

    #[tokio::test]
    async fn discovery_visibility_lags_registration() {
        let discovery = FakeDiscovery::new();
        discovery.visible_after(2);
        assert!(!discovery.scope_registered("datasets/weather_v2/").await.expect("poll"));

        discovery.register_scope("datasets/weather_v2/").await.expect("register");
        assert!(!discovery.scope_registered("datasets/weather_v2/").await.expect("poll"));
        assert!(!discovery.scope_registered("datasets/weather_v2/").await.expect("poll"));
        assert!(discovery.scope_registered("datasets/weather_v2/").await.expect("poll"));
        assert_eq!(discovery.scopes(), vec!["datasets/weather_v2/".to_string()]);
    }
}
