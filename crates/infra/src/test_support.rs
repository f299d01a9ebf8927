//! Scripted stages for orchestrator and worker tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Notify;

use docpipe_jobs::JobConfig;

use crate::pipeline::{Stage, StageError};

/// Rendezvous between a test and a stage that is mid-execution.
#[derive(Debug, Default)]
pub(crate) struct Gate {
    pub started: Notify,
    pub release: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// What one invocation does. Once the script runs out, calls succeed.
pub(crate) enum Step {
    Fail(StageError),
    Sleep(Duration),
    Panic,
    Wait(Arc<Gate>),
}

pub(crate) struct ScriptedStage {
    name: String,
    script: Mutex<VecDeque<Step>>,
    inputs: Mutex<Vec<JsonValue>>,
    calls: AtomicU32,
}

impl ScriptedStage {
    pub fn new(name: &str, steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(steps.into_iter().collect()),
            inputs: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<JsonValue> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: JsonValue, _config: &JobConfig) -> Result<JsonValue, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(input.clone());
        let step = self.script.lock().unwrap().pop_front();

        match step {
            Some(Step::Fail(err)) => return Err(err),
            Some(Step::Sleep(duration)) => tokio::time::sleep(duration).await,
            Some(Step::Panic) => panic!("scripted panic in {}", self.name),
            Some(Step::Wait(gate)) => {
                gate.started.notify_one();
                gate.release.notified().await;
            }
            None => {}
        }
        Ok(json!({ "echo": self.name, "input": input }))
    }
}
