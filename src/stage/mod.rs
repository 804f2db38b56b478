//! The Stage contract: a polymorphic capability that, given a request, a
//! read view of the pipeline so far, and a policy, produces a
//! [`StageResult`]. This is the seam where the orchestrator hands off to
//! whatever actually does routing, detection, diagnosis, report rendering
//! and hospital lookup — none of which this crate implements.

pub mod stub;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::errors::StageError;
use crate::model::StepName;
use crate::orchestrator::ProcessingRequest;
use crate::policy::PolicyConfig;
use crate::step_graph::StepGraph;

/// The output of a successful stage invocation. `extras` carries
/// step-specific fields the orchestrator projects onto the step
/// graph or the final response: `body_part` for ROUTE; `detections` for the
/// detectors; `level`/`rationale`/`partial`/`method` for TRIAGE;
/// `pdf_id`/`json_id` for REPORT; and so on.
#[derive(Debug, Clone, Default)]
pub struct StageResult {
    pub confidence: Option<f64>,
    pub artifacts: HashMap<String, String>,
    pub extras: Map<String, Value>,
}

impl StageResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_artifact(mut self, key: impl Into<String>, artifact_id: impl Into<String>) -> Self {
        self.artifacts.insert(key.into(), artifact_id.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }
}

/// A read-only view of the pipeline a stage may consult: the step graph
/// built so far, plus the raw `StageResult`s of steps that already
/// completed (so e.g. TRIAGE can read the detectors' `detections` extra
/// without the step graph itself needing to carry free-form payloads).
pub struct PipelineView<'a> {
    pub graph: &'a StepGraph,
    pub outputs: &'a HashMap<StepName, StageResult>,
}

impl<'a> PipelineView<'a> {
    pub fn new(graph: &'a StepGraph, outputs: &'a HashMap<StepName, StageResult>) -> Self {
        Self { graph, outputs }
    }

    pub fn extras_for(&self, step: StepName) -> Option<&Map<String, Value>> {
        self.outputs.get(&step).map(|result| &result.extras)
    }
}

/// The uniform contract every stage implements. `run` receives an absolute
/// deadline; well-behaved implementations race their own work against it
/// and return `StageErrorKind::Timeout` rather than relying solely on the
/// orchestrator's outer cancellation.
#[async_trait]
pub trait Stage: Send + Sync {
    async fn run(
        &self,
        request: &ProcessingRequest,
        view: &PipelineView<'_>,
        policy: &PolicyConfig,
        deadline: Instant,
    ) -> Result<StageResult, StageError>;
}

/// `StepName -> Stage` mapping, populated explicitly at startup: no implicit
/// global registration. Steps with no entry are skipped by the orchestrator
/// with reason "No handler available".
pub type StageRegistry = HashMap<StepName, Arc<dyn Stage>>;
