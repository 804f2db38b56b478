//! The top-level executor: builds a step graph from a request, drives stage
//! execution under per-step deadlines and retries, applies mode-specific
//! control flow, and assembles the final response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::artifact_store::ArtifactStore;
use crate::errors::{OrchestratorError, PolicyError};
use crate::model::{BodyPart, ProcessingMode, StepName, StepStatus, TriageLevel};
use crate::policy::{PolicyConfig, PolicyRegistry};
use crate::stage::{PipelineView, StageRegistry, StageResult};
#[cfg(test)]
use crate::stage::Stage;
use crate::step_graph::StepGraph;
use crate::telemetry::{TelemetryEvent, TelemetryEventKind, TelemetryHooks};
use crate::triage::TriageOutcome;

/// The fixed sequence every request shares. Detector steps are added
/// dynamically once ROUTE completes.
const BASE_SEQUENCE: [StepName; 5] =
    [StepName::Validate, StepName::Route, StepName::Triage, StepName::Diagnose, StepName::Report];

/// Input to [`Orchestrator::process`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRequest {
    pub image_ref: String,
    pub mode: ProcessingMode,
    #[serde(default)]
    pub symptoms: Option<String>,
    #[serde(default)]
    pub consents: HashMap<String, bool>,
    #[serde(default)]
    pub overrides: Option<Value>,
}

/// A point where the pipeline made forward progress on the orchestrator's
/// own judgment rather than blocking on a human, while still surfacing the
/// choice for review.
#[derive(Debug, Clone, Serialize)]
pub struct GuidedPrompt {
    pub step_name: StepName,
    pub prompt_type: String,
    pub message: String,
    pub options: Vec<String>,
    pub confidence: Option<f64>,
}

/// The assembled result of one `process` call.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingResponse {
    pub request_id: Uuid,
    pub step_graph: StepGraph,
    pub triage_result: Option<Value>,
    pub diagnosis_result: Option<Value>,
    pub report_manifest: Option<Value>,
    pub hospitals_result: Option<Value>,
    pub artifacts: HashMap<String, String>,
    pub guided_prompts: Vec<GuidedPrompt>,
}

/// A row of `list_active`.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub request_id: Uuid,
    pub mode: ProcessingMode,
    pub status: &'static str,
    pub partial: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub steps_completed: usize,
    pub steps_total: usize,
    pub detected_body_part: Option<BodyPart>,
    pub triage_level: Option<TriageLevel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupCounts {
    pub steps_removed: usize,
    pub artifacts_removed: usize,
}

fn overall_status(graph: &StepGraph) -> &'static str {
    let any_failed = graph.steps.iter().any(|s| matches!(s.status, StepStatus::Error | StepStatus::Timeout));
    if any_failed && !graph.partial {
        "failed"
    } else if graph.partial {
        "partial"
    } else {
        "completed"
    }
}

/// Projects a stage's `extras` onto the fields the step graph promotes to
/// first-class status.
fn project_extras(graph: &mut StepGraph, name: StepName, extras: &serde_json::Map<String, Value>) {
    match name {
        StepName::Route => {
            if let Some(body_part) =
                extras.get("body_part").and_then(|v| serde_json::from_value::<BodyPart>(v.clone()).ok())
            {
                graph.detected_body_part = Some(body_part);
            }
        }
        StepName::Triage => {
            if let Some(level) =
                extras.get("level").and_then(|v| serde_json::from_value::<TriageLevel>(v.clone()).ok())
            {
                graph.triage_level = Some(level);
            }
        }
        _ => {}
    }
}

/// Merges a stage's confidence and extras into one JSON value for the
/// response's semantic fields (triage_result, diagnosis_result, etc).
fn stage_value(outputs: &HashMap<StepName, StageResult>, step: StepName) -> Option<Value> {
    outputs.get(&step).map(|result| {
        let mut object = result.extras.clone();
        if let Some(confidence) = result.confidence {
            object.insert("confidence".to_string(), json!(confidence));
        }
        Value::Object(object)
    })
}

fn triage_outcome_value(outcome: &TriageOutcome) -> Value {
    json!({
        "level": outcome.level,
        "rationale": outcome.rationale,
        "confidence": outcome.confidence,
        "score": outcome.score,
        "method": outcome.method.to_string(),
    })
}

/// The request orchestration engine. One instance is shared across all
/// requests; each call to `process` runs its own sequential+fan-out control
/// flow over a step graph that lives only for the duration of that call
/// (then moves into `active_requests` until `cleanup`).
pub struct Orchestrator {
    policy_registry: Arc<PolicyRegistry>,
    stage_registry: Arc<StageRegistry>,
    artifact_store: Arc<dyn ArtifactStore>,
    telemetry: Arc<dyn TelemetryHooks>,
    active_requests: Arc<RwLock<HashMap<Uuid, StepGraph>>>,
}

impl Orchestrator {
    pub fn new(
        policy_registry: Arc<PolicyRegistry>,
        stage_registry: Arc<StageRegistry>,
        artifact_store: Arc<dyn ArtifactStore>,
        telemetry: Arc<dyn TelemetryHooks>,
    ) -> Self {
        Self {
            policy_registry,
            stage_registry,
            artifact_store,
            telemetry,
            active_requests: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn emit(
        &self,
        request_id: Uuid,
        kind: TelemetryEventKind,
        step_name: Option<StepName>,
        duration_ms: Option<u64>,
        config_hash: &str,
        metadata: HashMap<String, String>,
    ) {
        self.telemetry.emit(TelemetryEvent {
            request_id,
            kind,
            step_name,
            duration_ms,
            config_hash: config_hash.to_string(),
            metadata,
        });
    }

    /// Drives one step through its attempt/retry loop. Takes the graph and
    /// prior outputs behind `Mutex` rather than `&mut` so concurrent
    /// detector fan-out can call this twice with `tokio::join!` — each
    /// attempt only holds the lock for the mutation itself, never across
    /// the stage invocation.
    async fn run_step(
        &self,
        request: &ProcessingRequest,
        policy: &PolicyConfig,
        request_id: Uuid,
        graph: &Mutex<StepGraph>,
        outputs: &Mutex<HashMap<StepName, StageResult>>,
        name: StepName,
    ) {
        let Some(stage) = self.stage_registry.get(&name).cloned() else {
            let _ = graph.lock().await.skip(name, "No handler available".to_string());
            self.emit(request_id, TelemetryEventKind::StepSkipped, Some(name), None, &policy.config_hash, HashMap::new());
            return;
        };

        let mut attempt = 0u32;
        loop {
            let (snapshot_graph, snapshot_outputs) = {
                let g = graph.lock().await;
                let o = outputs.lock().await;
                (g.clone(), o.clone())
            };
            let view = PipelineView::new(&snapshot_graph, &snapshot_outputs);

            if graph.lock().await.start(name, attempt).is_err() {
                return;
            }
            self.emit(request_id, TelemetryEventKind::StepStart, Some(name), None, &policy.config_hash, HashMap::new());

            let timeout_secs = self.policy_registry.step_timeout(request_id, name).await.max(1);
            let deadline = Instant::now() + Duration::from_secs(timeout_secs);
            let started = Instant::now();

            let attempt_result =
                tokio::time::timeout(Duration::from_secs(timeout_secs), stage.run(request, &view, policy, deadline)).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match attempt_result {
                Err(_elapsed) => {
                    let _ = graph.lock().await.timeout(name);
                    let mut metadata = HashMap::new();
                    metadata.insert("error_message".to_string(), "step timed out".to_string());
                    self.emit(request_id, TelemetryEventKind::StepFailed, Some(name), Some(elapsed_ms), &policy.config_hash, metadata);
                    if self.policy_registry.should_retry(request_id, name, attempt, true).await {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        let _ = graph.lock().await.reset_for_retry(name);
                        attempt += 1;
                        continue;
                    }
                    return;
                }
                Ok(Err(stage_error)) => {
                    let _ = graph.lock().await.fail(name, stage_error.message.clone());
                    let mut metadata = HashMap::new();
                    metadata.insert("error_message".to_string(), stage_error.message.clone());
                    self.emit(request_id, TelemetryEventKind::StepFailed, Some(name), Some(elapsed_ms), &policy.config_hash, metadata);
                    let transient = stage_error.kind.is_transient();
                    if self.policy_registry.should_retry(request_id, name, attempt, transient).await {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        let _ = graph.lock().await.reset_for_retry(name);
                        attempt += 1;
                        continue;
                    }
                    return;
                }
                Ok(Ok(result)) => {
                    {
                        let mut g = graph.lock().await;
                        let _ = g.complete(name, result.confidence, result.artifacts.clone());
                        project_extras(&mut g, name, &result.extras);
                    }
                    outputs.lock().await.insert(name, result);
                    let mut metadata = HashMap::new();
                    if let Some(symptoms) = &request.symptoms {
                        metadata.insert("symptoms".to_string(), symptoms.clone());
                    }
                    self.emit(request_id, TelemetryEventKind::StepComplete, Some(name), Some(elapsed_ms), &policy.config_hash, metadata);
                    return;
                }
            }
        }
    }

    async fn skip_pending(&self, graph: &Mutex<StepGraph>, reason: &str) {
        let mut g = graph.lock().await;
        let pending: Vec<StepName> =
            g.steps.iter().filter(|s| s.status == StepStatus::Pending).map(|s| s.name).collect();
        for name in pending {
            let _ = g.skip(name, reason.to_string());
        }
    }

    async fn halted(&self, graph: &Mutex<StepGraph>, policy: &PolicyConfig) -> bool {
        graph.lock().await.has_fatal_error(policy)
    }

    /// Runs one request from validation through response assembly.
    pub async fn process(&self, request: ProcessingRequest) -> Result<ProcessingResponse, OrchestratorError> {
        let request_id = Uuid::new_v4();
        self.emit(request_id, TelemetryEventKind::RequestStart, None, None, "", HashMap::new());

        let policy = self
            .policy_registry
            .config_for(request_id, request.mode, request.overrides.as_ref())
            .await
            .map_err(PolicyError)
            .map_err(OrchestratorError::Validation)?;

        let mut graph_inner =
            StepGraph::new(request_id, request.mode, policy.config_hash.clone(), policy.thresholds_snapshot(), policy.timeouts_snapshot());
        for name in BASE_SEQUENCE {
            graph_inner.add_step(name).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        }

        let has_geo_consent = request.consents.get("geolocation").copied().unwrap_or(false);
        let include_hospitals = has_geo_consent || request.mode == ProcessingMode::Guided;
        if include_hospitals {
            graph_inner.add_step(StepName::Hospitals).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
        }

        let graph = Mutex::new(graph_inner);
        let outputs: Mutex<HashMap<StepName, StageResult>> = Mutex::new(HashMap::new());
        let mut guided_prompts = Vec::new();

        self.run_step(&request, &policy, request_id, &graph, &outputs, StepName::Validate).await;
        if self.halted(&graph, &policy).await {
            self.skip_pending(&graph, "pipeline halted after fatal error in validate").await;
            return Ok(self.finish(request_id, graph, outputs, guided_prompts).await);
        }

        self.run_step(&request, &policy, request_id, &graph, &outputs, StepName::Route).await;
        if self.halted(&graph, &policy).await {
            self.skip_pending(&graph, "pipeline halted after fatal error in route").await;
            return Ok(self.finish(request_id, graph, outputs, guided_prompts).await);
        }

        let (body_part, route_confidence) = {
            let g = graph.lock().await;
            (g.detected_body_part, g.get_step(StepName::Route).and_then(|s| s.confidence))
        };
        let low_confidence = route_confidence.map(|c| c < policy.router_threshold).unwrap_or(false);
        if request.mode == ProcessingMode::Guided && low_confidence {
            guided_prompts.push(GuidedPrompt {
                step_name: StepName::Route,
                prompt_type: "low_confidence".to_string(),
                message: format!(
                    "Routing confidence {:.2} is below threshold {:.2}; defaulting to running both detectors",
                    route_confidence.unwrap_or(0.0),
                    policy.router_threshold
                ),
                options: vec!["hand".to_string(), "leg".to_string(), "both".to_string()],
                confidence: route_confidence,
            });
        }

        let run_both = matches!(body_part, None | Some(BodyPart::Unknown)) || (request.mode == ProcessingMode::Guided && low_confidence);
        if run_both {
            {
                let mut g = graph.lock().await;
                let _ = g.add_step(StepName::DetectHand);
                let _ = g.add_step(StepName::DetectLeg);
            }
            tokio::join!(
                self.run_step(&request, &policy, request_id, &graph, &outputs, StepName::DetectHand),
                self.run_step(&request, &policy, request_id, &graph, &outputs, StepName::DetectLeg),
            );
        } else {
            let only = if body_part == Some(BodyPart::Leg) { StepName::DetectLeg } else { StepName::DetectHand };
            graph.lock().await.add_step(only).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
            self.run_step(&request, &policy, request_id, &graph, &outputs, only).await;
        }

        self.run_step(&request, &policy, request_id, &graph, &outputs, StepName::Triage).await;
        self.run_step(&request, &policy, request_id, &graph, &outputs, StepName::Diagnose).await;
        self.run_step(&request, &policy, request_id, &graph, &outputs, StepName::Report).await;

        if include_hospitals {
            if has_geo_consent {
                self.run_step(&request, &policy, request_id, &graph, &outputs, StepName::Hospitals).await;
            } else {
                guided_prompts.push(GuidedPrompt {
                    step_name: StepName::Hospitals,
                    prompt_type: "consent_required".to_string(),
                    message: "Geolocation consent is required to search nearby hospitals".to_string(),
                    options: vec!["grant".to_string(), "decline".to_string()],
                    confidence: None,
                });
                let _ = graph.lock().await.skip(StepName::Hospitals, "Geolocation consent not provided".to_string());
            }
        }

        Ok(self.finish(request_id, graph, outputs, guided_prompts).await)
    }

    async fn finish(
        &self,
        request_id: Uuid,
        graph: Mutex<StepGraph>,
        outputs: Mutex<HashMap<StepName, StageResult>>,
        guided_prompts: Vec<GuidedPrompt>,
    ) -> ProcessingResponse {
        let mut graph = graph.into_inner();
        let config_hash = graph.config_hash.clone();
        // recompute_partial needs a PolicyConfig only for fatal_on_error
        // lookups, which are immutable per-step facts already reflected in
        // which steps got skipped above; a request-scoped default suffices
        // here since the step table itself never varies across policy
        // instances.
        let policy = self.policy_registry.default_config();
        graph.recompute_partial(&policy);

        let outputs = outputs.into_inner();

        let triage_result = match graph.get_step(StepName::Triage).map(|s| s.status) {
            Some(StepStatus::Ok) => stage_value(&outputs, StepName::Triage),
            Some(StepStatus::Error) => {
                graph.partial = true;
                Some(triage_outcome_value(&TriageOutcome::error_fallback()))
            }
            _ => None,
        };
        let diagnosis_result = stage_value(&outputs, StepName::Diagnose);
        let report_manifest = stage_value(&outputs, StepName::Report);
        let hospitals_result = stage_value(&outputs, StepName::Hospitals);
        let artifacts = graph.all_artifacts();

        self.emit(request_id, TelemetryEventKind::RequestComplete, None, None, &config_hash, HashMap::new());
        self.active_requests.write().await.insert(request_id, graph.clone());

        ProcessingResponse {
            request_id,
            step_graph: graph,
            triage_result,
            diagnosis_result,
            report_manifest,
            hospitals_result,
            artifacts,
            guided_prompts,
        }
    }

    pub async fn status(&self, request_id: Uuid) -> Option<StepGraph> {
        self.active_requests.read().await.get(&request_id).cloned()
    }

    /// Most-recent-first, bounded to 50.
    pub async fn list_active(&self) -> Vec<RequestSummary> {
        let map = self.active_requests.read().await;
        let mut items: Vec<RequestSummary> = map
            .values()
            .map(|g| RequestSummary {
                request_id: g.request_id,
                mode: g.mode,
                status: overall_status(g),
                partial: g.partial,
                created_at: g.created_at,
                updated_at: g.updated_at,
                steps_completed: g.successful_steps().len(),
                steps_total: g.steps.len(),
                detected_body_part: g.detected_body_part,
                triage_level: g.triage_level,
            })
            .collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        items.truncate(50);
        items
    }

    pub async fn cleanup(&self, request_id: Uuid) -> CleanupCounts {
        let removed_graph = self.active_requests.write().await.remove(&request_id);
        self.policy_registry.release(request_id).await;
        match removed_graph {
            Some(g) => {
                let artifacts = g.all_artifacts();
                let mut artifacts_removed = 0usize;
                for artifact_id in artifacts.values() {
                    if self.artifact_store.delete(artifact_id).await.unwrap_or(false) {
                        artifacts_removed += 1;
                    }
                }
                CleanupCounts { steps_removed: g.steps.len(), artifacts_removed }
            }
            None => CleanupCounts { steps_removed: 0, artifacts_removed: 0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::artifact_store::LocalArtifactStore;
    use crate::errors::StageError;
    use crate::model::Detection;
    use crate::stage::stub::{default_registry, DiagnoseStage, ReportStage, TriageStage, ValidateStage};
    use crate::telemetry::NoopTelemetryHooks;

    fn orchestrator(store_dir: &std::path::Path) -> Orchestrator {
        let store: Arc<dyn ArtifactStore> = Arc::new(LocalArtifactStore::new(store_dir));
        let registry = Arc::new(default_registry(store.clone()));
        Orchestrator::new(Arc::new(PolicyRegistry::new()), registry, store, Arc::new(NoopTelemetryHooks))
    }

    /// Always reports the given body part and confidence, ignoring the request.
    struct FixedRouteStage {
        body_part: BodyPart,
        confidence: f64,
    }

    #[async_trait]
    impl Stage for FixedRouteStage {
        async fn run(
            &self,
            _request: &ProcessingRequest,
            _view: &PipelineView<'_>,
            _policy: &PolicyConfig,
            _deadline: Instant,
        ) -> Result<StageResult, StageError> {
            Ok(StageResult::new().with_confidence(self.confidence).with_extra("body_part", json!(self.body_part)))
        }
    }

    /// Always returns the given fixed set of detections.
    struct FixedDetectStage {
        detections: Vec<Detection>,
    }

    #[async_trait]
    impl Stage for FixedDetectStage {
        async fn run(
            &self,
            _request: &ProcessingRequest,
            _view: &PipelineView<'_>,
            _policy: &PolicyConfig,
            _deadline: Instant,
        ) -> Result<StageResult, StageError> {
            Ok(StageResult::new().with_extra("detections", json!(self.detections.clone())))
        }
    }

    /// Never completes before its own deadline, so the orchestrator's outer
    /// `tokio::time::timeout` always wins. Exercises the exhausted-retry
    /// timeout path without waiting on anything nondeterministic.
    struct AlwaysTimesOutStage;

    #[async_trait]
    impl Stage for AlwaysTimesOutStage {
        async fn run(
            &self,
            _request: &ProcessingRequest,
            _view: &PipelineView<'_>,
            _policy: &PolicyConfig,
            deadline: Instant,
        ) -> Result<StageResult, StageError> {
            tokio::time::sleep_until(deadline + Duration::from_secs(60)).await;
            Ok(StageResult::new())
        }
    }

    fn base_registry(store: Arc<dyn ArtifactStore>) -> HashMap<StepName, Arc<dyn Stage>> {
        let mut registry: StageRegistry = HashMap::new();
        registry.insert(StepName::Validate, Arc::new(ValidateStage));
        registry.insert(StepName::Triage, Arc::new(TriageStage));
        registry.insert(StepName::Diagnose, Arc::new(DiagnoseStage));
        registry.insert(StepName::Report, Arc::new(ReportStage::new(store)));
        registry
    }

    fn orchestrator_with_registry(registry: StageRegistry, store_dir: &std::path::Path) -> Orchestrator {
        let store: Arc<dyn ArtifactStore> = Arc::new(LocalArtifactStore::new(store_dir));
        Orchestrator::new(Arc::new(PolicyRegistry::new()), Arc::new(registry), store, Arc::new(NoopTelemetryHooks))
    }

    fn detection(label: &str, score: f64) -> Detection {
        Detection { label: label.to_string(), bbox: (10, 10, 50, 50), score }
    }

    fn request(image_ref: &str, mode: ProcessingMode, symptoms: Option<&str>) -> ProcessingRequest {
        ProcessingRequest {
            image_ref: image_ref.to_string(),
            mode,
            symptoms: symptoms.map(|s| s.to_string()),
            consents: HashMap::new(),
            overrides: None,
        }
    }

    #[tokio::test]
    async fn auto_mode_hand_fracture_with_severe_pain_is_red() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let response = orch
            .process(request("hand-fracture.png", ProcessingMode::Auto, Some("severe pain")))
            .await
            .unwrap();
        assert_eq!(response.step_graph.triage_level, Some(TriageLevel::Red));
        assert!(!response.step_graph.partial);
        for name in [StepName::Validate, StepName::Route, StepName::DetectHand, StepName::Triage, StepName::Diagnose, StepName::Report] {
            assert_eq!(response.step_graph.get_step(name).unwrap().status, StepStatus::Ok);
        }
        assert!(response.step_graph.get_step(StepName::DetectLeg).is_none());
    }

    #[tokio::test]
    async fn validate_failure_halts_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let response = orch.process(request("", ProcessingMode::Auto, None)).await.unwrap();
        assert_eq!(response.step_graph.get_step(StepName::Validate).unwrap().status, StepStatus::Error);
        assert_eq!(response.step_graph.get_step(StepName::Route).unwrap().status, StepStatus::Skipped);
        assert!(!response.step_graph.partial);
        assert!(response.triage_result.is_none());
        assert!(response.artifacts.is_empty());
    }

    #[tokio::test]
    async fn unknown_route_runs_both_detectors_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let response = orch.process(request("scan-ambiguous.png", ProcessingMode::Auto, None)).await.unwrap();
        assert_eq!(response.step_graph.get_step(StepName::DetectHand).unwrap().status, StepStatus::Ok);
        assert_eq!(response.step_graph.get_step(StepName::DetectLeg).unwrap().status, StepStatus::Ok);
    }

    #[tokio::test]
    async fn guided_mode_low_confidence_route_records_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let response = orch.process(request("scan-ambiguous.png", ProcessingMode::Guided, None)).await.unwrap();
        assert!(response.guided_prompts.iter().any(|p| p.step_name == StepName::Route && p.prompt_type == "low_confidence"));
    }

    #[tokio::test]
    async fn guided_mode_missing_geolocation_consent_skips_hospitals_with_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let response = orch.process(request("hand.png", ProcessingMode::Guided, None)).await.unwrap();
        assert_eq!(response.step_graph.get_step(StepName::Hospitals).unwrap().status, StepStatus::Skipped);
        assert!(response.guided_prompts.iter().any(|p| p.prompt_type == "consent_required"));
    }

    #[tokio::test]
    async fn hospitals_omitted_entirely_in_auto_mode_without_consent() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let response = orch.process(request("hand.png", ProcessingMode::Auto, None)).await.unwrap();
        assert!(response.step_graph.get_step(StepName::Hospitals).is_none());
    }

    #[tokio::test]
    async fn advanced_mode_overrides_change_config_hash_and_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let mut req = request("hand.png", ProcessingMode::Advanced, None);
        req.overrides = Some(json!({ "router_threshold": 0.95, "timeout_overrides": { "detect": 1 } }));
        let response = orch.process(req).await.unwrap();
        assert_ne!(response.step_graph.config_hash, PolicyRegistry::new().default_config().config_hash);
        assert_eq!(response.step_graph.timeouts.get(&StepName::DetectHand), Some(&1));
    }

    #[tokio::test]
    async fn cleanup_removes_graph_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        let response = orch.process(request("hand-fracture.png", ProcessingMode::Auto, None)).await.unwrap();
        let counts = orch.cleanup(response.request_id).await;
        assert!(counts.steps_removed > 0);
        assert!(orch.status(response.request_id).await.is_none());
    }

    #[tokio::test]
    async fn list_active_is_bounded_and_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(dir.path());
        for _ in 0..3 {
            orch.process(request("hand.png", ProcessingMode::Auto, None)).await.unwrap();
        }
        let summaries = orch.list_active().await;
        assert_eq!(summaries.len(), 3);
        for pair in summaries.windows(2) {
            assert!(pair[0].updated_at >= pair[1].updated_at);
        }
    }

    /// HAND routing, one severe displaced fracture, severe pain symptom ->
    /// RED, score >= 0.75, full sequence OK, not partial.
    #[tokio::test]
    async fn hand_fracture_with_severe_pain_is_red() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = base_registry(Arc::new(LocalArtifactStore::new(dir.path())));
        registry.insert(StepName::Route, Arc::new(FixedRouteStage { body_part: BodyPart::Hand, confidence: 0.92 }));
        registry.insert(StepName::DetectHand, Arc::new(FixedDetectStage { detections: vec![detection("displaced_fracture", 0.88)] }));
        let orch = orchestrator_with_registry(registry, dir.path());

        let response = orch.process(request("scan.png", ProcessingMode::Auto, Some("severe pain"))).await.unwrap();

        assert_eq!(response.step_graph.triage_level, Some(TriageLevel::Red));
        let score = response.triage_result.as_ref().unwrap().get("score").unwrap().as_f64().unwrap();
        assert!(score >= 0.75);
        for name in [StepName::Validate, StepName::Route, StepName::DetectHand, StepName::Triage, StepName::Diagnose, StepName::Report] {
            assert_eq!(response.step_graph.get_step(name).unwrap().status, StepStatus::Ok);
        }
        assert!(!response.step_graph.partial);
    }

    /// UNKNOWN routing runs both detectors; only DETECT_LEG finds anything.
    /// The canonical formula (0.7*0.55 + 0.3*0.05 = 0.40) lands exactly on
    /// the default AMBER cutoff, so the assertion is computed, not
    /// hard-coded.
    #[tokio::test]
    async fn unknown_route_runs_both_detectors_score_from_formula() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = base_registry(Arc::new(LocalArtifactStore::new(dir.path())));
        registry.insert(StepName::Route, Arc::new(FixedRouteStage { body_part: BodyPart::Unknown, confidence: 0.41 }));
        registry.insert(StepName::DetectHand, Arc::new(FixedDetectStage { detections: vec![] }));
        registry.insert(StepName::DetectLeg, Arc::new(FixedDetectStage { detections: vec![detection("hairline_fracture", 0.55)] }));
        let orch = orchestrator_with_registry(registry, dir.path());

        let response = orch.process(request("scan.png", ProcessingMode::Auto, None)).await.unwrap();

        assert_eq!(response.step_graph.get_step(StepName::DetectHand).unwrap().status, StepStatus::Ok);
        assert_eq!(response.step_graph.get_step(StepName::DetectLeg).unwrap().status, StepStatus::Ok);

        let expected_score = 0.7 * 0.55 + 0.3 * 0.05;
        let score = response.triage_result.as_ref().unwrap().get("score").unwrap().as_f64().unwrap();
        assert!((score - expected_score).abs() < 1e-9);
        assert_eq!(response.step_graph.triage_level, Some(TriageLevel::Amber));
    }

    /// DETECT_HAND exhausts its single retry on timeout. TRIAGE still runs
    /// off the empty detection set and the response carries `partial = true`
    /// with no fatal error, since DETECT_HAND is not `fatal_on_error`.
    ///
    /// This test blocks on two real 12s step timeouts (the default
    /// DETECT_HAND budget) plus the 0.5s inter-attempt backoff — there is no
    /// override path in AUTO mode to shorten it, and shortening the
    /// fixture's own sleep wouldn't exercise the timeout path at all.
    #[tokio::test]
    async fn detect_hand_timeout_exhausts_retry_and_triage_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = base_registry(Arc::new(LocalArtifactStore::new(dir.path())));
        registry.insert(StepName::Route, Arc::new(FixedRouteStage { body_part: BodyPart::Hand, confidence: 0.92 }));
        registry.insert(StepName::DetectHand, Arc::new(AlwaysTimesOutStage));
        let orch = orchestrator_with_registry(registry, dir.path());

        let response = orch.process(request("scan.png", ProcessingMode::Auto, None)).await.unwrap();

        let detect = response.step_graph.get_step(StepName::DetectHand).unwrap();
        assert_eq!(detect.status, StepStatus::Timeout);
        assert_eq!(detect.retry_count, 1);
        assert_eq!(response.step_graph.get_step(StepName::Triage).unwrap().status, StepStatus::Ok);
        assert!(response.step_graph.partial);
    }

    /// VALIDATE fails fatally. Everything downstream stays out of a
    /// PENDING/RUNNING state (it's SKIPPED), no artifacts are produced, and
    /// the response is not `partial` (a halt is a clean stop, not a partial
    /// one).
    #[tokio::test]
    async fn validate_failure_halts_pipeline_with_no_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let registry = base_registry(Arc::new(LocalArtifactStore::new(dir.path())));
        let orch = orchestrator_with_registry(registry, dir.path());

        let response = orch.process(request("", ProcessingMode::Auto, None)).await.unwrap();

        let validate = response.step_graph.get_step(StepName::Validate).unwrap();
        assert_eq!(validate.status, StepStatus::Error);
        assert!(validate.error_message.is_some());
        for step in &response.step_graph.steps {
            assert!(step.status == StepStatus::Error || step.status == StepStatus::Skipped);
        }
        assert!(!response.step_graph.partial);
        assert!(response.artifacts.is_empty());
    }

    /// ADVANCED-mode overrides change the effective policy. Both detector
    /// timeouts drop to 1s, the config hash moves off the default, and the
    /// step graph's snapshots reflect the override.
    #[tokio::test]
    async fn advanced_overrides_change_hash_and_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = base_registry(Arc::new(LocalArtifactStore::new(dir.path())));
        registry.insert(StepName::Route, Arc::new(FixedRouteStage { body_part: BodyPart::Hand, confidence: 0.92 }));
        registry.insert(StepName::DetectHand, Arc::new(FixedDetectStage { detections: vec![] }));
        let orch = orchestrator_with_registry(registry, dir.path());

        let mut req = request("scan.png", ProcessingMode::Advanced, None);
        req.overrides = Some(json!({ "router_threshold": 0.95, "timeout_overrides": { "detect": 1 } }));
        let response = orch.process(req).await.unwrap();

        let default_hash = PolicyRegistry::new().default_config().config_hash.clone();
        assert_ne!(response.step_graph.config_hash, default_hash);
        assert_eq!(response.step_graph.timeouts.get(&StepName::DetectHand), Some(&1));
        assert_eq!(response.step_graph.timeouts.get(&StepName::DetectLeg), Some(&1));
    }

    /// GUIDED mode, low-confidence routing and missing geolocation consent
    /// together. Both prompts are recorded, HOSPITALS ends SKIPPED (not
    /// omitted, since GUIDED always seeds it), both detectors run, and every
    /// other step completes normally.
    #[tokio::test]
    async fn guided_mode_records_both_prompts_and_skips_hospitals() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = base_registry(Arc::new(LocalArtifactStore::new(dir.path())));
        registry.insert(StepName::Route, Arc::new(FixedRouteStage { body_part: BodyPart::Unknown, confidence: 0.50 }));
        registry.insert(StepName::DetectHand, Arc::new(FixedDetectStage { detections: vec![detection("hairline_fracture", 0.4)] }));
        registry.insert(StepName::DetectLeg, Arc::new(FixedDetectStage { detections: vec![] }));
        let orch = orchestrator_with_registry(registry, dir.path());

        let response = orch.process(request("scan.png", ProcessingMode::Guided, None)).await.unwrap();

        assert!(response.guided_prompts.iter().any(|p| p.step_name == StepName::Route && p.prompt_type == "low_confidence"));
        assert!(response.guided_prompts.iter().any(|p| p.step_name == StepName::Hospitals && p.prompt_type == "consent_required"));
        assert_eq!(response.step_graph.get_step(StepName::Hospitals).unwrap().status, StepStatus::Skipped);
        assert_eq!(response.step_graph.get_step(StepName::DetectHand).unwrap().status, StepStatus::Ok);
        assert_eq!(response.step_graph.get_step(StepName::DetectLeg).unwrap().status, StepStatus::Ok);
        for name in [StepName::Validate, StepName::Route, StepName::Triage, StepName::Diagnose, StepName::Report] {
            assert_eq!(response.step_graph.get_step(name).unwrap().status, StepStatus::Ok);
        }
    }
}
