//! Deterministic stub stages. These stand in for the real ML/LLM/PDF
//! collaborators this crate does not implement, so the CLI demo and the
//! integration tests have something concrete to run the orchestrator
//! against. None of them does real inference — `RouteStage` and the
//! detectors derive their output from substrings of the request's image
//! reference, which is a convenient, reproducible stand-in, not a model.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;

use crate::artifact_store::{ArtifactStore, Bucket};
use crate::errors::{StageError, StageErrorKind};
use crate::model::{BodyPart, Detection};
use crate::orchestrator::ProcessingRequest;
use crate::policy::PolicyConfig;
use crate::stage::{PipelineView, Stage, StageResult};
use crate::triage::{self, TriageOutcome};

/// Fails requests with an empty image reference; otherwise passes through.
pub struct ValidateStage;

#[async_trait]
impl Stage for ValidateStage {
    async fn run(
        &self,
        request: &ProcessingRequest,
        _view: &PipelineView<'_>,
        _policy: &PolicyConfig,
        _deadline: Instant,
    ) -> Result<StageResult, StageError> {
        if request.image_ref.trim().is_empty() {
            return Err(StageError::new(StageErrorKind::InvalidInput, "image_ref is empty"));
        }
        Ok(StageResult::new())
    }
}

/// Classifies body part by substring match on the image reference, falling
/// back to UNKNOWN. Confidence is fixed per branch so GUIDED-mode
/// low-confidence prompting is reachable with an image ref like
/// `"scan-ambiguous.png"`.
pub struct RouteStage;

#[async_trait]
impl Stage for RouteStage {
    async fn run(
        &self,
        request: &ProcessingRequest,
        _view: &PipelineView<'_>,
        _policy: &PolicyConfig,
        _deadline: Instant,
    ) -> Result<StageResult, StageError> {
        let lower = request.image_ref.to_lowercase();
        let (body_part, confidence) = if lower.contains("hand") {
            (BodyPart::Hand, 0.92)
        } else if lower.contains("leg") {
            (BodyPart::Leg, 0.90)
        } else {
            (BodyPart::Unknown, 0.41)
        };
        Ok(StageResult::new()
            .with_confidence(confidence)
            .with_extra("body_part", json!(body_part)))
    }
}

/// Returns no detections unless the image reference contains a recognized
/// fixture keyword, in which case it returns one canned `Detection`. This
/// keeps the demo deterministic without a synthetic `mock_*` detection list
/// living anywhere near production code paths.
pub struct DetectStage {
    keyword: &'static str,
    label: &'static str,
}

impl DetectStage {
    pub fn hand() -> Self {
        Self { keyword: "fracture", label: "displaced_fracture" }
    }

    pub fn leg() -> Self {
        Self { keyword: "fracture", label: "hairline_fracture" }
    }
}

#[async_trait]
impl Stage for DetectStage {
    async fn run(
        &self,
        request: &ProcessingRequest,
        _view: &PipelineView<'_>,
        _policy: &PolicyConfig,
        _deadline: Instant,
    ) -> Result<StageResult, StageError> {
        let detections: Vec<Detection> = if request.image_ref.to_lowercase().contains(self.keyword) {
            vec![Detection { label: self.label.to_string(), bbox: (10, 10, 50, 50), score: 0.8 }]
        } else {
            Vec::new()
        };
        Ok(StageResult::new().with_extra("detections", json!(detections)))
    }
}

fn detections_from(view: &PipelineView<'_>, step: crate::model::StepName) -> Vec<Detection> {
    view.extras_for(step)
        .and_then(|extras| extras.get("detections"))
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default()
}

/// Wraps the pure triage kernel. Never itself returns an error — the
/// orchestrator is the only place that can still produce an error outcome
/// for TRIAGE (e.g. cancellation).
pub struct TriageStage;

#[async_trait]
impl Stage for TriageStage {
    async fn run(
        &self,
        request: &ProcessingRequest,
        view: &PipelineView<'_>,
        policy: &PolicyConfig,
        _deadline: Instant,
    ) -> Result<StageResult, StageError> {
        let mut detections = detections_from(view, crate::model::StepName::DetectHand);
        detections.extend(detections_from(view, crate::model::StepName::DetectLeg));

        let outcome: TriageOutcome = triage::assess(
            &detections,
            request.symptoms.as_deref(),
            view.graph.detected_body_part,
            policy.triage_thresholds(),
        );

        Ok(StageResult::new()
            .with_confidence(outcome.confidence)
            .with_extra("level", json!(outcome.level))
            .with_extra("rationale", json!(outcome.rationale))
            .with_extra("score", json!(outcome.score))
            .with_extra("method", json!(outcome.method.to_string())))
    }
}

/// Stubbed clinical summary generator, standing in for the LLM-backed
/// diagnosis collaborator.
pub struct DiagnoseStage;

#[async_trait]
impl Stage for DiagnoseStage {
    async fn run(
        &self,
        _request: &ProcessingRequest,
        view: &PipelineView<'_>,
        _policy: &PolicyConfig,
        _deadline: Instant,
    ) -> Result<StageResult, StageError> {
        let level = view
            .graph
            .triage_level
            .map(|l| l.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let summary = format!("Automated pre-read: triage level {level}. Clinical correlation advised.");
        Ok(StageResult::new().with_extra("summary", json!(summary)))
    }
}

/// Persists a JSON manifest and a placeholder PDF via the artifact store —
/// the only stub stage that actually touches `ArtifactStore`, since report
/// rendering is the step the spec ties artifacts to most directly.
pub struct ReportStage {
    store: Arc<dyn ArtifactStore>,
}

impl ReportStage {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for ReportStage {
    async fn run(
        &self,
        request: &ProcessingRequest,
        view: &PipelineView<'_>,
        _policy: &PolicyConfig,
        _deadline: Instant,
    ) -> Result<StageResult, StageError> {
        let manifest = json!({
            "request_id": view.graph.request_id,
            "triage_level": view.graph.triage_level,
            "body_part": view.graph.detected_body_part,
            "image_ref": request.image_ref,
        });
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| StageError::internal(format!("failed to serialize manifest: {e}")))?;

        let json_id = self
            .store
            .put(Bucket::Manifests, manifest_bytes, "json")
            .await
            .map_err(|e| StageError::new(StageErrorKind::Temporary, e.to_string()))?;

        let pdf_id = self
            .store
            .put(Bucket::Reports, b"%PDF-1.4 placeholder report\n".to_vec(), "pdf")
            .await
            .map_err(|e| StageError::new(StageErrorKind::Temporary, e.to_string()))?;

        Ok(StageResult::new()
            .with_artifact("json_manifest", json_id.clone())
            .with_artifact("pdf_report", pdf_id.clone())
            .with_extra("json_id", json!(json_id))
            .with_extra("pdf_id", json!(pdf_id)))
    }
}

/// Stubbed nearby-hospital lookup, standing in for the geolocation/maps
/// collaborator.
pub struct HospitalsStage;

#[async_trait]
impl Stage for HospitalsStage {
    async fn run(
        &self,
        _request: &ProcessingRequest,
        _view: &PipelineView<'_>,
        _policy: &PolicyConfig,
        _deadline: Instant,
    ) -> Result<StageResult, StageError> {
        let hospitals = json!([
            { "name": "General Hospital", "distance_km": 2.3 },
            { "name": "Regional Trauma Center", "distance_km": 5.1 },
        ]);
        Ok(StageResult::new().with_extra("hospitals", hospitals))
    }
}

/// Builds the default registry used by the CLI demo and most integration
/// tests, wired against `store`.
pub fn default_registry(store: Arc<dyn ArtifactStore>) -> HashMap<crate::model::StepName, Arc<dyn Stage>> {
    use crate::model::StepName::*;
    let mut registry: HashMap<crate::model::StepName, Arc<dyn Stage>> = HashMap::new();
    registry.insert(Validate, Arc::new(ValidateStage));
    registry.insert(Route, Arc::new(RouteStage));
    registry.insert(DetectHand, Arc::new(DetectStage::hand()));
    registry.insert(DetectLeg, Arc::new(DetectStage::leg()));
    registry.insert(Triage, Arc::new(TriageStage));
    registry.insert(Diagnose, Arc::new(DiagnoseStage));
    registry.insert(Report, Arc::new(ReportStage::new(store)));
    registry.insert(Hospitals, Arc::new(HospitalsStage));
    registry
}
