//! The step graph: a typed, mutable record of one request's progress,
//! consumed only by the orchestrator. Every mutation here is a single,
//! atomic method call — there is no way to observe a step mid-transition
//! from outside this module.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{BodyPart, ProcessingMode, StepName, StepStatus, TriageLevel};
use crate::policy::PolicyConfig;

/// A single step's lifecycle record: identity, current status, timing, and
/// whatever it produced or failed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: StepName,
    pub status: StepStatus,
    pub confidence: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub artifacts: HashMap<String, String>,
}

impl Step {
    fn pending(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            confidence: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
            retry_count: 0,
            artifacts: HashMap::new(),
        }
    }
}

/// Error returned by step graph mutations that violate an invariant (a
/// duplicate step name, or an operation against a step that does not
/// exist). The orchestrator treats these as programming errors — they
/// never originate from request input.
#[derive(Debug, thiserror::Error)]
pub enum StepGraphError {
    #[error("step {0} already exists in this graph")]
    DuplicateStep(StepName),
    #[error("step {0} is not present in this graph")]
    UnknownStep(StepName),
}

/// The mutable state container for one request's pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepGraph {
    pub request_id: Uuid,
    pub mode: ProcessingMode,
    pub steps: Vec<Step>,
    pub partial: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub config_hash: String,
    pub thresholds: Value,
    pub timeouts: HashMap<StepName, u64>,
    pub detected_body_part: Option<BodyPart>,
    pub triage_level: Option<TriageLevel>,
}

impl StepGraph {
    pub fn new(
        request_id: Uuid,
        mode: ProcessingMode,
        config_hash: String,
        thresholds: Value,
        timeouts: HashMap<StepName, u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            mode,
            steps: Vec::new(),
            partial: false,
            created_at: now,
            updated_at: now,
            config_hash,
            thresholds,
            timeouts,
            detected_body_part: None,
            triage_level: None,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn add_step(&mut self, name: StepName) -> Result<(), StepGraphError> {
        if self.steps.iter().any(|s| s.name == name) {
            return Err(StepGraphError::DuplicateStep(name));
        }
        self.steps.push(Step::pending(name));
        self.touch();
        Ok(())
    }

    pub fn get_step(&self, name: StepName) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    fn get_step_mut(&mut self, name: StepName) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    pub fn start(&mut self, name: StepName, retry_count: u32) -> Result<(), StepGraphError> {
        let now = Utc::now();
        let step = self.get_step_mut(name).ok_or(StepGraphError::UnknownStep(name))?;
        step.status = StepStatus::Running;
        step.started_at = Some(now);
        step.completed_at = None;
        step.duration_ms = None;
        step.retry_count = retry_count;
        self.touch();
        Ok(())
    }

    fn finish(
        &mut self,
        name: StepName,
        status: StepStatus,
    ) -> Result<&mut Step, StepGraphError> {
        let now = Utc::now();
        let step = self.get_step_mut(name).ok_or(StepGraphError::UnknownStep(name))?;
        step.status = status;
        let started = step.started_at.unwrap_or(now);
        step.started_at = Some(started);
        step.completed_at = Some(now);
        step.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        Ok(step)
    }

    pub fn complete(
        &mut self,
        name: StepName,
        confidence: Option<f64>,
        artifacts: HashMap<String, String>,
    ) -> Result<(), StepGraphError> {
        let step = self.finish(name, StepStatus::Ok)?;
        step.confidence = confidence;
        step.artifacts = artifacts;
        self.touch();
        Ok(())
    }

    pub fn fail(&mut self, name: StepName, error_message: String) -> Result<(), StepGraphError> {
        let step = self.finish(name, StepStatus::Error)?;
        step.error_message = Some(error_message);
        self.touch();
        Ok(())
    }

    pub fn timeout(&mut self, name: StepName) -> Result<(), StepGraphError> {
        let step = self.finish(name, StepStatus::Timeout)?;
        step.error_message = Some("step timed out".to_string());
        self.touch();
        Ok(())
    }

    pub fn skip(&mut self, name: StepName, reason: String) -> Result<(), StepGraphError> {
        let now = Utc::now();
        let step = self.get_step_mut(name).ok_or(StepGraphError::UnknownStep(name))?;
        step.status = StepStatus::Skipped;
        step.error_message = Some(reason);
        step.completed_at = Some(now);
        self.touch();
        Ok(())
    }

    /// The only reset path: internally re-opens a terminal ERROR/TIMEOUT
    /// step back to PENDING so the orchestrator can re-attempt it. Never
    /// observed from outside a single retry loop iteration.
    pub fn reset_for_retry(&mut self, name: StepName) -> Result<(), StepGraphError> {
        let step = self.get_step_mut(name).ok_or(StepGraphError::UnknownStep(name))?;
        step.status = StepStatus::Pending;
        step.started_at = None;
        step.completed_at = None;
        step.duration_ms = None;
        step.error_message = None;
        self.touch();
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status.is_terminal())
    }

    pub fn has_fatal_error(&self, policy: &PolicyConfig) -> bool {
        self.steps.iter().any(|s| {
            matches!(s.status, StepStatus::Error | StepStatus::Timeout)
                && policy.step_policies.get(&s.name).map(|p| p.fatal_on_error).unwrap_or(false)
        })
    }

    pub fn successful_steps(&self) -> Vec<StepName> {
        self.steps.iter().filter(|s| s.status == StepStatus::Ok).map(|s| s.name).collect()
    }

    pub fn failed_steps(&self) -> Vec<StepName> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Error | StepStatus::Timeout))
            .map(|s| s.name)
            .collect()
    }

    /// Recomputes `partial`: true iff some step ended ERROR/TIMEOUT but no
    /// fatal-error step failed.
    pub fn recompute_partial(&mut self, policy: &PolicyConfig) {
        let any_failed = self
            .steps
            .iter()
            .any(|s| matches!(s.status, StepStatus::Error | StepStatus::Timeout));
        self.partial = any_failed && !self.has_fatal_error(policy);
    }

    /// Flattens every step's artifacts into one mapping, last-write-wins on
    /// key collisions — keys are step-scoped so this is not expected to
    /// matter in practice.
    pub fn all_artifacts(&self) -> HashMap<String, String> {
        let mut merged = HashMap::new();
        for step in &self.steps {
            for (key, value) in &step.artifacts {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyConfig;

    fn new_graph() -> StepGraph {
        StepGraph::new(
            Uuid::new_v4(),
            ProcessingMode::Auto,
            "deadbeefcafebabe".to_string(),
            Value::Null,
            HashMap::new(),
        )
    }

    #[test]
    fn add_step_then_duplicate_fails() {
        let mut graph = new_graph();
        graph.add_step(StepName::Validate).unwrap();
        let err = graph.add_step(StepName::Validate).unwrap_err();
        assert!(matches!(err, StepGraphError::DuplicateStep(StepName::Validate)));
    }

    #[test]
    fn start_then_complete_sets_duration_and_terminal_status() {
        let mut graph = new_graph();
        graph.add_step(StepName::Validate).unwrap();
        graph.start(StepName::Validate, 0).unwrap();
        graph.complete(StepName::Validate, Some(0.9), HashMap::new()).unwrap();
        let step = graph.get_step(StepName::Validate).unwrap();
        assert_eq!(step.status, StepStatus::Ok);
        assert!(step.started_at.is_some());
        assert!(step.completed_at.is_some());
        assert!(step.duration_ms.is_some());
    }

    #[test]
    fn is_complete_requires_every_step_terminal() {
        let mut graph = new_graph();
        graph.add_step(StepName::Validate).unwrap();
        assert!(!graph.is_complete());
        graph.start(StepName::Validate, 0).unwrap();
        assert!(!graph.is_complete());
        graph.complete(StepName::Validate, None, HashMap::new()).unwrap();
        assert!(graph.is_complete());
    }

    #[test]
    fn has_fatal_error_true_only_for_fatal_steps() {
        let policy = PolicyConfig::default();
        let mut graph = new_graph();
        graph.add_step(StepName::DetectHand).unwrap();
        graph.start(StepName::DetectHand, 0).unwrap();
        graph.fail(StepName::DetectHand, "boom".to_string()).unwrap();
        assert!(!graph.has_fatal_error(&policy));

        graph.add_step(StepName::Validate).unwrap();
        graph.start(StepName::Validate, 0).unwrap();
        graph.fail(StepName::Validate, "boom".to_string()).unwrap();
        assert!(graph.has_fatal_error(&policy));
    }

    #[test]
    fn recompute_partial_is_true_only_for_non_fatal_failure() {
        let policy = PolicyConfig::default();
        let mut graph = new_graph();
        graph.add_step(StepName::DetectHand).unwrap();
        graph.start(StepName::DetectHand, 0).unwrap();
        graph.timeout(StepName::DetectHand).unwrap();
        graph.recompute_partial(&policy);
        assert!(graph.partial);
    }

    #[test]
    fn reset_for_retry_clears_timestamps_and_error() {
        let mut graph = new_graph();
        graph.add_step(StepName::Route).unwrap();
        graph.start(StepName::Route, 0).unwrap();
        graph.fail(StepName::Route, "oops".to_string()).unwrap();
        graph.reset_for_retry(StepName::Route).unwrap();
        let step = graph.get_step(StepName::Route).unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.error_message.is_none());
        assert!(step.started_at.is_none());
    }
}
