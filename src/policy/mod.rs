//! The policy & gates subsystem: a default, versioned `PolicyConfig`, and a
//! `PolicyRegistry` that derives per-request configs from overrides (only
//! honored in ADVANCED mode), computes a stable content hash, and answers
//! the retry/timeout/fatal/skip questions the orchestrator asks during
//! execution.
//!
//! `PolicyConfig` is immutable once built: `apply_overrides` returns a new
//! instance and the hash is computed once at construction, never mutated
//! in place.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{ProcessingMode, RetryPolicy, StepName};
use crate::triage::TriageThresholds;

/// Per-step execution policy: how long a step gets, how it retries on
/// failure, whether its failure is fatal to the whole request, and whether
/// it can be skipped outright.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepPolicy {
    pub timeout_seconds: u64,
    pub retry_policy: RetryPolicy,
    pub max_retries: u32,
    pub fatal_on_error: bool,
    pub skippable: bool,
}

fn default_step_policies() -> HashMap<StepName, StepPolicy> {
    use RetryPolicy::*;
    use StepName::*;
    let table: [(StepName, StepPolicy); 8] = [
        (
            Validate,
            StepPolicy { timeout_seconds: 5, retry_policy: Never, max_retries: 0, fatal_on_error: true, skippable: false },
        ),
        (
            Route,
            StepPolicy { timeout_seconds: 2, retry_policy: Once, max_retries: 1, fatal_on_error: true, skippable: false },
        ),
        (
            DetectHand,
            StepPolicy { timeout_seconds: 12, retry_policy: Once, max_retries: 1, fatal_on_error: false, skippable: true },
        ),
        (
            DetectLeg,
            StepPolicy { timeout_seconds: 12, retry_policy: Once, max_retries: 1, fatal_on_error: false, skippable: true },
        ),
        (
            Triage,
            StepPolicy { timeout_seconds: 2, retry_policy: Never, max_retries: 0, fatal_on_error: false, skippable: false },
        ),
        (
            Diagnose,
            StepPolicy { timeout_seconds: 5, retry_policy: Once, max_retries: 1, fatal_on_error: false, skippable: true },
        ),
        (
            Report,
            StepPolicy { timeout_seconds: 5, retry_policy: Once, max_retries: 1, fatal_on_error: false, skippable: true },
        ),
        (
            Hospitals,
            StepPolicy { timeout_seconds: 3, retry_policy: Once, max_retries: 1, fatal_on_error: false, skippable: true },
        ),
    ];
    table.into_iter().collect()
}

fn default_red_patterns() -> Vec<String> {
    vec!["compound".into(), "open".into(), "displaced".into(), "comminuted".into()]
}

fn default_amber_patterns() -> Vec<String> {
    vec!["fracture".into(), "break".into(), "crack".into()]
}

fn default_green_patterns() -> Vec<String> {
    vec!["normal".into(), "clear".into(), "no fracture".into()]
}

/// The versioned, hashable snapshot of detection/triage thresholds and
/// per-step policy that governs one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub router_threshold: f64,
    pub detector_score_min: f64,
    pub nms_iou: f64,
    pub triage_red_threshold: f64,
    pub triage_amber_threshold: f64,
    pub triage_high_confidence_threshold: f64,
    pub triage_red_patterns: Vec<String>,
    pub triage_amber_patterns: Vec<String>,
    pub triage_green_patterns: Vec<String>,
    pub step_policies: HashMap<StepName, StepPolicy>,
    pub max_retries: u32,
    pub version: String,
    pub config_hash: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let mut config = Self {
            router_threshold: 0.70,
            detector_score_min: 0.35,
            nms_iou: 0.50,
            triage_red_threshold: 0.75,
            triage_amber_threshold: 0.40,
            triage_high_confidence_threshold: 0.80,
            triage_red_patterns: default_red_patterns(),
            triage_amber_patterns: default_amber_patterns(),
            triage_green_patterns: default_green_patterns(),
            step_policies: default_step_policies(),
            max_retries: 1,
            version: "1.0.0".to_string(),
            config_hash: String::new(),
        };
        config.config_hash = config.compute_hash();
        config
    }
}

impl PolicyConfig {
    /// The canonical JSON payload the hash is computed over: thresholds,
    /// triage pattern lists, step policy table, version — nothing else.
    /// `serde_json::Map` without the `preserve_order` feature is key-sorted,
    /// which is what makes this serialization canonical.
    fn hash_payload(&self) -> Value {
        let mut step_policies: HashMap<String, Value> = HashMap::new();
        for name in StepName::ALL {
            if let Some(policy) = self.step_policies.get(&name) {
                step_policies.insert(name.to_string(), json!(policy));
            }
        }
        json!({
            "router_threshold": self.router_threshold,
            "detector_score_min": self.detector_score_min,
            "nms_iou": self.nms_iou,
            "triage_red_threshold": self.triage_red_threshold,
            "triage_amber_threshold": self.triage_amber_threshold,
            "triage_high_confidence_threshold": self.triage_high_confidence_threshold,
            "triage_red_patterns": self.triage_red_patterns,
            "triage_amber_patterns": self.triage_amber_patterns,
            "triage_green_patterns": self.triage_green_patterns,
            "step_policies": step_policies,
            "max_retries": self.max_retries,
            "version": self.version,
        })
    }

    fn compute_hash(&self) -> String {
        let payload = self.hash_payload();
        let canonical = serde_json::to_vec(&payload).expect("policy payload always serializes");
        let digest = Sha256::digest(&canonical);
        hex::encode(digest)[..16].to_string()
    }

    /// Applies a validated set of overrides and returns a brand-new,
    /// immutable instance with a freshly computed hash. `self` is never
    /// mutated.
    pub fn apply_overrides(&self, overrides: &PolicyOverrides) -> PolicyConfig {
        let mut next = self.clone();
        if let Some(v) = overrides.router_threshold {
            next.router_threshold = v;
        }
        if let Some(v) = overrides.detector_score_min {
            next.detector_score_min = v;
        }
        if let Some(v) = overrides.nms_iou {
            next.nms_iou = v;
        }
        if let Some(v) = overrides.triage_red_threshold {
            next.triage_red_threshold = v;
        }
        if let Some(v) = overrides.triage_amber_threshold {
            next.triage_amber_threshold = v;
        }
        if let Some(v) = overrides.triage_high_confidence_threshold {
            next.triage_high_confidence_threshold = v;
        }
        if let Some(v) = &overrides.triage_red_patterns {
            next.triage_red_patterns = v.clone();
        }
        if let Some(v) = &overrides.triage_amber_patterns {
            next.triage_amber_patterns = v.clone();
        }
        if let Some(v) = &overrides.triage_green_patterns {
            next.triage_green_patterns = v.clone();
        }
        if let Some(v) = overrides.max_retries {
            next.max_retries = v;
        }
        for (step, timeout) in &overrides.timeout_overrides {
            if let Some(policy) = next.step_policies.get_mut(step) {
                policy.timeout_seconds = *timeout;
            }
        }
        next.config_hash = next.compute_hash();
        next
    }

    pub fn triage_thresholds(&self) -> TriageThresholds {
        TriageThresholds {
            red_cutoff: self.triage_red_threshold,
            amber_cutoff: self.triage_amber_threshold,
        }
    }

    /// A snapshot of per-step timeouts, attached to `StepGraph::timeouts`.
    pub fn timeouts_snapshot(&self) -> HashMap<StepName, u64> {
        self.step_policies
            .iter()
            .map(|(name, policy)| (*name, policy.timeout_seconds))
            .collect()
    }

    /// A snapshot of detection thresholds, attached to `StepGraph::thresholds`.
    pub fn thresholds_snapshot(&self) -> Value {
        json!({
            "router_threshold": self.router_threshold,
            "detector_score_min": self.detector_score_min,
            "nms_iou": self.nms_iou,
            "triage_red_threshold": self.triage_red_threshold,
            "triage_amber_threshold": self.triage_amber_threshold,
        })
    }
}

/// The free-form override payload recognized when `mode = ADVANCED`. Every
/// field is optional; unrecognized keys in the source mapping are rejected
/// by [`validate_overrides`] before this type is ever constructed.
#[derive(Debug, Clone, Default)]
pub struct PolicyOverrides {
    pub router_threshold: Option<f64>,
    pub detector_score_min: Option<f64>,
    pub nms_iou: Option<f64>,
    pub triage_red_threshold: Option<f64>,
    pub triage_amber_threshold: Option<f64>,
    pub triage_high_confidence_threshold: Option<f64>,
    pub triage_red_patterns: Option<Vec<String>>,
    pub triage_amber_patterns: Option<Vec<String>>,
    pub triage_green_patterns: Option<Vec<String>>,
    pub max_retries: Option<u32>,
    pub timeout_overrides: HashMap<StepName, u64>,
}

const RECOGNIZED_KEYS: &[&str] = &[
    "router_threshold",
    "detector_score_min",
    "nms_iou",
    "triage_red_threshold",
    "triage_amber_threshold",
    "triage_high_confidence_threshold",
    "triage_red_patterns",
    "triage_amber_patterns",
    "triage_green_patterns",
    "max_retries",
    "timeout_overrides",
];

fn parse_fraction(value: &Value, key: &str, errors: &mut Vec<String>) -> Option<f64> {
    match value.as_f64() {
        Some(v) if (0.0..=1.0).contains(&v) => Some(v),
        Some(v) => {
            errors.push(format!("{key} must be in [0,1], got {v}"));
            None
        }
        None => {
            errors.push(format!("{key} must be a number"));
            None
        }
    }
}

fn parse_pattern_list(value: &Value, key: &str, errors: &mut Vec<String>) -> Option<Vec<String>> {
    match value.as_array() {
        Some(items) => {
            let mut patterns = Vec::with_capacity(items.len());
            let mut ok = true;
            for item in items {
                match item.as_str() {
                    Some(s) => patterns.push(s.to_string()),
                    None => {
                        errors.push(format!("{key} must be an array of strings"));
                        ok = false;
                        break;
                    }
                }
            }
            ok.then_some(patterns)
        }
        None => {
            errors.push(format!("{key} must be an array of strings"));
            None
        }
    }
}

fn step_name_from_key(key: &str) -> Option<Vec<StepName>> {
    if key == "detect" {
        return Some(vec![StepName::DetectHand, StepName::DetectLeg]);
    }
    StepName::ALL
        .iter()
        .find(|name| name.to_string() == key)
        .map(|name| vec![*name])
}

/// Pure validation of a free-form overrides mapping against the recognized
/// key list and each field's range/type rule. Returns either the parsed,
/// typed overrides or the full list of validation error strings (never a
/// partial mix of both).
pub fn validate_overrides(overrides: &Value) -> Result<PolicyOverrides, Vec<String>> {
    let mut errors = Vec::new();
    let map = match overrides.as_object() {
        Some(m) => m,
        None => return Err(vec!["overrides must be a JSON object".to_string()]),
    };

    for key in map.keys() {
        if !RECOGNIZED_KEYS.contains(&key.as_str()) {
            errors.push(format!("unrecognized override key '{key}'"));
        }
    }

    let mut parsed = PolicyOverrides::default();

    if let Some(v) = map.get("router_threshold") {
        parsed.router_threshold = parse_fraction(v, "router_threshold", &mut errors);
    }
    if let Some(v) = map.get("detector_score_min") {
        parsed.detector_score_min = parse_fraction(v, "detector_score_min", &mut errors);
    }
    if let Some(v) = map.get("nms_iou") {
        parsed.nms_iou = parse_fraction(v, "nms_iou", &mut errors);
    }
    if let Some(v) = map.get("triage_red_threshold") {
        parsed.triage_red_threshold = parse_fraction(v, "triage_red_threshold", &mut errors);
    }
    if let Some(v) = map.get("triage_amber_threshold") {
        parsed.triage_amber_threshold = parse_fraction(v, "triage_amber_threshold", &mut errors);
    }
    if let Some(v) = map.get("triage_high_confidence_threshold") {
        parsed.triage_high_confidence_threshold =
            parse_fraction(v, "triage_high_confidence_threshold", &mut errors);
    }
    if let Some(v) = map.get("triage_red_patterns") {
        parsed.triage_red_patterns = parse_pattern_list(v, "triage_red_patterns", &mut errors);
    }
    if let Some(v) = map.get("triage_amber_patterns") {
        parsed.triage_amber_patterns = parse_pattern_list(v, "triage_amber_patterns", &mut errors);
    }
    if let Some(v) = map.get("triage_green_patterns") {
        parsed.triage_green_patterns = parse_pattern_list(v, "triage_green_patterns", &mut errors);
    }
    if let Some(v) = map.get("max_retries") {
        match v.as_u64() {
            Some(n) => parsed.max_retries = Some(n as u32),
            None => errors.push("max_retries must be a non-negative integer".to_string()),
        }
    }
    if let Some(v) = map.get("timeout_overrides") {
        match v.as_object() {
            Some(sub) => {
                for (step_key, timeout_value) in sub {
                    let Some(names) = step_name_from_key(step_key) else {
                        errors.push(format!("unknown step name '{step_key}' in timeout_overrides"));
                        continue;
                    };
                    match timeout_value.as_u64() {
                        Some(seconds) => {
                            for name in names {
                                parsed.timeout_overrides.insert(name, seconds);
                            }
                        }
                        None => errors.push(format!(
                            "timeout_overrides.{step_key} must be a non-negative integer"
                        )),
                    }
                }
            }
            None => errors.push("timeout_overrides must be an object".to_string()),
        }
    }

    if errors.is_empty() {
        Ok(parsed)
    } else {
        Err(errors)
    }
}

/// Metadata about a request's derived config, exposed via
/// `PolicyRegistry::metadata`.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigMetadata {
    pub config_hash: String,
    pub version: String,
    pub is_default: bool,
}

/// Holds the default `PolicyConfig` and the per-request bindings derived
/// from it. Reads and writes of a given request's binding are serialized by
/// request id; the registry itself is shared across requests behind a
/// single `RwLock` guarding the binding map.
pub struct PolicyRegistry {
    default_config: Arc<PolicyConfig>,
    bindings: RwLock<HashMap<Uuid, Arc<PolicyConfig>>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            default_config: Arc::new(PolicyConfig::default()),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_config(&self) -> Arc<PolicyConfig> {
        self.default_config.clone()
    }

    /// Derives and stores the config for a request. AUTO/GUIDED always get
    /// the default config regardless of any overrides present on the
    /// request; only ADVANCED validates and applies them.
    pub async fn config_for(
        &self,
        request_id: Uuid,
        mode: ProcessingMode,
        overrides: Option<&Value>,
    ) -> Result<Arc<PolicyConfig>, Vec<String>> {
        let config = if mode == ProcessingMode::Advanced {
            match overrides {
                Some(raw) => {
                    let parsed = validate_overrides(raw)?;
                    Arc::new(self.default_config.apply_overrides(&parsed))
                }
                None => self.default_config.clone(),
            }
        } else {
            self.default_config.clone()
        };
        self.bindings.write().await.insert(request_id, config.clone());
        Ok(config)
    }

    async fn binding(&self, request_id: Uuid) -> Arc<PolicyConfig> {
        self.bindings
            .read()
            .await
            .get(&request_id)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    pub async fn step_timeout(&self, request_id: Uuid, step: StepName) -> u64 {
        let config = self.binding(request_id).await;
        config
            .step_policies
            .get(&step)
            .map(|p| p.timeout_seconds)
            .unwrap_or(5)
    }

    /// Retry decision for the next attempt. A step never retries once
    /// `retry_count` reaches its `max_retries`, regardless of policy. Below
    /// that bound, `NEVER` always returns false, `ONCE` always returns true
    /// (it relies on `max_retries` to cut it off after the first retry),
    /// and `EXPONENTIAL` returns true only when the error kind is transient.
    pub async fn should_retry(
        &self,
        request_id: Uuid,
        step: StepName,
        retry_count: u32,
        error_is_transient: bool,
    ) -> bool {
        let config = self.binding(request_id).await;
        let Some(policy) = config.step_policies.get(&step) else {
            return false;
        };
        if retry_count >= policy.max_retries {
            return false;
        }
        match policy.retry_policy {
            RetryPolicy::Never => false,
            RetryPolicy::Once => true,
            RetryPolicy::Exponential => error_is_transient,
        }
    }

    pub async fn is_fatal(&self, request_id: Uuid, step: StepName) -> bool {
        let config = self.binding(request_id).await;
        config.step_policies.get(&step).map(|p| p.fatal_on_error).unwrap_or(false)
    }

    pub async fn can_skip(&self, request_id: Uuid, step: StepName) -> bool {
        let config = self.binding(request_id).await;
        config.step_policies.get(&step).map(|p| p.skippable).unwrap_or(true)
    }

    pub async fn triage_config(&self, request_id: Uuid) -> TriageThresholds {
        self.binding(request_id).await.triage_thresholds()
    }

    pub async fn metadata(&self, request_id: Uuid) -> ConfigMetadata {
        let config = self.binding(request_id).await;
        ConfigMetadata {
            config_hash: config.config_hash.clone(),
            version: config.version.clone(),
            is_default: config.config_hash == self.default_config.config_hash,
        }
    }

    pub async fn release(&self, request_id: Uuid) {
        self.bindings.write().await.remove(&request_id);
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
