//! Core value types shared by every other module: enums for the fixed
//! vocabularies of the pipeline (body parts, triage levels, step names and
//! statuses) plus the `Detection` record produced by detector stages.
//!
//! These are intentionally dumb data holders — no behavior lives here
//! beyond `Display`/parsing convenience. Business rules belong to
//! `triage`, `policy`, `step_graph` and `orchestrator`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which body part a request's X-ray was classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyPart {
    Hand,
    Leg,
    Unknown,
}

impl fmt::Display for BodyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Hand => "hand",
            Self::Leg => "leg",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Urgency classification emitted by the triage kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageLevel {
    Red,
    Amber,
    Green,
}

impl fmt::Display for TriageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Red => "red",
            Self::Amber => "amber",
            Self::Green => "green",
        };
        write!(f, "{s}")
    }
}

/// How much latitude the orchestrator gives a request: AUTO runs the fixed
/// control flow with no human touch points, GUIDED adds prompts for
/// low-confidence routing and missing consents, ADVANCED additionally
/// honors policy overrides supplied on the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    Auto,
    Guided,
    Advanced,
}

/// The fixed vocabulary of steps a step graph may contain. `DetectHand` and
/// `DetectLeg` are never seeded at construction time; the orchestrator adds
/// whichever of them routing selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    Validate,
    Route,
    DetectHand,
    DetectLeg,
    Triage,
    Diagnose,
    Report,
    Hospitals,
}

impl StepName {
    /// All step names, in a stable order. Used to build the default policy
    /// table and for deterministic iteration in tests.
    pub const ALL: [StepName; 8] = [
        StepName::Validate,
        StepName::Route,
        StepName::DetectHand,
        StepName::DetectLeg,
        StepName::Triage,
        StepName::Diagnose,
        StepName::Report,
        StepName::Hospitals,
    ];

    /// Whether this step name is one of the two detectors. `timeout_overrides`
    /// accepts the `"detect"` alias, which expands to both of these.
    pub fn is_detector(&self) -> bool {
        matches!(self, StepName::DetectHand | StepName::DetectLeg)
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepName::Validate => "validate",
            StepName::Route => "route",
            StepName::DetectHand => "detect_hand",
            StepName::DetectLeg => "detect_leg",
            StepName::Triage => "triage",
            StepName::Diagnose => "diagnose",
            StepName::Report => "report",
            StepName::Hospitals => "hospitals",
        };
        write!(f, "{s}")
    }
}

/// A step's lifecycle position. Terminal once it reaches `Ok`, `Error`,
/// `Timeout` or `Skipped` — the orchestrator is the only code allowed to
/// move a step back out of `Error`/`Timeout` into `Pending` for a retry
/// (`StepGraph::reset_for_retry`), and it does so as a single atomic
/// operation never observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Ok,
    Error,
    Timeout,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Ok | StepStatus::Error | StepStatus::Timeout | StepStatus::Skipped
        )
    }
}

/// Per-step retry policy. `Never` means exactly one attempt; `Once` allows a
/// single retry regardless of error kind; `Exponential` allows repeated
/// retries up to `max_retries`, gated on the error kind being transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    Never,
    Once,
    Exponential,
}

/// A single bounding-box detection from a body-part detector stage.
/// Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// (x, y, w, h) in pixels.
    pub bbox: (i32, i32, i32, i32),
    /// Raw model confidence in [0, 1].
    pub score: f64,
}
