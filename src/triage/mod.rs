//! The triage decision kernel: a pure function from detections + symptoms
//! + body part + policy thresholds to an urgency level. No I/O, no shared
//! state, never fails — callers that need a fallback on internal error call
//! [`TriageOutcome::error_fallback`] directly rather than unwrapping a
//! `Result`, because the kernel itself has nothing to propagate.

use crate::model::{BodyPart, Detection, TriageLevel};

/// Keywords that bump the score when present in (already redacted) patient
/// symptom text.
const SEVERE_SYMPTOM_KEYWORDS: &[&str] = &[
    "severe pain",
    "intense pain",
    "unbearable",
    "excruciating",
    "deformity",
    "bone visible",
    "bleeding",
    "numbness",
    "tingling",
    "can't move",
    "unable to bear weight",
];

fn has_severe_symptom(symptoms: Option<&str>) -> bool {
    let Some(text) = symptoms else { return false };
    let lower = text.to_lowercase();
    SEVERE_SYMPTOM_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Maps a detection label substring to a severity contribution in [0, 0.3].
/// Checked in descending severity order so a label matching multiple
/// buckets gets the worse (higher) score.
fn severity(label: &str) -> f64 {
    let lower = label.to_lowercase();
    const BUCKETS: &[(&[&str], f64)] = &[
        (
            &["compound", "open", "severe", "displaced", "comminuted", "avulsion"],
            0.30,
        ),
        (&["fracture detected", "break", "crack", "confirmed fracture"], 0.20),
        (
            &["likely fracture", "probable fracture", "suspected fracture"],
            0.10,
        ),
        (&["possible fracture", "minor", "hairline", "stress"], 0.05),
        (
            &["no fractures", "no fracture", "normal", "clear", "negative"],
            0.00,
        ),
    ];
    for (keywords, value) in BUCKETS {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return *value;
        }
    }
    0.10
}

/// How the kernel arrived at its output. `DynamicScoring` is the only path
/// `assess` actually produces; `RuleBased` and `Hybrid` name alternative
/// scoring strategies that are not currently wired up; `ErrorFallback` is
/// returned by [`TriageOutcome::error_fallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageMethod {
    DynamicScoring,
    RuleBased,
    Hybrid,
    ErrorFallback,
}

impl std::fmt::Display for TriageMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriageMethod::DynamicScoring => "dynamic_scoring",
            TriageMethod::RuleBased => "rule_based",
            TriageMethod::Hybrid => "hybrid",
            TriageMethod::ErrorFallback => "error_fallback",
        };
        write!(f, "{s}")
    }
}

/// Threshold view the kernel reads from `PolicyConfig`. Kept separate from
/// `PolicyConfig` itself so the kernel module has no dependency on `policy`.
#[derive(Debug, Clone, Copy)]
pub struct TriageThresholds {
    pub red_cutoff: f64,
    pub amber_cutoff: f64,
}

impl Default for TriageThresholds {
    fn default() -> Self {
        Self {
            red_cutoff: 0.75,
            amber_cutoff: 0.40,
        }
    }
}

/// The kernel's output: the urgency level plus enough supporting detail for
/// a reviewer to understand why.
#[derive(Debug, Clone, PartialEq)]
pub struct TriageOutcome {
    pub level: TriageLevel,
    pub rationale: Vec<String>,
    pub confidence: f64,
    pub score: f64,
    pub method: TriageMethod,
}

impl TriageOutcome {
    /// The fallback the orchestrator attaches when its own invocation of
    /// the triage step fails — the kernel function itself never produces
    /// this outcome, since it has no failure path of its own.
    pub fn error_fallback() -> Self {
        Self {
            level: TriageLevel::Amber,
            rationale: vec!["Triage assessment unavailable, recommend medical evaluation".into()],
            confidence: 0.0,
            score: 0.5,
            method: TriageMethod::ErrorFallback,
        }
    }
}

fn level_for_score(score: f64, thresholds: TriageThresholds) -> TriageLevel {
    if score >= thresholds.red_cutoff {
        TriageLevel::Red
    } else if score >= thresholds.amber_cutoff {
        TriageLevel::Amber
    } else {
        TriageLevel::Green
    }
}

/// Scores detections and symptoms into an urgency level. Each detection's
/// contribution is `0.7 * detection_score + 0.3 * label_severity`; the
/// detection with the highest contribution drives the assessment, and a
/// severe symptom keyword adds a further 0.10 (capped at 1.0). An empty
/// detection list scores 0 (or 0.3 on a severe symptom alone).
pub fn assess(
    detections: &[Detection],
    symptoms: Option<&str>,
    _body_part: Option<BodyPart>,
    thresholds: TriageThresholds,
) -> TriageOutcome {
    let severe = has_severe_symptom(symptoms);

    if detections.is_empty() {
        let mut score = 0.0;
        let mut rationale = vec!["No fractures detected".to_string()];
        if severe {
            score += 0.3;
            rationale.push("Concerning symptoms reported".to_string());
        }
        return TriageOutcome {
            level: level_for_score(score, thresholds),
            rationale,
            confidence: 0.8,
            score,
            method: TriageMethod::DynamicScoring,
        };
    }

    // Pick the detection with the maximum contribution; ties break by
    // higher raw score, then by lower index.
    let mut best_index = 0usize;
    let mut best_contribution = f64::MIN;
    let mut best_score = f64::MIN;
    for (index, detection) in detections.iter().enumerate() {
        let contribution = 0.7 * detection.score + 0.3 * severity(&detection.label);
        let better = contribution > best_contribution
            || (contribution == best_contribution && detection.score > best_score);
        if better {
            best_contribution = contribution;
            best_score = detection.score;
            best_index = index;
        }
    }

    let mut score = best_contribution;
    let driving = &detections[best_index];
    let mut rationale = vec![format!(
        "Detection '{}' (score {:.2}) drives the assessment",
        driving.label, driving.score
    )];

    if severe {
        score = (score + 0.10).min(1.0);
        rationale.push("Concerning symptoms reported".to_string());
    }

    let confidence = detections
        .iter()
        .map(|d| d.score)
        .fold(f64::MIN, f64::max);

    TriageOutcome {
        level: level_for_score(score, thresholds),
        rationale,
        confidence,
        score,
        method: TriageMethod::DynamicScoring,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(label: &str, score: f64) -> Detection {
        Detection {
            label: label.to_string(),
            bbox: (0, 0, 10, 10),
            score,
        }
    }

    #[test]
    fn empty_detections_with_no_symptoms_is_green() {
        let outcome = assess(&[], None, None, TriageThresholds::default());
        assert_eq!(outcome.level, TriageLevel::Green);
        assert_eq!(outcome.score, 0.0);
        assert_eq!(outcome.confidence, 0.8);
        assert_eq!(outcome.rationale, vec!["No fractures detected".to_string()]);
    }

    #[test]
    fn empty_detections_with_severe_symptom_adds_point_three() {
        let outcome = assess(&[], Some("severe pain in the wrist"), None, TriageThresholds::default());
        assert_eq!(outcome.score, 0.3);
        assert_eq!(outcome.level, TriageLevel::Green);
    }

    #[test]
    fn displaced_fracture_with_severe_pain_is_red() {
        let detections = vec![detection("displaced_fracture", 0.88)];
        let outcome = assess(
            &detections,
            Some("severe pain"),
            Some(BodyPart::Hand),
            TriageThresholds::default(),
        );
        assert_eq!(outcome.level, TriageLevel::Red);
        assert!(outcome.score >= 0.75);
    }

    #[test]
    fn hairline_fracture_formula_lands_exactly_on_amber_boundary() {
        // 0.7*0.55 + 0.3*0.05 = 0.4, at the amber cutoff (>= amber_cutoff).
        let detections = vec![detection("hairline_fracture", 0.55)];
        let outcome = assess(&detections, None, None, TriageThresholds::default());
        let expected = 0.7 * 0.55 + 0.3 * 0.05;
        assert!((outcome.score - expected).abs() < 1e-9);
        assert_eq!(outcome.level, TriageLevel::Amber);
    }

    #[test]
    fn max_contribution_wins_over_multiple_detections() {
        let detections = vec![
            detection("normal", 0.95),
            detection("compound_fracture", 0.40),
        ];
        let outcome = assess(&detections, None, None, TriageThresholds::default());
        // compound: 0.7*0.40 + 0.3*0.30 = 0.37; normal: 0.7*0.95 + 0 = 0.665
        assert!((outcome.score - 0.665).abs() < 1e-9);
        assert!(outcome.rationale[0].contains("normal"));
    }

    #[test]
    fn ties_on_equal_contribution_break_by_lower_index() {
        // Both land in the same severity bucket (0.0) with the same raw
        // score, so contributions are bit-identical; the earlier index wins.
        let detections = vec![detection("normal", 0.5), detection("clear", 0.5)];
        let outcome = assess(&detections, None, None, TriageThresholds::default());
        assert!(outcome.rationale[0].contains("normal"));
    }

    #[test]
    fn confidence_is_empty_when_no_detections_uses_default_point_eight() {
        let outcome = assess(&[], None, None, TriageThresholds::default());
        assert_eq!(outcome.confidence, 0.8);
    }

    #[test]
    fn error_fallback_is_amber_with_zero_confidence() {
        let fallback = TriageOutcome::error_fallback();
        assert_eq!(fallback.level, TriageLevel::Amber);
        assert_eq!(fallback.confidence, 0.0);
        assert_eq!(fallback.method, TriageMethod::ErrorFallback);
    }

    #[test]
    fn score_capped_at_one_after_symptom_bonus() {
        let detections = vec![detection("compound_fracture", 1.0)];
        let outcome = assess(&detections, Some("excruciating pain"), None, TriageThresholds::default());
        assert!(outcome.score <= 1.0);
    }
}
