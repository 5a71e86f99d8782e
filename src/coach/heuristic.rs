// src/coach/heuristic.rs
//! Qualitative-to-numeric scoring of report text.
//!
//! Used when the structured output lacks a metric group: each axis label is
//! looked up by keyword in the Markdown report and the first sentence that
//! mentions it is scored by its qualitative wording.

use lazy_static::lazy_static;
use regex::Regex;

use super::extraction::{GroupSpec, MetricGroup, DEFAULT_METRIC};

lazy_static! {
    static ref EXCELLENT_RE: Regex = word_regex(&["excellent", "outstanding", "elite", "exceptional"]);
    static ref POOR_RE: Regex = word_regex(&["poor", "weak", "limited", "lacking", "deficient", "restricted"]);
    static ref GOOD_RE: Regex = word_regex(&["good", "solid", "strong", "efficient"]);
    static ref AVERAGE_RE: Regex = word_regex(&["average", "adequate", "moderate", "fair"]);
}

fn word_regex(words: &[&str]) -> Regex {
    let pattern = format!(r"(?i)\b(?:{})\b", words.join("|"));
    Regex::new(&pattern).unwrap_or_else(|_| Regex::new("$^").unwrap())
}

/// Keywords that identify an axis in free text.
fn keywords(label: &str) -> &'static [&'static str] {
    match label {
        "Control" => &["control"],
        "Strike %" => &["strike percentage", "strike %", "strike rate", "strikes"],
        "Movement" => &["movement"],
        "Velo" => &["velocity", "velo"],
        "Command" => &["command"],
        "Skill" => &["overall skill", "skill"],
        "Lower Body" => &["lower body", "leg drive", "legs"],
        "Core" => &["core"],
        "Ground Force" => &["ground force"],
        "Rotation" => &["rotational power", "rotation"],
        "Overall Power" => &["overall power", "power"],
        "Hip/Shldr Sep" => &[
            "hip-shoulder separation",
            "hip shoulder separation",
            "hip/shoulder separation",
            "separation",
        ],
        "Torso Velo" => &["torso velocity", "torso rotation", "trunk rotation"],
        "Lead Leg Block" => &["lead leg", "front leg", "block"],
        "Shoulder IR Velo" => &["internal rotation", "shoulder ir"],
        "Arm Speed" => &["arm speed"],
        "Sequencing" => &["sequencing", "kinetic chain"],
        "Shoulder ER" => &["external rotation", "shoulder er"],
        "T-Spine Rot" => &["t-spine", "thoracic"],
        "Hip Mob" => &["hip mobility"],
        "Ankle Mob" => &["ankle"],
        "Overall Mob" => &["overall mobility", "mobility", "flexibility"],
        _ => &[],
    }
}

/// Score a single sentence: excellent 90, good 75, average 50, poor 25.
pub fn qualitative_score(sentence: &str) -> Option<f64> {
    if EXCELLENT_RE.is_match(sentence) {
        Some(90.0)
    } else if POOR_RE.is_match(sentence) {
        Some(25.0)
    } else if GOOD_RE.is_match(sentence) {
        Some(75.0)
    } else if AVERAGE_RE.is_match(sentence) {
        Some(50.0)
    } else {
        None
    }
}

/// Score for one axis label; the default metric when the report is silent.
pub fn score_label(label: &str, report: &str) -> f64 {
    let words = keywords(label);
    let fallback = label.to_lowercase();

    report
        .split(|c| matches!(c, '.' | '!' | '?' | '\n'))
        .map(str::to_lowercase)
        .filter(|sentence| {
            if words.is_empty() {
                sentence.contains(&fallback)
            } else {
                words.iter().any(|word| sentence.contains(word))
            }
        })
        .find_map(|sentence| qualitative_score(&sentence))
        .unwrap_or(DEFAULT_METRIC)
}

/// Build a whole metric group from report text.
pub fn estimate_group(spec: &GroupSpec, report: &str) -> MetricGroup {
    let labels: Vec<String> = spec.labels.iter().map(|l| l.to_string()).collect();
    let values = spec.labels.iter().map(|l| score_label(l, report)).collect();

    let mut group = MetricGroup::new(spec.key, spec.title, labels, values, spec.num_axes());
    group.estimated = true;
    group
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coach::extraction::SCHEMA;

    #[test]
    fn qualitative_terms_are_ordered() {
        assert_eq!(qualitative_score("excellent arm speed"), Some(90.0));
        assert_eq!(qualitative_score("Good extension"), Some(75.0));
        assert_eq!(qualitative_score("average command"), Some(50.0));
        assert_eq!(qualitative_score("poor ankle mobility"), Some(25.0));
        assert_eq!(qualitative_score("the athlete throws"), None);
        assert_eq!(qualitative_score("goodness"), None);
    }

    #[test]
    fn mentioned_quality_moves_metric_off_default() {
        let report = "## Mechanics\nThe athlete shows excellent hip-shoulder separation.\nArm speed is good.\nSequencing is poor and the kinetic chain leaks energy.";
        assert!(score_label("Hip/Shldr Sep", report) > DEFAULT_METRIC);
        assert!(score_label("Arm Speed", report) > DEFAULT_METRIC);
        assert!(score_label("Sequencing", report) < DEFAULT_METRIC);
        assert_eq!(score_label("Lead Leg Block", report), DEFAULT_METRIC);
    }

    #[test]
    fn estimated_group_has_schema_shape() {
        let group = estimate_group(&SCHEMA[2], "Excellent hip-shoulder separation.");
        assert!(group.valid);
        assert!(group.estimated);
        assert_eq!(group.values.len(), 6);
        assert_eq!(group.values[0], 90.0);
        assert_eq!(group.values[5], DEFAULT_METRIC);
    }
}
