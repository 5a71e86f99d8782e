// src/coach/extraction.rs
//! Stage 2: structured metrics mined from the Stage 1 report.
//!
//! Model output is treated as unreliable. Code fences are stripped, a
//! brace-delimited fallback is tried when the whole text does not parse,
//! malformed groups are kept and flagged, and groups the model left out
//! are estimated from the report text.

use std::sync::Arc;

use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::heuristic;
use crate::error::CoachError;
use crate::retry::RetryPolicy;
use crate::services::{
    ContentPart, GenerationConfig, GenerationRequest, GenerationService, ResponseFormat,
};
use crate::storage::AnalysisResult;

/// Value used for missing or non-numeric metrics.
pub const DEFAULT_METRIC: f64 = 50.0;

/// Shape of one metric group in the report schema.
#[derive(Debug, Clone, Copy)]
pub struct GroupSpec {
    pub key: &'static str,
    pub title: &'static str,
    pub labels: &'static [&'static str],
}

impl GroupSpec {
    pub fn num_axes(&self) -> usize {
        self.labels.len()
    }
}

pub const SCHEMA: [GroupSpec; 4] = [
    GroupSpec {
        key: "skills",
        title: "Skills",
        labels: &["Control", "Strike %", "Movement", "Velo", "Command", "Skill"],
    },
    GroupSpec {
        key: "power",
        title: "Power",
        labels: &["Lower Body", "Core", "Ground Force", "Rotation", "Overall Power"],
    },
    GroupSpec {
        key: "mocap",
        title: "Motion Capture",
        labels: &[
            "Hip/Shldr Sep",
            "Torso Velo",
            "Lead Leg Block",
            "Shoulder IR Velo",
            "Arm Speed",
            "Sequencing",
        ],
    },
    GroupSpec {
        key: "mobility",
        title: "Mobility",
        labels: &["Shoulder ER", "T-Spine Rot", "Hip Mob", "Ankle Mob", "Overall Mob"],
    },
];

/// One radar/bar chart worth of data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricGroup {
    pub key: String,
    pub title: String,
    pub labels: Vec<String>,
    pub values: Vec<f64>,
    pub num_axes: usize,
    /// Label and value counts both equal `num_axes`
    pub valid: bool,
    /// Filled in from the report text rather than the model output
    pub estimated: bool,
}

impl MetricGroup {
    pub fn new(key: &str, title: &str, labels: Vec<String>, values: Vec<f64>, num_axes: usize) -> Self {
        let valid = labels.len() == num_axes && values.len() == num_axes;
        Self {
            key: key.to_string(),
            title: title.to_string(),
            labels,
            values,
            num_axes,
            valid,
            estimated: false,
        }
    }

    /// Labels and values resized to `num_axes`, padded with `Axis N` and
    /// the default metric, values clamped to [0, 100].
    pub fn normalized(&self) -> (Vec<String>, Vec<f64>) {
        let labels = (0..self.num_axes)
            .map(|i| {
                self.labels
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("Axis {}", i + 1))
            })
            .collect();
        let values = (0..self.num_axes)
            .map(|i| self.values.get(i).copied().unwrap_or(DEFAULT_METRIC).clamp(0.0, 100.0))
            .collect();
        (labels, values)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredReport {
    pub summary: String,
    pub groups: Vec<MetricGroup>,
    /// Risk and development items
    pub predictions: Vec<String>,
    /// Recommendations
    pub roadmap: Vec<String>,
}

impl StructuredReport {
    pub fn group(&self, key: &str) -> Option<&MetricGroup> {
        self.groups.iter().find(|g| g.key == key)
    }

    pub fn invalid_groups(&self) -> impl Iterator<Item = &MetricGroup> {
        self.groups.iter().filter(|g| !g.valid)
    }
}

lazy_static! {
    static ref FENCE_RE: Regex =
        Regex::new(r"(?s)^\s*```[A-Za-z]*\s*|\s*```\s*$").unwrap_or_else(|_| Regex::new("$^").unwrap());
}

/// Remove a leading ```` ```json ```` and trailing ```` ``` ```` if present.
pub fn strip_code_fences(raw: &str) -> String {
    FENCE_RE.replace_all(raw.trim(), "").trim().to_string()
}

/// Parse model output into a JSON object, or `None` if nothing usable is found.
fn parse_object(raw: &str) -> Option<Map<String, Value>> {
    let stripped = strip_code_fences(raw);
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&stripped) {
        return Some(map);
    }

    let start = stripped.find('{')?;
    let end = stripped.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&stripped[start..=end]) {
        Ok(Value::Object(map)) => {
            debug!("[Stage 2] Recovered JSON object from surrounding text");
            Some(map)
        }
        _ => None,
    }
}

fn first_key<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| map.get(*key))
}

fn metric_value(value: &Value) -> f64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite()).unwrap_or(DEFAULT_METRIC)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn parse_group(spec: &GroupSpec, value: &Value) -> MetricGroup {
    let empty = Map::new();
    let obj = value.as_object().unwrap_or(&empty);

    let title = obj
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or(spec.title);
    let values: Vec<f64> = obj
        .get("values")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(metric_value).collect())
        .unwrap_or_default();
    let labels: Vec<String> = obj
        .get("labels")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|l| l.as_str().map(str::to_string).unwrap_or_else(|| l.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let claimed_axes = obj.get("num_axes").and_then(Value::as_u64);
    let num_axes = spec.num_axes();

    let mut group = MetricGroup::new(spec.key, title, labels, values, num_axes);
    if let Some(claimed) = claimed_axes.filter(|&n| n != num_axes as u64) {
        warn!(
            "[Stage 2] Group '{}' claims {} axes, expected {}",
            spec.key, claimed, num_axes
        );
        group.valid = false;
    }
    if !group.valid {
        warn!(
            "[Stage 2] Group '{}' has {} values and {} labels for {} axes",
            spec.key,
            group.values.len(),
            group.labels.len(),
            group.num_axes
        );
    }
    group
}

/// Build a report from raw model output. `report_text` is used to estimate
/// any metric group the output does not contain.
pub fn parse_structured_output(raw: &str, report_text: &str) -> Option<StructuredReport> {
    let map = parse_object(raw)?;

    let mut missing = Vec::new();
    let summary = match first_key(&map, &["video_summary", "summary"]) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => {
            missing.push("video_summary");
            String::new()
        }
    };

    let groups = SCHEMA
        .iter()
        .map(|spec| match map.get(spec.key) {
            Some(value) => parse_group(spec, value),
            None => {
                missing.push(spec.key);
                heuristic::estimate_group(spec, report_text)
            }
        })
        .collect();

    let predictions_value = first_key(&map, &["predictions", "risks"]);
    if predictions_value.is_none() {
        missing.push("predictions");
    }
    let roadmap_value = first_key(&map, &["roadmap", "recommendations"]);
    if roadmap_value.is_none() {
        missing.push("roadmap");
    }

    if !missing.is_empty() {
        warn!("[Stage 2] Missing keys in structured output: {}", missing.join(", "));
    }

    Some(StructuredReport {
        summary,
        groups,
        predictions: string_list(predictions_value),
        roadmap: string_list(roadmap_value),
    })
}

/// Converts a Stage 1 report into a [`StructuredReport`].
pub struct ExtractionStage {
    generation: Arc<dyn GenerationService>,
    retry: RetryPolicy,
    config: GenerationConfig,
}

impl ExtractionStage {
    pub fn new(generation: Arc<dyn GenerationService>, retry: RetryPolicy) -> Self {
        Self {
            generation,
            retry,
            config: GenerationConfig {
                temperature: Some(0.1),
                max_output_tokens: Some(4096),
                response_format: ResponseFormat::Json,
            },
        }
    }

    /// Returns `Ok(None)` when the model output cannot be used; callers
    /// then fall back to the Markdown report. Only cancellation is an error.
    pub async fn extract(
        &self,
        report: &AnalysisResult,
        cancel: &CancellationToken,
    ) -> Result<Option<StructuredReport>, CoachError> {
        let request = GenerationRequest::new(
            vec![ContentPart::text(extraction_prompt(&report.markdown))],
            self.config.clone(),
        );

        let generation = self.generation.clone();
        let output = match self
            .retry
            .run_cancellable("Stage 2 extraction", cancel, || generation.generate(&request))
            .await
        {
            Ok(output) => output,
            Err(CoachError::Cancelled) => return Err(CoachError::Cancelled),
            Err(e) => {
                warn!("[Stage 2] Extraction call failed, keeping text report: {}", e);
                return Ok(None);
            }
        };

        let Some(raw) = output.non_empty_text() else {
            warn!("[Stage 2] Model returned no structured output");
            return Ok(None);
        };

        match parse_structured_output(raw, &report.markdown) {
            Some(structured) => {
                info!(
                    "[Stage 2] Extracted {} metric groups ({} flagged)",
                    structured.groups.len(),
                    structured.invalid_groups().count()
                );
                Ok(Some(structured))
            }
            None => {
                warn!("[Stage 2] Output was not JSON, keeping text report");
                Ok(None)
            }
        }
    }
}

fn extraction_prompt(report: &str) -> String {
    let mut schema = String::new();
    for spec in SCHEMA.iter() {
        schema.push_str(&format!(
            "  \"{}\": {{\"title\": \"{}\", \"num_axes\": {}, \"labels\": [{}], \"values\": [{} numbers 0-100]}},\n",
            spec.key,
            spec.title,
            spec.num_axes(),
            spec.labels
                .iter()
                .map(|l| format!("\"{}\"", l))
                .collect::<Vec<_>>()
                .join(", "),
            spec.num_axes()
        ));
    }

    format!(
        "Extract structured data from the coaching report below. Respond with a single JSON \
object and nothing else, using exactly this shape:\n{{\n  \"video_summary\": \"two sentence summary\",\n{}  \
\"predictions\": [\"risk or development item\", ...],\n  \"roadmap\": [\"recommendation\", ...]\n}}\n\
Score every metric from 0 to 100 based only on the report. Use 50 when the report says nothing about it.\n\n\
REPORT:\n{}",
        schema, report
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_JSON: &str = r#"{
        "video_summary": "Right-handed pitcher, clean delivery with early trunk rotation.",
        "skills": {"title": "Skills", "num_axes": 6, "labels": ["Control", "Strike %", "Movement", "Velo", "Command", "Skill"], "values": [70, 65, 60, 80, 55, 70]},
        "power": {"title": "Power", "num_axes": 5, "labels": ["Lower Body", "Core", "Ground Force", "Rotation", "Overall Power"], "values": [60, 70, 55, 75, 65]},
        "mocap": {"title": "Motion Capture", "num_axes": 6, "labels": ["Hip/Shldr Sep", "Torso Velo", "Lead Leg Block", "Shoulder IR Velo", "Arm Speed", "Sequencing"], "values": [40, 60, 50, 70, 75, 45]},
        "mobility": {"title": "Mobility", "num_axes": 5, "labels": ["Shoulder ER", "T-Spine Rot", "Hip Mob", "Ankle Mob", "Overall Mob"], "values": [80, 60, 55, 50, 62]},
        "predictions": ["Elbow stress from early trunk rotation"],
        "roadmap": ["Hip-shoulder separation drills", "Lead leg bracing work"]
    }"#;

    #[test]
    fn fenced_and_bare_json_parse_identically() {
        let fenced = format!("```json\n{}\n```", FULL_JSON);
        let bare = parse_structured_output(FULL_JSON, "").unwrap();
        let from_fenced = parse_structured_output(&fenced, "").unwrap();
        assert_eq!(bare, from_fenced);

        let plain_fence = format!("```\n{}\n```", FULL_JSON);
        assert_eq!(parse_structured_output(&plain_fence, "").unwrap(), bare);

        assert_eq!(bare.groups.len(), 4);
        assert!(bare.groups.iter().all(|g| g.valid && !g.estimated));
        assert_eq!(bare.roadmap.len(), 2);
    }

    #[test]
    fn recovers_object_from_surrounding_prose() {
        let raw = format!("Here is the data you asked for:\n{}\nLet me know if you need more.", FULL_JSON);
        let report = parse_structured_output(&raw, "").unwrap();
        assert_eq!(report.group("power").unwrap().values[3], 75.0);
    }

    #[test]
    fn plain_prose_is_absent() {
        assert!(parse_structured_output("The pitcher looks good overall.", "").is_none());
        assert!(parse_structured_output("{ not json at all }", "").is_none());
        assert!(parse_structured_output("[1, 2, 3]", "").is_none());
    }

    #[test]
    fn mismatched_group_is_flagged_but_kept() {
        let raw = r#"{
            "video_summary": "Short clip.",
            "skills": {"num_axes": 6, "labels": ["Control", "Strike %"], "values": [70, 65, 60]},
            "power": {"num_axes": 5, "labels": ["Lower Body", "Core", "Ground Force", "Rotation", "Overall Power"], "values": [60, 70, 55, 75, 65]},
            "mocap": {"num_axes": 6, "labels": ["a", "b", "c", "d", "e", "f"], "values": [1, 2, 3, 4, 5, 6]},
            "mobility": {"num_axes": 5, "labels": ["a", "b", "c", "d", "e"], "values": [1, 2, 3, 4, 5]},
            "predictions": [],
            "roadmap": []
        }"#;

        let report = parse_structured_output(raw, "").unwrap();
        let skills = report.group("skills").unwrap();
        assert!(!skills.valid);
        assert_eq!(skills.values, vec![70.0, 65.0, 60.0]);
        assert_eq!(report.invalid_groups().count(), 1);
        assert!(report.group("power").unwrap().valid);

        let (labels, values) = skills.normalized();
        assert_eq!(labels.len(), 6);
        assert_eq!(labels[5], "Axis 6");
        assert_eq!(values, vec![70.0, 65.0, 60.0, 50.0, 50.0, 50.0]);
    }

    #[test]
    fn non_numeric_values_default_and_clamp() {
        let raw = r#"{"skills": {"labels": ["a", "b", "c"], "values": ["85%", "high", 140, "nan", "NaN", -3]}}"#;
        let report = parse_structured_output(raw, "").unwrap();
        let skills = report.group("skills").unwrap();
        assert_eq!(skills.values, vec![85.0, 50.0, 140.0, 50.0, 50.0, -3.0]);
        assert_eq!(
            skills.normalized().1,
            vec![85.0, 50.0, 100.0, 50.0, 50.0, 0.0]
        );
    }

    #[test]
    fn model_axis_count_never_overrides_schema() {
        let raw = r#"{"skills": {"num_axes": 4611686018427387904, "labels": ["a"], "values": [1]}}"#;
        let report = parse_structured_output(raw, "").unwrap();
        let skills = report.group("skills").unwrap();
        assert!(!skills.valid);
        assert_eq!(skills.num_axes, 6);

        let (labels, values) = skills.normalized();
        assert_eq!(labels.len(), 6);
        assert_eq!(values.len(), 6);

        let raw = r#"{"power": {"num_axes": 0, "labels": ["Lower Body", "Core", "Ground Force", "Rotation", "Overall Power"], "values": [60, 70, 55, 75, 65]}}"#;
        let report = parse_structured_output(raw, "").unwrap();
        let power = report.group("power").unwrap();
        assert!(!power.valid);
        assert_eq!(power.normalized().1, vec![60.0, 70.0, 55.0, 75.0, 65.0]);
    }

    #[test]
    fn missing_groups_are_estimated_from_report() {
        let raw = r#"{"video_summary": "Bullpen session.", "predictions": ["None"], "recommendations": ["Long toss"]}"#;
        let report_text = "The athlete shows excellent hip-shoulder separation. Ankle mobility is poor.";

        let report = parse_structured_output(raw, report_text).unwrap();
        assert_eq!(report.roadmap, vec!["Long toss".to_string()]);

        let mocap = report.group("mocap").unwrap();
        assert!(mocap.estimated);
        assert!(mocap.valid);
        assert!(mocap.values[0] > DEFAULT_METRIC);

        let mobility = report.group("mobility").unwrap();
        assert!(mobility.values[3] < DEFAULT_METRIC);
    }

    #[test]
    fn prompt_embeds_report_and_schema() {
        let prompt = extraction_prompt("## Summary\nGood arm speed.");
        assert!(prompt.contains("Good arm speed."));
        assert!(prompt.contains("\"mocap\""));
        assert!(prompt.contains("\"Hip/Shldr Sep\""));
    }
}
