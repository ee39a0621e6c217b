//! Structured match analysis report.
//!
//! These types mirror the JSON document the model is asked to produce for
//! a match recording. Deserialization is deliberately tolerant: unknown
//! fields are ignored, sequences default to empty, and most scalar details
//! are optional, because the upstream model controls the document and its
//! adherence varies. A report is produced once per successful run and
//! fully replaced on re-run, never merged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Full analysis of one match recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchAnalysis {
    /// Who is playing, where, and the observed score.
    #[serde(default)]
    pub match_context: MatchContext,

    /// Observed shapes for both sides.
    #[serde(default)]
    pub formations: Formations,

    /// Timestamped events in recording order.
    #[serde(default)]
    pub events: Vec<MatchEvent>,

    /// Player movement observations in recording order.
    #[serde(default)]
    pub player_movements: Vec<PlayerMovement>,

    /// Tactical insights in the order the model reported them.
    #[serde(default)]
    pub insights: Vec<TacticalInsight>,

    /// Stamped by the pipeline on success; not part of the model document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
}

/// Match identification context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchContext {
    #[serde(default)]
    pub home_team: String,
    #[serde(default)]
    pub away_team: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub competition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<String>,
}

/// Observed formations for the two sides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Formations {
    #[serde(default)]
    pub home: TeamFormation,
    #[serde(default)]
    pub away: TeamFormation,
}

/// One team's observed shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamFormation {
    #[serde(default)]
    pub team: String,
    /// Shape notation, e.g. "4-3-3".
    #[serde(default)]
    pub shape: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One timestamped event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchEvent {
    /// Display timestamp within the recording, e.g. "12:34".
    #[serde(default)]
    pub timestamp: String,
    /// Event category as reported by the model, e.g. "goal", "turnover".
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// One player movement observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerMovement {
    #[serde(default)]
    pub player: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub observation: String,
}

/// One tactical insight, optionally anchored to a key moment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TacticalInsight {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_moment: Option<KeyMoment>,
}

/// A moment in the recording an insight points at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyMoment {
    /// Display timestamp, e.g. "54:10".
    #[serde(default)]
    pub timestamp: String,
    /// Offset into the recording in seconds.
    #[serde(default)]
    pub seconds: f64,
}
