use serde::{Deserialize, Serialize};

/// Per-video outcome returned by the analysis service once a job finishes.
///
/// The service reports these as nested analysis blocks; the adapter flattens
/// them into this shape before anything else sees them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub video_url: String,
    pub succeeded: bool,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub translation: Option<String>,
    /// Visual quality score on a 0-10 scale.
    #[serde(default)]
    pub video_score: Option<f32>,
    /// Audio quality score on a 0-10 scale.
    #[serde(default)]
    pub audio_score: Option<f32>,
    #[serde(default)]
    pub overall_score: Option<f32>,
    /// Failure detail for items the service could not process.
    #[serde(default)]
    pub error: Option<String>,
}
