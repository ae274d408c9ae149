//! Emotion classification: ranked prosody predictions → one emotion → one light state.
//!
//! Everything here is pure. `classify` picks the top prediction, `is_confident`
//! is the gate the session manager applies before anything visible happens, and
//! `to_actuator_state` is a total lookup that always yields one of seven colours.

use serde::{Deserialize, Serialize};

/// Scores at or below this never reach observers or the light.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.45;

/// One ranked emotion returned by the inference service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionPrediction {
    pub name: String,
    /// Confidence in [0, 1].
    pub score: f64,
}

impl EmotionPrediction {
    pub fn new(name: impl Into<String>, score: f64) -> Self {
        Self {
            name: name.into(),
            score,
        }
    }
}

/// The winning prediction of one inference response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub emotion: String,
    pub score: f64,
}

/// Select the prediction with the highest score.
///
/// Ties keep the first-seen entry. Returns `None` ("no detection") for an empty set.
pub fn classify(predictions: &[EmotionPrediction]) -> Option<Classification> {
    let mut best: Option<&EmotionPrediction> = None;
    for prediction in predictions {
        match best {
            Some(current) if prediction.score <= current.score => {}
            _ => best = Some(prediction),
        }
    }
    best.map(|p| Classification {
        emotion: p.name.clone(),
        score: p.score,
    })
}

/// Confidence gate: strictly greater than the threshold passes.
pub fn is_confident(score: f64, threshold: f64) -> bool {
    score > threshold
}

/// Light state sent to the actuator. Serialized with the bridge's field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActuatorState {
    pub hue: u16,
    #[serde(rename = "sat")]
    pub saturation: u8,
    #[serde(rename = "bri")]
    pub brightness: u8,
}

/// The seven canonical categories the light can show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmotionCategory {
    Joy,
    Excitement,
    Anger,
    Sadness,
    Calmness,
    Fear,
    Neutral,
}

impl EmotionCategory {
    pub const ALL: [EmotionCategory; 7] = [
        EmotionCategory::Joy,
        EmotionCategory::Excitement,
        EmotionCategory::Anger,
        EmotionCategory::Sadness,
        EmotionCategory::Calmness,
        EmotionCategory::Fear,
        EmotionCategory::Neutral,
    ];

    /// Map any emotion name onto a category. Never fails; unknown names are Neutral.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Joy" | "Adoration" | "Amusement" | "Ecstasy" => EmotionCategory::Joy,
            "Excitement" => EmotionCategory::Excitement,
            "Anger" | "Annoyance" | "Disgust" | "Contempt" => EmotionCategory::Anger,
            "Sadness" => EmotionCategory::Sadness,
            "Calmness" => EmotionCategory::Calmness,
            "Fear" | "Anxiety" | "Horror" | "Distress" => EmotionCategory::Fear,
            _ => EmotionCategory::Neutral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionCategory::Joy => "Joy",
            EmotionCategory::Excitement => "Excitement",
            EmotionCategory::Anger => "Anger",
            EmotionCategory::Sadness => "Sadness",
            EmotionCategory::Calmness => "Calmness",
            EmotionCategory::Fear => "Fear",
            EmotionCategory::Neutral => "Neutral",
        }
    }

    /// Colour table entry for this category.
    pub const fn state(self) -> ActuatorState {
        let (hue, saturation, brightness) = match self {
            EmotionCategory::Joy => (10000, 254, 254),        // yellow
            EmotionCategory::Excitement => (5000, 254, 254),  // orange
            EmotionCategory::Anger => (0, 254, 254),          // red
            EmotionCategory::Sadness => (46920, 200, 100),    // blue
            EmotionCategory::Calmness => (35000, 150, 150),   // teal
            EmotionCategory::Fear => (50000, 254, 200),       // violet
            EmotionCategory::Neutral => (8000, 50, 150),      // warm white
        };
        ActuatorState {
            hue,
            saturation,
            brightness,
        }
    }
}

/// Light state for an emotion name. Total over all strings.
pub fn to_actuator_state(name: &str) -> ActuatorState {
    EmotionCategory::from_name(name).state()
}
