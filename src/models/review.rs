use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Criterion names for P1-P16, in order. Used when persisting review rows.
pub const CRITERIA_NAMES: [&str; 16] = [
    "Disclaimer",
    "Manufacturer_Info",
    "General_Description",
    "Theory_Of_Operation",
    "Features",
    "Potential_Applications",
    "Pin_Configuration",
    "Absolute_Maximum_Ratings",
    "Electrical_Characteristics",
    "Operating_Conditions",
    "Sensor_Performance",
    "Communication_Protocol",
    "Register_Map",
    "Package_Information",
    "Basic_Usage",
    "Compliance_Certifications",
];

/// A criterion score: an integer, or a sentinel string. The canonical
/// contract is 1-5 or the literal "N/A"; anything else fails chunk
/// validation (and is flagged as a warning by the extractor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreValue {
    Numeric(i64),
    Text(String),
}

impl ScoreValue {
    pub fn not_applicable() -> Self {
        ScoreValue::Text("N/A".to_string())
    }

    pub fn is_not_applicable(&self) -> bool {
        matches!(self, ScoreValue::Text(s) if s == "N/A")
    }

    pub fn as_numeric(&self) -> Option<i64> {
        match self {
            ScoreValue::Numeric(n) => Some(*n),
            ScoreValue::Text(_) => None,
        }
    }

    pub fn is_valid_likert(&self) -> bool {
        match self {
            ScoreValue::Numeric(n) => (1..=5).contains(n),
            ScoreValue::Text(s) => s == "N/A",
        }
    }
}

impl From<i64> for ScoreValue {
    fn from(n: i64) -> Self {
        ScoreValue::Numeric(n)
    }
}

impl std::fmt::Display for ScoreValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScoreValue::Numeric(n) => write!(f, "{}", n),
            ScoreValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// A strict sub-response schema for one review chunk. Every field is
/// required at deserialization; `validate` enforces the score contract.
pub trait ReviewChunk: DeserializeOwned {
    const NUMBER: u8;

    fn score_fields(&self) -> Vec<(&'static str, &ScoreValue)>;

    fn validate(&self) -> Result<()> {
        for (field, value) in self.score_fields() {
            if !value.is_valid_likert() {
                return Err(Error::ChunkValidation {
                    chunk: Self::NUMBER,
                    message: format!("{}: {} is not an integer 1-5 or \"N/A\"", field, value),
                });
            }
        }
        Ok(())
    }
}

/// Chunk 1: criteria P1-P6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewChunk1 {
    pub sensor_evaluated: String,
    pub p1_score: ScoreValue,
    pub p1_justification: String,
    pub p2_score: ScoreValue,
    pub p2_justification: String,
    pub p3_score: ScoreValue,
    pub p3_justification: String,
    pub p4_score: ScoreValue,
    pub p4_justification: String,
    pub p5_score: ScoreValue,
    pub p5_justification: String,
    pub p6_score: ScoreValue,
    pub p6_justification: String,
}

impl ReviewChunk for ReviewChunk1 {
    const NUMBER: u8 = 1;

    fn score_fields(&self) -> Vec<(&'static str, &ScoreValue)> {
        vec![
            ("p1_score", &self.p1_score),
            ("p2_score", &self.p2_score),
            ("p3_score", &self.p3_score),
            ("p4_score", &self.p4_score),
            ("p5_score", &self.p5_score),
            ("p6_score", &self.p6_score),
        ]
    }
}

/// Chunk 2: criteria P7-P11.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewChunk2 {
    pub sensor_evaluated: String,
    pub p7_score: ScoreValue,
    pub p7_justification: String,
    pub p8_score: ScoreValue,
    pub p8_justification: String,
    pub p9_score: ScoreValue,
    pub p9_justification: String,
    pub p10_score: ScoreValue,
    pub p10_justification: String,
    pub p11_score: ScoreValue,
    pub p11_justification: String,
}

impl ReviewChunk for ReviewChunk2 {
    const NUMBER: u8 = 2;

    fn score_fields(&self) -> Vec<(&'static str, &ScoreValue)> {
        vec![
            ("p7_score", &self.p7_score),
            ("p8_score", &self.p8_score),
            ("p9_score", &self.p9_score),
            ("p10_score", &self.p10_score),
            ("p11_score", &self.p11_score),
        ]
    }
}

/// Chunk 3: criteria P12-P16 plus the overall verdict and a free-text
/// confirmation that the review covers only the requested sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewChunk3 {
    pub sensor_evaluated: String,
    pub p12_score: ScoreValue,
    pub p12_justification: String,
    pub p13_score: ScoreValue,
    pub p13_justification: String,
    pub p14_score: ScoreValue,
    pub p14_justification: String,
    pub p15_score: ScoreValue,
    pub p15_justification: String,
    pub p16_score: ScoreValue,
    pub p16_justification: String,
    pub overall_score: i64,
    pub overall_justification: String,
    pub confirmation: String,
}

impl ReviewChunk for ReviewChunk3 {
    const NUMBER: u8 = 3;

    fn score_fields(&self) -> Vec<(&'static str, &ScoreValue)> {
        vec![
            ("p12_score", &self.p12_score),
            ("p13_score", &self.p13_score),
            ("p14_score", &self.p14_score),
            ("p15_score", &self.p15_score),
            ("p16_score", &self.p16_score),
        ]
    }

    fn validate(&self) -> Result<()> {
        for (field, value) in self.score_fields() {
            if !value.is_valid_likert() {
                return Err(Error::ChunkValidation {
                    chunk: Self::NUMBER,
                    message: format!("{}: {} is not an integer 1-5 or \"N/A\"", field, value),
                });
            }
        }
        if !(1..=5).contains(&self.overall_score) {
            return Err(Error::ChunkValidation {
                chunk: Self::NUMBER,
                message: format!("overall_score: {} is outside 1-5", self.overall_score),
            });
        }
        Ok(())
    }
}

/// All 16 criteria plus the overall verdict, merged from the three
/// validated chunks. Only constructed once every chunk has passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteReview {
    pub sensor_evaluated: String,
    pub p1_score: ScoreValue,
    pub p1_justification: String,
    pub p2_score: ScoreValue,
    pub p2_justification: String,
    pub p3_score: ScoreValue,
    pub p3_justification: String,
    pub p4_score: ScoreValue,
    pub p4_justification: String,
    pub p5_score: ScoreValue,
    pub p5_justification: String,
    pub p6_score: ScoreValue,
    pub p6_justification: String,
    pub p7_score: ScoreValue,
    pub p7_justification: String,
    pub p8_score: ScoreValue,
    pub p8_justification: String,
    pub p9_score: ScoreValue,
    pub p9_justification: String,
    pub p10_score: ScoreValue,
    pub p10_justification: String,
    pub p11_score: ScoreValue,
    pub p11_justification: String,
    pub p12_score: ScoreValue,
    pub p12_justification: String,
    pub p13_score: ScoreValue,
    pub p13_justification: String,
    pub p14_score: ScoreValue,
    pub p14_justification: String,
    pub p15_score: ScoreValue,
    pub p15_justification: String,
    pub p16_score: ScoreValue,
    pub p16_justification: String,
    pub overall_score: i64,
    pub overall_justification: String,
    pub confirmation: String,
}

impl CompleteReview {
    /// Structural join of the three chunks. Ranges are disjoint by
    /// construction, so no reconciliation is needed.
    pub fn merge(chunk1: ReviewChunk1, chunk2: ReviewChunk2, chunk3: ReviewChunk3) -> Self {
        Self {
            sensor_evaluated: chunk1.sensor_evaluated,
            p1_score: chunk1.p1_score,
            p1_justification: chunk1.p1_justification,
            p2_score: chunk1.p2_score,
            p2_justification: chunk1.p2_justification,
            p3_score: chunk1.p3_score,
            p3_justification: chunk1.p3_justification,
            p4_score: chunk1.p4_score,
            p4_justification: chunk1.p4_justification,
            p5_score: chunk1.p5_score,
            p5_justification: chunk1.p5_justification,
            p6_score: chunk1.p6_score,
            p6_justification: chunk1.p6_justification,
            p7_score: chunk2.p7_score,
            p7_justification: chunk2.p7_justification,
            p8_score: chunk2.p8_score,
            p8_justification: chunk2.p8_justification,
            p9_score: chunk2.p9_score,
            p9_justification: chunk2.p9_justification,
            p10_score: chunk2.p10_score,
            p10_justification: chunk2.p10_justification,
            p11_score: chunk2.p11_score,
            p11_justification: chunk2.p11_justification,
            p12_score: chunk3.p12_score,
            p12_justification: chunk3.p12_justification,
            p13_score: chunk3.p13_score,
            p13_justification: chunk3.p13_justification,
            p14_score: chunk3.p14_score,
            p14_justification: chunk3.p14_justification,
            p15_score: chunk3.p15_score,
            p15_justification: chunk3.p15_justification,
            p16_score: chunk3.p16_score,
            p16_justification: chunk3.p16_justification,
            overall_score: chunk3.overall_score,
            overall_justification: chunk3.overall_justification,
            confirmation: chunk3.confirmation,
        }
    }

    fn criterion_pairs(&self) -> Vec<(&ScoreValue, &str)> {
        vec![
            (&self.p1_score, &self.p1_justification),
            (&self.p2_score, &self.p2_justification),
            (&self.p3_score, &self.p3_justification),
            (&self.p4_score, &self.p4_justification),
            (&self.p5_score, &self.p5_justification),
            (&self.p6_score, &self.p6_justification),
            (&self.p7_score, &self.p7_justification),
            (&self.p8_score, &self.p8_justification),
            (&self.p9_score, &self.p9_justification),
            (&self.p10_score, &self.p10_justification),
            (&self.p11_score, &self.p11_justification),
            (&self.p12_score, &self.p12_justification),
            (&self.p13_score, &self.p13_justification),
            (&self.p14_score, &self.p14_justification),
            (&self.p15_score, &self.p15_justification),
            (&self.p16_score, &self.p16_justification),
        ]
    }

    /// Scores keyed by canonical criterion key ("P1".."P16", "Overall").
    pub fn scores(&self) -> BTreeMap<String, ScoreValue> {
        let mut scores: BTreeMap<String, ScoreValue> = self
            .criterion_pairs()
            .into_iter()
            .enumerate()
            .map(|(i, (score, _))| (format!("P{}", i + 1), score.clone()))
            .collect();
        scores.insert("Overall".to_string(), ScoreValue::Numeric(self.overall_score));
        scores
    }

    /// Justifications keyed by canonical criterion key.
    pub fn justifications(&self) -> BTreeMap<String, String> {
        let mut justifications: BTreeMap<String, String> = self
            .criterion_pairs()
            .into_iter()
            .enumerate()
            .map(|(i, (_, text))| (format!("P{}", i + 1), text.to_string()))
            .collect();
        justifications.insert("Overall".to_string(), self.overall_justification.clone());
        justifications
    }

    /// Mean of the numeric P1-P16 scores; None when every criterion is
    /// "N/A".
    pub fn average_numeric_score(&self) -> Option<f64> {
        let numeric: Vec<i64> = self
            .criterion_pairs()
            .into_iter()
            .filter_map(|(score, _)| score.as_numeric())
            .collect();
        if numeric.is_empty() {
            return None;
        }
        Some(numeric.iter().sum::<i64>() as f64 / numeric.len() as f64)
    }
}
