use std::path::Path;

use crate::error::{Error, Result};
use crate::models::Sensor;

const DEFAULT_GENERATION_TEMPLATE: &str = "\
You are an expert in electronic sensors and technical documentation.
Write a complete technical datasheet in markdown for the {{SENSOR_BRAND}} {{SENSOR_MODEL}} sensor.
Cover: disclaimer, manufacturer information, general description, theory of operation, features,
potential applications, pin configuration, absolute maximum ratings, electrical characteristics,
operating conditions, sensor performance, communication protocol, register map, package information,
basic usage, and compliance/certifications.
";

const DEFAULT_REVIEW_TEMPLATE: &str = "\
You are reviewing a machine-generated datasheet for the {{SENSOR_BRAND}} {{SENSOR_MODEL}} sensor
against the official manufacturer datasheet. Score each requested criterion from 1 (unusable)
to 5 (matches the official datasheet), or \"N/A\" when the official datasheet does not cover it.

# Generated datasheet

{{generated_datasheet}}

# Official datasheet

{{official_datasheet}}
";

/// A prompt template with `{{...}}` placeholders, loaded from a file or
/// falling back to the built-in defaults.
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let template = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read template {}: {}", path.display(), e))
        })?;
        Ok(Self::new(template))
    }

    pub fn generation_default() -> Self {
        Self::new(DEFAULT_GENERATION_TEMPLATE)
    }

    pub fn review_default() -> Self {
        Self::new(DEFAULT_REVIEW_TEMPLATE)
    }

    pub fn render_generation(&self, sensor: &Sensor) -> String {
        self.template
            .replace("{{SENSOR_BRAND}}", &sensor.brand)
            .replace("{{SENSOR_MODEL}}", &sensor.sensor_type)
    }

    pub fn render_review(&self, sensor: &Sensor, generated: &str, official: &str) -> String {
        self.render_generation(sensor)
            .replace("{{generated_datasheet}}", generated)
            .replace("{{official_datasheet}}", official)
    }
}

/// One of the three review sub-requests, each scoped to a disjoint
/// criterion range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkId {
    First,
    Second,
    Third,
}

impl ChunkId {
    pub const ALL: [ChunkId; 3] = [ChunkId::First, ChunkId::Second, ChunkId::Third];

    pub fn number(self) -> u8 {
        match self {
            ChunkId::First => 1,
            ChunkId::Second => 2,
            ChunkId::Third => 3,
        }
    }

    pub fn criteria(self) -> &'static str {
        match self {
            ChunkId::First => "P1-P6",
            ChunkId::Second => "P7-P11",
            ChunkId::Third => "P12-P16 + overall",
        }
    }

    fn instructions(self) -> &'static str {
        match self {
            ChunkId::First => CHUNK1_INSTRUCTIONS,
            ChunkId::Second => CHUNK2_INSTRUCTIONS,
            ChunkId::Third => CHUNK3_INSTRUCTIONS,
        }
    }
}

/// Appends the chunk-specific response-format instructions to the
/// rendered review prompt.
pub fn chunk_prompt(base: &str, chunk: ChunkId) -> String {
    format!("{}\n{}", base, chunk.instructions())
}

/// Single-shot variant: the whole review in one response, parsed with
/// the tolerant extraction cascade instead of the strict chunk schemas.
pub fn single_prompt(base: &str) -> String {
    format!("{}\n{}", base, SINGLE_INSTRUCTIONS)
}

const SINGLE_INSTRUCTIONS: &str = r#"
# IMPORTANT: Response Format
Evaluate ALL criteria P1-P16 and provide an overall score.
Return ONLY valid JSON with keys "p1_score", "p1_justification" through
"p16_score", "p16_justification", plus "overall_score" and
"overall_justification". Scores are integers 1-5 or "N/A".
Keep justifications concise (under 100 characters).
"#;

const CHUNK1_INSTRUCTIONS: &str = r#"
# IMPORTANT: Response Format for CHUNK 1
This is part 1 of 3 of the review. ONLY evaluate criteria P1-P6 (Disclaimer through Potential Applications).
Return ONLY valid JSON with this exact structure:

```json
{
  "sensor_evaluated": "BRAND MODEL",
  "p1_score": 5,
  "p1_justification": "Brief justification for P1",
  "p2_score": 4,
  "p2_justification": "Brief justification for P2",
  "p3_score": 4,
  "p3_justification": "Brief justification for P3",
  "p4_score": 5,
  "p4_justification": "Brief justification for P4",
  "p5_score": 3,
  "p5_justification": "Brief justification for P5",
  "p6_score": 4,
  "p6_justification": "Brief justification for P6"
}
```

Scores are integers 1-5 or "N/A". DO NOT include evaluations for P7-P16 or an overall score.
Keep justifications concise (under 100 characters) so the response fits within API limits.
"#;

const CHUNK2_INSTRUCTIONS: &str = r#"
# IMPORTANT: Response Format for CHUNK 2
This is part 2 of 3 of the review. ONLY evaluate criteria P7-P11 (Pin Configuration through Sensor Performance).
Return ONLY valid JSON with this exact structure:

```json
{
  "sensor_evaluated": "BRAND MODEL",
  "p7_score": 4,
  "p7_justification": "Brief justification for P7",
  "p8_score": 5,
  "p8_justification": "Brief justification for P8",
  "p9_score": 3,
  "p9_justification": "Brief justification for P9",
  "p10_score": 4,
  "p10_justification": "Brief justification for P10",
  "p11_score": 5,
  "p11_justification": "Brief justification for P11"
}
```

Scores are integers 1-5 or "N/A". DO NOT include evaluations for P1-P6, P12-P16, or an overall score.
Keep justifications concise (under 100 characters) so the response fits within API limits.
"#;

const CHUNK3_INSTRUCTIONS: &str = r#"
# IMPORTANT: Response Format for CHUNK 3
This is part 3 of 3 of the review. ONLY evaluate criteria P12-P16 (Communication Protocol through Compliance) and provide an overall score.
Return ONLY valid JSON with this exact structure:

```json
{
  "sensor_evaluated": "BRAND MODEL",
  "p12_score": 4,
  "p12_justification": "Brief justification for P12",
  "p13_score": 3,
  "p13_justification": "Brief justification for P13",
  "p14_score": 5,
  "p14_justification": "Brief justification for P14",
  "p15_score": 4,
  "p15_justification": "Brief justification for P15",
  "p16_score": "N/A",
  "p16_justification": "Brief justification for P16",
  "overall_score": 4,
  "overall_justification": "Brief overall justification",
  "confirmation": "This review is exclusively for the BRAND MODEL sensor and contains no references to other sensor models."
}
```

The overall score is an integer 1-5. DO NOT include evaluations for P1-P11.
Keep justifications concise (under 100 characters) so the response fits within API limits.
"#;
