use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::error::Result;
use crate::models::{ScoreValue, Sensor, CRITERIA_NAMES};

/// Durable sink for per-request metrics and structured review scores.
pub struct Storage {
    conn: Connection,
}

/// One timing/token row for a generation request.
pub struct MetricsRecord {
    pub sensor: Sensor,
    pub model: String,
    pub response_time_seconds: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub response_chars: usize,
}

/// One review outcome, keyed by canonical criterion keys ("P1".."P16",
/// "Overall"). Both the chunked and the single-shot review paths are
/// persisted through this shape.
pub struct ReviewRecord {
    pub sensor: Sensor,
    pub generator_model: String,
    pub reviewer_provider: String,
    pub reviewer_model: String,
    pub datasheet_status: String,
    pub scores: BTreeMap<String, ScoreValue>,
    pub justifications: BTreeMap<String, String>,
    pub warning: Option<String>,
}

impl ReviewRecord {
    /// Mean of the numeric P1-P16 scores; "Overall" is excluded.
    pub fn average_score(&self) -> Option<f64> {
        let numeric: Vec<i64> = self
            .scores
            .iter()
            .filter(|(key, _)| key.as_str() != "Overall")
            .filter_map(|(_, score)| score.as_numeric())
            .collect();
        if numeric.is_empty() {
            return None;
        }
        Some(numeric.iter().sum::<i64>() as f64 / numeric.len() as f64)
    }
}

#[derive(Debug)]
pub struct ReviewSummaryRow {
    pub reviewer_model: String,
    pub reviews: u32,
    pub average_score: Option<f64>,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let storage = Self { conn };
        storage.init_db()?;
        Ok(storage)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self { conn };
        storage.init_db()?;
        Ok(storage)
    }

    fn init_db(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                id INTEGER PRIMARY KEY,
                timestamp TEXT NOT NULL,
                sensor_brand TEXT NOT NULL,
                sensor_type TEXT NOT NULL,
                model TEXT NOT NULL,
                response_time_seconds REAL NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                response_chars INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reviews (
                id INTEGER PRIMARY KEY,
                timestamp TEXT NOT NULL,
                sensor_brand TEXT NOT NULL,
                sensor_type TEXT NOT NULL,
                generator_model TEXT NOT NULL,
                reviewer_provider TEXT NOT NULL,
                reviewer_model TEXT NOT NULL,
                datasheet_status TEXT NOT NULL,
                average_score REAL,
                overall_score TEXT,
                scores_json TEXT NOT NULL,
                justifications_json TEXT NOT NULL,
                warning TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_metrics_model ON metrics(model);
            CREATE INDEX IF NOT EXISTS idx_reviews_reviewer ON reviews(reviewer_model);
            "#,
        )?;
        Ok(())
    }

    pub fn record_metrics(&self, record: &MetricsRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO metrics (timestamp, sensor_brand, sensor_type, model,
                                 response_time_seconds, input_tokens, output_tokens, response_chars)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                record.sensor.brand,
                record.sensor.sensor_type,
                record.model,
                record.response_time_seconds,
                record.input_tokens as i64,
                record.output_tokens as i64,
                record.response_chars as i64,
            ],
        )?;
        Ok(())
    }

    pub fn record_review(&self, record: &ReviewRecord) -> Result<()> {
        let labeled_scores: BTreeMap<String, &ScoreValue> = record
            .scores
            .iter()
            .map(|(key, score)| (labeled_criterion(key), score))
            .collect();
        let labeled_justifications: BTreeMap<String, &String> = record
            .justifications
            .iter()
            .map(|(key, text)| (labeled_criterion(key), text))
            .collect();
        let scores_json = serde_json::to_string(&labeled_scores)?;
        let justifications_json = serde_json::to_string(&labeled_justifications)?;
        let overall = record.scores.get("Overall").map(|score| score.to_string());

        self.conn.execute(
            r#"
            INSERT INTO reviews (timestamp, sensor_brand, sensor_type, generator_model,
                                 reviewer_provider, reviewer_model, datasheet_status,
                                 average_score, overall_score, scores_json, justifications_json, warning)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                record.sensor.brand,
                record.sensor.sensor_type,
                record.generator_model,
                record.reviewer_provider,
                record.reviewer_model,
                record.datasheet_status,
                record.average_score(),
                overall,
                scores_json,
                justifications_json,
                record.warning,
            ],
        )?;
        Ok(())
    }

    pub fn review_summary(&self) -> Result<Vec<ReviewSummaryRow>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT reviewer_model, COUNT(*), AVG(average_score)
            FROM reviews
            GROUP BY reviewer_model
            ORDER BY reviewer_model
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(ReviewSummaryRow {
                reviewer_model: row.get(0)?,
                reviews: row.get(1)?,
                average_score: row.get(2)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

/// "P7" -> "P7_Pin_Configuration"; keys without a criterion name
/// ("Overall") pass through unchanged.
fn labeled_criterion(key: &str) -> String {
    key.strip_prefix('P')
        .and_then(|digits| digits.parse::<usize>().ok())
        .filter(|n| (1..=CRITERIA_NAMES.len()).contains(n))
        .map(|n| format!("P{}_{}", n, CRITERIA_NAMES[n - 1]))
        .unwrap_or_else(|| key.to_string())
}
