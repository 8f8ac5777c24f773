use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::llm::extractor::recover_json;
use crate::llm::provider::ProviderClient;
use crate::models::{
    CompleteReview, ModelRequest, ReviewChunk, ReviewChunk1, ReviewChunk2, ReviewChunk3, Sensor,
};
use crate::review::prompts::{chunk_prompt, ChunkId, PromptTemplate};

/// Splits one oversized structured review into three sequential
/// sub-requests over disjoint criterion ranges and merges the validated
/// chunks. Requests go out one at a time with a fixed delay in between,
/// since providers throttle bursts aggressively. A missing or invalid
/// chunk aborts the whole review; a partial merge is never produced.
pub struct ChunkedReviewOrchestrator {
    client: Arc<dyn ProviderClient>,
    template: PromptTemplate,
    chunk_delay: Duration,
}

impl ChunkedReviewOrchestrator {
    pub fn new(client: Arc<dyn ProviderClient>, template: PromptTemplate) -> Self {
        Self {
            client,
            template,
            chunk_delay: Duration::from_secs(30),
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub async fn review_sensor(
        &self,
        model_id: &str,
        sensor: &Sensor,
        generated: &str,
        official: &str,
    ) -> Result<CompleteReview> {
        let base = self.template.render_review(sensor, generated, official);

        let chunk1: ReviewChunk1 = self
            .process_chunk(ChunkId::First, model_id, sensor, &base)
            .await?;
        self.pause_between_chunks().await;
        let chunk2: ReviewChunk2 = self
            .process_chunk(ChunkId::Second, model_id, sensor, &base)
            .await?;
        self.pause_between_chunks().await;
        let chunk3: ReviewChunk3 = self
            .process_chunk(ChunkId::Third, model_id, sensor, &base)
            .await?;

        tracing::info!("All review chunks validated for {}, merging", sensor);
        Ok(CompleteReview::merge(chunk1, chunk2, chunk3))
    }

    async fn process_chunk<T: ReviewChunk>(
        &self,
        id: ChunkId,
        model_id: &str,
        sensor: &Sensor,
        base: &str,
    ) -> Result<T> {
        tracing::info!(
            "Reviewing {} chunk {} ({}) with {}",
            sensor,
            id.number(),
            id.criteria(),
            model_id
        );

        let request = ModelRequest::new(model_id, chunk_prompt(base, id));
        let response = self.client.send_request(&request).await?;

        let value = recover_json(&response.text).ok_or_else(|| Error::ChunkExtraction {
            chunk: T::NUMBER,
            message: "response contained no parsable JSON".to_string(),
        })?;
        let chunk: T = serde_json::from_value(value).map_err(|e| Error::ChunkValidation {
            chunk: T::NUMBER,
            message: e.to_string(),
        })?;
        chunk.validate()?;
        Ok(chunk)
    }

    async fn pause_between_chunks(&self) {
        if !self.chunk_delay.is_zero() {
            tracing::debug!(
                "Waiting {}s between review chunks",
                self.chunk_delay.as_secs()
            );
            tokio::time::sleep(self.chunk_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::models::{ModelResponse, ScoreValue};

    #[derive(Debug)]
    struct ScriptedClient {
        responses: Mutex<VecDeque<String>>,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(responses: Vec<String>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedClient {
        async fn send_request(&self, _request: &ModelRequest) -> crate::error::Result<ModelResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = self
                .responses
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| "out of scripted responses".to_string());
            Ok(ModelResponse::from_text(text))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn fenced(body: String) -> String {
        format!("Here is the review:\n```json\n{}\n```", body)
    }

    fn chunk1_response() -> String {
        let mut fields = vec![r#""sensor_evaluated": "Bosch BME280""#.to_string()];
        for i in 1..=6 {
            fields.push(format!(r#""p{}_score": 4"#, i));
            fields.push(format!(r#""p{}_justification": "ok""#, i));
        }
        fenced(format!("{{{}}}", fields.join(", ")))
    }

    fn chunk2_response(p9_score: &str) -> String {
        let mut fields = vec![r#""sensor_evaluated": "Bosch BME280""#.to_string()];
        for i in 7..=11 {
            let score = if i == 9 { p9_score.to_string() } else { "3".to_string() };
            fields.push(format!(r#""p{}_score": {}"#, i, score));
            fields.push(format!(r#""p{}_justification": "fine""#, i));
        }
        fenced(format!("{{{}}}", fields.join(", ")))
    }

    fn chunk3_response() -> String {
        let mut fields = vec![r#""sensor_evaluated": "Bosch BME280""#.to_string()];
        for i in 12..=16 {
            fields.push(format!(r#""p{}_score": 5"#, i));
            fields.push(format!(r#""p{}_justification": "good""#, i));
        }
        fields.push(r#""overall_score": 4"#.to_string());
        fields.push(r#""overall_justification": "solid""#.to_string());
        fields.push(r#""confirmation": "Bosch BME280 only""#.to_string());
        fenced(format!("{{{}}}", fields.join(", ")))
    }

    fn orchestrator(client: Arc<ScriptedClient>) -> ChunkedReviewOrchestrator {
        ChunkedReviewOrchestrator::new(client, PromptTemplate::review_default())
    }

    #[tokio::test(start_paused = true)]
    async fn three_valid_chunks_merge_into_a_complete_review() {
        let client = ScriptedClient::new(vec![
            chunk1_response(),
            chunk2_response("3"),
            chunk3_response(),
        ]);
        let sensor = Sensor::new("Bosch", "BME280");

        let review = orchestrator(client.clone())
            .review_sensor("openai/gpt-4", &sensor, "GEN", "OFFICIAL")
            .await
            .unwrap();

        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
        assert_eq!(review.sensor_evaluated, "Bosch BME280");
        assert_eq!(review.overall_score, 4);
        let scores = review.scores();
        assert_eq!(scores["P1"], ScoreValue::Numeric(4));
        assert_eq!(scores["P9"], ScoreValue::Numeric(3));
        assert_eq!(scores["P16"], ScoreValue::Numeric(5));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_chunk2_aborts_before_chunk3_and_names_the_chunk() {
        let client = ScriptedClient::new(vec![
            chunk1_response(),
            chunk2_response("7"),
            chunk3_response(),
        ]);
        let sensor = Sensor::new("Bosch", "BME280");

        let err = orchestrator(client.clone())
            .review_sensor("openai/gpt-4", &sensor, "GEN", "OFFICIAL")
            .await
            .unwrap_err();

        match err {
            Error::ChunkValidation { chunk, message } => {
                assert_eq!(chunk, 2);
                assert!(message.contains("p9_score"), "got: {message}");
            }
            other => panic!("unexpected error: {other}"),
        }
        // Chunk 3 was never requested; no partial merge exists.
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_required_field_is_a_chunk_validation_error() {
        let broken = chunk1_response().replace(r#""p6_score": 4, "#, "");
        let client = ScriptedClient::new(vec![broken]);
        let sensor = Sensor::new("Bosch", "BME280");

        let err = orchestrator(client)
            .review_sensor("openai/gpt-4", &sensor, "GEN", "OFFICIAL")
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ChunkValidation { chunk: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn response_without_json_is_a_chunk_extraction_error() {
        let client = ScriptedClient::new(vec!["I cannot review this sensor.".to_string()]);
        let sensor = Sensor::new("Bosch", "BME280");

        let err = orchestrator(client)
            .review_sensor("openai/gpt-4", &sensor, "GEN", "OFFICIAL")
            .await
            .unwrap_err();

        match err {
            Error::ChunkExtraction { chunk, .. } => assert_eq!(chunk, 1),
            other => panic!("unexpected error: {other}"),
        }
    }
}
