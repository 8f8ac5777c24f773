use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::{Config, ModelEntry};
use crate::error::{Error, Result};
use crate::llm::{extract, ClientFactory, ProviderClient, RateLimiter};
use crate::models::{ModelRequest, Sensor};
use crate::review::{single_prompt, ChunkedReviewOrchestrator, PromptTemplate};
use crate::storage::{MetricsRecord, ReviewRecord, Storage};

/// Drives the sensor x model grid: datasheet generation with metrics
/// logging, and datasheet review (chunked or single-shot). A failure on
/// one (sensor, model) unit is recorded and logged; sibling units keep
/// going.
pub struct ComparisonPipeline {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
    storage: Storage,
    config: Config,
}

impl ComparisonPipeline {
    /// Builds one client per configured provider, all sharing a single
    /// rate limiter scoped to this run. Configuration problems surface
    /// here, before any network activity.
    pub fn new(config: Config, storage: Storage) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::from_config(&config));
        let mut clients = HashMap::new();
        for (name, provider_config) in &config.providers {
            let client = ClientFactory::get_client(provider_config, name, Some(limiter.clone()))?;
            clients.insert(name.clone(), client);
        }
        Ok(Self {
            clients,
            storage,
            config,
        })
    }

    fn client_for(&self, provider: &str) -> Result<&Arc<dyn ProviderClient>> {
        self.clients
            .get(provider)
            .ok_or_else(|| Error::Config(format!("no client for provider '{}'", provider)))
    }

    pub async fn generate_all(&self) -> Result<()> {
        let template = match &self.config.prompt_template_path {
            Some(path) => PromptTemplate::from_file(path)?,
            None => PromptTemplate::generation_default(),
        };

        let total = self.config.sensors.len() * self.config.models.len();
        tracing::info!("Generating datasheets for {} sensor/model pairs", total);
        let pb = progress_bar(total as u64, "pairs");

        let mut failures = 0usize;
        for sensor in &self.config.sensors {
            let prompt = template.render_generation(sensor);
            for model in &self.config.models {
                if let Err(e) = self.generate_one(sensor, model, &prompt).await {
                    failures += 1;
                    tracing::error!("{} with {} failed: {}", sensor, model.id, e);
                }
                pb.inc(1);
            }
        }
        pb.finish_with_message("generation complete");

        if failures > 0 {
            tracing::warn!("{}/{} generation units failed", failures, total);
        }
        Ok(())
    }

    async fn generate_one(&self, sensor: &Sensor, model: &ModelEntry, prompt: &str) -> Result<()> {
        let client = self.client_for(&model.provider)?;

        let request = ModelRequest::new(&model.id, prompt);
        let start = Instant::now();
        let response = client.send_request(&request).await?;
        let elapsed = start.elapsed().as_secs_f64();

        let path = self.write_result(sensor, &model.id, &response.text)?;
        tracing::info!(
            "{} with {}: {:.1}s, {} output tokens, saved to {}",
            sensor,
            model.id,
            elapsed,
            response.output_tokens,
            path.display()
        );

        self.storage.record_metrics(&MetricsRecord {
            sensor: sensor.clone(),
            model: model.id.clone(),
            response_time_seconds: elapsed,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            response_chars: response.text.chars().count(),
        })?;
        Ok(())
    }

    fn write_result(&self, sensor: &Sensor, model_id: &str, text: &str) -> Result<PathBuf> {
        let dir = self.config.results_path.join(sensor.slug());
        std::fs::create_dir_all(&dir)?;
        let filename = format!(
            "{}_{}.md",
            model_id.replace('/', "_"),
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        let path = dir.join(filename);
        std::fs::write(&path, text)?;
        Ok(path)
    }

    /// Reviews every generated datasheet for every configured sensor
    /// with the given reviewer model.
    pub async fn review_all(&self, reviewer: &ModelEntry, chunked: bool) -> Result<()> {
        let client = self.client_for(&reviewer.provider)?.clone();
        let template = match &self.config.review_prompt_template_path {
            Some(path) => PromptTemplate::from_file(path)?,
            None => PromptTemplate::review_default(),
        };

        let pb = progress_bar(self.config.sensors.len() as u64, "sensors");
        if chunked {
            let orchestrator = ChunkedReviewOrchestrator::new(client, template)
                .with_chunk_delay(Duration::from_secs(self.config.chunk_delay_seconds));
            for sensor in &self.config.sensors {
                if let Err(e) = self.review_sensor_chunked(&orchestrator, reviewer, sensor).await {
                    tracing::error!("Review of {} failed: {}", sensor, e);
                }
                pb.inc(1);
            }
        } else {
            for sensor in &self.config.sensors {
                if let Err(e) = self
                    .review_sensor_single(&client, &template, reviewer, sensor)
                    .await
                {
                    tracing::error!("Review of {} failed: {}", sensor, e);
                }
                pb.inc(1);
            }
        }
        pb.finish_with_message("review complete");
        Ok(())
    }

    async fn review_sensor_chunked(
        &self,
        orchestrator: &ChunkedReviewOrchestrator,
        reviewer: &ModelEntry,
        sensor: &Sensor,
    ) -> Result<()> {
        let (official_path, official) = self.find_official_datasheet(sensor)?;
        let datasheet_status = format!("found at {}", official_path.display());

        for (path, generator_model) in self.generated_datasheets(sensor)? {
            let generated = std::fs::read_to_string(&path)?;
            match orchestrator
                .review_sensor(&reviewer.id, sensor, &generated, &official)
                .await
            {
                Ok(review) => {
                    self.write_review_json(sensor, &reviewer.id, &serde_json::to_string_pretty(&review)?)?;
                    self.storage.record_review(&ReviewRecord {
                        sensor: sensor.clone(),
                        generator_model,
                        reviewer_provider: reviewer.provider.clone(),
                        reviewer_model: reviewer.id.clone(),
                        datasheet_status: datasheet_status.clone(),
                        scores: review.scores(),
                        justifications: review.justifications(),
                        warning: None,
                    })?;
                }
                Err(e) => tracing::error!(
                    "Chunked review of {} ({}) with {} failed: {}",
                    sensor,
                    generator_model,
                    reviewer.id,
                    e
                ),
            }
        }
        Ok(())
    }

    async fn review_sensor_single(
        &self,
        client: &Arc<dyn ProviderClient>,
        template: &PromptTemplate,
        reviewer: &ModelEntry,
        sensor: &Sensor,
    ) -> Result<()> {
        let (official_path, official) = self.find_official_datasheet(sensor)?;
        let datasheet_status = format!("found at {}", official_path.display());

        for (path, generator_model) in self.generated_datasheets(sensor)? {
            let generated = std::fs::read_to_string(&path)?;
            let prompt = single_prompt(&template.render_review(sensor, &generated, &official));
            let request = ModelRequest::new(&reviewer.id, prompt);

            match client.send_request(&request).await {
                Ok(response) => {
                    let context = format!("sensor={}, model={}", sensor, reviewer.id);
                    let extraction = extract(&response.text, Some(&context));
                    if extraction.scores.is_empty() {
                        tracing::error!(
                            "Extraction failed for {} ({}) with {}: {}",
                            sensor,
                            generator_model,
                            reviewer.id,
                            extraction.warning.as_deref().unwrap_or("no scores")
                        );
                        continue;
                    }
                    if let Some(warning) = &extraction.warning {
                        tracing::warn!("{}: {}", context, warning);
                    }
                    self.storage.record_review(&ReviewRecord {
                        sensor: sensor.clone(),
                        generator_model,
                        reviewer_provider: reviewer.provider.clone(),
                        reviewer_model: reviewer.id.clone(),
                        datasheet_status: datasheet_status.clone(),
                        scores: extraction.scores,
                        justifications: extraction.justifications,
                        warning: extraction.warning,
                    })?;
                }
                Err(e) => tracing::error!(
                    "Single review of {} ({}) with {} failed: {}",
                    sensor,
                    generator_model,
                    reviewer.id,
                    e
                ),
            }
        }
        Ok(())
    }

    /// Probes the configured datasheet directories for
    /// `<Brand>_<Type>.md`, then `.txt`.
    fn find_official_datasheet(&self, sensor: &Sensor) -> Result<(PathBuf, String)> {
        for dir in &self.config.datasheet_paths {
            for extension in ["md", "txt"] {
                let candidate = dir.join(format!("{}.{}", sensor.slug(), extension));
                if candidate.exists() {
                    tracing::debug!("Official datasheet found at {}", candidate.display());
                    let content = std::fs::read_to_string(&candidate)?;
                    return Ok((candidate, content));
                }
            }
        }
        Err(Error::DatasheetNotFound(sensor.to_string()))
    }

    /// Generated datasheet files for a sensor, paired with the label of
    /// the model that produced them (the filename stem).
    fn generated_datasheets(&self, sensor: &Sensor) -> Result<Vec<(PathBuf, String)>> {
        let dir = self.config.results_path.join(sensor.slug());
        if !dir.exists() {
            tracing::warn!("No generated datasheets for {} in {}", sensor, dir.display());
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "md") {
                let label = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .unwrap_or_default();
                files.push((path, label));
            }
        }
        files.sort();
        Ok(files)
    }

    fn write_review_json(&self, sensor: &Sensor, reviewer_model: &str, json: &str) -> Result<PathBuf> {
        let dir = &self.config.reviews_path;
        std::fs::create_dir_all(dir)?;
        let filename = format!(
            "{}_{}_review.json",
            reviewer_model.replace('/', "_"),
            sensor.slug()
        );
        let path = dir.join(filename);
        std::fs::write(&path, json)?;
        Ok(path)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

fn progress_bar(len: u64, unit: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {}",
                unit
            ))
            .unwrap()
            .progress_chars("#>-"),
    );
    pb
}
