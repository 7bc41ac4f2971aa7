//! HTTP-backed collaborators and the runner wired from configuration.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::sync::Arc;
use waypoint::analysis::{full_analysis, refresh_analysis, AggregateStore, UnitSource};
use waypoint::{
    EngineConfig, FallbackProcessor, ProcessingError, Runner, RunnerBuilder, TaskStore,
    UnitContext, WorkUnit, WorkUnitProcessor,
};

use crate::config::ServerConfig;

/// Work unit processor behind an HTTP endpoint.
///
/// Posts `{unit, context}` and takes the JSON response as the result.
/// Connection errors, 429 and 5xx responses are retryable.
pub struct HttpProcessor {
    client: reqwest::Client,
    name: String,
    url: String,
}

impl HttpProcessor {
    pub fn new(client: reqwest::Client, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl WorkUnitProcessor for HttpProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        unit: &WorkUnit,
        context: &UnitContext,
    ) -> Result<serde_json::Value, ProcessingError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "unit": unit, "context": context }))
            .send()
            .await
            .map_err(|e| ProcessingError::retryable(&unit.id, e))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProcessingError::retryable(
                &unit.id,
                anyhow::anyhow!("{} returned {status}", self.name),
            ));
        }
        if !status.is_success() {
            return Err(ProcessingError::permanent(
                &unit.id,
                anyhow::anyhow!("{} returned {status}", self.name),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| ProcessingError::permanent(&unit.id, e))
    }
}

/// Unit source behind `POST {base}/units`, queried with `{ownerId, options}`.
pub struct HttpUnitSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUnitSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl UnitSource for HttpUnitSource {
    async fn load(
        &self,
        owner_id: &str,
        options: &serde_json::Value,
    ) -> anyhow::Result<Vec<WorkUnit>> {
        let url = format!("{}/units", self.base_url.trim_end_matches('/'));
        let units = self
            .client
            .post(&url)
            .json(&json!({ "ownerId": owner_id, "options": options }))
            .send()
            .await
            .with_context(|| format!("requesting units from {url}"))?
            .error_for_status()?
            .json()
            .await
            .context("decoding units")?;
        Ok(units)
    }
}

/// Build a runner with both analysis task types over HTTP collaborators.
pub fn build_runner<S, G>(
    store: S,
    aggregates: G,
    config: &ServerConfig,
    engine: &EngineConfig,
) -> anyhow::Result<Runner<S>>
where
    S: TaskStore + 'static,
    G: AggregateStore + Clone,
{
    let processor_url = config
        .processor_url
        .clone()
        .context("WAYPOINT_PROCESSOR_URL is not set")?;
    let source_url = config
        .unit_source_url
        .clone()
        .context("WAYPOINT_UNIT_SOURCE_URL is not set")?;

    let client = reqwest::Client::new();
    let primary = HttpProcessor::new(client.clone(), "primary", processor_url);
    let processor: Arc<dyn WorkUnitProcessor> = match &config.fallback_processor_url {
        Some(url) => Arc::new(FallbackProcessor::new(
            primary,
            HttpProcessor::new(client.clone(), "fallback", url.clone()),
        )),
        None => Arc::new(primary),
    };
    let source = Arc::new(HttpUnitSource::new(client, source_url));

    Ok(RunnerBuilder::new(store)
        .config(engine)
        .pipeline(full_analysis(
            source.clone(),
            processor.clone(),
            aggregates.clone(),
            engine,
        ))
        .pipeline(refresh_analysis(source, processor, aggregates, engine))
        .build())
}
