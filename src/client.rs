use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::{FetchMode, PollerConfig, ResponseShape};
use crate::models::{FetchBatch, FetchError, PollResult, PresenceSnapshot, PresenceStatus};

/// Wrapper around the remote presence API. Owns key injection, timeouts and
/// response normalization; never touches shared state.
pub struct PresenceClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    subjects: Vec<String>,
    fetch_mode: FetchMode,
    shape: ResponseShape,
    limiter: Semaphore,
}

impl PresenceClient {
    pub fn new(config: &PollerConfig, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            subjects: config.subjects.clone(),
            fetch_mode: config.fetch_mode,
            shape: config.response.clone(),
            limiter: Semaphore::new(config.max_concurrency.max(1)),
        })
    }

    /// One fetch attempt covering every tracked subject.
    pub async fn fetch(&self, cycle: u64) -> PollResult {
        match self.fetch_mode {
            FetchMode::Roster => self.fetch_roster(cycle).await,
            FetchMode::PerSubject => self.fetch_per_subject(cycle).await,
        }
    }

    async fn fetch_roster(&self, cycle: u64) -> PollResult {
        let (http_status, body) = self.get_json(&self.base_url).await?;
        let entries = self.roster_entries(&body)?;

        let now = Utc::now();
        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(subject_id) = self.subject_id_of(entry) else {
                continue;
            };
            if !self.subjects.is_empty() && !self.subjects.contains(&subject_id) {
                continue;
            }
            snapshots.push(PresenceSnapshot {
                subject_id,
                status: self.status_of(entry),
                last_updated_at: now,
                source_cycle: cycle,
            });
        }

        Ok(FetchBatch {
            snapshots,
            http_status,
            partial_failures: Vec::new(),
        })
    }

    async fn fetch_per_subject(&self, cycle: u64) -> PollResult {
        let now = Utc::now();
        let mut tasks = FuturesUnordered::new();
        for subject in &self.subjects {
            tasks.push(async move {
                let _permit = self.limiter.acquire().await.ok();
                (subject.clone(), self.fetch_one(subject).await)
            });
        }

        let mut snapshots = Vec::new();
        let mut partial_failures = Vec::new();
        let mut http_status = None;
        while let Some((subject_id, result)) = tasks.next().await {
            match result {
                Ok((status, presence)) => {
                    http_status.get_or_insert(status);
                    snapshots.push(PresenceSnapshot {
                        subject_id,
                        status: presence,
                        last_updated_at: now,
                        source_cycle: cycle,
                    });
                }
                Err(err) => partial_failures.push((subject_id, err)),
            }
        }

        // A cycle with zero successful subjects counts as a failed cycle.
        if snapshots.is_empty() {
            return Err(partial_failures
                .into_iter()
                .map(|(_, err)| err)
                .next()
                .unwrap_or_else(|| {
                    FetchError::MalformedResponse("no subjects configured".into())
                }));
        }

        Ok(FetchBatch {
            snapshots,
            http_status: http_status.unwrap_or(200),
            partial_failures,
        })
    }

    async fn fetch_one(&self, subject: &str) -> Result<(u16, PresenceStatus), FetchError> {
        let url = format!("{}/{}", self.base_url, subject);
        let (http_status, body) = self.get_json(&url).await?;
        if !body.is_object() {
            return Err(FetchError::MalformedResponse(format!(
                "expected a status object for subject {subject}"
            )));
        }
        Ok((http_status, self.status_of(&body)))
    }

    async fn get_json(&self, url: &str) -> Result<(u16, Value), FetchError> {
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, format!("APIKEY {}", self.api_key))
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::AuthRejected(status.as_u16()));
        }
        if !status.is_success() {
            return Err(FetchError::Unknown(status.as_u16()));
        }

        let body = response.json::<Value>().await.map_err(|err| {
            if err.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::MalformedResponse(err.to_string())
            }
        })?;
        Ok((status.as_u16(), body))
    }

    /// The roster endpoint returns a bare array, or an object wrapping the
    /// array under one of the configured keys.
    fn roster_entries<'a>(&self, body: &'a Value) -> Result<&'a Vec<Value>, FetchError> {
        if let Some(entries) = body.as_array() {
            return Ok(entries);
        }
        if let Some(wrapper) = body.as_object() {
            for key in &self.shape.wrapper_keys {
                if let Some(entries) = wrapper.get(key).and_then(Value::as_array) {
                    return Ok(entries);
                }
            }
        }
        Err(FetchError::MalformedResponse(
            "expected a roster array or a known wrapper object".into(),
        ))
    }

    fn subject_id_of(&self, entry: &Value) -> Option<String> {
        match entry.get(&self.shape.id_field) {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        }
    }

    fn status_of(&self, entry: &Value) -> PresenceStatus {
        let matches = |values: &[String], raw: &str| {
            values.iter().any(|value| value.eq_ignore_ascii_case(raw))
        };
        match entry.get(&self.shape.status_field).and_then(Value::as_str) {
            Some(raw) if matches(&self.shape.present_values, raw) => PresenceStatus::Present,
            Some(raw) if matches(&self.shape.absent_values, raw) => PresenceStatus::Absent,
            _ => PresenceStatus::Unknown,
        }
    }
}

fn transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(err.to_string())
    }
}
