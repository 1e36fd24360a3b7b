use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PollerConfig {
    /// Endpoint root of the remote presence API.
    pub base_url: String,
    /// Name of the environment variable holding the API key. The key itself
    /// never appears in the config file.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Age of the last success after which the overview reports stale data.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    /// Subject ids to track. Empty set with `roster` fetch mode tracks
    /// everything the remote returns.
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub fetch_mode: FetchMode,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub response: ResponseShape,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// One request returns every subject's presence.
    #[default]
    Roster,
    /// One request per tracked subject, fanned out within the cycle.
    PerSubject,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackoffConfig {
    /// Consecutive failures before the interval starts stretching.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
    /// Ceiling on the interval, as a multiple of the base interval.
    #[serde(default = "default_max_multiplier")]
    pub max_multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            factor: default_backoff_factor(),
            max_multiplier: default_max_multiplier(),
        }
    }
}

/// Mapping from the remote JSON to presence snapshots. The remote schema is
/// deployment-specific, so nothing here is hard-coded in the client.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResponseShape {
    /// Keys tried, in order, when the body is an object wrapping the roster
    /// array instead of a bare array.
    #[serde(default = "default_wrapper_keys")]
    pub wrapper_keys: Vec<String>,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_status_field")]
    pub status_field: String,
    #[serde(default = "default_present_values")]
    pub present_values: Vec<String>,
    #[serde(default = "default_absent_values")]
    pub absent_values: Vec<String>,
}

impl Default for ResponseShape {
    fn default() -> Self {
        Self {
            wrapper_keys: default_wrapper_keys(),
            id_field: default_id_field(),
            status_field: default_status_field(),
            present_values: default_present_values(),
            absent_values: default_absent_values(),
        }
    }
}

fn default_api_key_env() -> String { "ONLOCATION_API_KEY".into() }
fn default_poll_interval() -> u64 { 10 }
fn default_request_timeout() -> u64 { 15_000 }
fn default_api_port() -> u16 { 3000 }
fn default_stale_after() -> u64 { 120 }
fn default_max_concurrency() -> usize { 8 }
fn default_failure_threshold() -> u32 { 3 }
fn default_backoff_factor() -> f64 { 2.0 }
fn default_max_multiplier() -> f64 { 8.0 }
fn default_wrapper_keys() -> Vec<String> {
    vec!["data".into(), "staff".into(), "employees".into()]
}
fn default_id_field() -> String { "id".into() }
fn default_status_field() -> String { "onsite_status".into() }
fn default_present_values() -> Vec<String> { vec!["onsite".into()] }
fn default_absent_values() -> Vec<String> { vec!["offsite".into()] }
