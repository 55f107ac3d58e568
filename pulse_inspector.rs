//! # Pulse Inspector - Live Metrics & Flame Graph Engine
//!
//! Periodically pulls metric snapshots and stack-sample profiles from a
//! running process and keeps them in a shape a live UI can draw from:
//! rolling chart series per metric dimension and flame-graph layouts per
//! profile stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              PULSE INSPECTOR                                 │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  METRIC SOURCE  ──(write lock, whole batch)──▶  METRIC TREE ──┐              │
//! │  PROFILE SOURCE ──(build aside, swap Arc)────▶  SAMPLE TREES ─┼─▶ RENDER     │
//! │  TRACE STREAM   ──(short mutex)──────────────▶  TRACE STORE ──┘    MODELS    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every source gets its own poll task, so two fetches for the same source
//! can never overlap. Readers take the metric tree's read lock for one full
//! walk, and read sample trees from an atomically published snapshot.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::hash_map::Entry;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::sync::watch;
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use futures::StreamExt;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{de::DeserializeOwned, Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String, Collection & Hashing
// ----------------------------------------------------------------------------
use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt as tracing_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

// ----------------------------------------------------------------------------
// Time, Networking, Patterns
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client as HttpClient;

// ----------------------------------------------------------------------------
// Configuration, CLI, Self-Metrics
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Inspector version - follows semantic versioning
pub const INSPECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Human readable product name
pub const INSPECTOR_NAME: &str = "Pulse Inspector";

// ----------------------------------------------------------------------------
// Series & Tree Shape
// ----------------------------------------------------------------------------

/// Default number of points kept per ring list
pub const DEFAULT_SERIES_LENGTH: usize = 100;

/// Default number of name segments forming one metric tree path
pub const DEFAULT_SPLIT_DEPTH: usize = 2;

/// Default metric name segment separator
pub const DEFAULT_NAME_SEPARATOR: &str = "_";

/// Dimension key used for metrics without labels
pub const DEFAULT_DIMENSION: &str = "default";

/// Name of the synthetic "no stack" node of every sample tree
pub const PROFILE_ROOT_NAME: &str = "#root";

/// Vertical padding applied around chart extremes
pub const CHART_AXIS_PADDING: f64 = 5.0;

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default metric scrape interval (milliseconds)
pub const DEFAULT_SCRAPE_INTERVAL_MS: u64 = 250;

/// Minimum allowed scrape interval (milliseconds)
pub const MIN_SCRAPE_INTERVAL_MS: u64 = 10;

/// Lower bound on the pause between two profile captures (milliseconds)
pub const MIN_PROFILE_PAUSE_MS: u64 = 50;

/// Default headless render interval (milliseconds)
pub const DEFAULT_RENDER_INTERVAL_MS: u64 = 1000;

/// Default retention window for trace events (seconds)
pub const DEFAULT_TRACE_WINDOW_SECS: u64 = 10;

/// Default HTTP timeout for metric and profile fetches (seconds)
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Pause before reopening a closed trace stream (milliseconds)
pub const TRACE_RECONNECT_DELAY_MS: u64 = 1000;

/// Longest trace line buffered while waiting for its newline (bytes)
pub const MAX_TRACE_LINE_BYTES: usize = 64 * 1024;

// ----------------------------------------------------------------------------
// Network
// ----------------------------------------------------------------------------

/// Default inspected target
pub const DEFAULT_TARGET_URL: &str = "http://0.0.0.0:6060/";

/// Default path of the decoded metrics snapshot
pub const DEFAULT_METRICS_PATH: &str = "metrics";

/// Default listen address of the inspector's own metrics endpoint
pub const DEFAULT_SELF_METRICS_ADDR: &str = "0.0.0.0:7070";

// ============================================================================
// SECTION 3: DECODED INPUT TYPES
// ============================================================================
// The wire decoders live outside this crate. Everything below describes the
// already-decoded records the engine consumes. They derive serde so a JSON
// snapshot of a decoded batch can be fetched directly.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Metric Families
// ----------------------------------------------------------------------------

/// Type tag of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
    Summary,
    Histogram,
    /// Treated exactly like a gauge
    #[default]
    Untyped,
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Summary => write!(f, "summary"),
            MetricKind::Histogram => write!(f, "histogram"),
            MetricKind::Untyped => write!(f, "untyped"),
        }
    }
}

/// A single label (name, value) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelPair {
    pub name: CompactString,
    pub value: CompactString,
}

impl LabelPair {
    #[inline]
    pub fn new<N, V>(name: N, value: V) -> Self
    where
        N: Into<CompactString>,
        V: Into<CompactString>,
    {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Labels of one metric instance. Most carry only a handful.
pub type Labels = SmallVec<[LabelPair; 4]>;

/// One summary quantile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantile {
    #[serde(with = "float_repr")]
    pub quantile: f64,
    #[serde(with = "float_repr")]
    pub value: f64,
}

/// One cumulative histogram bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    #[serde(with = "float_repr")]
    pub upper_bound: f64,
    pub cumulative_count: u64,
}

/// Type-specific numeric payload of a metric instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum MetricPayload {
    /// Gauge, counter and untyped values
    Value {
        #[serde(with = "float_repr")]
        value: f64,
    },
    Summary {
        sample_count: u64,
        #[serde(with = "float_repr")]
        sample_sum: f64,
        #[serde(default)]
        quantiles: Vec<Quantile>,
    },
    Histogram {
        sample_count: u64,
        #[serde(with = "float_repr")]
        sample_sum: f64,
        #[serde(default)]
        buckets: Vec<Bucket>,
    },
}

/// One labeled instance inside a family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(default)]
    pub labels: Labels,
    pub payload: MetricPayload,
}

impl Metric {
    /// Plain value instance (gauge, counter, untyped)
    pub fn value(value: f64) -> Self {
        Self {
            labels: Labels::new(),
            payload: MetricPayload::Value { value },
        }
    }

    pub fn summary(sample_count: u64, sample_sum: f64, quantiles: Vec<Quantile>) -> Self {
        Self {
            labels: Labels::new(),
            payload: MetricPayload::Summary {
                sample_count,
                sample_sum,
                quantiles,
            },
        }
    }

    pub fn histogram(sample_count: u64, sample_sum: f64, buckets: Vec<Bucket>) -> Self {
        Self {
            labels: Labels::new(),
            payload: MetricPayload::Histogram {
                sample_count,
                sample_sum,
                buckets,
            },
        }
    }

    /// Append a label, keeping presentation order
    pub fn with_label(mut self, name: &str, value: &str) -> Self {
        self.labels.push(LabelPair::new(name, value));
        self
    }
}

/// A decoded metric family record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricFamily {
    /// Absent names are rejected at ingestion
    #[serde(default)]
    pub name: Option<CompactString>,
    #[serde(default)]
    pub help: String,
    #[serde(default, rename = "type")]
    pub kind: MetricKind,
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

impl MetricFamily {
    pub fn new(name: &str, kind: MetricKind) -> Self {
        Self {
            name: Some(CompactString::from(name)),
            help: String::new(),
            kind,
            metrics: Vec::new(),
        }
    }

    /// Single unlabeled gauge instance
    pub fn gauge(name: &str, value: f64) -> Self {
        Self::new(name, MetricKind::Gauge).with_metric(Metric::value(value))
    }

    /// Single unlabeled counter instance
    pub fn counter(name: &str, value: f64) -> Self {
        Self::new(name, MetricKind::Counter).with_metric(Metric::value(value))
    }

    pub fn with_help(mut self, help: &str) -> Self {
        self.help = help.to_string();
        self
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metrics.push(metric);
        self
    }
}

// ----------------------------------------------------------------------------
// 3.2 Stack Samples
// ----------------------------------------------------------------------------

/// One stack location. Inlining can expand a location into several
/// logical frames, listed in the order they are entered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub lines: SmallVec<[CompactString; 2]>,
}

impl Location {
    pub fn frame(name: &str) -> Self {
        let mut lines = SmallVec::new();
        lines.push(CompactString::from(name));
        Self { lines }
    }

    pub fn inlined(names: &[&str]) -> Self {
        Self {
            lines: names.iter().map(|n| CompactString::from(*n)).collect(),
        }
    }
}

/// One weighted stack observation, locations listed outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sample {
    #[serde(default)]
    pub locations: Vec<Location>,
    /// Nanoseconds, bytes or event count depending on the stream
    pub weight: i64,
}

impl Sample {
    /// Build a sample where every frame is its own location
    pub fn from_frames(frames: &[&str], weight: i64) -> Self {
        Self {
            locations: frames.iter().map(|f| Location::frame(f)).collect(),
            weight,
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.locations.push(location);
        self
    }
}

// ----------------------------------------------------------------------------
// 3.3 Float Representation
// ----------------------------------------------------------------------------

/// JSON has no literal for infinities or NaN, so non-finite floats travel as
/// strings such as `"+Inf"` and `"NaN"`.
mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_str(&super::format_bound(*value))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => text
                .trim()
                .parse::<f64>()
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Render a bucket bound or quantile the way it appears in series names.
pub fn format_bound(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{}", value)
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Inspector Errors
// ----------------------------------------------------------------------------

/// The main error type. All subsystem errors convert into it.
#[derive(Error, Debug)]
pub enum InspectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl InspectorError {
    /// Whether the next poll has a chance of succeeding
    pub fn is_recoverable(&self) -> bool {
        match self {
            InspectorError::Config(_) => false,
            InspectorError::Ingest(_) => true,
            InspectorError::Source(e) => e.is_recoverable(),
            InspectorError::Io(_) => true,
            InspectorError::Internal(_) => false,
            InspectorError::ShuttingDown => false,
        }
    }

    /// Error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            InspectorError::Config(_) => "config",
            InspectorError::Ingest(_) => "ingest",
            InspectorError::Source(e) => e.category(),
            InspectorError::Io(_) => "io",
            InspectorError::Internal(_) => "internal",
            InspectorError::ShuttingDown => "shutdown",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Ingestion Errors
// ----------------------------------------------------------------------------

/// Errors raised while folding a decoded batch into the metric tree.
/// Families applied before the failing one stay applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("Malformed metric family at position {index}: {reason}")]
    MalformedInput { index: usize, reason: String },
}

// ----------------------------------------------------------------------------
// 4.3 Source Errors
// ----------------------------------------------------------------------------

/// Transport failures of the fetch step. Retrying is the poll loop's job.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("Background build failed: {0}")]
    Join(String),
}

impl SourceError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            SourceError::Request { .. } => true,
            SourceError::Status { status, .. } => *status >= 500 || *status == 429,
            SourceError::Decode { .. } => false,
            SourceError::Join(_) => false,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            SourceError::Request { .. } => "request",
            SourceError::Status { .. } => "status",
            SourceError::Decode { .. } => "decode",
            SourceError::Join(_) => "join",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Configuration Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Result Type Aliases
// ----------------------------------------------------------------------------

pub type InspectorResult<T> = Result<T, InspectorError>;

pub type IngestResult<T> = Result<T, IngestError>;

pub type SourceResult<T> = Result<T, SourceError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file + PULSE_* environment overrides, validated before use.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration of the inspector
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectorConfig {
    /// What to inspect and where its data lives
    #[serde(default)]
    pub target: TargetConfig,

    /// Ring list and metric tree shape
    #[serde(default)]
    pub series: SeriesConfig,

    /// Poll, render and retention intervals
    #[serde(default)]
    pub intervals: IntervalConfig,

    /// The inspector's own metrics endpoint
    #[serde(default)]
    pub self_metrics: SelfMetricsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl InspectorConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PULSE_").split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string (no environment overrides)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.series.length == 0 {
            return Err(ConfigError::invalid_value(
                "series.length",
                "series length must be at least 1",
            ));
        }

        if self.series.split_depth == 0 {
            return Err(ConfigError::invalid_value(
                "series.split_depth",
                "split depth must be at least 1",
            ));
        }

        if self.series.separator.is_empty() {
            return Err(ConfigError::invalid_value(
                "series.separator",
                "separator cannot be empty",
            ));
        }

        self.series.compiled_exclude()?;

        if self.intervals.scrape < Duration::from_millis(MIN_SCRAPE_INTERVAL_MS) {
            return Err(ConfigError::invalid_value(
                "intervals.scrape",
                format!("scrape interval must be at least {}ms", MIN_SCRAPE_INTERVAL_MS),
            ));
        }

        if self.intervals.render.is_zero() {
            return Err(ConfigError::invalid_value(
                "intervals.render",
                "render interval cannot be zero",
            ));
        }

        let mut seen: Vec<&str> = Vec::with_capacity(self.target.profiles.len());
        for stream in &self.target.profiles {
            if stream.name.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    "target.profiles.name",
                    "profile stream names cannot be empty",
                ));
            }
            if seen.contains(&stream.name.as_str()) {
                return Err(ConfigError::invalid_value(
                    "target.profiles.name",
                    format!("duplicate profile stream '{}'", stream.name),
                ));
            }
            seen.push(&stream.name);
        }

        if self.self_metrics.enabled {
            self.self_metrics.socket_addr()?;
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Target Configuration
// ----------------------------------------------------------------------------

/// Units a profile stream's sample weights are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightUnit {
    #[default]
    Nanoseconds,
    Bytes,
    Count,
}

/// One profile stream of the target (cpu, heap, block, mutex, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileStreamConfig {
    pub name: String,
    pub path: String,
    /// Capture window requested from the target, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<u64>,
    #[serde(default)]
    pub unit: WeightUnit,
}

impl ProfileStreamConfig {
    pub fn new(name: &str, path: &str, unit: WeightUnit) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            seconds: None,
            unit,
        }
    }

    pub fn with_seconds(mut self, seconds: u64) -> Self {
        self.seconds = Some(seconds);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URL of the inspected process
    #[serde(default = "default_target_url")]
    pub url: String,

    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    #[serde(default = "default_profile_streams")]
    pub profiles: Vec<ProfileStreamConfig>,

    /// Line-oriented trace event stream, disabled when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traces_path: Option<String>,

    #[serde(with = "humantime_serde", default = "default_fetch_timeout")]
    pub timeout: Duration,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: default_target_url(),
            metrics_path: default_metrics_path(),
            profiles: default_profile_streams(),
            traces_path: None,
            timeout: default_fetch_timeout(),
        }
    }
}

impl TargetConfig {
    pub fn metrics_url(&self) -> String {
        join_url(&self.url, &self.metrics_path)
    }

    pub fn profile_url(&self, stream: &ProfileStreamConfig) -> String {
        join_url(&self.url, &stream.path)
    }

    pub fn traces_url(&self) -> Option<String> {
        self.traces_path.as_deref().map(|p| join_url(&self.url, p))
    }

    pub fn stream(&self, name: &str) -> Option<&ProfileStreamConfig> {
        self.profiles.iter().find(|s| s.name == name)
    }
}

/// Join a base URL and a relative path with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn default_target_url() -> String {
    DEFAULT_TARGET_URL.into()
}

fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.into()
}

fn default_profile_streams() -> Vec<ProfileStreamConfig> {
    vec![
        ProfileStreamConfig::new("cpu", "debug/pprof/profile", WeightUnit::Nanoseconds)
            .with_seconds(1),
        ProfileStreamConfig::new("heap", "debug/pprof/heap", WeightUnit::Bytes),
        ProfileStreamConfig::new("block", "debug/pprof/block", WeightUnit::Nanoseconds),
        ProfileStreamConfig::new("mutex", "debug/pprof/mutex", WeightUnit::Nanoseconds),
    ]
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS)
}

// ----------------------------------------------------------------------------
// 5.3 Series Configuration
// ----------------------------------------------------------------------------

/// How histogram bucket series are derived across scrapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketMode {
    /// Delta of each bucket's cumulative count
    #[default]
    Cumulative,
    /// Cumulative counts are first turned into per-bucket counts, then deltaed
    PerBucket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesConfig {
    /// Ring list capacity
    #[serde(default = "default_series_length")]
    pub length: usize,

    /// Maximum number of name segments per metric tree path
    #[serde(default = "default_split_depth")]
    pub split_depth: usize,

    #[serde(default = "default_separator")]
    pub separator: String,

    #[serde(default)]
    pub bucket_mode: BucketMode,

    /// Regex patterns; matching family names are not ingested
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            length: default_series_length(),
            split_depth: default_split_depth(),
            separator: default_separator(),
            bucket_mode: BucketMode::default(),
            exclude: Vec::new(),
        }
    }
}

impl SeriesConfig {
    pub fn compiled_exclude(&self) -> Result<Vec<Regex>, ConfigError> {
        self.exclude
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    ConfigError::invalid_value("series.exclude", format!("{}: {}", pattern, e))
                })
            })
            .collect()
    }
}

fn default_series_length() -> usize {
    DEFAULT_SERIES_LENGTH
}

fn default_split_depth() -> usize {
    DEFAULT_SPLIT_DEPTH
}

fn default_separator() -> String {
    DEFAULT_NAME_SEPARATOR.into()
}

// ----------------------------------------------------------------------------
// 5.4 Interval Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    /// Pause between metric scrapes
    #[serde(with = "humantime_serde", default = "default_scrape_interval")]
    pub scrape: Duration,

    /// Pause between two profile captures of the same stream
    #[serde(with = "humantime_serde", default)]
    pub profile_pause: Duration,

    /// Headless render tick
    #[serde(with = "humantime_serde", default = "default_render_interval")]
    pub render: Duration,

    /// How long trace events stay visible
    #[serde(with = "humantime_serde", default = "default_trace_window")]
    pub trace_window: Duration,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            scrape: default_scrape_interval(),
            profile_pause: Duration::ZERO,
            render: default_render_interval(),
            trace_window: default_trace_window(),
        }
    }
}

fn default_scrape_interval() -> Duration {
    Duration::from_millis(DEFAULT_SCRAPE_INTERVAL_MS)
}

fn default_render_interval() -> Duration {
    Duration::from_millis(DEFAULT_RENDER_INTERVAL_MS)
}

fn default_trace_window() -> Duration {
    Duration::from_secs(DEFAULT_TRACE_WINDOW_SECS)
}

// ----------------------------------------------------------------------------
// 5.5 Self-Metrics Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfMetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_self_metrics_addr")]
    pub addr: String,
}

impl Default for SelfMetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_self_metrics_addr(),
        }
    }
}

impl SelfMetricsConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr
            .parse()
            .map_err(|e| ConfigError::invalid_value("self_metrics.addr", format!("{}", e)))
    }
}

fn default_self_metrics_addr() -> String {
    DEFAULT_SELF_METRICS_ADDR.into()
}

// ----------------------------------------------------------------------------
// 5.6 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Daily rolling log file, in addition to stdout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Map a configured level name to a filter, defaulting to INFO.
pub fn parse_level_filter(level: &str) -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;

    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system. The returned guard must outlive the
/// program's logging when a log file is configured.
pub fn init_logging(config: &LoggingConfig) -> InspectorResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_level_filter(&config.level).into())
        .from_env_lossy();

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let file_name = path.file_name().ok_or_else(|| {
                ConfigError::invalid_value("logging.file", "log file path has no file name")
            })?;
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stdout_layer = match config.format.as_str() {
        "json" => tracing_fmt::layer()
            .json()
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
        "pretty" => tracing_fmt::layer()
            .pretty()
            .with_ansi(config.colors)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
        _ => tracing_fmt::layer()
            .compact()
            .with_ansi(config.colors)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| InspectorError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "pulse::init",
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "Logging initialized"
    );

    Ok(guard)
}

// ============================================================================
// SECTION 7: RING LIST
// ============================================================================
// Fixed-capacity history of scalars. Storage is doubled and every write is
// mirrored, so the oldest-to-newest view is always one contiguous slice and
// reading it never allocates.
// ============================================================================

/// Fixed-capacity circular buffer of the most recent `capacity` values.
#[derive(Debug, Clone)]
pub struct RingList {
    /// `2 * capacity` slots; slot `i` and `capacity + i` always hold the same value
    data: Box<[f64]>,
    capacity: usize,
    /// Next write slot
    pos: usize,
    len: usize,
    last_value: f64,
    last_sum: f64,
    last_count: f64,
}

impl RingList {
    /// Create an empty list. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: vec![0.0; capacity * 2].into_boxed_slice(),
            capacity,
            pos: 0,
            len: 0,
            last_value: 0.0,
            last_sum: 0.0,
            last_count: 0.0,
        }
    }

    /// Append a value, overwriting the oldest one when full. NaN is stored as 0.
    #[inline]
    pub fn push(&mut self, value: f64) {
        let value = if value.is_nan() { 0.0 } else { value };

        self.data[self.pos] = value;
        self.data[self.capacity + self.pos] = value;

        self.pos += 1;
        if self.pos >= self.capacity {
            self.pos = 0;
        }

        if self.len < self.capacity {
            self.len += 1;
        }
    }

    /// Append the difference to the previous raw value of a monotonic counter.
    ///
    /// The previous raw value starts at zero, so the first point equals the
    /// first observation itself.
    #[inline]
    pub fn push_delta(&mut self, value: f64) {
        let delta = value - self.last_value;
        self.last_value = value;
        self.push(delta);
    }

    /// Append the mean of the observations that arrived since the previous
    /// call, derived from an accumulator's running sum and count. No new
    /// observations yield 0.
    #[inline]
    pub fn push_windowed_mean(&mut self, sum: f64, count: f64) {
        let new_count = count - self.last_count;
        let mean = if new_count == 0.0 {
            0.0
        } else {
            (sum - self.last_sum) / new_count
        };
        self.last_sum = sum;
        self.last_count = count;
        self.push(mean);
    }

    /// Up to `capacity` most recent values, oldest first.
    #[inline]
    pub fn view(&self) -> &[f64] {
        let start = self.pos + self.capacity - self.len;
        &self.data[start..start + self.len]
    }

    /// Most recently pushed value
    pub fn latest(&self) -> Option<f64> {
        self.view().last().copied()
    }

    /// Last raw value seen by `push_delta`
    pub fn last_raw(&self) -> f64 {
        self.last_value
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Minimum and maximum across all given views, for sizing chart axes.
/// Returns `(0.0, 0.0)` when the views hold no values at all.
pub fn extremes<'a, I>(views: I) -> (f64, f64)
where
    I: IntoIterator<Item = &'a [f64]>,
{
    let mut range: Option<(f64, f64)> = None;
    for value in views.into_iter().flatten() {
        range = Some(match range {
            None => (*value, *value),
            Some((min, max)) => (min.min(*value), max.max(*value)),
        });
    }
    range.unwrap_or((0.0, 0.0))
}

// ============================================================================
// SECTION 8: METRIC SERIES & METRIC TREE
// ============================================================================
// Metric names are split into path segments and stored in an arena-backed
// tree. Nodes own their children by index; the parent link is a plain index
// too, so ancestor walks stay O(depth) without shared ownership.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Metric Series
// ----------------------------------------------------------------------------

/// Derivation family of a series. Only used to pick how values are pushed
/// and how a renderer might annotate the chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesKind {
    Gauge,
    Counter,
}

/// One named series, holding a ring list per dimension.
#[derive(Debug, Clone)]
pub struct MetricSeries {
    kind: SeriesKind,
    name: CompactString,
    help: String,
    capacity: usize,
    /// Dimensions in first-seen order, for stable rendering
    dims: Vec<CompactString>,
    lists: AHashMap<CompactString, RingList>,
}

impl MetricSeries {
    pub fn new(kind: SeriesKind, name: &str, help: &str, capacity: usize) -> Self {
        Self {
            kind,
            name: CompactString::from(name),
            help: help.to_string(),
            capacity,
            dims: Vec::new(),
            lists: AHashMap::new(),
        }
    }

    pub fn kind(&self) -> SeriesKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn help(&self) -> &str {
        &self.help
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ring list for `dimension`, created on first use.
    pub fn list_mut(&mut self, dimension: &str) -> &mut RingList {
        match self.lists.entry(CompactString::from(dimension)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.dims.push(entry.key().clone());
                entry.insert(RingList::new(self.capacity))
            }
        }
    }

    pub fn list(&self, dimension: &str) -> Option<&RingList> {
        self.lists.get(dimension)
    }

    pub fn view(&self, dimension: &str) -> Option<&[f64]> {
        self.lists.get(dimension).map(RingList::view)
    }

    pub fn dimensions(&self) -> &[CompactString] {
        &self.dims
    }

    /// `(dimension, view)` pairs in first-seen dimension order
    pub fn lines(&self) -> impl Iterator<Item = (&str, &[f64])> + '_ {
        self.dims.iter().filter_map(move |dim| {
            self.lists
                .get(dim.as_str())
                .map(|list| (dim.as_str(), list.view()))
        })
    }

    pub fn extremes(&self) -> (f64, f64) {
        extremes(self.lines().map(|(_, view)| view))
    }

    /// True when the only dimension is the unlabeled default one
    pub fn is_default_only(&self) -> bool {
        self.dims.len() == 1 && self.dims[0] == DEFAULT_DIMENSION
    }
}

/// Build the dimension key of a label set.
///
/// Pairs are sorted by label name (then value) so the same label set always
/// maps to one dimension regardless of presentation order.
pub fn dimension_key(labels: &[LabelPair]) -> CompactString {
    if labels.is_empty() {
        return CompactString::from(DEFAULT_DIMENSION);
    }

    let mut sorted: SmallVec<[&LabelPair; 8]> = labels.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.value.cmp(&b.value)));

    let mut key = CompactString::default();
    for (i, label) in sorted.iter().enumerate() {
        if i > 0 {
            key.push(' ');
        }
        key.push_str(&label.name);
        key.push(':');
        key.push_str(&label.value);
    }
    key
}

// ----------------------------------------------------------------------------
// 8.2 Metric Tree
// ----------------------------------------------------------------------------

/// Index of a node inside its [`MetricTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricNodeId(u32);

impl MetricNodeId {
    pub const ROOT: Self = Self(0);

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
pub struct MetricNode {
    name: CompactString,
    series: Option<MetricSeries>,
    parent: Option<MetricNodeId>,
    /// Sorted by child name
    children: Vec<MetricNodeId>,
}

impl MetricNode {
    fn new(name: &str, parent: Option<MetricNodeId>) -> Self {
        Self {
            name: CompactString::from(name),
            series: None,
            parent,
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn series(&self) -> Option<&MetricSeries> {
        self.series.as_ref()
    }

    pub fn parent(&self) -> Option<MetricNodeId> {
        self.parent
    }

    pub fn children(&self) -> &[MetricNodeId] {
        &self.children
    }
}

/// Identity of a series being recorded into.
#[derive(Debug, Clone, Copy)]
pub struct SeriesKey<'a> {
    pub name: &'a str,
    pub help: &'a str,
    pub dimension: &'a str,
}

/// Hierarchical namespace of metric series. Nodes are never removed.
#[derive(Debug, Clone)]
pub struct MetricTree {
    nodes: Vec<MetricNode>,
    /// Series name -> owning node, first claimant wins
    index: AHashMap<CompactString, MetricNodeId>,
    series_count: usize,
    capacity: usize,
    split_depth: usize,
    separator: CompactString,
}

impl MetricTree {
    pub fn new(capacity: usize, split_depth: usize, separator: &str) -> Self {
        Self {
            nodes: vec![MetricNode::new("root", None)],
            index: AHashMap::new(),
            series_count: 0,
            capacity: capacity.max(1),
            split_depth: split_depth.max(1),
            separator: CompactString::from(separator),
        }
    }

    pub fn from_config(config: &SeriesConfig) -> Self {
        Self::new(config.length, config.split_depth, &config.separator)
    }

    #[inline]
    pub fn root(&self) -> MetricNodeId {
        MetricNodeId::ROOT
    }

    /// Node behind an id handed out by this tree
    #[inline]
    pub fn node(&self, id: MetricNodeId) -> &MetricNode {
        &self.nodes[id.index()]
    }

    pub fn get(&self, id: MetricNodeId) -> Option<&MetricNode> {
        self.nodes.get(id.index())
    }

    /// Total node count, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn series_count(&self) -> usize {
        self.series_count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Split a metric name into at most `split_depth` path segments.
    pub fn split_name<'a>(&self, name: &'a str) -> SmallVec<[&'a str; 8]> {
        name.splitn(self.split_depth, self.separator.as_str()).collect()
    }

    fn find_child(&self, parent: MetricNodeId, name: &str) -> Result<MetricNodeId, usize> {
        let children = &self.nodes[parent.index()].children;
        children
            .binary_search_by(|child| self.nodes[child.index()].name.as_str().cmp(name))
            .map(|pos| children[pos])
    }

    /// Child of `parent` named `name`, created in sorted position if missing.
    pub fn child(&mut self, parent: MetricNodeId, name: &str) -> MetricNodeId {
        match self.find_child(parent, name) {
            Ok(id) => id,
            Err(pos) => {
                let id = MetricNodeId(self.nodes.len() as u32);
                self.nodes.push(MetricNode::new(name, Some(parent)));
                self.nodes[parent.index()].children.insert(pos, id);
                id
            }
        }
    }

    /// Walk the path from the root, creating missing nodes, and return the
    /// leaf. Resolving the same path twice returns the same node.
    pub fn resolve<'p, I>(&mut self, path: I) -> MetricNodeId
    where
        I: IntoIterator<Item = &'p str>,
    {
        path.into_iter()
            .fold(self.root(), |node, segment| self.child(node, segment))
    }

    /// Non-creating lookup of a path
    pub fn find<'p, I>(&self, path: I) -> Option<MetricNodeId>
    where
        I: IntoIterator<Item = &'p str>,
    {
        path.into_iter().try_fold(self.root(), |node, segment| {
            self.find_child(node, segment).ok()
        })
    }

    /// Resolve the node a metric name belongs to
    pub fn resolve_metric(&mut self, name: &str) -> MetricNodeId {
        let path = self.split_name(name);
        self.resolve(path)
    }

    /// Path segments from the root down to `id`, root excluded
    pub fn path(&self, id: MetricNodeId) -> Vec<&str> {
        let mut segments = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = &self.nodes[current.index()];
            if node.parent.is_some() {
                segments.push(node.name.as_str());
            }
            cursor = node.parent;
        }
        segments.reverse();
        segments
    }

    /// Series at `node`, created with the given kind on first use.
    pub fn ensure_series(
        &mut self,
        node: MetricNodeId,
        kind: SeriesKind,
        name: &str,
        help: &str,
    ) -> &mut MetricSeries {
        let capacity = self.capacity;
        let slot = &mut self.nodes[node.index()];

        if slot.series.is_none() {
            self.series_count += 1;
            match self.index.get(name) {
                Some(owner) => debug!(
                    target: "pulse::metrics",
                    series = name,
                    owner = owner.0,
                    shadowed = node.0,
                    "Series name already indexed, keeping first owner"
                ),
                None => {
                    self.index.insert(CompactString::from(name), node);
                }
            }
        }

        let series = slot
            .series
            .get_or_insert_with(|| MetricSeries::new(kind, name, help, capacity));
        if series.help.is_empty() && !help.is_empty() {
            series.help = help.to_string();
        }
        series
    }

    pub fn series(&self, node: MetricNodeId) -> Option<&MetricSeries> {
        self.get(node).and_then(MetricNode::series)
    }

    pub fn series_node(&self, name: &str) -> Option<MetricNodeId> {
        self.index.get(name).copied()
    }

    pub fn series_by_name(&self, name: &str) -> Option<&MetricSeries> {
        self.series_node(name).and_then(|id| self.series(id))
    }

    /// Ring list view of one series dimension
    pub fn view(&self, series: &str, dimension: &str) -> Option<&[f64]> {
        self.series_by_name(series)
            .and_then(|series| series.view(dimension))
    }

    // ---- Recording ----

    pub fn record_gauge(&mut self, node: MetricNodeId, key: SeriesKey<'_>, value: f64) {
        self.ensure_series(node, SeriesKind::Gauge, key.name, key.help)
            .list_mut(key.dimension)
            .push(value);
    }

    pub fn record_counter(&mut self, node: MetricNodeId, key: SeriesKey<'_>, value: f64) {
        self.ensure_series(node, SeriesKind::Counter, key.name, key.help)
            .list_mut(key.dimension)
            .push_delta(value);
    }

    /// Record `:count`, `:mean` and one plain series per quantile as
    /// children of `node`.
    pub fn record_summary(
        &mut self,
        node: MetricNodeId,
        key: SeriesKey<'_>,
        sample_count: u64,
        sample_sum: f64,
        quantiles: &[Quantile],
    ) {
        self.record_accumulator(node, key, sample_count, sample_sum);

        for quantile in quantiles {
            let suffix = format!(":{}", format_bound(quantile.quantile));
            let child = self.child(node, &suffix);
            let name = format!("{}{}", key.name, suffix);
            self.ensure_series(child, SeriesKind::Gauge, &name, key.help)
                .list_mut(key.dimension)
                .push(quantile.value);
        }
    }

    /// Record `:count`, `:mean` and one delta series per bucket as children
    /// of `node`.
    pub fn record_histogram(
        &mut self,
        node: MetricNodeId,
        key: SeriesKey<'_>,
        sample_count: u64,
        sample_sum: f64,
        buckets: &[Bucket],
        mode: BucketMode,
    ) {
        self.record_accumulator(node, key, sample_count, sample_sum);

        let mut previous = 0u64;
        for bucket in buckets {
            let count = match mode {
                BucketMode::Cumulative => bucket.cumulative_count,
                BucketMode::PerBucket => bucket.cumulative_count.saturating_sub(previous),
            };
            previous = bucket.cumulative_count;

            let suffix = format!(":{}", format_bound(bucket.upper_bound));
            let child = self.child(node, &suffix);
            let name = format!("{}{}", key.name, suffix);
            self.ensure_series(child, SeriesKind::Counter, &name, key.help)
                .list_mut(key.dimension)
                .push_delta(count as f64);
        }
    }

    fn record_accumulator(
        &mut self,
        node: MetricNodeId,
        key: SeriesKey<'_>,
        sample_count: u64,
        sample_sum: f64,
    ) {
        let count_node = self.child(node, ":count");
        let count_name = format!("{}:count", key.name);
        self.ensure_series(count_node, SeriesKind::Counter, &count_name, key.help)
            .list_mut(key.dimension)
            .push_delta(sample_count as f64);

        let mean_node = self.child(node, ":mean");
        let mean_name = format!("{}:mean", key.name);
        self.ensure_series(mean_node, SeriesKind::Gauge, &mean_name, key.help)
            .list_mut(key.dimension)
            .push_windowed_mean(sample_sum, sample_count as f64);
    }

    // ---- Traversal ----

    /// Depth-first pre-order walk over every node owning a series, children
    /// in name order.
    pub fn traverse<F>(&self, visit: F)
    where
        F: FnMut(MetricNodeId, &MetricSeries),
    {
        self.traverse_from(self.root(), visit)
    }

    /// Same as [`traverse`](Self::traverse), starting at `start`.
    pub fn traverse_from<F>(&self, start: MetricNodeId, mut visit: F)
    where
        F: FnMut(MetricNodeId, &MetricSeries),
    {
        self.walk_from(start, |id, node, _| {
            if let Some(series) = &node.series {
                visit(id, series);
            }
        });
    }

    /// Pre-order walk over every node with its depth (root is 0).
    pub fn walk<F>(&self, visit: F)
    where
        F: FnMut(MetricNodeId, &MetricNode, usize),
    {
        self.walk_from(self.root(), visit)
    }

    fn walk_from<F>(&self, start: MetricNodeId, mut visit: F)
    where
        F: FnMut(MetricNodeId, &MetricNode, usize),
    {
        if self.get(start).is_none() {
            return;
        }

        let mut stack = vec![(start, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let node = &self.nodes[id.index()];
            visit(id, node, depth);
            stack.extend(node.children.iter().rev().map(|child| (*child, depth + 1)));
        }
    }
}

// ============================================================================
// SECTION 9: METRIC INGESTION
// ============================================================================

/// Outcome of folding one decoded batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Families that were ingested
    pub families: usize,
    /// Metric instances recorded
    pub metrics: usize,
    /// Instances whose payload does not match the family type
    pub skipped: usize,
    /// Families dropped by exclude patterns
    pub excluded: usize,
}

/// Converts decoded metric families into ring list updates.
#[derive(Debug, Clone, Default)]
pub struct MetricIngestor {
    bucket_mode: BucketMode,
    exclude: Vec<Regex>,
}

impl MetricIngestor {
    pub fn new(bucket_mode: BucketMode) -> Self {
        Self {
            bucket_mode,
            exclude: Vec::new(),
        }
    }

    pub fn with_exclude(mut self, exclude: Vec<Regex>) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn from_config(config: &SeriesConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.bucket_mode).with_exclude(config.compiled_exclude()?))
    }

    pub fn bucket_mode(&self) -> BucketMode {
        self.bucket_mode
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|re| re.is_match(name))
    }

    /// Fold one batch into `tree`.
    ///
    /// A family without a name aborts the call with
    /// [`IngestError::MalformedInput`]; families before it stay applied.
    /// Instances whose payload does not fit the family type are skipped.
    pub fn ingest(
        &self,
        tree: &mut MetricTree,
        families: &[MetricFamily],
    ) -> IngestResult<IngestReport> {
        let mut report = IngestReport::default();

        for (index, family) in families.iter().enumerate() {
            let name = match family.name.as_deref() {
                Some(name) if !name.is_empty() => name,
                _ => {
                    return Err(IngestError::MalformedInput {
                        index,
                        reason: "metric family has no name".into(),
                    })
                }
            };

            if self.is_excluded(name) {
                report.excluded += 1;
                continue;
            }

            report.families += 1;
            for metric in &family.metrics {
                if self.ingest_metric(tree, family, name, metric) {
                    report.metrics += 1;
                } else {
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    fn ingest_metric(
        &self,
        tree: &mut MetricTree,
        family: &MetricFamily,
        name: &str,
        metric: &Metric,
    ) -> bool {
        let dimension = dimension_key(&metric.labels);
        let key = SeriesKey {
            name,
            help: &family.help,
            dimension: &dimension,
        };

        match (family.kind, &metric.payload) {
            (MetricKind::Gauge | MetricKind::Untyped, MetricPayload::Value { value }) => {
                let node = tree.resolve_metric(name);
                tree.record_gauge(node, key, *value);
            }
            (MetricKind::Counter, MetricPayload::Value { value }) => {
                let node = tree.resolve_metric(name);
                tree.record_counter(node, key, *value);
            }
            (
                MetricKind::Summary,
                MetricPayload::Summary {
                    sample_count,
                    sample_sum,
                    quantiles,
                },
            ) => {
                let node = tree.resolve_metric(name);
                tree.record_summary(node, key, *sample_count, *sample_sum, quantiles);
            }
            (
                MetricKind::Histogram,
                MetricPayload::Histogram {
                    sample_count,
                    sample_sum,
                    buckets,
                },
            ) => {
                let node = tree.resolve_metric(name);
                tree.record_histogram(
                    node,
                    key,
                    *sample_count,
                    *sample_sum,
                    buckets,
                    self.bucket_mode,
                );
            }
            (kind, _) => {
                trace!(
                    target: "pulse::metrics",
                    family = name,
                    kind = %kind,
                    "Skipping metric with unsupported shape"
                );
                return false;
            }
        }

        true
    }
}

// ============================================================================
// SECTION 10: PHASE 1 TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    fn tree() -> MetricTree {
        MetricTree::new(3, DEFAULT_SPLIT_DEPTH, DEFAULT_NAME_SEPARATOR)
    }

    fn histogram_family(name: &str, count: u64, sum: f64, cumulative: &[u64]) -> MetricFamily {
        let bounds = [1.0, 5.0, f64::INFINITY];
        let buckets = bounds
            .iter()
            .zip(cumulative)
            .map(|(bound, count)| Bucket {
                upper_bound: *bound,
                cumulative_count: *count,
            })
            .collect();
        MetricFamily::new(name, MetricKind::Histogram).with_metric(Metric::histogram(count, sum, buckets))
    }

    // ---- Ring list ----

    #[test]
    fn test_ring_list_keeps_most_recent() {
        let mut list = RingList::new(3);
        assert!(list.is_empty());
        assert_eq!(list.view(), &[] as &[f64]);

        list.push(1.0);
        list.push(2.0);
        assert_eq!(list.view(), &[1.0, 2.0]);

        list.push(3.0);
        list.push(4.0);
        assert_eq!(list.view(), &[2.0, 3.0, 4.0]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.latest(), Some(4.0));
    }

    #[test]
    fn test_ring_list_zero_capacity_is_raised() {
        let mut list = RingList::new(0);
        assert_eq!(list.capacity(), 1);
        list.push(7.0);
        list.push(8.0);
        assert_eq!(list.view(), &[8.0]);
    }

    #[test]
    fn test_ring_list_nan_stored_as_zero() {
        let mut list = RingList::new(4);
        list.push(f64::NAN);
        list.push_delta(f64::NAN);
        assert_eq!(list.view(), &[0.0, 0.0]);
    }

    #[test]
    fn test_push_delta_first_sample_is_raw() {
        let mut list = RingList::new(5);
        list.push_delta(5.0);
        list.push_delta(9.0);
        list.push_delta(9.0);
        assert_eq!(list.view(), &[5.0, 4.0, 0.0]);
        assert_eq!(list.last_raw(), 9.0);
    }

    #[test]
    fn test_push_windowed_mean() {
        let mut list = RingList::new(5);
        list.push_windowed_mean(10.0, 2.0);
        list.push_windowed_mean(30.0, 4.0);
        // no new observations
        list.push_windowed_mean(30.0, 4.0);
        assert_eq!(list.view(), &[5.0, 10.0, 0.0]);
    }

    #[test]
    fn test_extremes() {
        let a = [1.0, -3.0, 2.0];
        let b = [7.5];
        assert_eq!(extremes([&a[..], &b[..]]), (-3.0, 7.5));
        assert_eq!(extremes(std::iter::empty::<&[f64]>()), (0.0, 0.0));
        assert_eq!(extremes([&[] as &[f64]]), (0.0, 0.0));
    }

    proptest! {
        #[test]
        fn prop_view_is_suffix_of_pushes(
            capacity in 1usize..16,
            values in prop::collection::vec(-1.0e6f64..1.0e6, 0..64),
        ) {
            let mut list = RingList::new(capacity);
            for v in &values {
                list.push(*v);
            }
            let keep = values.len().min(capacity);
            prop_assert_eq!(list.view(), &values[values.len() - keep..]);
        }

        #[test]
        fn prop_deltas_of_rising_input_are_non_negative(
            start in 0u32..1000,
            steps in prop::collection::vec(0u32..1000, 1..32),
        ) {
            let mut list = RingList::new(steps.len() + 1);
            let mut value = start as f64;
            list.push_delta(value);
            for step in &steps {
                value += *step as f64;
                list.push_delta(value);
            }
            prop_assert!(list.view().iter().all(|delta| *delta >= 0.0));
            prop_assert_eq!(&list.view()[1..], &steps.iter().map(|s| *s as f64).collect::<Vec<_>>()[..]);
        }

        #[test]
        fn prop_resolve_is_idempotent(
            paths in prop::collection::vec(
                prop::collection::vec(prop::sample::select(vec!["go", "gc", "heap", "rpc"]), 1..4),
                1..12,
            ),
        ) {
            let mut tree = MetricTree::new(4, 4, "_");
            let first: Vec<MetricNodeId> = paths.iter().map(|p| tree.resolve(p.iter().copied())).collect();
            let nodes = tree.len();
            let second: Vec<MetricNodeId> = paths.iter().map(|p| tree.resolve(p.iter().copied())).collect();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(tree.len(), nodes);
            for (path, id) in paths.iter().zip(&second) {
                prop_assert_eq!(&tree.path(*id), path);
            }
        }

        #[test]
        fn prop_deltas_telescope_to_last_value(
            values in prop::collection::vec(-1_000_000i32..1_000_000, 1..32),
        ) {
            let mut list = RingList::new(values.len());
            for v in &values {
                list.push_delta(*v as f64);
            }
            let total: f64 = list.view().iter().sum();
            prop_assert_eq!(total, *values.last().unwrap() as f64);
        }
    }

    // ---- Dimension keys & formatting ----

    #[rstest]
    #[case(&[], "default")]
    #[case(&[("method", "GET")], "method:GET")]
    #[case(&[("path", "/"), ("method", "GET")], "method:GET path:/")]
    #[case(&[("b", "2"), ("a", "9"), ("a", "1")], "a:1 a:9 b:2")]
    fn test_dimension_key(#[case] labels: &[(&str, &str)], #[case] expected: &str) {
        let labels: Vec<LabelPair> = labels.iter().map(|(n, v)| LabelPair::new(*n, *v)).collect();
        assert_eq!(dimension_key(&labels).as_str(), expected);
    }

    #[rstest]
    #[case(0.5, "0.5")]
    #[case(10.0, "10")]
    #[case(0.005, "0.005")]
    #[case(f64::INFINITY, "+Inf")]
    #[case(f64::NEG_INFINITY, "-Inf")]
    #[case(f64::NAN, "NaN")]
    fn test_format_bound(#[case] value: f64, #[case] expected: &str) {
        assert_eq!(format_bound(value), expected);
    }

    #[test]
    fn test_decode_family_json() {
        let json = r#"[{
            "name": "http_latency",
            "help": "Request latency",
            "type": "histogram",
            "metrics": [{
                "labels": [{"name": "code", "value": "200"}],
                "payload": {
                    "shape": "histogram",
                    "sample_count": 3,
                    "sample_sum": 1.5,
                    "buckets": [
                        {"upper_bound": 0.5, "cumulative_count": 2},
                        {"upper_bound": "+Inf", "cumulative_count": 3}
                    ]
                }
            }]
        }]"#;

        let families: Vec<MetricFamily> = serde_json::from_str(json).unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].kind, MetricKind::Histogram);
        match &families[0].metrics[0].payload {
            MetricPayload::Histogram { buckets, .. } => {
                assert_eq!(buckets[1].upper_bound, f64::INFINITY);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    // ---- Metric tree ----

    #[test]
    fn test_resolve_is_idempotent() {
        let mut tree = tree();
        let first = tree.resolve(["go", "memstats"]);
        let second = tree.resolve(["go", "memstats"]);
        assert_eq!(first, second);
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_resolve_shares_prefix() {
        let mut tree = tree();
        let a = tree.resolve(["go", "memstats"]);
        let b = tree.resolve(["go", "goroutines"]);
        assert_ne!(a, b);

        let go = tree.find(["go"]).unwrap();
        assert_eq!(tree.node(a).parent(), Some(go));
        assert_eq!(tree.node(b).parent(), Some(go));
        // children sorted by name
        let names: Vec<&str> = tree
            .node(go)
            .children()
            .iter()
            .map(|id| tree.node(*id).name())
            .collect();
        assert_eq!(names, vec!["goroutines", "memstats"]);
    }

    #[test]
    fn test_split_depth_limits_segments() {
        let mut tree = tree();
        let node = tree.resolve_metric("go_memstats_alloc_bytes");
        assert_eq!(tree.path(node), vec!["go", "memstats_alloc_bytes"]);

        let mut deep = MetricTree::new(3, 3, "_");
        let node = deep.resolve_metric("go_memstats_alloc_bytes");
        assert_eq!(deep.path(node), vec!["go", "memstats", "alloc_bytes"]);

        let mut flat = MetricTree::new(3, 1, "_");
        let node = flat.resolve_metric("go_memstats_alloc_bytes");
        assert_eq!(flat.path(node), vec!["go_memstats_alloc_bytes"]);
    }

    #[test]
    fn test_find_does_not_create() {
        let tree = tree();
        assert!(tree.find(["missing"]).is_none());
        assert_eq!(tree.len(), 1);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_traverse_preorder_by_name() {
        let mut tree = tree();
        let ingestor = MetricIngestor::default();
        ingestor
            .ingest(
                &mut tree,
                &[
                    MetricFamily::gauge("zeta", 1.0),
                    MetricFamily::gauge("alpha_b", 1.0),
                    MetricFamily::gauge("alpha_a", 1.0),
                    MetricFamily::gauge("alpha", 1.0),
                ],
            )
            .unwrap();

        let mut names = Vec::new();
        tree.traverse(|_, series| names.push(series.name().to_string()));
        assert_eq!(names, vec!["alpha", "alpha_a", "alpha_b", "zeta"]);

        let mut depths = Vec::new();
        tree.walk(|_, node, depth| depths.push((node.name().to_string(), depth)));
        assert_eq!(depths[0], ("root".to_string(), 0));
        assert_eq!(depths[1], ("alpha".to_string(), 1));
        assert_eq!(depths[2], ("a".to_string(), 2));
    }

    #[test]
    fn test_traverse_from_subtree() {
        let mut tree = tree();
        MetricIngestor::default()
            .ingest(
                &mut tree,
                &[
                    MetricFamily::gauge("go_threads", 1.0),
                    MetricFamily::gauge("go_goroutines", 1.0),
                    MetricFamily::gauge("process_open_fds", 1.0),
                ],
            )
            .unwrap();

        let go = tree.find(["go"]).unwrap();
        let mut names = Vec::new();
        tree.traverse_from(go, |_, series| names.push(series.name().to_string()));
        assert_eq!(names, vec!["go_goroutines", "go_threads"]);
        assert_eq!(tree.series_count(), 3);
    }

    // ---- Ingestion ----

    #[test]
    fn test_gauge_scenario() {
        let mut tree = tree();
        let ingestor = MetricIngestor::default();
        ingestor.ingest(&mut tree, &[MetricFamily::gauge("temp", 10.0)]).unwrap();
        ingestor.ingest(&mut tree, &[MetricFamily::gauge("temp", 12.0)]).unwrap();

        assert_eq!(tree.view("temp", DEFAULT_DIMENSION).unwrap(), &[10.0, 12.0]);
        assert_eq!(tree.series_by_name("temp").unwrap().kind(), SeriesKind::Gauge);
    }

    #[test]
    fn test_counter_scenario() {
        let mut tree = tree();
        let ingestor = MetricIngestor::default();
        ingestor.ingest(&mut tree, &[MetricFamily::counter("reqs", 5.0)]).unwrap();
        ingestor.ingest(&mut tree, &[MetricFamily::counter("reqs", 9.0)]).unwrap();

        assert_eq!(tree.view("reqs", DEFAULT_DIMENSION).unwrap(), &[5.0, 4.0]);
        assert_eq!(tree.series_by_name("reqs").unwrap().kind(), SeriesKind::Counter);
    }

    #[test]
    fn test_histogram_scenario_cumulative() {
        let mut tree = MetricTree::new(10, 2, "_");
        let ingestor = MetricIngestor::new(BucketMode::Cumulative);
        ingestor.ingest(&mut tree, &[histogram_family("lat", 5, 10.0, &[3, 3, 5])]).unwrap();
        ingestor.ingest(&mut tree, &[histogram_family("lat", 9, 30.0, &[4, 6, 9])]).unwrap();

        let latest = |name: &str| tree.view(name, DEFAULT_DIMENSION).unwrap().last().copied();
        assert_eq!(latest("lat:1"), Some(1.0));
        assert_eq!(latest("lat:5"), Some(3.0));
        assert_eq!(latest("lat:+Inf"), Some(4.0));
        assert_eq!(tree.view("lat:count", DEFAULT_DIMENSION).unwrap(), &[5.0, 4.0]);
        assert_eq!(tree.view("lat:mean", DEFAULT_DIMENSION).unwrap(), &[2.0, 5.0]);
    }

    #[test]
    fn test_histogram_per_bucket_mode() {
        let mut tree = MetricTree::new(10, 2, "_");
        let ingestor = MetricIngestor::new(BucketMode::PerBucket);
        ingestor.ingest(&mut tree, &[histogram_family("lat", 5, 10.0, &[3, 3, 5])]).unwrap();
        ingestor.ingest(&mut tree, &[histogram_family("lat", 9, 30.0, &[4, 6, 9])]).unwrap();

        assert_eq!(tree.view("lat:1", DEFAULT_DIMENSION).unwrap(), &[3.0, 1.0]);
        assert_eq!(tree.view("lat:5", DEFAULT_DIMENSION).unwrap(), &[0.0, 2.0]);
        assert_eq!(tree.view("lat:+Inf", DEFAULT_DIMENSION).unwrap(), &[2.0, 1.0]);
    }

    #[test]
    fn test_histogram_children_live_under_family_node() {
        let mut tree = MetricTree::new(10, 2, "_");
        MetricIngestor::default()
            .ingest(&mut tree, &[histogram_family("http_latency", 1, 1.0, &[0, 1, 1])])
            .unwrap();

        let family = tree.find(["http", "latency"]).unwrap();
        assert!(tree.series(family).is_none());
        let count = tree.find(["http", "latency", ":count"]).unwrap();
        assert_eq!(tree.series(count).unwrap().name(), "http_latency:count");
        assert_eq!(tree.series_node("http_latency:+Inf"), tree.find(["http", "latency", ":+Inf"]));
    }

    #[test]
    fn test_summary_series() {
        let mut tree = MetricTree::new(10, 2, "_");
        let ingestor = MetricIngestor::default();
        let quantiles = vec![
            Quantile { quantile: 0.5, value: 0.2 },
            Quantile { quantile: 0.99, value: 0.9 },
        ];
        let family = MetricFamily::new("rpc_latency", MetricKind::Summary)
            .with_help("RPC latency")
            .with_metric(Metric::summary(4, 2.0, quantiles).with_label("svc", "api"));
        ingestor.ingest(&mut tree, &[family]).unwrap();

        let dim = "svc:api";
        assert_eq!(tree.view("rpc_latency:0.5", dim).unwrap(), &[0.2]);
        assert_eq!(tree.view("rpc_latency:0.99", dim).unwrap(), &[0.9]);
        assert_eq!(tree.view("rpc_latency:count", dim).unwrap(), &[4.0]);
        assert_eq!(tree.view("rpc_latency:mean", dim).unwrap(), &[0.5]);
        assert_eq!(tree.series_by_name("rpc_latency:mean").unwrap().help(), "RPC latency");
    }

    #[test]
    fn test_labeled_dimensions_share_series() {
        let mut tree = tree();
        let family = MetricFamily::new("http_requests", MetricKind::Counter)
            .with_metric(Metric::value(3.0).with_label("code", "200"))
            .with_metric(Metric::value(1.0).with_label("code", "500"));
        MetricIngestor::default().ingest(&mut tree, &[family]).unwrap();

        let series = tree.series_by_name("http_requests").unwrap();
        let dims: Vec<&str> = series.dimensions().iter().map(|d| d.as_str()).collect();
        assert_eq!(dims, vec!["code:200", "code:500"]);
        assert!(!series.is_default_only());
        assert_eq!(series.extremes(), (1.0, 3.0));
    }

    #[test]
    fn test_missing_name_applies_prefix_and_fails() {
        let mut tree = tree();
        let nameless = MetricFamily {
            name: None,
            ..MetricFamily::gauge("ignored", 1.0)
        };
        let batch = [
            MetricFamily::gauge("first", 1.0),
            nameless,
            MetricFamily::gauge("third", 1.0),
        ];

        let err = MetricIngestor::default().ingest(&mut tree, &batch).unwrap_err();
        assert!(matches!(err, IngestError::MalformedInput { index: 1, .. }));
        assert!(tree.series_by_name("first").is_some());
        assert!(tree.series_by_name("third").is_none());
    }

    #[test]
    fn test_shape_mismatch_is_skipped() {
        let mut tree = tree();
        let family = MetricFamily::new("odd", MetricKind::Counter)
            .with_metric(Metric::summary(1, 1.0, Vec::new()))
            .with_metric(Metric::value(2.0));

        let report = MetricIngestor::default().ingest(&mut tree, &[family]).unwrap();
        assert_eq!(report.metrics, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(tree.view("odd", DEFAULT_DIMENSION).unwrap(), &[2.0]);
    }

    #[test]
    fn test_exclude_patterns() {
        let mut tree = tree();
        let ingestor = MetricIngestor::default().with_exclude(vec![Regex::new("^go_").unwrap()]);
        let report = ingestor
            .ingest(
                &mut tree,
                &[MetricFamily::gauge("go_threads", 8.0), MetricFamily::gauge("up", 1.0)],
            )
            .unwrap();

        assert_eq!(report.excluded, 1);
        assert_eq!(report.families, 1);
        assert!(tree.series_by_name("go_threads").is_none());
    }

    #[test]
    fn test_help_is_refreshed_when_empty() {
        let mut tree = tree();
        let ingestor = MetricIngestor::default();
        ingestor.ingest(&mut tree, &[MetricFamily::gauge("up", 1.0)]).unwrap();
        assert_eq!(tree.series_by_name("up").unwrap().help(), "");

        ingestor
            .ingest(&mut tree, &[MetricFamily::gauge("up", 1.0).with_help("Target is up")])
            .unwrap();
        assert_eq!(tree.series_by_name("up").unwrap().help(), "Target is up");
    }

    #[test]
    fn test_untyped_family_records_like_gauge() {
        let mut tree = tree();
        let ingestor = MetricIngestor::default();
        for value in [3.0, 5.0] {
            let family = MetricFamily::new("queue_depth", MetricKind::Untyped).with_metric(Metric::value(value));
            ingestor.ingest(&mut tree, &[family]).unwrap();
        }

        assert_eq!(tree.view("queue_depth", DEFAULT_DIMENSION).unwrap(), &[3.0, 5.0]);
        assert_eq!(tree.series_by_name("queue_depth").unwrap().kind(), SeriesKind::Gauge);
    }

    #[test]
    fn test_family_without_type_decodes_as_untyped() {
        let json = r#"[{"name": "u", "metrics": [{"payload": {"shape": "value", "value": 3}}]}]"#;
        let families: Vec<MetricFamily> = serde_json::from_str(json).unwrap();
        assert_eq!(families[0].kind, MetricKind::Untyped);

        let mut tree = tree();
        MetricIngestor::default().ingest(&mut tree, &families).unwrap();
        assert_eq!(tree.view("u", DEFAULT_DIMENSION).unwrap(), &[3.0]);
    }

    #[test]
    fn test_colliding_series_names_keep_first_owner() {
        let mut tree = tree();
        let ingestor = MetricIngestor::default();
        ingestor
            .ingest(
                &mut tree,
                &[histogram_family("rpc", 5, 10.0, &[3, 3, 5]), MetricFamily::gauge("rpc:count", 42.0)],
            )
            .unwrap();

        let mut traversed = 0;
        tree.traverse(|_, _| traversed += 1);
        assert_eq!(traversed, 6);
        assert_eq!(tree.series_count(), 6);

        let histogram_count = tree.find(["rpc", ":count"]).unwrap();
        assert_eq!(tree.series_node("rpc:count"), Some(histogram_count));
        assert_eq!(tree.view("rpc:count", DEFAULT_DIMENSION).unwrap(), &[5.0]);

        let gauge = tree.find(["rpc:count"]).unwrap();
        assert_eq!(tree.series(gauge).unwrap().view(DEFAULT_DIMENSION).unwrap(), &[42.0]);
    }
}

// ============================================================================
// SECTION 11: SAMPLE TREE & FLAME LAYOUT
// ============================================================================
// Call trees are built once per capture and never mutated afterwards. The
// builder owns the mutable phase; `SampleTree` is the frozen result that
// gets published to readers.
// ============================================================================

/// Index of a frame inside its [`SampleTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u32);

impl FrameId {
    pub const ROOT: Self = Self(0);

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// One logical frame of the aggregated call tree.
#[derive(Debug, Clone)]
pub struct FrameNode {
    name: CompactString,
    /// Weight of samples whose innermost frame is this one
    self_weight: i64,
    /// Weight of every sample passing through this frame
    total: i64,
    parent: Option<FrameId>,
    children: Vec<FrameId>,
}

impl FrameNode {
    fn new(name: &str, parent: Option<FrameId>) -> Self {
        Self {
            name: CompactString::from(name),
            self_weight: 0,
            total: 0,
            parent,
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn self_weight(&self) -> i64 {
        self.self_weight
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn parent(&self) -> Option<FrameId> {
        self.parent
    }

    pub fn children(&self) -> &[FrameId] {
        &self.children
    }
}

/// Folds samples into a call tree.
#[derive(Debug)]
pub struct SampleTreeBuilder {
    nodes: Vec<FrameNode>,
    lookup: AHashMap<(FrameId, CompactString), FrameId>,
    samples: usize,
}

impl Default for SampleTreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleTreeBuilder {
    pub fn new() -> Self {
        Self {
            nodes: vec![FrameNode::new(PROFILE_ROOT_NAME, None)],
            lookup: AHashMap::new(),
            samples: 0,
        }
    }

    fn child(&mut self, parent: FrameId, name: &str) -> FrameId {
        let key = (parent, CompactString::from(name));
        if let Some(id) = self.lookup.get(&key) {
            return *id;
        }

        let id = FrameId(self.nodes.len() as u32);
        self.nodes.push(FrameNode::new(name, Some(parent)));
        self.nodes[parent.index()].children.push(id);
        self.lookup.insert(key, id);
        id
    }

    /// Fold one sample in: self weight lands on the innermost frame, total
    /// weight on that frame and every ancestor up to the root.
    pub fn add(&mut self, sample: &Sample) {
        let mut leaf = FrameId::ROOT;
        for location in &sample.locations {
            for line in &location.lines {
                leaf = self.child(leaf, line);
            }
        }

        // weights come from the target; clamp instead of wrapping
        let self_weight = &mut self.nodes[leaf.index()].self_weight;
        *self_weight = self_weight.saturating_add(sample.weight);

        let mut cursor = Some(leaf);
        while let Some(id) = cursor {
            let node = &mut self.nodes[id.index()];
            node.total = node.total.saturating_add(sample.weight);
            cursor = node.parent;
        }

        self.samples += 1;
    }

    pub fn extend<'s, I>(&mut self, samples: I)
    where
        I: IntoIterator<Item = &'s Sample>,
    {
        for sample in samples {
            self.add(sample);
        }
    }

    /// Sort every child list by name and freeze the tree.
    pub fn finish(mut self) -> SampleTree {
        for i in 0..self.nodes.len() {
            let mut children = std::mem::take(&mut self.nodes[i].children);
            children.sort_by(|a, b| self.nodes[a.index()].name.cmp(&self.nodes[b.index()].name));
            self.nodes[i].children = children;
        }

        SampleTree {
            nodes: self.nodes,
            samples: self.samples,
        }
    }
}

/// One positioned flame graph node, widths relative to the root total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlameSpan<'a> {
    pub id: FrameId,
    pub depth: usize,
    pub offset: f64,
    pub width: f64,
    pub name: &'a str,
    pub self_weight: i64,
    pub total: i64,
}

/// Immutable aggregated call tree of one profile capture.
#[derive(Debug, Clone)]
pub struct SampleTree {
    nodes: Vec<FrameNode>,
    samples: usize,
}

impl Default for SampleTree {
    fn default() -> Self {
        SampleTreeBuilder::new().finish()
    }
}

impl SampleTree {
    pub fn build(samples: &[Sample]) -> Self {
        let mut builder = SampleTreeBuilder::new();
        builder.extend(samples);
        builder.finish()
    }

    #[inline]
    pub fn root(&self) -> FrameId {
        FrameId::ROOT
    }

    #[inline]
    pub fn node(&self, id: FrameId) -> &FrameNode {
        &self.nodes[id.index()]
    }

    pub fn get(&self, id: FrameId) -> Option<&FrameNode> {
        self.nodes.get(id.index())
    }

    /// Sum of all sample weights
    pub fn total(&self) -> i64 {
        self.nodes[0].total
    }

    pub fn sample_count(&self) -> usize {
        self.samples
    }

    /// Node count, root included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Follow frame names from the root
    pub fn find_path(&self, path: &[&str]) -> Option<FrameId> {
        path.iter().try_fold(self.root(), |id, name| {
            let children = &self.nodes[id.index()].children;
            children
                .binary_search_by(|child| self.nodes[child.index()].name.as_str().cmp(name))
                .ok()
                .map(|pos| children[pos])
        })
    }

    /// Frame names from below the root down to `id`
    pub fn path(&self, id: FrameId) -> Vec<&str> {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = &self.nodes[current.index()];
            if node.parent.is_some() {
                names.push(node.name.as_str());
            }
            cursor = node.parent;
        }
        names.reverse();
        names
    }

    /// Pre-order flame layout. The root spans `[0, 1)`; each child starts
    /// where its previous sibling ended. Nothing is emitted for an empty
    /// profile.
    pub fn layout<'a, F>(&'a self, mut visit: F)
    where
        F: FnMut(FlameSpan<'a>),
    {
        let total = self.total();
        if total <= 0 {
            return;
        }
        let divisor = total as f64;

        let mut stack = vec![(FrameId::ROOT, 0usize, 0.0f64)];
        while let Some((id, depth, offset)) = stack.pop() {
            let node = &self.nodes[id.index()];
            visit(FlameSpan {
                id,
                depth,
                offset,
                width: node.total as f64 / divisor,
                name: &node.name,
                self_weight: node.self_weight,
                total: node.total,
            });

            let first = stack.len();
            let mut child_offset = offset;
            for child in &node.children {
                stack.push((*child, depth + 1, child_offset));
                child_offset += self.nodes[child.index()].total as f64 / divisor;
            }
            stack[first..].reverse();
        }
    }

    pub fn spans(&self) -> Vec<FlameSpan<'_>> {
        let mut spans = Vec::with_capacity(self.nodes.len());
        self.layout(|span| spans.push(span));
        spans
    }

    /// Folded stack lines (`a;b;c weight`) for frames with self weight.
    pub fn folded(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut stack = vec![FrameId::ROOT];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.index()];
            if node.self_weight != 0 && node.parent.is_some() {
                lines.push(format!("{} {}", self.path(id).join(";"), node.self_weight));
            }
            stack.extend(node.children.iter().rev().copied());
        }
        lines
    }

    /// The `n` frames with the highest self weight, heaviest first.
    pub fn hottest(&self, n: usize) -> Vec<FrameId> {
        let mut ids: Vec<FrameId> = (1..self.nodes.len() as u32)
            .map(FrameId)
            .filter(|id| self.nodes[id.index()].self_weight != 0)
            .collect();
        ids.sort_by(|a, b| {
            let (a, b) = (&self.nodes[a.index()], &self.nodes[b.index()]);
            b.self_weight
                .cmp(&a.self_weight)
                .then_with(|| a.name.cmp(&b.name))
        });
        ids.truncate(n);
        ids
    }
}

// ============================================================================
// SECTION 12: SHARED STATE
// ============================================================================
// The application owns one of each store and hands them to poll loops and
// renderers. There is no process-wide state.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Metric Store
// ----------------------------------------------------------------------------

/// Metric tree behind one reader/writer lock.
///
/// Ingestion holds the write lock for a whole batch and traversals hold the
/// read lock for a whole walk, so a reader never sees half a batch.
#[derive(Debug)]
pub struct MetricStore {
    tree: RwLock<MetricTree>,
    ingestor: MetricIngestor,
    generation: AtomicU64,
}

impl MetricStore {
    pub fn new(tree: MetricTree, ingestor: MetricIngestor) -> Self {
        Self {
            tree: RwLock::new(tree),
            ingestor,
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &SeriesConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            MetricTree::from_config(config),
            MetricIngestor::from_config(config)?,
        ))
    }

    /// Fold one decoded batch under the write lock.
    pub fn ingest(&self, families: &[MetricFamily]) -> IngestResult<IngestReport> {
        let result = {
            let mut tree = self.tree.write();
            self.ingestor.ingest(&mut tree, families)
        };
        // a failed batch may still have applied a prefix
        self.generation.fetch_add(1, AtomicOrdering::Release);
        result
    }

    /// Shared read guard; hold it for one full walk.
    pub fn read(&self) -> RwLockReadGuard<'_, MetricTree> {
        self.tree.read()
    }

    pub fn with_tree<R>(&self, f: impl FnOnce(&MetricTree) -> R) -> R {
        f(&self.tree.read())
    }

    pub fn traverse<F>(&self, visit: F)
    where
        F: FnMut(MetricNodeId, &MetricSeries),
    {
        self.tree.read().traverse(visit)
    }

    /// Copy of one ring list view
    pub fn view(&self, series: &str, dimension: &str) -> Option<Vec<f64>> {
        self.tree.read().view(series, dimension).map(<[f64]>::to_vec)
    }

    pub fn series_count(&self) -> usize {
        self.tree.read().series_count()
    }

    /// Number of ingestion calls so far
    pub fn generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::Acquire)
    }
}

// ----------------------------------------------------------------------------
// 12.2 Profile Store
// ----------------------------------------------------------------------------

/// Published state of one named profile stream.
#[derive(Debug, Default)]
pub struct ProfileStream {
    current: ArcSwapOption<SampleTree>,
    unit: WeightUnit,
    paused: AtomicBool,
    builds: AtomicU64,
}

impl ProfileStream {
    pub fn new(unit: WeightUnit) -> Self {
        Self {
            unit,
            ..Self::default()
        }
    }

    /// Latest published tree
    pub fn current(&self) -> Option<Arc<SampleTree>> {
        self.current.load_full()
    }

    /// Replace the published tree in one atomic swap.
    pub fn publish(&self, tree: Arc<SampleTree>) {
        self.current.store(Some(tree));
        self.builds.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn unit(&self) -> WeightUnit {
        self.unit
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(AtomicOrdering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, AtomicOrdering::Release);
    }

    pub fn builds(&self) -> u64 {
        self.builds.load(AtomicOrdering::Relaxed)
    }
}

/// Sample trees keyed by stream name.
///
/// Trees are built aside and published by swapping an `Arc`; readers load
/// the current `Arc` once and walk it without any lock.
#[derive(Debug, Default)]
pub struct ProfileStore {
    streams: DashMap<CompactString, Arc<ProfileStream>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream, keeping the existing one if already present
    pub fn register(&self, name: &str, unit: WeightUnit) -> Arc<ProfileStream> {
        self.streams
            .entry(CompactString::from(name))
            .or_insert_with(|| Arc::new(ProfileStream::new(unit)))
            .clone()
    }

    pub fn stream(&self, name: &str) -> Option<Arc<ProfileStream>> {
        self.streams.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn publish(&self, name: &str, tree: SampleTree) -> Arc<SampleTree> {
        let tree = Arc::new(tree);
        let stream = match self.stream(name) {
            Some(stream) => stream,
            None => self.register(name, WeightUnit::default()),
        };
        stream.publish(Arc::clone(&tree));
        tree
    }

    pub fn build_and_publish(&self, name: &str, samples: &[Sample]) -> Arc<SampleTree> {
        self.publish(name, SampleTree::build(samples))
    }

    pub fn current(&self, name: &str) -> Option<Arc<SampleTree>> {
        self.stream(name).and_then(|stream| stream.current())
    }

    /// Lay out the current tree of `name`. Returns false if nothing is
    /// published yet.
    pub fn layout<F>(&self, name: &str, visit: F) -> bool
    where
        F: FnMut(FlameSpan<'_>),
    {
        match self.current(name) {
            Some(tree) => {
                tree.layout(visit);
                true
            }
            None => false,
        }
    }

    /// Returns false for unknown streams
    pub fn set_paused(&self, name: &str, paused: bool) -> bool {
        match self.stream(name) {
            Some(stream) => {
                stream.set_paused(paused);
                true
            }
            None => false,
        }
    }

    pub fn is_paused(&self, name: &str) -> bool {
        self.stream(name).map_or(false, |stream| stream.is_paused())
    }

    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .streams
            .iter()
            .map(|entry| entry.key().to_string())
            .collect();
        names.sort();
        names
    }
}

// ----------------------------------------------------------------------------
// 12.3 Trace Store
// ----------------------------------------------------------------------------

/// One finished span of a traced task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

/// A parsed `name;task;start;stop` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLine {
    pub stream: CompactString,
    pub task: CompactString,
    pub event: TraceEvent,
}

impl TraceLine {
    /// Parse one line; anything malformed yields `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.trim_end_matches(['\r', '\n']).split(';');
        let stream = fields.next()?;
        let task = fields.next()?;
        let start = fields.next()?;
        let stop = fields.next()?;
        if fields.next().is_some() {
            return None;
        }

        let parse = |text: &str| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|ts| ts.with_timezone(&Utc))
        };

        Some(Self {
            stream: CompactString::from(stream),
            task: CompactString::from(task),
            event: TraceEvent {
                start: parse(start)?,
                stop: parse(stop)?,
            },
        })
    }
}

type TaskEvents = AHashMap<CompactString, Vec<TraceEvent>>;

/// Recent trace events per stream and task.
#[derive(Debug)]
pub struct TraceStore {
    window: Duration,
    streams: Mutex<AHashMap<CompactString, TaskEvents>>,
}

impl TraceStore {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            streams: Mutex::new(AHashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
    }

    /// Append an event, then drop every event in the store that ended
    /// before `now - window`.
    pub fn record(&self, stream: &str, task: &str, event: TraceEvent, now: DateTime<Utc>) {
        let cutoff = self.cutoff(now);
        let mut streams = self.streams.lock();
        streams
            .entry(CompactString::from(stream))
            .or_default()
            .entry(CompactString::from(task))
            .or_default()
            .push(event);

        if let Some(cutoff) = cutoff {
            Self::prune_expired(&mut streams, cutoff);
        }
    }

    /// Drop expired events. Tasks and streams left empty are removed.
    pub fn prune(&self, now: DateTime<Utc>) {
        if let Some(cutoff) = self.cutoff(now) {
            Self::prune_expired(&mut self.streams.lock(), cutoff);
        }
    }

    fn prune_expired(streams: &mut AHashMap<CompactString, TaskEvents>, cutoff: DateTime<Utc>) {
        streams.retain(|_, tasks| {
            tasks.retain(|_, events| {
                events.retain(|event| event.stop > cutoff);
                !events.is_empty()
            });
            !tasks.is_empty()
        });
    }

    /// Parse and record one line. Returns false if the line was ignored.
    pub fn ingest_line(&self, line: &str, now: DateTime<Utc>) -> bool {
        match TraceLine::parse(line) {
            Some(parsed) => {
                self.record(&parsed.stream, &parsed.task, parsed.event, now);
                true
            }
            None => false,
        }
    }

    pub fn stream_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.lock().keys().map(|k| k.to_string()).collect();
        names.sort();
        names
    }

    pub fn tasks(&self, stream: &str) -> Vec<String> {
        let mut tasks: Vec<String> = self
            .streams
            .lock()
            .get(stream)
            .map(|tasks| tasks.keys().map(|k| k.to_string()).collect())
            .unwrap_or_default();
        tasks.sort();
        tasks
    }

    pub fn events(&self, stream: &str, task: &str) -> Vec<TraceEvent> {
        self.streams
            .lock()
            .get(stream)
            .and_then(|tasks| tasks.get(task))
            .cloned()
            .unwrap_or_default()
    }

    /// Copy of every task of `stream`, sorted by task name
    pub fn snapshot(&self, stream: &str) -> Vec<(String, Vec<TraceEvent>)> {
        let streams = self.streams.lock();
        let mut tasks: Vec<(String, Vec<TraceEvent>)> = streams
            .get(stream)
            .map(|tasks| {
                tasks
                    .iter()
                    .map(|(task, events)| (task.to_string(), events.clone()))
                    .collect()
            })
            .unwrap_or_default();
        tasks.sort_by(|a, b| a.0.cmp(&b.0));
        tasks
    }

    pub fn event_count(&self) -> usize {
        self.streams
            .lock()
            .values()
            .flat_map(|tasks| tasks.values())
            .map(Vec::len)
            .sum()
    }
}

// ============================================================================
// SECTION 13: RENDER MODELS
// ============================================================================
// Plain data handed to whatever draws the windows. Computing these is the
// only thing a renderer does while holding shared state.
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartLine {
    pub dimension: String,
    pub values: Vec<f64>,
}

/// Everything needed to draw one series chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartFrame {
    pub title: String,
    pub tooltip: String,
    pub kind: SeriesKind,
    pub lines: Vec<ChartLine>,
    pub y_min: f64,
    pub y_max: f64,
    pub x_max: usize,
    pub show_legend: bool,
}

impl ChartFrame {
    fn from_series(series: &MetricSeries) -> Self {
        let (min, max) = series.extremes();
        Self {
            title: series.name().to_string(),
            tooltip: series.help().to_string(),
            kind: series.kind(),
            lines: series
                .lines()
                .map(|(dimension, values)| ChartLine {
                    dimension: dimension.to_string(),
                    values: values.to_vec(),
                })
                .collect(),
            y_min: min - CHART_AXIS_PADDING,
            y_max: max + CHART_AXIS_PADDING,
            x_max: series.capacity(),
            show_legend: !series.is_default_only(),
        }
    }
}

/// One chart per series below `from`, in traversal order.
pub fn chart_frames(tree: &MetricTree, from: MetricNodeId) -> Vec<ChartFrame> {
    let mut frames = Vec::new();
    tree.traverse_from(from, |_, series| frames.push(ChartFrame::from_series(series)));
    frames
}

impl WeightUnit {
    /// Human readable rendering of a sample weight
    pub fn format(self, value: i64) -> String {
        match self {
            WeightUnit::Nanoseconds => {
                let magnitude = humantime::format_duration(Duration::from_nanos(value.unsigned_abs()));
                if value < 0 {
                    format!("-{}", magnitude)
                } else {
                    magnitude.to_string()
                }
            }
            WeightUnit::Bytes => format_bytes(value),
            WeightUnit::Count => value.to_string(),
        }
    }
}

fn format_bytes(value: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut scaled = value.unsigned_abs() as f64;
    let mut unit = 0;
    while scaled >= 1024.0 && unit < UNITS.len() - 1 {
        scaled /= 1024.0;
        unit += 1;
    }

    let sign = if value < 0 { "-" } else { "" };
    if unit == 0 {
        format!("{}{} B", sign, value.unsigned_abs())
    } else {
        format!("{}{:.1} {}", sign, scaled, UNITS[unit])
    }
}

/// One flame graph bar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlameBar {
    pub depth: usize,
    pub offset: f64,
    pub width: f64,
    /// Share of the bar spent in the frame itself
    pub fill: f64,
    pub name: String,
    pub label: String,
}

pub fn flame_bars(tree: &SampleTree, unit: WeightUnit) -> Vec<FlameBar> {
    let mut bars = Vec::with_capacity(tree.len());
    tree.layout(|span| {
        let fill = if span.total == 0 {
            0.0
        } else {
            span.self_weight as f64 / span.total as f64
        };
        bars.push(FlameBar {
            depth: span.depth,
            offset: span.offset,
            width: span.width,
            fill,
            name: span.name.to_string(),
            label: format!(
                "{} ({}/{})",
                span.name,
                unit.format(span.self_weight),
                unit.format(span.total)
            ),
        });
    });
    bars
}

/// Visible spans of one traced task, as fractions of the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceLane {
    pub task: String,
    pub spans: Vec<(f64, f64)>,
}

/// Lanes for every task of `stream`, placing events on `[now - window, now]`.
pub fn trace_lanes(store: &TraceStore, stream: &str, now: DateTime<Utc>) -> Vec<TraceLane> {
    let window = store.window().as_nanos() as f64;
    let Some(window_start) = store.cutoff(now) else {
        return Vec::new();
    };
    if window <= 0.0 {
        return Vec::new();
    }

    let position = |at: DateTime<Utc>| {
        let nanos = (at - window_start).num_nanoseconds().unwrap_or(i64::MAX) as f64;
        nanos / window
    };

    store.prune(now);
    store
        .snapshot(stream)
        .into_iter()
        .map(|(task, events)| {
            let spans = events
                .iter()
                .filter_map(|event| {
                    let stop = position(event.stop);
                    if stop < 0.0 {
                        return None;
                    }
                    Some((position(event.start).max(0.0), stop.min(1.0)))
                })
                .collect();
            TraceLane { task, spans }
        })
        .collect()
}

// ============================================================================
// SECTION 14: PHASE 2 TESTS
// ============================================================================

#[cfg(test)]
mod phase2_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn scenario_samples() -> Vec<Sample> {
        vec![
            Sample::from_frames(&["a", "b"], 1),
            Sample::from_frames(&["a", "b"], 2),
            Sample::from_frames(&["a", "c"], 1),
        ]
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    // ---- Sample tree ----

    #[test]
    fn test_sample_tree_scenario() {
        let tree = SampleTree::build(&scenario_samples());

        let a = tree.node(tree.find_path(&["a"]).unwrap());
        let b = tree.node(tree.find_path(&["a", "b"]).unwrap());
        let c = tree.node(tree.find_path(&["a", "c"]).unwrap());

        assert_eq!((a.total(), a.self_weight()), (4, 0));
        assert_eq!((b.total(), b.self_weight()), (3, 3));
        assert_eq!((c.total(), c.self_weight()), (1, 1));
        assert_eq!(tree.total(), 4);
        assert_eq!(tree.sample_count(), 3);
        assert_eq!(tree.node(tree.root()).name(), PROFILE_ROOT_NAME);
    }

    #[test]
    fn test_children_sorted_regardless_of_arrival() {
        let tree = SampleTree::build(&[
            Sample::from_frames(&["main", "zz"], 1),
            Sample::from_frames(&["main", "aa"], 1),
            Sample::from_frames(&["main", "mm"], 1),
        ]);
        let main = tree.find_path(&["main"]).unwrap();
        let names: Vec<&str> = tree
            .node(main)
            .children()
            .iter()
            .map(|id| tree.node(*id).name())
            .collect();
        assert_eq!(names, vec!["aa", "mm", "zz"]);
    }

    #[test]
    fn test_inlined_frames_expand_in_order() {
        let sample = Sample::default()
            .with_location(Location::frame("main"))
            .with_location(Location::inlined(&["outer", "inner"]));
        let sample = Sample { weight: 5, ..sample };
        let tree = SampleTree::build(&[sample]);

        let inner = tree.find_path(&["main", "outer", "inner"]).unwrap();
        assert_eq!(tree.node(inner).self_weight(), 5);
        assert_eq!(tree.path(inner), vec!["main", "outer", "inner"]);
    }

    #[test]
    fn test_empty_stack_weighs_on_root() {
        let tree = SampleTree::build(&[Sample { locations: Vec::new(), weight: 7 }]);
        assert_eq!(tree.node(tree.root()).self_weight(), 7);
        assert_eq!(tree.total(), 7);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_huge_weights_saturate() {
        let heavy = i64::MAX / 2 + 1;
        let tree = SampleTree::build(&[Sample::from_frames(&["a"], heavy), Sample::from_frames(&["b"], heavy)]);

        assert_eq!(tree.total(), i64::MAX);
        let a = tree.find_path(&["a"]).unwrap();
        assert_eq!(tree.node(a).total(), heavy);
        assert_eq!(tree.node(a).self_weight(), heavy);
        assert_eq!(tree.spans().len(), 3);
    }

    #[test]
    fn test_layout_scenario() {
        let tree = SampleTree::build(&scenario_samples());
        let spans: Vec<(usize, f64, f64, String)> = tree
            .spans()
            .iter()
            .map(|s| (s.depth, s.offset, s.width, s.name.to_string()))
            .collect();

        assert_eq!(
            spans,
            vec![
                (0, 0.0, 1.0, PROFILE_ROOT_NAME.to_string()),
                (1, 0.0, 1.0, "a".to_string()),
                (2, 0.0, 0.75, "b".to_string()),
                (2, 0.75, 0.25, "c".to_string()),
            ]
        );
    }

    #[test]
    fn test_layout_of_empty_tree_emits_nothing() {
        let tree = SampleTree::build(&[]);
        let mut calls = 0;
        tree.layout(|_| calls += 1);
        assert_eq!(calls, 0);
        assert!(flame_bars(&tree, WeightUnit::Count).is_empty());
    }

    #[test]
    fn test_folded_and_hottest() {
        let tree = SampleTree::build(&scenario_samples());
        assert_eq!(tree.folded(), vec!["a;b 3".to_string(), "a;c 1".to_string()]);

        let hottest = tree.hottest(5);
        let names: Vec<&str> = hottest.iter().map(|id| tree.node(*id).name()).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert_eq!(tree.hottest(1).len(), 1);
    }

    fn sample_strategy() -> impl Strategy<Value = Sample> {
        (
            prop::collection::vec(prop::sample::select(vec!["a", "b", "c", "d"]), 0..5),
            0i64..1000,
        )
            .prop_map(|(frames, weight)| Sample::from_frames(&frames, weight))
    }

    proptest! {
        #[test]
        fn prop_totals_are_consistent(samples in prop::collection::vec(sample_strategy(), 0..40)) {
            let tree = SampleTree::build(&samples);
            let expected: i64 = samples.iter().map(|s| s.weight).sum();
            prop_assert_eq!(tree.total(), expected);

            for i in 0..tree.len() as u32 {
                let node = tree.node(FrameId(i));
                let children: i64 = node.children().iter().map(|c| tree.node(*c).total()).sum();
                prop_assert_eq!(node.total(), node.self_weight() + children);
            }
        }

        #[test]
        fn prop_layout_offsets_are_monotonic(samples in prop::collection::vec(sample_strategy(), 1..40)) {
            let tree = SampleTree::build(&samples);
            let spans = tree.spans();
            let mut offsets: AHashMap<FrameId, f64> = AHashMap::new();
            for span in &spans {
                offsets.insert(span.id, span.offset);
            }

            for span in &spans {
                let node = tree.node(span.id);
                let mut previous = span.offset;
                let mut widths = 0.0;
                for child in node.children() {
                    let offset = offsets[child];
                    prop_assert!(offset + 1e-9 >= previous);
                    previous = offset;
                    widths += tree.node(*child).total() as f64 / tree.total() as f64;
                }
                prop_assert!(widths <= span.width + 1e-9);
            }
        }
    }

    // ---- Metric store ----

    #[test]
    fn test_readers_never_see_partial_batches() {
        const SERIES: usize = 16;
        const BATCHES: usize = 200;

        let store = MetricStore::new(MetricTree::new(4, 2, "_"), MetricIngestor::default());
        let names: Vec<String> = (0..SERIES).map(|i| format!("g{:02}", i)).collect();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for k in 1..=BATCHES {
                    let batch: Vec<MetricFamily> = names
                        .iter()
                        .map(|name| MetricFamily::gauge(name, k as f64))
                        .collect();
                    store.ingest(&batch).unwrap();
                }
            });

            for _ in 0..2 {
                scope.spawn(|| {
                    for _ in 0..BATCHES {
                        let mut latest = Vec::new();
                        store.traverse(|_, series| {
                            latest.push(series.list(DEFAULT_DIMENSION).and_then(RingList::latest));
                        });
                        if let Some(first) = latest.first() {
                            assert!(latest.iter().all(|v| v == first), "torn read: {:?}", latest);
                        }
                    }
                });
            }
        });

        assert_eq!(store.generation(), BATCHES as u64);
        assert_eq!(store.view("g00", DEFAULT_DIMENSION).unwrap().last(), Some(&(BATCHES as f64)));
    }

    #[test]
    fn test_store_generation_counts_failed_batches() {
        let store = MetricStore::new(MetricTree::new(4, 2, "_"), MetricIngestor::default());
        let bad = MetricFamily { name: None, ..Default::default() };
        assert!(store.ingest(&[MetricFamily::gauge("up", 1.0), bad]).is_err());
        assert_eq!(store.generation(), 1);
        assert_eq!(store.series_count(), 1);
    }

    // ---- Profile store ----

    #[test]
    fn test_publish_swaps_whole_tree() {
        let store = ProfileStore::new();
        store.register("cpu", WeightUnit::Nanoseconds);
        assert!(store.current("cpu").is_none());
        assert!(!store.layout("cpu", |_| {}));

        let first = store.build_and_publish("cpu", &scenario_samples());
        let held = store.current("cpu").unwrap();
        assert!(Arc::ptr_eq(&first, &held));

        let second = store.build_and_publish("cpu", &[Sample::from_frames(&["x"], 10)]);
        assert!(Arc::ptr_eq(&second, &store.current("cpu").unwrap()));
        // earlier snapshot stays intact for whoever still holds it
        assert_eq!(held.total(), 4);
        assert_eq!(store.stream("cpu").unwrap().builds(), 2);

        let mut names = Vec::new();
        assert!(store.layout("cpu", |span| names.push(span.name.to_string())));
        assert_eq!(names, vec![PROFILE_ROOT_NAME.to_string(), "x".to_string()]);
    }

    #[test]
    fn test_streams_are_independent() {
        let store = ProfileStore::new();
        store.build_and_publish("heap", &[Sample::from_frames(&["alloc"], 64)]);
        store.build_and_publish("cpu", &scenario_samples());

        assert_eq!(store.stream_names(), vec!["cpu".to_string(), "heap".to_string()]);
        assert_eq!(store.current("heap").unwrap().total(), 64);
        assert_eq!(store.current("cpu").unwrap().total(), 4);
    }

    #[test]
    fn test_pause_flag() {
        let store = ProfileStore::new();
        store.register("block", WeightUnit::Nanoseconds);
        assert!(!store.is_paused("block"));
        assert!(store.set_paused("block", true));
        assert!(store.is_paused("block"));
        assert!(!store.set_paused("missing", true));
    }

    // ---- Traces ----

    #[test]
    fn test_trace_line_parse() {
        let line = "db;query;2024-01-01T00:00:00Z;2024-01-01T00:00:01.5Z";
        let parsed = TraceLine::parse(line).unwrap();
        assert_eq!(parsed.stream.as_str(), "db");
        assert_eq!(parsed.task.as_str(), "query");
        assert_eq!((parsed.event.stop - parsed.event.start).num_milliseconds(), 1500);

        assert!(TraceLine::parse("db;query;2024-01-01T00:00:00Z").is_none());
        assert!(TraceLine::parse("db;query;yesterday;today").is_none());
        assert!(TraceLine::parse("a;b;2024-01-01T00:00:00Z;2024-01-01T00:00:00Z;x").is_none());
    }

    #[test]
    fn test_trace_store_prunes_old_events() {
        let store = TraceStore::new(Duration::from_secs(10));
        let now = ts(100);

        store.record("db", "query", TraceEvent { start: ts(70), stop: ts(80) }, now);
        store.record("db", "query", TraceEvent { start: ts(94), stop: ts(95) }, now);
        store.record("db", "commit", TraceEvent { start: ts(98), stop: ts(99) }, now);

        assert_eq!(store.events("db", "query"), vec![TraceEvent { start: ts(94), stop: ts(95) }]);
        assert_eq!(store.tasks("db"), vec!["commit".to_string(), "query".to_string()]);
        assert_eq!(store.stream_names(), vec!["db".to_string()]);
        assert_eq!(store.event_count(), 2);
        assert!(store.tasks("missing").is_empty());
    }

    #[test]
    fn test_trace_lanes() {
        let store = TraceStore::new(Duration::from_secs(10));
        let now = ts(100);
        store.record("db", "query", TraceEvent { start: ts(85), stop: ts(95) }, now);
        store.record("db", "query", TraceEvent { start: ts(96), stop: ts(98) }, now);

        let lanes = trace_lanes(&store, "db", now);
        assert_eq!(lanes.len(), 1);
        assert_eq!(lanes[0].task, "query");
        let spans = &lanes[0].spans;
        assert!((spans[0].0 - 0.0).abs() < 1e-9 && (spans[0].1 - 0.5).abs() < 1e-9);
        assert!((spans[1].0 - 0.6).abs() < 1e-9 && (spans[1].1 - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_idle_tasks_and_streams_expire() {
        let store = TraceStore::new(Duration::from_secs(10));
        store.record("db", "query", TraceEvent { start: ts(80), stop: ts(85) }, ts(90));
        store.record("db", "vacuum", TraceEvent { start: ts(86), stop: ts(88) }, ts(90));
        assert_eq!(store.event_count(), 2);

        store.record("cache", "get", TraceEvent { start: ts(99), stop: ts(100) }, ts(100));
        assert_eq!(store.stream_names(), vec!["cache".to_string()]);
        assert!(store.tasks("db").is_empty());
        assert_eq!(store.event_count(), 1);

        assert!(trace_lanes(&store, "cache", ts(120)).is_empty());
        assert_eq!(store.event_count(), 0);
        assert!(store.stream_names().is_empty());
    }

    // ---- Render models ----

    #[test]
    fn test_chart_frames() {
        let mut tree = MetricTree::new(3, 2, "_");
        let ingestor = MetricIngestor::default();
        ingestor.ingest(&mut tree, &[MetricFamily::gauge("temp", 10.0).with_help("Temperature")]).unwrap();
        ingestor.ingest(&mut tree, &[MetricFamily::gauge("temp", 12.0)]).unwrap();

        let frames = chart_frames(&tree, tree.root());
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.title, "temp");
        assert_eq!(frame.tooltip, "Temperature");
        assert_eq!((frame.y_min, frame.y_max), (5.0, 17.0));
        assert_eq!(frame.x_max, 3);
        assert!(!frame.show_legend);
        assert_eq!(frame.lines[0].values, vec![10.0, 12.0]);
    }

    #[test]
    fn test_chart_legend_shown_for_labeled_series() {
        let mut tree = MetricTree::new(3, 2, "_");
        let family = MetricFamily::new("conns", MetricKind::Gauge)
            .with_metric(Metric::value(1.0).with_label("state", "idle"));
        MetricIngestor::default().ingest(&mut tree, &[family]).unwrap();

        let frames = chart_frames(&tree, tree.root());
        assert!(frames[0].show_legend);
        assert_eq!(frames[0].lines[0].dimension, "state:idle");
    }

    #[test]
    fn test_flame_bars() {
        let tree = SampleTree::build(&scenario_samples());
        let bars = flame_bars(&tree, WeightUnit::Nanoseconds);

        assert_eq!(bars.len(), 4);
        assert_eq!(bars[0].label, "#root (0s/4ns)");
        assert_eq!(bars[2].name, "b");
        assert_eq!(bars[2].label, "b (3ns/3ns)");
        assert_eq!(bars[2].fill, 1.0);
        assert_eq!(bars[1].fill, 0.0);
    }

    #[test]
    fn test_weight_unit_format() {
        assert_eq!(WeightUnit::Nanoseconds.format(3_000_000_000), "3s");
        assert_eq!(WeightUnit::Bytes.format(512), "512 B");
        assert_eq!(WeightUnit::Bytes.format(1536), "1.5 KiB");
        assert_eq!(WeightUnit::Bytes.format(3 * 1024 * 1024), "3.0 MiB");
        assert_eq!(WeightUnit::Count.format(42), "42");
    }
}

// ============================================================================
// SECTION 15: DATA SOURCES
// ============================================================================
// Sources hand back already-decoded batches. The HTTP implementations fetch
// JSON renderings of those batches from the inspected process.
// ============================================================================

// ----------------------------------------------------------------------------
// 15.1 Source Traits
// ----------------------------------------------------------------------------

/// Something that yields one decoded metric batch per call.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Name used in logs and self metrics
    fn name(&self) -> &str;

    async fn fetch(&self) -> SourceResult<Vec<MetricFamily>>;
}

/// Something that yields one decoded sample batch of a named stream per call.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// Stream name the built tree is published under
    fn name(&self) -> &str;

    fn unit(&self) -> WeightUnit {
        WeightUnit::default()
    }

    async fn fetch(&self) -> SourceResult<Vec<Sample>>;
}

// ----------------------------------------------------------------------------
// 15.2 HTTP Sources
// ----------------------------------------------------------------------------

/// Build the shared HTTP client used by all sources.
pub fn build_http_client(timeout: Duration) -> InspectorResult<HttpClient> {
    HttpClient::builder()
        .timeout(timeout)
        .gzip(true)
        .brotli(true)
        .pool_max_idle_per_host(4)
        .user_agent(format!("pulse-inspector/{}", INSPECTOR_VERSION))
        .build()
        .map_err(|e| InspectorError::Internal(format!("Failed to build HTTP client: {}", e)))
}

async fn fetch_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    url: &str,
) -> SourceResult<T> {
    let response = request.send().await.map_err(|e| SourceError::Request {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    response.json::<T>().await.map_err(|e| SourceError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

/// Metric snapshot endpoint of the target.
#[derive(Debug, Clone)]
pub struct HttpMetricSource {
    client: HttpClient,
    url: String,
}

impl HttpMetricSource {
    pub fn new(client: HttpClient, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn from_config(client: HttpClient, target: &TargetConfig) -> Self {
        Self::new(client, target.metrics_url())
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MetricSource for HttpMetricSource {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn fetch(&self) -> SourceResult<Vec<MetricFamily>> {
        fetch_json(self.client.get(&self.url), &self.url).await
    }
}

/// One profile endpoint of the target. Captures with a window block for
/// that long on the target side, so the request timeout grows with it.
#[derive(Debug, Clone)]
pub struct HttpProfileSource {
    client: HttpClient,
    stream: ProfileStreamConfig,
    url: String,
    timeout: Duration,
}

impl HttpProfileSource {
    pub fn new(client: HttpClient, target: &TargetConfig, stream: ProfileStreamConfig) -> Self {
        let timeout = target.timeout + Duration::from_secs(stream.seconds.unwrap_or(0));
        Self {
            client,
            url: target.profile_url(&stream),
            stream,
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl ProfileSource for HttpProfileSource {
    fn name(&self) -> &str {
        &self.stream.name
    }

    fn unit(&self) -> WeightUnit {
        self.stream.unit
    }

    async fn fetch(&self) -> SourceResult<Vec<Sample>> {
        let mut request = self.client.get(&self.url).timeout(self.timeout);
        if let Some(seconds) = self.stream.seconds {
            request = request.query(&[("seconds", seconds)]);
        }
        fetch_json(request, &self.url).await
    }
}

// ============================================================================
// SECTION 16: SELF METRICS
// ============================================================================

/// The inspector's own counters, exposed in Prometheus text format.
pub struct SelfMetrics {
    registry: Registry,
    pub ingest_batches: IntCounter,
    pub ingest_failures: IntCounter,
    pub skipped_metrics: IntCounter,
    pub excluded_families: IntCounter,
    pub fetch_failures: IntCounterVec,
    pub profile_builds: IntCounterVec,
    pub build_duration: HistogramVec,
    pub live_series: IntGauge,
    pub trace_events: IntCounter,
}

impl SelfMetrics {
    pub fn new() -> InspectorResult<Self> {
        let registry = Registry::new_custom(Some("pulse".into()), None).map_err(prometheus_error)?;

        let ingest_batches = IntCounter::new("ingest_batches_total", "Metric batches ingested")
            .map_err(prometheus_error)?;
        let ingest_failures =
            IntCounter::new("ingest_failures_total", "Metric batches rejected as malformed")
                .map_err(prometheus_error)?;
        let skipped_metrics = IntCounter::new(
            "skipped_metrics_total",
            "Metric instances skipped for an unsupported shape",
        )
        .map_err(prometheus_error)?;
        let excluded_families =
            IntCounter::new("excluded_families_total", "Metric families dropped by exclude patterns")
                .map_err(prometheus_error)?;
        let fetch_failures = IntCounterVec::new(
            Opts::new("fetch_failures_total", "Failed fetches per source"),
            &["source"],
        )
        .map_err(prometheus_error)?;
        let profile_builds = IntCounterVec::new(
            Opts::new("profile_builds_total", "Sample trees published per stream"),
            &["stream"],
        )
        .map_err(prometheus_error)?;
        let build_duration = HistogramVec::new(
            HistogramOpts::new("profile_build_seconds", "Sample tree build time")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["stream"],
        )
        .map_err(prometheus_error)?;
        let live_series = IntGauge::new("live_series", "Series currently held in the metric tree")
            .map_err(prometheus_error)?;
        let trace_events = IntCounter::new("trace_events_total", "Trace events recorded")
            .map_err(prometheus_error)?;

        registry.register(Box::new(ingest_batches.clone())).map_err(prometheus_error)?;
        registry.register(Box::new(ingest_failures.clone())).map_err(prometheus_error)?;
        registry.register(Box::new(skipped_metrics.clone())).map_err(prometheus_error)?;
        registry.register(Box::new(excluded_families.clone())).map_err(prometheus_error)?;
        registry.register(Box::new(fetch_failures.clone())).map_err(prometheus_error)?;
        registry.register(Box::new(profile_builds.clone())).map_err(prometheus_error)?;
        registry.register(Box::new(build_duration.clone())).map_err(prometheus_error)?;
        registry.register(Box::new(live_series.clone())).map_err(prometheus_error)?;
        registry.register(Box::new(trace_events.clone())).map_err(prometheus_error)?;

        Ok(Self {
            registry,
            ingest_batches,
            ingest_failures,
            skipped_metrics,
            excluded_families,
            fetch_failures,
            profile_builds,
            build_duration,
            live_series,
            trace_events,
        })
    }

    /// Render every registered metric in text exposition format
    pub fn encode(&self) -> InspectorResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prometheus_error)?;
        String::from_utf8(buffer).map_err(|e| InspectorError::Internal(e.to_string()))
    }

    fn observe_ingest(&self, report: &IngestReport, series: usize) {
        self.ingest_batches.inc();
        self.skipped_metrics.inc_by(report.skipped as u64);
        self.excluded_families.inc_by(report.excluded as u64);
        self.live_series.set(series as i64);
    }
}

impl Debug for SelfMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfMetrics")
            .field("ingest_batches", &self.ingest_batches.get())
            .field("ingest_failures", &self.ingest_failures.get())
            .field("live_series", &self.live_series.get())
            .field("trace_events", &self.trace_events.get())
            .finish()
    }
}

fn prometheus_error(e: prometheus::Error) -> InspectorError {
    InspectorError::Internal(format!("Self metrics error: {}", e))
}

/// Serve `/metrics` until `cancel` fires.
pub async fn serve_self_metrics(
    addr: SocketAddr,
    metrics: Arc<SelfMetrics>,
    cancel: CancellationToken,
) -> InspectorResult<()> {
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let metrics = Arc::clone(&metrics);
            async move {
                match metrics.encode() {
                    Ok(body) => (axum::http::StatusCode::OK, body),
                    Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                }
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "pulse::engine", addr = %addr, "Self metrics endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    Ok(())
}

// ============================================================================
// SECTION 17: INSPECTOR & POLL LOOPS
// ============================================================================
// One task per source. A loop awaits its own fetch before scheduling the
// next one, so fetches of one source never overlap, and no lock is held
// while a fetch is in flight.
// ============================================================================

// ----------------------------------------------------------------------------
// 17.1 Poll Context
// ----------------------------------------------------------------------------

/// Shared handles every poll task works against.
#[derive(Clone)]
pub struct PollContext {
    pub metrics: Arc<MetricStore>,
    pub profiles: Arc<ProfileStore>,
    pub traces: Arc<TraceStore>,
    pub self_metrics: Arc<SelfMetrics>,
    updates: Arc<watch::Sender<u64>>,
    cancel: CancellationToken,
}

impl PollContext {
    /// Tell renderers that something changed
    fn notify(&self) {
        self.updates.send_modify(|generation| *generation += 1);
    }

    fn ensure_running(&self) -> InspectorResult<()> {
        if self.cancel.is_cancelled() {
            return Err(InspectorError::ShuttingDown);
        }
        Ok(())
    }

    /// Fetch and fold one metric batch.
    pub async fn poll_metrics(&self, source: &dyn MetricSource) -> InspectorResult<IngestReport> {
        self.ensure_running()?;
        let families = source.fetch().await.map_err(|e| {
            self.self_metrics
                .fetch_failures
                .with_label_values(&[source.name()])
                .inc();
            e
        })?;

        let result = self.metrics.ingest(&families);
        self.notify();

        match result {
            Ok(report) => {
                self.self_metrics
                    .observe_ingest(&report, self.metrics.series_count());
                Ok(report)
            }
            Err(e) => {
                self.self_metrics.ingest_failures.inc();
                Err(e.into())
            }
        }
    }

    /// Capture one profile, build it off the runtime and publish it.
    /// Returns `None` when the stream is paused.
    pub async fn poll_profile(
        &self,
        source: &dyn ProfileSource,
    ) -> InspectorResult<Option<Arc<SampleTree>>> {
        self.ensure_running()?;
        let name = source.name();
        if self.profiles.is_paused(name) {
            return Ok(None);
        }

        let samples = source.fetch().await.map_err(|e| {
            self.self_metrics
                .fetch_failures
                .with_label_values(&[name])
                .inc();
            e
        })?;

        // paused while the capture was running
        if self.profiles.is_paused(name) {
            return Ok(None);
        }

        let started = Instant::now();
        let tree = tokio::task::spawn_blocking(move || SampleTree::build(&samples))
            .await
            .map_err(|e| SourceError::Join(e.to_string()))?;
        self.self_metrics
            .build_duration
            .with_label_values(&[name])
            .observe(started.elapsed().as_secs_f64());

        let tree = self.profiles.publish(name, tree);
        self.self_metrics
            .profile_builds
            .with_label_values(&[name])
            .inc();
        self.notify();

        debug!(
            target: "pulse::profile",
            stream = name,
            samples = tree.sample_count(),
            nodes = tree.len(),
            total = tree.total(),
            "Profile published"
        );

        Ok(Some(tree))
    }

    /// Read a line-oriented trace stream until it ends or the inspector
    /// shuts down. Returns the number of recorded events.
    pub async fn stream_traces(&self, client: &HttpClient, url: &str) -> InspectorResult<usize> {
        self.ensure_running()?;
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::Request {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }
            .into());
        }

        let mut body = Box::pin(response.bytes_stream());
        let mut pending: Vec<u8> = Vec::new();
        let mut recorded = 0usize;

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => break,
                chunk = body.next() => chunk,
            };

            let chunk = match chunk {
                Some(chunk) => chunk.map_err(|e| SourceError::Request {
                    url: url.to_string(),
                    message: e.to_string(),
                })?,
                None => {
                    // unterminated last line
                    if !pending.is_empty() && self.record_trace_line(&pending) {
                        recorded += 1;
                    }
                    break;
                }
            };

            pending.extend_from_slice(&chunk);
            while let Some(end) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=end).collect();
                if self.record_trace_line(&line) {
                    recorded += 1;
                }
            }

            if pending.len() > MAX_TRACE_LINE_BYTES {
                warn!(
                    target: "pulse::traces",
                    url = url,
                    bytes = pending.len(),
                    "Trace line exceeds limit, discarding"
                );
                pending.clear();
            }
        }

        Ok(recorded)
    }

    fn record_trace_line(&self, line: &[u8]) -> bool {
        let recorded = self
            .traces
            .ingest_line(&String::from_utf8_lossy(line), Utc::now());
        if recorded {
            self.self_metrics.trace_events.inc();
            self.notify();
        }
        recorded
    }
}

// ----------------------------------------------------------------------------
// 17.2 Poll Loops
// ----------------------------------------------------------------------------

async fn run_metrics_loop(ctx: PollContext, source: Arc<dyn MetricSource>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        target: "pulse::metrics",
        source = source.name(),
        interval_ms = every.as_millis() as u64,
        "Metric loop started"
    );

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            result = ctx.poll_metrics(source.as_ref()) => match result {
                Ok(report) => trace!(
                    target: "pulse::metrics",
                    families = report.families,
                    metrics = report.metrics,
                    skipped = report.skipped,
                    "Metric batch ingested"
                ),
                Err(e) if e.is_recoverable() => warn!(
                    target: "pulse::metrics",
                    source = source.name(),
                    category = e.category(),
                    error = %e,
                    "Metric poll failed"
                ),
                Err(e) => error!(
                    target: "pulse::metrics",
                    source = source.name(),
                    category = e.category(),
                    error = %e,
                    "Metric poll failed, target response unusable"
                ),
            }
        }
    }

    info!(target: "pulse::metrics", source = source.name(), "Metric loop stopped");
}

async fn run_profile_loop(ctx: PollContext, source: Arc<dyn ProfileSource>, pause: Duration) {
    let pause = pause.max(Duration::from_millis(MIN_PROFILE_PAUSE_MS));

    info!(
        target: "pulse::profile",
        stream = source.name(),
        pause_ms = pause.as_millis() as u64,
        "Profile loop started"
    );

    loop {
        if !ctx.profiles.is_paused(source.name()) {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                result = ctx.poll_profile(source.as_ref()) => {
                    match result {
                        Err(e) if e.is_recoverable() => warn!(
                            target: "pulse::profile",
                            stream = source.name(),
                            category = e.category(),
                            error = %e,
                            "Profile poll failed"
                        ),
                        Err(e) => error!(
                            target: "pulse::profile",
                            stream = source.name(),
                            category = e.category(),
                            error = %e,
                            "Profile poll failed, target response unusable"
                        ),
                        Ok(None) => trace!(target: "pulse::profile", stream = source.name(), "Stream paused"),
                        Ok(Some(_)) => {}
                    }
                }
            }
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = sleep(pause) => {}
        }
    }

    info!(target: "pulse::profile", stream = source.name(), "Profile loop stopped");
}

async fn run_trace_loop(ctx: PollContext, client: HttpClient, url: String) {
    let retry = Duration::from_millis(TRACE_RECONNECT_DELAY_MS);
    info!(target: "pulse::traces", url = %url, "Trace loop started");

    while !ctx.cancel.is_cancelled() {
        match ctx.stream_traces(&client, &url).await {
            Ok(recorded) => debug!(
                target: "pulse::traces",
                recorded,
                "Trace stream closed"
            ),
            Err(InspectorError::ShuttingDown) => break,
            Err(e) => warn!(
                target: "pulse::traces",
                category = e.category(),
                error = %e,
                "Trace stream failed"
            ),
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = sleep(retry) => {}
        }
    }

    info!(target: "pulse::traces", "Trace loop stopped");
}

// ----------------------------------------------------------------------------
// 17.3 Inspector
// ----------------------------------------------------------------------------

/// Owns all state of one inspected target and the tasks feeding it.
pub struct Inspector {
    config: InspectorConfig,
    context: PollContext,
    client: HttpClient,
    tasks: Mutex<Vec<TokioJoinHandle<()>>>,
    started: Instant,
}

impl Inspector {
    pub fn new(config: InspectorConfig) -> InspectorResult<Self> {
        config.validate()?;

        let metrics = Arc::new(MetricStore::from_config(&config.series)?);
        let profiles = Arc::new(ProfileStore::new());
        for stream in &config.target.profiles {
            profiles.register(&stream.name, stream.unit);
        }
        let traces = Arc::new(TraceStore::new(config.intervals.trace_window));
        let (updates, _) = watch::channel(0u64);

        let context = PollContext {
            metrics,
            profiles,
            traces,
            self_metrics: Arc::new(SelfMetrics::new()?),
            updates: Arc::new(updates),
            cancel: CancellationToken::new(),
        };

        let client = build_http_client(config.target.timeout)?;

        Ok(Self {
            config,
            context,
            client,
            tasks: Mutex::new(Vec::new()),
            started: Instant::now(),
        })
    }

    pub fn config(&self) -> &InspectorConfig {
        &self.config
    }

    pub fn context(&self) -> &PollContext {
        &self.context
    }

    pub fn metrics(&self) -> &Arc<MetricStore> {
        &self.context.metrics
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.context.profiles
    }

    pub fn traces(&self) -> &Arc<TraceStore> {
        &self.context.traces
    }

    pub fn self_metrics(&self) -> &Arc<SelfMetrics> {
        &self.context.self_metrics
    }

    pub fn http_client(&self) -> &HttpClient {
        &self.client
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.context.cancel.clone()
    }

    /// Receiver whose value increments after every change to the stores
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.context.updates.subscribe()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    fn track(&self, handle: TokioJoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub fn spawn_metrics_loop(&self, source: Arc<dyn MetricSource>) {
        let ctx = self.context.clone();
        let every = self.config.intervals.scrape;
        self.track(tokio::spawn(run_metrics_loop(ctx, source, every)));
    }

    pub fn spawn_profile_loop(&self, source: Arc<dyn ProfileSource>) {
        self.context.profiles.register(source.name(), source.unit());
        let ctx = self.context.clone();
        let pause = self.config.intervals.profile_pause;
        self.track(tokio::spawn(run_profile_loop(ctx, source, pause)));
    }

    pub fn spawn_trace_loop(&self, url: String) {
        let ctx = self.context.clone();
        let client = self.client.clone();
        self.track(tokio::spawn(run_trace_loop(ctx, client, url)));
    }

    pub fn spawn_self_metrics_server(&self, addr: SocketAddr) {
        let metrics = Arc::clone(&self.context.self_metrics);
        let cancel = self.context.cancel.clone();
        self.track(tokio::spawn(async move {
            if let Err(e) = serve_self_metrics(addr, metrics, cancel).await {
                error!(target: "pulse::engine", error = %e, "Self metrics endpoint failed");
            }
        }));
    }

    /// Start one loop per configured HTTP source.
    pub fn start_http_sources(&self) -> InspectorResult<()> {
        let target = &self.config.target;

        self.spawn_metrics_loop(Arc::new(HttpMetricSource::from_config(
            self.client.clone(),
            target,
        )));

        for stream in &target.profiles {
            self.spawn_profile_loop(Arc::new(HttpProfileSource::new(
                self.client.clone(),
                target,
                stream.clone(),
            )));
        }

        if let Some(url) = target.traces_url() {
            self.spawn_trace_loop(url);
        }

        if self.config.self_metrics.enabled {
            self.spawn_self_metrics_server(self.config.self_metrics.socket_addr()?);
        }

        info!(
            target: "pulse::engine",
            target_url = %target.url,
            profiles = target.profiles.len(),
            traces = target.traces_path.is_some(),
            tasks = self.task_count(),
            "Sources started"
        );
        Ok(())
    }

    pub async fn poll_metrics_once(&self, source: &dyn MetricSource) -> InspectorResult<IngestReport> {
        self.context.poll_metrics(source).await
    }

    pub async fn poll_profile_once(
        &self,
        source: &dyn ProfileSource,
    ) -> InspectorResult<Option<Arc<SampleTree>>> {
        self.context.profiles.register(source.name(), source.unit());
        self.context.poll_profile(source).await
    }

    /// Ask every loop to stop
    pub fn shutdown(&self) {
        info!(target: "pulse::engine", "Shutdown requested");
        self.context.cancel.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.context.cancel.is_cancelled()
    }

    /// Wait for every spawned loop to finish.
    pub async fn join(&self) {
        let handles: Vec<TokioJoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(target: "pulse::engine", error = %e, "Poll task panicked");
            }
        }
    }
}

// ============================================================================
// SECTION 18: CLI & HEADLESS RENDERING
// ============================================================================

// ----------------------------------------------------------------------------
// 18.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// Pulse Inspector CLI
#[derive(Parser, Debug)]
#[command(
    name = "pulse",
    version,
    about = "Live metrics and flame graphs for a running process",
    long_about = "Pulse polls a process for metric snapshots and stack-sample \
                  profiles and keeps rolling chart series and flame graph \
                  layouts ready for display."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "pulse.toml", env = "PULSE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PULSE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "PULSE_DEBUG")]
    pub debug: bool,

    /// Base URL of the inspected process
    #[arg(short, long)]
    pub target: Option<String>,

    /// Points kept per chart line
    #[arg(long)]
    pub series_length: Option<usize>,

    /// Metric scrape interval (e.g. 250ms, 1s)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub scrape_interval: Option<Duration>,

    /// Serve the inspector's own metrics on this address
    #[arg(long)]
    pub self_metrics_addr: Option<String>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Poll the target continuously (default)
    Run,

    /// Fetch metrics once (and optionally one profile) and print them
    Snapshot {
        /// Profile stream to capture as folded stacks
        #[arg(short, long)]
        stream: Option<String>,

        /// Print chart frames as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

impl Cli {
    /// Fold command line overrides into a loaded configuration
    pub fn apply_overrides(&self, config: &mut InspectorConfig) {
        if let Some(target) = &self.target {
            config.target.url = target.clone();
        }
        if let Some(length) = self.series_length {
            config.series.length = length;
        }
        if let Some(scrape) = self.scrape_interval {
            config.intervals.scrape = scrape;
        }
        if let Some(addr) = &self.self_metrics_addr {
            config.self_metrics.enabled = true;
            config.self_metrics.addr = addr.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.debug {
            config.logging.level = "debug".into();
        }
    }
}

// ----------------------------------------------------------------------------
// 18.2 Command Handlers
// ----------------------------------------------------------------------------

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> InspectorResult<()> {
    println!("Validating configuration: {}", config_path.display());

    match InspectorConfig::load(config_path) {
        Ok(config) => {
            println!("Configuration is valid");

            if verbose {
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("  target:          {}", config.target.url);
            println!("  metrics:         {}", config.target.metrics_url());
            println!(
                "  scrape interval: {}",
                humantime::format_duration(config.intervals.scrape)
            );
            println!("  series length:   {}", config.series.length);
            println!("  split depth:     {}", config.series.split_depth);
            for stream in &config.target.profiles {
                println!("  profile stream:  {} -> {}", stream.name, config.target.profile_url(stream));
            }
            if let Some(url) = config.target.traces_url() {
                println!("  traces:          {}", url);
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed: {}", e);
            Err(InspectorError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> InspectorResult<()> {
    let config_str = InspectorConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} v{}", INSPECTOR_NAME, INSPECTOR_VERSION);
    println!("  target: {}", std::env::consts::ARCH);
    println!("  os:     {}", std::env::consts::OS);
}

/// Handle the run subcommand: poll until interrupted.
async fn handle_run(config: InspectorConfig) -> InspectorResult<()> {
    let inspector = Inspector::new(config)?;
    inspector.start_http_sources()?;

    let cancel = inspector.cancel_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(target: "pulse::engine", "Received interrupt"),
            Err(e) => error!(target: "pulse::engine", error = %e, "Failed to listen for interrupt"),
        }
        cancel.cancel();
    });

    run_render_loop(&inspector).await;

    inspector.join().await;
    info!(
        target: "pulse::engine",
        uptime_secs = inspector.uptime().as_secs(),
        "Inspector stopped"
    );
    Ok(())
}

/// Handle the snapshot subcommand: one metric fetch, optionally one profile.
async fn handle_snapshot(
    config: InspectorConfig,
    stream: Option<&str>,
    json: bool,
) -> InspectorResult<()> {
    let inspector = Inspector::new(config)?;
    let target = &inspector.config().target;

    let source = HttpMetricSource::from_config(inspector.http_client().clone(), target);
    let report = inspector.poll_metrics_once(&source).await?;
    info!(
        target: "pulse::engine",
        families = report.families,
        metrics = report.metrics,
        "Metric snapshot ingested"
    );

    let frames = inspector.metrics().with_tree(|tree| chart_frames(tree, tree.root()));
    if json {
        let text = serde_json::to_string_pretty(&frames)
            .map_err(|e| InspectorError::Internal(e.to_string()))?;
        println!("{}", text);
    } else {
        for frame in &frames {
            let latest: Vec<String> = frame
                .lines
                .iter()
                .map(|line| {
                    format!(
                        "{}={}",
                        line.dimension,
                        line.values.last().copied().unwrap_or_default()
                    )
                })
                .collect();
            println!("{:<56} {}", frame.title, latest.join(" "));
        }
    }

    if let Some(name) = stream {
        let stream = target.stream(name).cloned().ok_or_else(|| {
            ConfigError::invalid_value("stream", format!("unknown profile stream '{}'", name))
        })?;
        let source = HttpProfileSource::new(inspector.http_client().clone(), target, stream);
        if let Some(tree) = inspector.poll_profile_once(&source).await? {
            for line in tree.folded() {
                println!("{}", line);
            }
        }
    }

    Ok(())
}

// ----------------------------------------------------------------------------
// 18.3 Headless Rendering
// ----------------------------------------------------------------------------

/// Sizes of the models computed in one render pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderSummary {
    pub charts: usize,
    pub flame_bars: usize,
    pub trace_lanes: usize,
}

/// Compute every render model once, the way a UI frame would.
pub fn render_frame(inspector: &Inspector, now: DateTime<Utc>) -> RenderSummary {
    let mut summary = RenderSummary::default();

    let charts = inspector
        .metrics()
        .with_tree(|tree| chart_frames(tree, tree.root()));
    summary.charts = charts.len();

    let profiles = inspector.profiles();
    for name in profiles.stream_names() {
        let Some(stream) = profiles.stream(&name) else {
            continue;
        };
        if let Some(tree) = stream.current() {
            let bars = flame_bars(&tree, stream.unit());
            trace!(
                target: "pulse::render",
                stream = %name,
                bars = bars.len(),
                paused = stream.is_paused(),
                "Flame graph laid out"
            );
            summary.flame_bars += bars.len();
        }
    }

    let traces = inspector.traces();
    for name in traces.stream_names() {
        summary.trace_lanes += trace_lanes(traces, &name, now).len();
    }

    debug!(
        target: "pulse::render",
        charts = summary.charts,
        flame_bars = summary.flame_bars,
        trace_lanes = summary.trace_lanes,
        "Frame rendered"
    );
    summary
}

/// Re-render on the configured tick whenever the stores changed.
async fn run_render_loop(inspector: &Inspector) {
    let cancel = inspector.cancel_token();
    let mut updates = inspector.subscribe();
    let mut ticker = interval(inspector.config().intervals.render);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !updates.has_changed().unwrap_or(false) {
            continue;
        }
        let generation = *updates.borrow_and_update();
        trace!(target: "pulse::render", generation, "Stores changed");
        render_frame(inspector, Utc::now());
    }
}

// ============================================================================
// SECTION 19: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the pulse binary
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let found = cli.config.exists();
    let mut config = if found {
        InspectorConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        InspectorConfig::default()
    };
    cli.apply_overrides(&mut config);
    config
        .validate()
        .context("Invalid configuration after command line overrides")?;

    let _log_guard = init_logging(&config.logging)?;
    if !found {
        warn!(
            target: "pulse::init",
            "Config file not found at {}, using defaults",
            cli.config.display()
        );
    }
    info!(target: "pulse::init", "{} v{}", INSPECTOR_NAME, INSPECTOR_VERSION);

    match cli.command {
        Some(Commands::Snapshot { stream, json }) => {
            handle_snapshot(config, stream.as_deref(), json).await?;
        }
        Some(Commands::Run) | None => handle_run(config).await?,
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 20: PHASE 3 TESTS
// ============================================================================
