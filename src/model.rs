//! In-memory metric model shared by the parser, enrichers and encoder.
//!
//! The types mirror the structure of the Prometheus exposition format: a
//! `MetricFamily` groups all samples that share one metric identity, and a
//! `Sample` carries its labels as two positionally corresponding vectors.

use ahash::AHashMap as HashMap;
use serde::Serialize;
use std::fmt;

/// Metric families keyed by family name.
pub type FamilyMap = HashMap<String, MetricFamily>;

/// Content type of the classic Prometheus text format.
pub const CONTENT_TYPE_004: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Content type of the OpenMetrics 1.0.0 text format.
pub const CONTENT_TYPE_OPENMETRICS_100: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Type of a metric family as declared by a `# TYPE` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Info,
    StateSet,
    Unknown,
}

impl MetricType {
    /// Maps a TYPE directive word onto a type, ignoring case.
    ///
    /// `untyped` maps to [`MetricType::Unknown`]; words that are not part of
    /// the exposition grammar yield `None`.
    pub fn from_type_word(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "counter" => Some(Self::Counter),
            "gauge" => Some(Self::Gauge),
            "histogram" => Some(Self::Histogram),
            "summary" => Some(Self::Summary),
            "info" => Some(Self::Info),
            "stateset" => Some(Self::StateSet),
            "untyped" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Word used for this type in a text 0.0.4 `# TYPE` line.
    pub fn text004_word(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
            Self::Info | Self::StateSet | Self::Unknown => "untyped",
        }
    }

    /// Histograms and summaries spread one family over several suffixed names.
    pub fn is_compound(self) -> bool {
        matches!(self, Self::Histogram | Self::Summary)
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
            Self::Info => "info",
            Self::StateSet => "stateset",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A single sample line.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub label_names: Vec<String>,
    pub label_values: Vec<String>,
    pub value: f64,
}

impl Sample {
    /// Creates a sample.
    ///
    /// # Panics
    /// Panics if the label name and value vectors differ in length.
    pub fn new(
        name: impl Into<String>,
        label_names: Vec<String>,
        label_values: Vec<String>,
        value: f64,
    ) -> Self {
        assert_eq!(
            label_names.len(),
            label_values.len(),
            "label names and values must correspond positionally"
        );
        Self {
            name: name.into(),
            label_names,
            label_values,
            value,
        }
    }

    /// Creates a sample without any labels.
    pub fn unlabelled(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, Vec::new(), Vec::new(), value)
    }

    /// Returns the value of the label `name`, if present.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.label_names
            .iter()
            .position(|n| n == name)
            .map(|idx| self.label_values[idx].as_str())
    }
}

/// A named, typed group of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub metric_type: MetricType,
    /// Never absent; empty when no HELP line was seen.
    pub help: String,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, metric_type: MetricType, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metric_type,
            help: help.into(),
            samples: Vec::new(),
        }
    }

    pub fn with_samples(mut self, samples: Vec<Sample>) -> Self {
        self.samples = samples;
        self
    }
}

/// Framing of a fetched metrics document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContentType {
    /// Prometheus text format 0.0.4; no terminator.
    Text004,
    /// OpenMetrics 1.0.0; terminated by a single `# EOF` line.
    OpenMetrics100,
}

impl ContentType {
    /// Derives the framing from an HTTP `Content-Type` header value.
    ///
    /// Anything that is not explicitly OpenMetrics is treated as text 0.0.4.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim_start().starts_with("application/openmetrics-text") => {
                Self::OpenMetrics100
            }
            _ => Self::Text004,
        }
    }

    pub fn header_value(self) -> &'static str {
        match self {
            Self::Text004 => CONTENT_TYPE_004,
            Self::OpenMetrics100 => CONTENT_TYPE_OPENMETRICS_100,
        }
    }
}

/// Raw outcome of a successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub data: String,
    pub content_type: ContentType,
}

impl FetchResult {
    pub fn new(data: impl Into<String>, content_type: ContentType) -> Self {
        Self {
            data: data.into(),
            content_type,
        }
    }
}
