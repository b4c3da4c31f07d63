//! Label enrichment of parsed metric families.
//!
//! Every enricher appends a fixed, variant-specific set of labels behind the
//! labels a sample already carries. Input families are never mutated; the
//! same parsed result may be enriched differently for different consumers.

use crate::model::{FamilyMap, MetricFamily, Sample};

pub const LABEL_ORG_NAME: &str = "org_name";
pub const LABEL_SPACE_NAME: &str = "space_name";
pub const LABEL_APP_NAME: &str = "app_name";
pub const LABEL_INSTANCE_ID: &str = "cf_instance_id";
pub const LABEL_INSTANCE_NUMBER: &str = "cf_instance_number";
pub const LABEL_INSTANCE: &str = "instance";

/// Marker label stamped on metrics the gateway generates itself.
pub const GATEWAY_MARKER_LABEL: &str = "herakles_gateway";

/// Label names of the all-labels enricher, in emission order.
pub const ALL_LABEL_NAMES: [&str; 5] = [
    LABEL_ORG_NAME,
    LABEL_SPACE_NAME,
    LABEL_APP_NAME,
    LABEL_INSTANCE_ID,
    LABEL_INSTANCE_NUMBER,
];

/// Origin of scraped samples.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginLabels {
    pub org_name: String,
    pub space_name: String,
    pub app_name: String,
    pub instance_id: String,
}

impl OriginLabels {
    pub fn new(
        org_name: impl Into<String>,
        space_name: impl Into<String>,
        app_name: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            org_name: org_name.into(),
            space_name: space_name.into(),
            app_name: app_name.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Label values matching [`ALL_LABEL_NAMES`].
    ///
    /// An instance id without `:` has no instance number; the label is then
    /// emitted with an empty value so every sample keeps the same label set.
    pub fn values(&self) -> [String; 5] {
        [
            self.org_name.clone(),
            self.space_name.clone(),
            self.app_name.clone(),
            self.instance_id.clone(),
            instance_number(&self.instance_id)
                .unwrap_or_default()
                .to_string(),
        ]
    }
}

/// Suffix of an instance id after its final `:`.
pub fn instance_number(instance_id: &str) -> Option<&str> {
    instance_id.rfind(':').map(|idx| &instance_id[idx + 1..])
}

/// Closed set of enrichment strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enricher {
    /// org, space, app, instance id and instance number.
    AllLabels(OriginLabels),
    /// A single `instance` label.
    InstanceOnly { instance: String },
    /// The all-labels set for self-generated samples, names optionally prefixed.
    OwnMetrics {
        label_prefix: Option<String>,
        origin: OriginLabels,
    },
    /// `herakles_gateway="true"` marker only.
    PrefixOnly,
    /// Identity.
    Null,
}

impl Enricher {
    pub fn all_labels(origin: OriginLabels) -> Self {
        Self::AllLabels(origin)
    }

    pub fn instance_only(instance: impl Into<String>) -> Self {
        Self::InstanceOnly {
            instance: instance.into(),
        }
    }

    pub fn own_metrics(label_prefix: Option<String>, origin: OriginLabels) -> Self {
        Self::OwnMetrics {
            label_prefix: label_prefix.filter(|p| !p.is_empty()),
            origin,
        }
    }

    /// Label names appended by this enricher.
    pub fn label_names(&self) -> Vec<String> {
        match self {
            Self::AllLabels(_) => ALL_LABEL_NAMES.iter().map(|s| s.to_string()).collect(),
            Self::InstanceOnly { .. } => vec![LABEL_INSTANCE.to_string()],
            Self::OwnMetrics { label_prefix, .. } => own_label_names(label_prefix.as_deref()),
            Self::PrefixOnly => vec![GATEWAY_MARKER_LABEL.to_string()],
            Self::Null => Vec::new(),
        }
    }

    /// Label values appended by this enricher, matching [`Enricher::label_names`].
    pub fn label_values(&self) -> Vec<String> {
        match self {
            Self::AllLabels(origin) | Self::OwnMetrics { origin, .. } => origin.values().into(),
            Self::InstanceOnly { instance } => vec![instance.clone()],
            Self::PrefixOnly => vec!["true".to_string()],
            Self::Null => Vec::new(),
        }
    }

    /// Returns a new family map with the enrichment labels appended.
    pub fn enrich(&self, families: &FamilyMap) -> FamilyMap {
        if matches!(self, Self::Null) {
            return families.clone();
        }

        let names = self.label_names();
        let values = self.label_values();

        families
            .iter()
            .map(|(key, family)| (key.clone(), enrich_family(family, &names, &values)))
            .collect()
    }
}

/// Label names of the own-metrics enricher for the given prefix.
pub fn own_label_names(label_prefix: Option<&str>) -> Vec<String> {
    ALL_LABEL_NAMES
        .iter()
        .map(|name| match label_prefix {
            Some(prefix) => format!("{prefix}_{name}"),
            None => name.to_string(),
        })
        .collect()
}

fn enrich_family(family: &MetricFamily, names: &[String], values: &[String]) -> MetricFamily {
    let samples = family
        .samples
        .iter()
        .map(|sample| {
            let mut label_names = Vec::with_capacity(sample.label_names.len() + names.len());
            label_names.extend_from_slice(&sample.label_names);
            label_names.extend_from_slice(names);

            let mut label_values = Vec::with_capacity(sample.label_values.len() + values.len());
            label_values.extend_from_slice(&sample.label_values);
            label_values.extend_from_slice(values);

            Sample::new(sample.name.clone(), label_names, label_values, sample.value)
        })
        .collect();

    MetricFamily::new(family.name.clone(), family.metric_type, family.help.clone())
        .with_samples(samples)
}
