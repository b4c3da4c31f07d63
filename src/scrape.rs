//! Scrape orchestration.
//!
//! One fetch task per instance runs on a bounded worker pool. Each task
//! fetches, parses and enriches its instance's document and folds the result
//! into a shared aggregate. A failing instance only contributes an `up=0`
//! indicator; the aggregate is always returned.

use ahash::AHashMap as HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::ScrapingConfig;
use crate::discovery::Instance;
use crate::enrich::Enricher;
use crate::exposition::parse;
use crate::fetcher::{FetchError, Fetcher};
use crate::internal_metrics::InternalMetrics;
use crate::model::{FamilyMap, FetchResult};

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("no instance matched the request")]
    NoInstances,
    #[error("request originates from this gateway")]
    Loopback,
}

#[derive(Debug, Clone)]
pub struct ScrapeSettings {
    pub workers: usize,
    pub fetch_timeout: Duration,
    pub max_processing_time: Duration,
    pub label_enrichment: bool,
}

impl From<&ScrapingConfig> for ScrapeSettings {
    fn from(cfg: &ScrapingConfig) -> Self {
        Self {
            workers: cfg.threads,
            fetch_timeout: cfg.fetch_timeout(),
            max_processing_time: cfg.max_processing_time(),
            label_enrichment: cfg.label_enrichment,
        }
    }
}

/// Metric families merged across instances by family name.
#[derive(Debug, Default)]
pub struct Aggregate {
    families: FamilyMap,
}

impl Aggregate {
    /// Appends the samples of `batch` to families of the same name.
    ///
    /// A family whose type differs from the one already aggregated is dropped.
    pub fn fold(&mut self, batch: FamilyMap) {
        for (name, family) in batch {
            match self.families.entry(name) {
                Entry::Vacant(slot) => {
                    slot.insert(family);
                }
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    if existing.metric_type != family.metric_type {
                        warn!(
                            "Metric {} has type {} but another instance reported {}, dropping {} samples",
                            existing.name,
                            existing.metric_type,
                            family.metric_type,
                            family.samples.len()
                        );
                        continue;
                    }
                    if existing.help.is_empty() {
                        existing.help = family.help;
                    }
                    existing.samples.extend(family.samples);
                }
            }
        }
    }

    pub fn into_families(self) -> FamilyMap {
        self.families
    }
}

/// Outcome of scraping a set of instances.
#[derive(Debug, Default)]
pub struct ScrapeReport {
    pub families: FamilyMap,
    /// Every requested instance with whether it was scraped successfully.
    pub up: Vec<(Instance, bool)>,
    /// Raw documents of successful instances, when requested.
    pub raw: Vec<(Instance, FetchResult)>,
    pub duration: Duration,
}

struct TaskOutcome {
    index: usize,
    instance: Instance,
    raw: Option<FetchResult>,
    up: bool,
}

pub struct ScrapeOrchestrator<F> {
    fetcher: Arc<F>,
    settings: ScrapeSettings,
    internal: Option<Arc<InternalMetrics>>,
}

impl<F: Fetcher> ScrapeOrchestrator<F> {
    pub fn new(fetcher: F, settings: ScrapeSettings) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            settings,
            internal: None,
        }
    }

    /// Records fetch failures and latencies in `internal`.
    pub fn with_internal_metrics(mut self, internal: Arc<InternalMetrics>) -> Self {
        self.internal = Some(internal);
        self
    }

    pub fn settings(&self) -> &ScrapeSettings {
        &self.settings
    }

    /// Scrapes all instances and folds their families.
    ///
    /// With `retain_raw`, the unparsed documents are kept in the report. If
    /// label enrichment is disabled as well, documents are passed through
    /// without being parsed and `families` stays empty.
    #[instrument(skip_all, fields(instances = instances.len()))]
    pub async fn scrape(&self, instances: Vec<Instance>, retain_raw: bool) -> ScrapeReport {
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + self.settings.max_processing_time;
        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let aggregate = Arc::new(Mutex::new(Aggregate::default()));

        let mut pending: HashMap<usize, Instance> = HashMap::new();
        let mut tasks = JoinSet::new();
        let passthrough = retain_raw && !self.settings.label_enrichment;

        for (index, instance) in instances.into_iter().enumerate() {
            pending.insert(index, instance.clone());

            let semaphore = semaphore.clone();
            let aggregate = aggregate.clone();
            let fetcher = self.fetcher.clone();
            let internal = self.internal.clone();
            let fetch_timeout = self.settings.fetch_timeout;
            let label_enrichment = self.settings.label_enrichment;

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return TaskOutcome {
                        index,
                        instance,
                        raw: None,
                        up: false,
                    };
                };

                let started = Instant::now();
                let result = match tokio::time::timeout(
                    fetch_timeout,
                    fetcher.fetch(&instance, fetch_timeout),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout {
                        url: instance.access_url.clone(),
                        timeout: fetch_timeout,
                    }),
                };
                if let Some(internal) = &internal {
                    internal.observe_latency(&instance, started.elapsed().as_secs_f64());
                }

                match result {
                    Ok(fetched) => {
                        if !passthrough {
                            let families = parse(&fetched.data);
                            let enricher = if label_enrichment {
                                Enricher::all_labels(instance.origin())
                            } else {
                                Enricher::Null
                            };
                            let enriched = enricher.enrich(&families);
                            aggregate
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .fold(enriched);
                        }

                        TaskOutcome {
                            index,
                            instance,
                            raw: retain_raw.then_some(fetched),
                            up: true,
                        }
                    }
                    Err(e) => {
                        warn!("Scraping instance {} failed: {}", instance.instance_id, e);
                        if let Some(internal) = &internal {
                            internal.record_failure(&instance);
                        }
                        TaskOutcome {
                            index,
                            instance,
                            raw: None,
                            up: false,
                        }
                    }
                }
            });
        }

        let mut report = ScrapeReport::default();
        let mut timed_out = false;

        loop {
            let next = tokio::time::timeout_at(deadline, tasks.join_next()).await;
            match next {
                Ok(Some(joined)) => self.collect(joined, &mut pending, &mut report),
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    tasks.abort_all();
                    break;
                }
            }
        }

        if timed_out {
            // Tasks that finished before being aborted still count.
            while let Some(joined) = tasks.join_next().await {
                self.collect(joined, &mut pending, &mut report);
            }
            info!(
                "Scrape exceeded {:?}, {} instances did not complete",
                self.settings.max_processing_time,
                pending.len()
            );
        }

        for (_, instance) in pending.drain() {
            if let Some(internal) = &self.internal {
                internal.record_failure(&instance);
            }
            report.up.push((instance, false));
        }

        report.families = match Arc::try_unwrap(aggregate) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
            // Aborted tasks may not have released their handle yet.
            Err(shared) => std::mem::take(&mut *shared.lock().unwrap_or_else(PoisonError::into_inner)),
        }
        .into_families();
        report.duration = start.elapsed();

        debug!(
            "Scrape finished in {:?}: {} families, {}/{} instances up",
            report.duration,
            report.families.len(),
            report.up.iter().filter(|(_, up)| *up).count(),
            report.up.len()
        );
        report
    }

    fn collect(
        &self,
        joined: Result<TaskOutcome, tokio::task::JoinError>,
        pending: &mut HashMap<usize, Instance>,
        report: &mut ScrapeReport,
    ) {
        match joined {
            Ok(outcome) => {
                pending.remove(&outcome.index);
                if let Some(raw) = outcome.raw {
                    report.raw.push((outcome.instance.clone(), raw));
                }
                report.up.push((outcome.instance, outcome.up));
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => warn!("Scrape task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MetricFamily, MetricType, Sample};

    fn family(name: &str, metric_type: MetricType, value: f64) -> FamilyMap {
        let mut map = FamilyMap::default();
        map.insert(
            name.to_string(),
            MetricFamily::new(name, metric_type, "")
                .with_samples(vec![Sample::unlabelled(name, value)]),
        );
        map
    }

    #[test]
    fn test_fold_appends_same_type() {
        let mut aggregate = Aggregate::default();
        aggregate.fold(family("requests", MetricType::Counter, 1.0));
        aggregate.fold(family("requests", MetricType::Counter, 2.0));

        let families = aggregate.into_families();
        let values: Vec<f64> = families["requests"].samples.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_fold_drops_type_mismatch() {
        let mut aggregate = Aggregate::default();
        aggregate.fold(family("requests", MetricType::Counter, 1.0));
        aggregate.fold(family("requests", MetricType::Gauge, 2.0));

        let families = aggregate.into_families();
        assert_eq!(families["requests"].metric_type, MetricType::Counter);
        assert_eq!(families["requests"].samples.len(), 1);
    }

    #[test]
    fn test_fold_takes_help_from_later_batch() {
        let mut aggregate = Aggregate::default();
        aggregate.fold(family("up_time", MetricType::Gauge, 1.0));
        let mut described = family("up_time", MetricType::Gauge, 2.0);
        described.get_mut("up_time").unwrap().help = "Uptime".into();
        aggregate.fold(described);

        assert_eq!(aggregate.into_families()["up_time"].help, "Uptime");
    }
}
