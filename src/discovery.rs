//! Discovery of scrape target instances.
//!
//! An [`InstanceResolver`] turns a configured target into its running
//! instances. [`CachingDiscoverer`] fronts a resolver with a single-flight
//! cache so overlapping scrape requests share one resolution per target.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use ahash::AHashMap as HashMap;

use crate::cache::{CacheError, CacheSettings, SingleFlightCache};
use crate::config::TargetConfig;
use crate::enrich::{instance_number, OriginLabels};
use crate::fetcher::AuthEnricher;

/// One scrape target instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub org_name: String,
    pub space_name: String,
    pub app_name: String,
    pub app_id: String,
    pub path: String,
    pub protocol: String,
    /// `<app id>:<instance number>`
    pub instance_id: String,
    pub access_url: String,
    #[serde(skip)]
    pub auth: AuthEnricher,
}

impl Instance {
    pub fn instance_number(&self) -> Option<&str> {
        instance_number(&self.instance_id)
    }

    pub fn origin(&self) -> OriginLabels {
        OriginLabels::new(
            &self.org_name,
            &self.space_name,
            &self.app_name,
            &self.instance_id,
        )
    }
}

/// Identity of a configured target, compared by value.
///
/// One application may expose several metrics endpoints, so the path and
/// protocol are part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub org_name: String,
    pub space_name: String,
    pub app_name: String,
    pub path: String,
    pub protocol: String,
}

impl TargetKey {
    pub fn new(
        org_name: impl Into<String>,
        space_name: impl Into<String>,
        app_name: impl Into<String>,
        path: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            org_name: org_name.into(),
            space_name: space_name.into(),
            app_name: app_name.into(),
            path: path.into(),
            protocol: protocol.into(),
        }
    }
}

impl From<&TargetConfig> for TargetKey {
    fn from(target: &TargetConfig) -> Self {
        Self::new(
            &target.org_name,
            &target.space_name,
            &target.app_name,
            &target.path,
            &target.protocol,
        )
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} ({} {})",
            self.org_name, self.space_name, self.app_name, self.protocol, self.path
        )
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("unknown target {0}")]
    UnknownTarget(TargetKey),

    #[error("resolving target {target} failed: {reason}")]
    Resolve { target: TargetKey, reason: String },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Resolves a target into its instances.
pub trait InstanceResolver: Send + Sync + 'static {
    fn resolve(
        &self,
        target: &TargetKey,
    ) -> impl Future<Output = Result<Vec<Instance>, DiscoveryError>> + Send;
}

/// Resolves targets from static configuration.
pub struct StaticResolver {
    targets: HashMap<TargetKey, TargetConfig>,
}

impl StaticResolver {
    pub fn new(targets: &[TargetConfig]) -> Self {
        Self {
            targets: targets
                .iter()
                .map(|t| (TargetKey::from(t), t.clone()))
                .collect(),
        }
    }
}

impl InstanceResolver for StaticResolver {
    async fn resolve(&self, target: &TargetKey) -> Result<Vec<Instance>, DiscoveryError> {
        let config = self
            .targets
            .get(target)
            .ok_or_else(|| DiscoveryError::UnknownTarget(target.clone()))?;

        let access_url = format!("{}://{}{}", config.protocol, config.route, config.path);
        let auth = match &config.basic_auth {
            Some(basic) => AuthEnricher::Basic {
                username: basic.username.clone(),
                password: basic.password.clone(),
            },
            None => AuthEnricher::None,
        };

        Ok((0..config.instances)
            .map(|number| Instance {
                org_name: config.org_name.clone(),
                space_name: config.space_name.clone(),
                app_name: config.app_name.clone(),
                app_id: config.app_id().to_string(),
                path: config.path.clone(),
                protocol: config.protocol.clone(),
                instance_id: format!("{}:{}", config.app_id(), number),
                access_url: access_url.clone(),
                auth: auth.clone(),
            })
            .collect())
    }
}

/// Cache-backed discovery over all configured targets.
pub struct CachingDiscoverer {
    targets: Vec<TargetKey>,
    cache: SingleFlightCache<TargetKey, Arc<Vec<Instance>>>,
}

impl CachingDiscoverer {
    pub fn new<R: InstanceResolver>(
        targets: Vec<TargetKey>,
        resolver: R,
        settings: CacheSettings,
    ) -> Self {
        let resolver = Arc::new(resolver);
        let cache = SingleFlightCache::new("discovery", settings, move |key: TargetKey| {
            let resolver = resolver.clone();
            async move { resolver.resolve(&key).await.map(Arc::new) }
        });
        Self { targets, cache }
    }

    pub fn cache(&self) -> &SingleFlightCache<TargetKey, Arc<Vec<Instance>>> {
        &self.cache
    }

    pub fn targets(&self) -> &[TargetKey] {
        &self.targets
    }

    /// Instances of all targets, optionally narrowed to one application and
    /// one instance number. Targets that fail to resolve are skipped.
    pub async fn discover(
        &self,
        app_id: Option<&str>,
        instance_number: Option<&str>,
    ) -> Vec<Instance> {
        let mut result = Vec::new();
        for target in &self.targets {
            let instances = match self.cache.get(target).await {
                Ok(instances) => instances,
                Err(e) => {
                    warn!("Discovery of target {} failed: {}", target, e);
                    continue;
                }
            };
            result.extend(
                instances
                    .iter()
                    .filter(|i| app_id.map_or(true, |id| i.app_id == id))
                    .filter(|i| {
                        instance_number.map_or(true, |n| i.instance_number() == Some(n))
                    })
                    .cloned(),
            );
        }
        debug!("Discovered {} instances", result.len());
        result
    }

    /// Drops all cached resolutions.
    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }
}
