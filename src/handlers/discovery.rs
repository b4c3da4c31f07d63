//! Service discovery endpoint handler.
//!
//! Returns the discovered instances in the Prometheus HTTP service discovery
//! format, each pointing at its `/singleTargetMetrics` path on this gateway.

use axum::{
    extract::State,
    http::{header, HeaderMap},
    Json,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::discovery::Instance;
use crate::state::SharedState;

const META_PREFIX: &str = "__meta_herakles_gateway";

/// One target group of the HTTP service discovery format.
#[derive(Debug, Serialize)]
pub struct TargetGroup {
    pub targets: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Path under which the single target endpoint serves `instance`.
pub fn single_target_path(instance: &Instance) -> String {
    format!(
        "/singleTargetMetrics/{}/{}",
        instance.app_id,
        instance.instance_number().unwrap_or_default()
    )
}

fn target_group(gateway: &str, instance: &Instance) -> TargetGroup {
    let mut labels = BTreeMap::new();
    labels.insert("__metrics_path__".to_string(), single_target_path(instance));
    labels.insert(format!("{META_PREFIX}_org_name"), instance.org_name.clone());
    labels.insert(format!("{META_PREFIX}_space_name"), instance.space_name.clone());
    labels.insert(format!("{META_PREFIX}_app_name"), instance.app_name.clone());
    labels.insert(format!("{META_PREFIX}_app_id"), instance.app_id.clone());
    labels.insert(
        format!("{META_PREFIX}_instance_id"),
        instance.instance_id.clone(),
    );
    labels.insert(
        format!("{META_PREFIX}_instance_number"),
        instance.instance_number().unwrap_or_default().to_string(),
    );

    TargetGroup {
        targets: vec![gateway.to_string()],
        labels,
    }
}

/// Handler for the /discovery endpoint.
#[instrument(skip(state, headers))]
pub async fn discovery_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Json<Vec<TargetGroup>> {
    debug!("Processing /discovery request");

    // Prometheus reaches us under the host it used for this request.
    let gateway = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| {
            format!(
                "{}:{}",
                state.config.bind.as_deref().unwrap_or("localhost"),
                state.config.port.unwrap_or_default()
            )
        });

    let instances = state.discoverer.discover(None, None).await;
    Json(
        instances
            .iter()
            .map(|instance| target_group(&gateway, instance))
            .collect(),
    )
}
