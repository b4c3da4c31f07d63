//! Scrape command implementation.
//!
//! Runs one scrape over all (or one application's) instances and prints the
//! merged document, the same body `/metrics` would return.

use herakles_scrape_gateway::exposition::{encode_text, merge};
use herakles_scrape_gateway::internal_metrics::{render_additional, RequestMetrics};
use herakles_scrape_gateway::state::AppState;
use herakles_scrape_gateway::{ContentType, FetchResult};

/// Scrapes once and writes the document to stdout.
pub async fn command_scrape(state: &AppState, app_id: Option<&str>) -> anyhow::Result<()> {
    let instances = state.discoverer.discover(app_id, None).await;
    if instances.is_empty() {
        anyhow::bail!("no instances discovered");
    }

    let report = state.orchestrator.scrape(instances, false).await;
    let request_metrics = RequestMetrics::new(true)?;
    request_metrics.record(&report);

    let primary = FetchResult::new(encode_text(&report.families), ContentType::Text004);
    let additional = render_additional(&request_metrics, state.internal_metrics.as_deref());
    print!("{}", merge(Some(&primary), &additional));

    let down = report.up.iter().filter(|(_, up)| !up).count();
    if down > 0 {
        eprintln!("⚠️  {} of {} instances could not be scraped", down, report.up.len());
    }
    Ok(())
}
