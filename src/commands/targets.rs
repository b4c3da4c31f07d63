//! Targets command implementation.
//!
//! Resolves every configured target and prints its instances.

use herakles_scrape_gateway::cli::ConfigFormat;
use herakles_scrape_gateway::state::AppState;
use herakles_scrape_gateway::Instance;

/// Lists the instances of all configured targets in the requested format.
pub async fn command_targets(state: &AppState, format: ConfigFormat) -> anyhow::Result<()> {
    let instances: Vec<Instance> = state.discoverer.discover(None, None).await;

    let output = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(&instances)?,
        ConfigFormat::Yaml => serde_yaml::to_string(&instances)?,
        ConfigFormat::Toml => {
            // TOML documents need a table at the root.
            #[derive(serde::Serialize)]
            struct Targets<'a> {
                instances: &'a [Instance],
            }
            toml::to_string_pretty(&Targets {
                instances: &instances,
            })?
        }
    };

    println!("{output}");
    println!(
        "📋 Total: {} instances in {} targets",
        instances.len(),
        state.discoverer.targets().len()
    );
    Ok(())
}
