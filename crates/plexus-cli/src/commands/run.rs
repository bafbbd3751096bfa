//! `plexus run` command implementation

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use plexus_greeter::{GreeterApi, read_greeting};
use plexus_kernel::{ApiTable, ModuleApi, ModuleRegistry, PollSummary, RegistryConfig, RegistryReport};
use tracing::{debug, info, warn};

/// Options of `plexus run`
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dynamic: bool,
    pub library: Option<PathBuf>,
    pub interval_ms: u64,
    pub iterations: Option<u64>,
}

/// Execute the `plexus run` command
pub async fn run(mut config: RegistryConfig, opts: RunOptions) -> anyhow::Result<()> {
    if opts.dynamic || opts.library.is_some() {
        config.prefer_dynamic = true;
    }

    let registry = ModuleRegistry::new(config);
    for library in &registry.config().persistent_libraries {
        if let Err(report) = registry.load_library_persistently(library) {
            warn!("{report:?}");
        }
    }

    let greeter = provision_greeter(&registry, opts.library.as_ref())?;
    for name in &registry.config().dynamic_modules {
        if name != GreeterApi::NAME {
            warn!(module = %name, "Only the greeter module can be hosted");
        }
    }

    if let Some(status) = registry.module_status(GreeterApi::ID) {
        println!(
            "{} greeter: {:?} ({})",
            "->".green(),
            status.provisioning,
            status.state
        );
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(opts.interval_ms.max(1)));
    let mut polls = 0u64;
    let mut last_greeting: Option<String> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let summary = registry.poll_for_reloads();
                report_summary(&summary);

                let greeting = read_greeting(&greeter.load());
                if greeting != last_greeting {
                    match &greeting {
                        Some(text) => println!("{} {}", "greeter says:".cyan(), text),
                        None => println!("{} greeter unavailable", "!".yellow()),
                    }
                    last_greeting = greeting;
                }

                polls += 1;
                debug!(polls, "Poll complete");
                if opts.iterations.is_some_and(|limit| polls >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&registry.modules())?);
    Ok(())
}

fn provision_greeter(
    registry: &ModuleRegistry,
    library: Option<&PathBuf>,
) -> anyhow::Result<Arc<ApiTable<GreeterApi>>> {
    let result: RegistryReport<_> = match library {
        Some(path) => {
            let symbol = registry.config().entry_symbol(GreeterApi::NAME);
            registry.get_or_create_dynamic::<GreeterApi>(path, &symbol, true)
        }
        None => registry.load_default::<GreeterApi>(plexus_greeter::register),
    };

    match result {
        Ok(table) => Ok(table),
        Err(report) => {
            // A watched module comes back once a loadable build lands.
            warn!("{report:?}");
            registry
                .get::<GreeterApi>()
                .ok_or_else(|| anyhow::anyhow!("Failed to provision greeter: {report}"))
        }
    }
}

fn report_summary(summary: &PollSummary) {
    for id in &summary.reloaded {
        println!("{} reloaded {}", "✓".green(), id);
    }
    for id in &summary.unchanged {
        debug!(module = %id, "Unchanged");
    }
    for id in &summary.failed {
        println!("{} reload of {} failed", "✗".red(), id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_run_completes() {
        let opts = RunOptions {
            dynamic: false,
            library: None,
            interval_ms: 1,
            iterations: Some(2),
        };

        run(RegistryConfig::default(), opts).await.unwrap();
    }

    #[test]
    fn test_missing_library_still_provisions_table() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModuleRegistry::new(RegistryConfig::default().with_prefer_dynamic(true));
        let library = dir.path().join("libgreeter.so");

        let table = provision_greeter(&registry, Some(&library)).unwrap();
        assert!(table.load().greeting.is_none());
    }
}
