//! `plexus watch` command implementation

use std::path::Path;
use std::time::Duration;

use colored::Colorize;
use plexus_kernel::FileWatcher;
use tracing::info;

/// Execute the `plexus watch` command
pub async fn run(path: &Path, interval_ms: u64) -> anyhow::Result<()> {
    let mut watcher = FileWatcher::new()?;
    watcher.add_watch(path, |changed: &Path| {
        println!("{} {}", "written:".green(), changed.display());
    })?;

    println!("{} Watching {} (Ctrl-C to stop)", "->".green(), path.display().to_string().cyan());

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                watcher.poll();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return Ok(());
            }
        }
    }
}
