//! `plexus config` command implementation

use colored::Colorize;
use plexus_kernel::RegistryConfig;

/// Execute the `plexus config` command
pub fn run(config: &RegistryConfig) -> anyhow::Result<()> {
    println!("{} Effective configuration", "->".green());
    println!("{}", serde_json::to_string_pretty(config)?);

    if config.prefer_dynamic {
        println!();
        println!(
            "{} greeter loads from {} via {}",
            "->".green(),
            config.library_path("greeter").display(),
            config.entry_symbol("greeter").cyan()
        );
    }
    Ok(())
}
