//! `plexus inspect` command implementation

use std::path::Path;

use plexus_kernel::loader::{LoadMode, ModuleLoader};
use plexus_kernel::RegistryConfig;
use serde_json::{Value, json};

/// Execute the `plexus inspect` command
pub fn run(config: &RegistryConfig, library: &Path, symbol: Option<&str>) -> anyhow::Result<()> {
    let report = inspect(config, library, symbol)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn inspect(config: &RegistryConfig, library: &Path, symbol: Option<&str>) -> anyhow::Result<Value> {
    let symbol = match symbol {
        Some(symbol) => symbol.to_string(),
        None => config.entry_symbol(&module_name(library)?),
    };

    let mut loader = ModuleLoader::new(library, LoadMode::Shadow);
    loader
        .open()
        .map_err(|e| anyhow::anyhow!("Failed to open '{}': {}", library.display(), e))?;

    let resolved = loader.resolve(&symbol);
    Ok(json!({
        "path": library.display().to_string(),
        "hash": loader.hash(),
        "symbol": symbol,
        "found": resolved.is_ok(),
        "error": resolved.err().map(|e| e.to_string()),
    }))
}

/// Module name from a library file name: `libgreeter.so` is `greeter`
fn module_name(library: &Path) -> anyhow::Result<String> {
    let file_name = library
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid library path: {}", library.display()))?;

    let name = file_name
        .strip_suffix(std::env::consts::DLL_SUFFIX)
        .unwrap_or(file_name);
    let name = name
        .strip_prefix(std::env::consts::DLL_PREFIX)
        .unwrap_or(name);
    Ok(name.to_string())
}
