//! Scan command - prints the fingerprint map the change detector would see

use std::path::Path;

use anyhow::{bail, Context, Result};
use colored::Colorize;

use crate::config::ServiceConfig;
use crate::fingerprint::{snapshot, ScanOptions};

/// Fingerprint `dir` with a service's scan settings, or with the given
/// extensions when no service file is named.
pub fn execute(dir: &Path, service_config: Option<&Path>, extensions: &[String]) -> Result<()> {
    let options = match service_config {
        Some(path) => ServiceConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?
            .scan_options(),
        None if extensions.is_empty() => {
            bail!("Nothing to scan for: pass --config <service.toml> or --ext <.ext>")
        }
        None => ScanOptions {
            allowed_extensions: extensions.iter().map(|ext| normalize_extension(ext)).collect(),
            ..ScanOptions::default()
        },
    };

    let map = snapshot(dir, &options).with_context(|| format!("Failed to scan {}", dir.display()))?;
    for (path, digest) in &map {
        println!("{}  {path}", digest[..16.min(digest.len())].dimmed());
    }
    println!("{} {} file(s) fingerprinted", "✓".green().bold(), map.len());
    Ok(())
}

fn normalize_extension(ext: &str) -> String {
    if ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{ext}")
    }
}
