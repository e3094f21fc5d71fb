use std::io;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::process::Command;
use tracing::warn;

const CLI_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    pub size_bytes: u64,
    pub details: String,
}

/// Lists installed models by shelling out to `ollama list` and parsing its
/// tabular output.
pub async fn list_models_cli() -> io::Result<Vec<ModelEntry>> {
    let output = tokio::time::timeout(CLI_TIMEOUT, Command::new("ollama").arg("list").output())
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "ollama list timed out"))?
        .map_err(|e| io::Error::new(e.kind(), format!("failed to run ollama list: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(io::Error::other(format!(
            "ollama list exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(parse_list_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parses `ollama list` table output.
///
/// The size column appears either split ("3.2 GB") or joined ("3.2GB"),
/// with decimal or binary unit spellings; binary prefixes are treated as
/// their decimal names.
pub fn parse_list_output(stdout: &str) -> Vec<ModelEntry> {
    let mut entries = Vec::new();
    for (index, line) in stdout.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let upper = line.to_ascii_uppercase();
        if index == 0 && upper.starts_with("NAME") {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(name) = tokens.first() else { continue };

        let mut size_bytes = 0u64;
        let mut size_token_range = None;
        for (i, token) in tokens.iter().enumerate().skip(1) {
            if let Some(bytes) = parse_joined_size(token) {
                size_bytes = bytes;
                size_token_range = Some((i, i));
                break;
            }
            if let Some(next) = tokens.get(i + 1)
                && let Some(bytes) = parse_split_size(token, next)
            {
                size_bytes = bytes;
                size_token_range = Some((i, i + 1));
                break;
            }
        }
        if size_token_range.is_none() {
            warn!("ollama list: no parseable size on line: {line}");
        }

        let details = match size_token_range {
            Some((_, end)) => tokens[end + 1..].join(" "),
            None => tokens[1..].join(" "),
        };
        entries.push(ModelEntry {
            name: (*name).to_string(),
            size_bytes,
            details,
        });
    }
    entries
}

/// "3.2GB", "512MB", "1.1GiB" ...
fn parse_joined_size(token: &str) -> Option<u64> {
    let split_at = token.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = token.split_at(split_at);
    if number.is_empty() {
        return None;
    }
    let value: f64 = number.parse().ok()?;
    Some((value * unit_multiplier(unit)? as f64) as u64)
}

/// "3.2" "GB" as two consecutive tokens.
fn parse_split_size(number: &str, unit: &str) -> Option<u64> {
    let value: f64 = number.parse().ok()?;
    Some((value * unit_multiplier(unit)? as f64) as u64)
}

fn unit_multiplier(unit: &str) -> Option<u64> {
    // Binary spellings (KiB/MiB/...) normalize to their decimal names.
    match unit.to_ascii_uppercase().as_str() {
        "B" => Some(1),
        "KB" | "KIB" => Some(1_000),
        "MB" | "MIB" => Some(1_000_000),
        "GB" | "GIB" => Some(1_000_000_000),
        "TB" | "TIB" => Some(1_000_000_000_000),
        _ => None,
    }
}
