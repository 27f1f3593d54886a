//! Output formatting utilities

use crate::OutputFormat;
use console::style;
use indicatif::{HumanBytes, HumanDuration};
use serde::Serialize;
use std::time::Duration;

/// Print `value` as pretty JSON when requested, otherwise run `human`
pub fn print_output<T: Serialize>(
    value: &T,
    format: OutputFormat,
    human: impl FnOnce(&T),
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Human => human(value),
    }
    Ok(())
}

pub fn success(message: impl std::fmt::Display) {
    println!("{} {}", style("✓").green().bold(), message);
}

pub fn field(label: &str, value: impl std::fmt::Display) {
    println!("    {}: {}", label, value);
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    HumanBytes(bytes).to_string()
}

pub fn format_duration(elapsed: Duration) -> String {
    HumanDuration(elapsed).to_string()
}
