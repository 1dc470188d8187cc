//! `linkkeeper policy`: print the effective recovery policy table.

use anyhow::Result;

use linkkeeper::config::Config;
use linkkeeper::recovery::ErrorClassification;

pub async fn run(config_path: &str, format: &str) -> Result<()> {
    let config = Config::load(config_path).await?;
    let entries = config.recovery.policy_table().entries();

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        _ => render_text(&entries),
    }
    Ok(())
}

fn render_text(entries: &[ErrorClassification]) {
    println!(
        "{:<22} {:<9} {:<20} {:>5} {:>7} {:>10} {:>10}",
        "CODE", "SEVERITY", "STRATEGY", "RETRY", "RETRIES", "BASE_MS", "MAX_MS"
    );
    println!("{}", "-".repeat(89));
    for entry in entries {
        println!(
            "{:<22} {:<9} {:<20} {:>5} {:>7} {:>10} {:>10}",
            entry.code.as_str(),
            entry.severity.as_str(),
            entry.strategy.as_str(),
            if entry.retryable { "yes" } else { "no" },
            entry.max_retries,
            entry.base_delay_ms,
            entry.max_delay_ms,
        );
    }
}
