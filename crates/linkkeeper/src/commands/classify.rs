//! `linkkeeper classify`: show how a failure would be handled.

use anyhow::{Result, bail};
use serde::Serialize;

use linkkeeper::config::Config;
use linkkeeper::recovery::{BackoffPolicy, Classifier, ErrorClassification};
use linkkeeper_protocol::{DisconnectReason, Failure};

/// How many attempts the delay preview covers at most.
const PREVIEW_ATTEMPTS: u32 = 5;

#[derive(Debug, Serialize)]
struct Report {
    failure: String,
    classification: ErrorClassification,
    /// Unjittered delay of each attempt, in milliseconds.
    delays_ms: Vec<u64>,
}

pub async fn run(
    reason: Option<DisconnectReason>,
    status: Option<u16>,
    message: Option<String>,
    config_path: &str,
    format: &str,
) -> Result<()> {
    if reason.is_none() && status.is_none() && message.is_none() {
        bail!("Describe the failure with at least one of --reason, --status or --message");
    }

    let config = Config::load(config_path).await?;
    let classifier = Classifier::new(config.recovery.policy_table());
    let failure = Failure {
        reason,
        status,
        message,
    };
    let classification = classifier.classify(&failure);
    let delays_ms = preview_delays(&config.recovery.backoff(), &classification);

    let report = Report {
        failure: failure.to_string(),
        classification,
        delays_ms,
    };
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => render_text(&report),
    }
    Ok(())
}

fn preview_delays(backoff: &BackoffPolicy, classification: &ErrorClassification) -> Vec<u64> {
    if !classification.retryable {
        return Vec::new();
    }
    (1..=classification.max_retries.min(PREVIEW_ATTEMPTS))
        .map(|attempt| {
            backoff
                .unjittered(
                    attempt,
                    classification.base_delay(),
                    classification.max_delay(),
                )
                .as_millis() as u64
        })
        .collect()
}

fn render_text(report: &Report) {
    let c = &report.classification;
    println!("Failure:     {}", report.failure);
    println!("Code:        {}", c.code);
    println!("Description: {}", c.description);
    println!("Severity:    {}", c.severity.as_str());
    println!("Strategy:    {}", c.strategy);
    if c.retryable {
        println!("Retries:     up to {}", c.max_retries);
        let delays: Vec<_> = report.delays_ms.iter().map(|d| format!("{d}ms")).collect();
        println!("Delays:      {}", delays.join(", "));
    } else {
        println!("Retries:     none");
    }
}
