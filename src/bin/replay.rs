//! Replays a JSONL file of intake items through the pipeline and prints
//! every emitted event as one JSON line on stdout.
//!
//! Usage: `replay <items.jsonl>`. Config resolution is the same as the
//! service (`PIPELINE_CONFIG_PATH`, then `config/pipeline.toml`). Intents go
//! to the paper dispatcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use sentiment_gate::execution::PaperDispatcher;
use sentiment_gate::{build_pipeline, telemetry, IntakeItem, ItemOutcome, PipelineConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();

    let Some(path) = std::env::args().nth(1) else {
        bail!("usage: replay <items.jsonl>");
    };

    let config = Arc::new(PipelineConfig::load_default().context("loading pipeline config")?);
    let (pipeline, recorder) = build_pipeline(config, Arc::new(PaperDispatcher::new()))?;

    let mut events = pipeline.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ev) => match serde_json::to_string(&ev) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "unprintable event"),
                },
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("opening {path}"))?;
    let mut lines = BufReader::new(file).lines();

    let mut tally: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut lineno = 0usize;
    while let Some(line) = lines.next_line().await.context("reading replay file")? {
        lineno += 1;
        if line.trim().is_empty() {
            continue;
        }
        let raw: IntakeItem = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(line = lineno, error = %e, "skipping malformed line");
                *tally.entry("malformed").or_default() += 1;
                continue;
            }
        };
        let Some(item) = raw.into_content() else {
            tracing::info!(line = lineno, "skipping item without text or ticker");
            *tally.entry("skipped").or_default() += 1;
            continue;
        };
        let report = pipeline.process_item(item).await;
        for outcome in &report.outcomes {
            let key = match outcome {
                ItemOutcome::Dispatched { .. } => "dispatched",
                ItemOutcome::Hold { .. } => "hold",
                ItemOutcome::Suppressed { .. } => "suppressed",
                ItemOutcome::Inconclusive { .. } => "inconclusive",
                ItemOutcome::BudgetExceeded { .. } => "budget_exceeded",
            };
            *tally.entry(key).or_default() += 1;
        }
    }

    // Dropping the last pipeline handle closes the bus and the recorder.
    drop(pipeline);
    let _ = printer.await;
    if let Some(handle) = recorder {
        handle.await.context("recorder task")??;
    }

    eprintln!("replay done: {lineno} lines");
    for (k, v) in &tally {
        eprintln!("  {k:<16} {v}");
    }
    Ok(())
}
