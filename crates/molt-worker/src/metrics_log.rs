//! Optional fire-and-forget JSON Lines metrics sink, enabled by the
//! metrics-output-path environment variable (the JSON-Lines format choice
//! is recorded in DESIGN.md). One line per completed response: the same
//! `metrics` map the wire response carries, plus `request_id` and `entry`
//! so lines can be correlated without re-parsing frames.

use std::collections::HashMap;

use molt_wire::MetricValue;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

#[derive(Serialize)]
struct MetricsLine<'a> {
    request_id: u64,
    entry: &'a str,
    #[serde(flatten)]
    metrics: &'a HashMap<String, MetricValue>,
}

/// Cheap to clone; `log` never blocks the caller even if the backing file
/// is slow or the path was never configured.
#[derive(Clone, Default)]
pub struct MetricsLogger {
    tx: Option<UnboundedSender<String>>,
}

impl MetricsLogger {
    pub fn from_env() -> Self {
        match std::env::var("MOLT_METRICS_PATH") {
            Ok(path) if !path.is_empty() => Self::spawn(path),
            _ => Self { tx: None },
        }
    }

    fn spawn(path: String) -> Self {
        let (tx, mut rx) = unbounded_channel::<String>();
        tokio::spawn(async move {
            let file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await;
            let mut file = match file {
                Ok(file) => file,
                Err(err) => {
                    tracing::error!(error = %err, path, "failed to open metrics path; metrics logging disabled");
                    return;
                }
            };
            while let Some(line) = rx.recv().await {
                if let Err(err) = file.write_all(line.as_bytes()).await {
                    tracing::warn!(error = %err, "failed to write metrics line");
                }
            }
        });
        Self { tx: Some(tx) }
    }

    pub fn log(&self, request_id: u64, entry: &str, metrics: &HashMap<String, MetricValue>) {
        let Some(tx) = &self.tx else { return };
        let line = MetricsLine { request_id, entry, metrics };
        match serde_json::to_string(&line) {
            Ok(mut json) => {
                json.push('\n');
                let _ = tx.send(json);
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize metrics line"),
        }
    }
}
