use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stats::BatchStats;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub strategy: String,
    pub total: u64,
    pub processed_count: u64,
    pub unprocessed_count: u64,
    pub elapsed_s: f64,
}

impl BatchSummary {
    pub fn from_stats(
        batch_id: &str,
        started_at: &str,
        finished_at: &str,
        strategy: &str,
        stats: &BatchStats,
    ) -> Self {
        Self {
            batch_id: batch_id.to_string(),
            started_at: started_at.to_string(),
            finished_at: finished_at.to_string(),
            strategy: strategy.to_string(),
            total: stats.total,
            processed_count: stats.processed_count,
            unprocessed_count: stats.unprocessed_count,
            elapsed_s: stats.elapsed.as_secs_f64(),
        }
    }
}

pub fn write_summary(
    path: &Path,
    summary: &BatchSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Map, Value};

    use super::{write_summary, BatchSummary};
    use crate::stats::BatchStats;

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let stats = BatchStats {
            total: 3,
            processed_count: 2,
            unprocessed_count: 1,
            elapsed: Duration::from_millis(1500),
        };
        let summary = BatchSummary::from_stats(
            "batch-123",
            "2026-02-19T00:00:00+00:00",
            "2026-02-19T00:10:00+00:00",
            "embed",
            &stats,
        );
        let mut extra = Map::new();
        extra.insert("source".to_string(), Value::String("/in".to_string()));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["batch_id"], json!("batch-123"));
        assert_eq!(parsed["processed_count"], json!(2));
        assert_eq!(parsed["unprocessed_count"], json!(1));
        assert_eq!(parsed["elapsed_s"], json!(1.5));
        assert_eq!(parsed["source"], json!("/in"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
