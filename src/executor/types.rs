//! Wire types for the worker RPC protocol.
//!
//! Workers speak HTTP/JSON: submit, status, cancel, NDJSON log streaming,
//! and preview/validate. These types hide the wire shapes from the rest of
//! the control plane; callers only see domain types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use smelter_core::ports::QueryResult;
use smelter_core::types::{LogEntry, RunStatus, S3Credentials};
use smelter_core::SmelterError;

/// Submission sent to a worker. Carries everything the worker needs to
/// execute without calling back: the published-version snapshot pins the
/// exact code, and the optional credentials override rides along in memory
/// only.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitRequest {
    pub run_id: Uuid,
    pub namespace: String,
    pub layer: String,
    pub pipeline_name: String,
    pub trigger: String,
    pub published_versions: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_credentials: Option<S3Credentials>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    pub worker_run_id: String,
}

/// Worker-side view of a run, returned by the status poll.
#[derive(Debug, Clone, Deserialize)]
pub struct RunStatusReport {
    pub status: RunStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub rows_written: Option<i64>,
    #[serde(default)]
    pub archived_landing_zones: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// One NDJSON line of the worker's log stream.
pub type LogLine = LogEntry;

#[derive(Debug, Clone, Serialize)]
pub struct PreviewRequest {
    pub namespace: String,
    pub layer: String,
    pub pipeline_name: String,
    pub published_versions: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

/// Raw preview/validate result: one JSON-encoded value array per column,
/// parallel to `columns`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawQueryResult {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub column_values: Vec<String>,
    #[serde(default)]
    pub phases: Vec<String>,
    #[serde(default)]
    pub explain: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Flatten a columnar result into row maps keyed by column name.
pub fn decode_query_result(raw: RawQueryResult) -> Result<QueryResult, SmelterError> {
    let mut decoded: Vec<Vec<serde_json::Value>> = Vec::with_capacity(raw.column_values.len());
    for (i, blob) in raw.column_values.iter().enumerate() {
        let values: Vec<serde_json::Value> = serde_json::from_str(blob).map_err(|e| {
            SmelterError::Internal(anyhow::anyhow!(
                "malformed column data for {:?}: {e}",
                raw.columns.get(i)
            ))
        })?;
        decoded.push(values);
    }

    let row_count = decoded.iter().map(Vec::len).max().unwrap_or(0);
    let mut rows = Vec::with_capacity(row_count);
    for row_idx in 0..row_count {
        let mut row = HashMap::with_capacity(raw.columns.len());
        for (col_idx, name) in raw.columns.iter().enumerate() {
            let value = decoded
                .get(col_idx)
                .and_then(|col| col.get(row_idx))
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            row.insert(name.clone(), value);
        }
        rows.push(row);
    }

    Ok(QueryResult {
        columns: raw.columns,
        rows,
        phases: raw.phases,
        explain: raw.explain,
        warnings: raw.warnings,
        errors: raw.errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_zips_columns_into_rows() {
        let raw = RawQueryResult {
            columns: vec!["id".into(), "name".into()],
            column_values: vec!["[1,2]".into(), "[\"a\",\"b\"]".into()],
            phases: vec!["plan".into()],
            explain: None,
            warnings: vec![],
            errors: vec![],
        };
        let result = decode_query_result(raw).unwrap();
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0]["id"], 1);
        assert_eq!(result.rows[1]["name"], "b");
    }

    #[test]
    fn decode_rejects_malformed_column() {
        let raw = RawQueryResult {
            columns: vec!["id".into()],
            column_values: vec!["not json".into()],
            phases: vec![],
            explain: None,
            warnings: vec![],
            errors: vec![],
        };
        assert!(decode_query_result(raw).is_err());
    }

    #[test]
    fn submit_request_omits_absent_credentials() {
        let req = SubmitRequest {
            run_id: Uuid::nil(),
            namespace: "sales".into(),
            layer: "bronze".into(),
            pipeline_name: "orders".into(),
            trigger: "manual".into(),
            published_versions: HashMap::new(),
            s3_credentials: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("s3_credentials"));
    }
}
