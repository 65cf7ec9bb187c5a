//! Readable summaries of repair results for assertion messages.

use reviver_core::RepairResult;
use serde_json::{json, Value};

/// Renders `result` as JSON with per-table scores.
pub fn repair_report(result: &RepairResult) -> Value {
    let tables: serde_json::Map<String, Value> = result
        .evaluation
        .tables()
        .map(|(name, table)| {
            (
                name.to_string(),
                json!({
                    "score": table.score(),
                    "rows": table.rows,
                    "ok_pages": table.ok_pages,
                    "corrupted_pages": table.corrupted_pages,
                    "recovered": table.recovered,
                }),
            )
        })
        .collect();
    json!({
        "recovered_table_count": result.recovered_table_count,
        "score": result.score,
        "error": result.error.as_ref().map(|error| format!("{:?}: {}", error.kind, error.message)),
        "tables": tables,
    })
}

/// Pretty-printed form of [`repair_report`].
pub fn repair_report_string(result: &RepairResult) -> String {
    serde_json::to_string_pretty(&repair_report(result)).unwrap_or_default()
}
