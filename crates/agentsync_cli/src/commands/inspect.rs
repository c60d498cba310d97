//! Inspect command implementation.

use agentsync_protocol::SeqRange;
use agentsync_queue::{PersistedDiff, PersistentQueue};
use serde::Serialize;
use std::path::Path;

/// Queue inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Queue path.
    pub path: String,
    /// One entry per module with pending diffs.
    pub modules: Vec<ModuleStats>,
}

/// Pending diffs of one module.
#[derive(Debug, Serialize)]
pub struct ModuleStats {
    /// Module name.
    pub module: String,
    /// Number of rows listed.
    pub pending: usize,
    /// The pending diffs, ascending seq.
    pub rows: Vec<Row>,
}

/// One pending diff.
#[derive(Debug, Serialize)]
pub struct Row {
    /// Sequence number.
    pub seq: u64,
    /// Entity id.
    pub id: String,
    /// Destination index.
    pub index: String,
    /// `upsert` or `delete`.
    pub operation: String,
    /// Payload.
    pub data: String,
}

impl From<PersistedDiff> for Row {
    fn from(diff: PersistedDiff) -> Self {
        Self {
            seq: diff.seq,
            id: diff.id,
            index: diff.index,
            operation: diff.operation.to_string(),
            data: diff.data,
        }
    }
}

/// Collects the pending diffs of every module, or of one, optionally
/// restricted to a seq range.
pub fn collect(
    queue: &PersistentQueue,
    module: Option<&str>,
    range: Option<SeqRange>,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let modules = match module {
        Some(module) => vec![module.to_string()],
        None => queue.modules()?,
    };

    let mut result = InspectResult {
        path: queue.location().to_string(),
        modules: Vec::with_capacity(modules.len()),
    };
    for module in modules {
        let diffs = match range {
            Some(range) => queue.fetch_range(&module, &[range])?,
            None => queue.fetch_all(&module)?,
        };
        let rows: Vec<Row> = diffs.into_iter().map(Row::from).collect();
        result.modules.push(ModuleStats {
            module,
            pending: rows.len(),
            rows,
        });
    }
    Ok(result)
}

/// Runs the inspect command.
pub fn run(
    path: &Path,
    module: Option<&str>,
    range: Option<SeqRange>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No queue found at {:?}", path).into());
    }
    let queue = PersistentQueue::open(&path.to_string_lossy())?;
    let result = collect(&queue, module, range)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => print_text_output(&result),
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Queue: {}", result.path);
    if result.modules.is_empty() {
        println!("  (no pending diffs)");
        return;
    }
    for module in &result.modules {
        println!();
        println!("Module {} - {} pending", module.module, module.pending);
        for row in &module.rows {
            println!(
                "  {:>8}  {:<6}  {:<20}  {}  {}",
                row.seq, row.operation, row.index, row.id, row.data
            );
        }
    }
}
