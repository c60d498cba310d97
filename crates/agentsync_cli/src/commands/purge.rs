//! Purge command implementation.

use agentsync_queue::PersistentQueue;
use std::path::Path;

/// Runs the purge command.
pub fn run(path: &Path, module: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No queue found at {:?}", path).into());
    }
    let queue = PersistentQueue::open(&path.to_string_lossy())?;
    let removed = queue.remove_all(module)?;
    tracing::info!(module, removed, "module purged");
    println!("Removed {removed} pending diffs from module {module}");
    Ok(())
}
