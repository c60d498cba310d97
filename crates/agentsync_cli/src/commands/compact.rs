//! Compact command implementation.

use agentsync_queue::PersistentQueue;
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No queue found at {:?}", path).into());
    }
    let queue = PersistentQueue::open(&path.to_string_lossy())?;
    tracing::debug!(path = %path.display(), "compacting journal");
    let result = queue.compact()?;

    println!("Compaction complete:");
    println!("  Records:      {} -> {}", result.input_records, result.output_records);
    println!("  Size before:  {} bytes", result.bytes_before);
    println!("  Size after:   {} bytes", result.bytes_after);
    println!("  Reclaimed:    {} bytes", result.bytes_saved());
    Ok(())
}
