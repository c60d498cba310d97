//! Verify command implementation.

use agentsync_queue::journal::{summarize, JournalSummary};
use agentsync_storage::{FileBackend, StorageBackend};
use std::path::Path;

/// Reads the journal at `path` and counts its records.
///
/// Holding the store lock keeps a running agent from appending meanwhile.
pub fn check(path: &Path) -> Result<JournalSummary, Box<dyn std::error::Error>> {
    let backend = FileBackend::open(path)?;
    let bytes = backend.read_all()?;
    Ok(summarize(&bytes)?)
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No queue found at {:?}", path).into());
    }
    println!("Verifying queue at {:?}", path);
    println!();

    match check(path) {
        Ok(summary) => {
            println!("  Records:      {}", summary.records);
            println!("    put:        {}", summary.puts);
            println!("    remove:     {}", summary.removes);
            println!("    remove-all: {}", summary.remove_alls);
            println!("    watermark:  {}", summary.watermarks);
            println!("  Valid bytes:  {}", summary.valid_len);
            if summary.torn_len > 0 {
                println!(
                    "  Torn tail:    {} bytes (dropped on next open)",
                    summary.torn_len
                );
            }
            println!();
            println!("✓ Queue verification passed");
            Ok(())
        }
        Err(e) => {
            println!("  Error: {e}");
            println!();
            println!("✗ Queue verification failed");
            Err("Verification failed".into())
        }
    }
}
