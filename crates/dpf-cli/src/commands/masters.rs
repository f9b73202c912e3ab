//! Masters command for decoding hex master words from text.

use std::io::Write;

use anyhow::Result;

use dpf_core::{Topology, decode_master_text};

/// Prints one line per decoded word and returns how many lines failed.
pub fn run<W: Write>(writer: &mut W, text: &str, topology: &Topology) -> Result<usize> {
    let mut failed = 0;
    for word in decode_master_text(text, topology) {
        match word {
            Ok(word) => writeln!(writer, "{word}")?,
            Err(e) => {
                tracing::warn!(error = %e, "skipping master word");
                failed += 1;
            }
        }
    }
    Ok(failed)
}
