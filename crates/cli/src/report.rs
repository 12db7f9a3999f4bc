//! Summary output: human text on stderr, JSON on stdout and/or a file.

use std::path::Path;

use fleetlink_recon::SyncSummary;

use crate::exit_codes::EXIT_USAGE;
use crate::CliError;

/// Most suggestions printed in the human summary; JSON carries all of them.
const MAX_SUGGESTIONS_SHOWN: usize = 10;

pub fn emit(summary: &SyncSummary, json_output: bool, output_file: Option<&Path>) -> Result<(), CliError> {
    if json_output || output_file.is_some() {
        let json_str = serde_json::to_string_pretty(summary)
            .map_err(|e| CliError::new(EXIT_USAGE, format!("JSON serialization error: {e}")))?;

        if let Some(path) = output_file {
            std::fs::write(path, &json_str)
                .map_err(|e| CliError::new(EXIT_USAGE, format!("cannot write output: {e}")))?;
            eprintln!("wrote {}", path.display());
        }

        if json_output {
            println!("{json_str}");
        }
    }

    print_human(summary);
    Ok(())
}

fn print_human(s: &SyncSummary) {
    eprintln!(
        "{} sync: {} matched, {} new mappings, {} locations, {} vehicles updated, {} skipped",
        s.mode, s.matched, s.upserted_mappings, s.updated_locations, s.updated_vehicles, s.skipped,
    );

    if s.cancelled {
        eprintln!("run was cancelled before all devices were processed");
    }

    for error in &s.errors {
        eprintln!("  error: {error}");
    }

    if !s.unmatched_suggestions.is_empty() {
        eprintln!("{} devices need review:", s.unmatched_suggestions.len());
        for suggestion in s.unmatched_suggestions.iter().take(MAX_SUGGESTIONS_SHOWN) {
            let candidates: Vec<String> = suggestion
                .top_candidates
                .iter()
                .map(|c| format!("{} {} ({:.2} {})", c.vehicle_id, c.plate_number, c.score, c.reason))
                .collect();
            eprintln!(
                "  {} '{}' -> {}",
                suggestion.tracker_id,
                suggestion.device_plate,
                candidates.join(", ")
            );
        }
        if s.unmatched_suggestions.len() > MAX_SUGGESTIONS_SHOWN {
            eprintln!("  ... {} more (use --json)", s.unmatched_suggestions.len() - MAX_SUGGESTIONS_SHOWN);
        }
    }
}
