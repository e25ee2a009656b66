//! Progress reporting for database builds
//!
//! Provides real-time progress display using indicatif progress bars.

use crate::ingest::{BuildSummary, IngestProgress};
use crate::store::StoreSummary;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Progress reporter that displays build status
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        // Template is a constant; a parse failure only loses the custom style
        if let Ok(spinner) = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            bar.set_style(spinner.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Hidden reporter, for library callers that want no terminal output
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Update the display during ingestion
    pub fn update_ingest(&self, progress: &IngestProgress) {
        let read = match progress.fraction() {
            Some(fraction) => format!(
                "{}/{} ({:.0}%)",
                format_number(progress.read as u64),
                format_number(progress.total as u64),
                fraction * 100.0
            ),
            None => format_number(progress.read as u64),
        };

        let msg = format!(
            "Read: {} | Inserted: {} | Rejected: {} | Rate: {:.0}/s | Workers: {}/{}",
            read,
            format_number(progress.stats.inserted),
            format_number(progress.stats.rejected),
            progress.records_per_second(),
            progress.active_workers,
            progress.total_workers,
        );

        self.bar.set_message(msg);
    }

    /// Update the display during the merge phase
    pub fn update_merge(&self, fraction: f64) {
        self.bar
            .set_message(format!("Merging temporary stores: {:.1}%", fraction * 100.0));
    }

    /// Set a status message
    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Finish and clear the progress display
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Print a summary of the build results
pub fn print_summary(summary: &BuildSummary, db_path: &str, db_size: Option<u64>) {
    let duration_secs = summary.duration.as_secs_f64();
    let rate = if duration_secs > 0.0 {
        summary.stats.processed as f64 / duration_secs
    } else {
        0.0
    };

    let title = if summary.completed {
        style("Build Complete").green().bold()
    } else {
        style("Build Interrupted").yellow().bold()
    };

    println!();
    println!("{}", title);
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {}",
        style("Processed:").bold(),
        format_number(summary.stats.processed)
    );
    println!(
        "  {} {}",
        style("Inserted:").bold(),
        format_number(summary.stats.inserted)
    );
    println!(
        "  {} {}",
        style("Rejected:").bold(),
        format_number(summary.stats.rejected)
    );
    if summary.stats.deleted > 0 {
        println!(
            "  {} {}",
            style("Replaced:").bold(),
            format_number(summary.stats.deleted)
        );
    }
    if summary.temporary_stores > 0 {
        println!(
            "  {} {} ({:.1}s)",
            style("Merged stores:").bold(),
            summary.temporary_stores,
            summary.merge_duration.as_secs_f64()
        );
    }
    println!(
        "  {} {:.1}s ({:.0} records/sec)",
        style("Duration:").bold(),
        duration_secs,
        rate
    );
    if summary.failed > 0 {
        println!(
            "  {} {}",
            style("Failed:").yellow().bold(),
            format_number(summary.failed)
        );
    }
    if let Some(size) = db_size {
        println!(
            "  {} {} ({})",
            style("Database:").bold(),
            db_path,
            format_size(size, BINARY)
        );
    } else {
        println!("  {} {}", style("Database:").bold(), db_path);
    }
    println!();
}

/// Print a header at the start of the build
pub fn print_header(input: &str, output: &str, mode: &str, threads: usize) {
    println!();
    println!(
        "{} {}",
        style("screendb").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Source:").bold(), input);
    println!("  {} {}", style("Output:").bold(), output);
    println!("  {} {}", style("Mode:").bold(), mode);
    if threads == 0 {
        println!("  {} single", style("Threads:").bold());
    } else {
        println!("  {} {}", style("Threads:").bold(), threads);
    }
    println!();
}

/// Print the contents and metadata of a database
pub fn print_info(
    db_path: &str,
    db_size: Option<u64>,
    summary: &StoreSummary,
    metadata: &[(String, String)],
) {
    println!();
    println!("{} {}", style("Database").cyan().bold(), db_path);
    println!("{}", style("─".repeat(50)).dim());
    if let Some(size) = db_size {
        println!("  {} {}", style("Size:").bold(), format_size(size, BINARY));
    }
    println!(
        "  {} {}",
        style("Records:").bold(),
        format_number(summary.records)
    );
    println!(
        "  {} {}",
        style("Distinct hashes:").bold(),
        format_number(summary.distinct_hashes)
    );
    println!(
        "  {} {}",
        style("Derived records:").bold(),
        format_number(summary.derived_records)
    );

    if !summary.feature_totals.is_empty() {
        println!();
        println!("  {}", style("Features by type").bold());
        for (feature_type, count) in &summary.feature_totals {
            println!("    {:>6}  {}", feature_type, format_number(*count));
        }
    }

    if !metadata.is_empty() {
        println!();
        println!("  {}", style("Build info").bold());
        for (key, value) in metadata {
            println!("    {:<16}{}", key, value);
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(1234567890), "1,234,567,890");
    }

    #[test]
    fn test_hidden_reporter_accepts_updates() {
        let reporter = ProgressReporter::hidden();
        reporter.update_ingest(&IngestProgress::default());
        reporter.update_merge(0.5);
        reporter.finish("done");
    }
}
