//! Formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};
use nodevm_core::{Notification, NotificationLevel, ProgressState};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Whole-number percentage of `progress`; an empty tree counts as done.
pub fn percent(progress: &ProgressState) -> u64 {
    if progress.max == 0 {
        return 100;
    }
    (progress.current.min(progress.max) * 100) / progress.max
}

/// One progress line, e.g. `[ 35%] Starting virtual machine`.
pub fn format_progress(progress: &ProgressState) -> String {
    let description = progress.description.as_deref().unwrap_or("Working");
    format!("[{:>3}%] {}", percent(progress), description)
}

pub fn format_notification(notification: &Notification) -> String {
    let label = match notification.level {
        NotificationLevel::Info => "info",
        NotificationLevel::Warning => "warning",
        NotificationLevel::Error => "error",
    };
    format!("{}: {}", label, notification.message)
}
