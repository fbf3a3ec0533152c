// src/utils/log.rs

//! Console report formatting for CLI commands.
//!
//! Diagnostics go through the `log` facade. These helpers print the
//! operator-facing reports (`status`, `history`, `check`) to stdout with the
//! same timestamped layout.

use chrono::Local;

/// Format a report line with timestamp.
fn format_line(message: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    format!("[{}] {}", timestamp, message)
}

/// Print a report line
pub fn line(message: &str) {
    println!("{}", format_line(message));
}

/// Print a separator line
pub fn separator() {
    println!("{}", format_line(&"─".repeat(60)));
}

/// Print a header
pub fn header(title: &str) {
    let border = "═".repeat(60);
    println!("{}", format_line(&border));
    println!("{}", format_line(&format!("  {}", title)));
    println!("{}", format_line(&border));
}

/// Print a sub-item (indented)
pub fn sub_item(message: &str) {
    println!("{}", format_line(&format!("    {}", message)));
}

/// Print a summary section
pub fn summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("{}", format_line(&format!("[SUMMARY] {}", title)));
    for (key, value) in items {
        println!("{}", format_line(&format!("    {}: {}", key, value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_line_has_timestamp_prefix() {
        let formatted = format_line("wh347 idle");
        assert!(formatted.starts_with('['));
        assert!(formatted.ends_with("] wh347 idle"));
    }
}
