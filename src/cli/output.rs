//! Terminal output helpers - progress bar, headers and status lines

use std::collections::BTreeMap;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use crate::session::report::TypeCount;

/// Status indicators
pub struct StatusIcons;

impl StatusIcons {
    pub const SUCCESS: &'static str = "✓";
    pub const ERROR: &'static str = "✗";
    pub const WARNING: &'static str = "⚠";
    pub const SCAN: &'static str = "🔍";
}

/// Byte progress over the source
pub fn scan_bar(total: u64) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
            )?
            .progress_chars("█▓░"),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    Ok(pb)
}

/// Print a styled header
pub fn print_header(title: &str) {
    let width = 60usize;
    let padding = width.saturating_sub(title.len() + 4) / 2;

    println!();
    println!("{}", "═".repeat(width).cyan());
    println!(
        "{}  {}  {}",
        " ".repeat(padding),
        title.bright_white().bold(),
        " ".repeat(padding)
    );
    println!("{}", "═".repeat(width).cyan());
    println!();
}

pub fn print_kv(key: &str, value: &str) {
    println!("  {}: {}", key.bright_black(), value.white());
}

pub fn print_success(msg: &str) {
    println!("{} {}", StatusIcons::SUCCESS.green(), msg.green());
}

pub fn print_warning(msg: &str) {
    println!("{} {}", StatusIcons::WARNING.yellow(), msg.yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", StatusIcons::ERROR.red(), msg.red());
}

/// Colored bar showing how recovered files split across types
pub fn print_type_gauge(by_type: &BTreeMap<String, TypeCount>) {
    let recovered: Vec<(&String, &TypeCount)> =
        by_type.iter().filter(|(_, c)| c.recovered > 0).collect();
    let total: usize = recovered.iter().map(|(_, c)| c.recovered).sum();
    if total == 0 {
        return;
    }

    let bar_width = 50usize;
    let paint = |i: usize, s: &str| match i % 6 {
        0 => s.magenta(),
        1 => s.cyan(),
        2 => s.yellow(),
        3 => s.green(),
        4 => s.blue(),
        _ => s.red(),
    };

    let mut bar = String::new();
    for (i, (_, count)) in recovered.iter().enumerate() {
        let width = (count.recovered as f64 / total as f64 * bar_width as f64) as usize;
        bar.push_str(&paint(i, &"█".repeat(width.max(1))).to_string());
    }
    println!("  [{}]", bar);

    for (i, (name, count)) in recovered.iter().enumerate() {
        println!(
            "  {} {:<8} {:>6}  ({})",
            paint(i, "█"),
            name,
            count.recovered,
            humansize::format_size(count.bytes, humansize::BINARY)
        );
    }
}
