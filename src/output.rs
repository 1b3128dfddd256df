//! Terminal output for humans
//!
//! Headers and status lines are colored with owo-colors, blocking stages get
//! an indicatif spinner. Machine-oriented diagnostics go through `tracing`.

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use std::fmt::Display;
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";
const SPINNER_TEMPLATE: &str = "  {spinner:.cyan} {msg} {elapsed:.dim}";

fn header(marker: impl Display, message: impl Display) {
    println!("{} {}", marker, message);
}

/// `==> Packaging libField/master@local/testing`
pub fn action(message: &str) {
    header("==>".blue().bold(), message.bold());
}

/// `(2/5) hdf5/1.10.5@cd3/devel`
pub fn action_numbered(current: usize, total: usize, message: &str) {
    let counter = format!("({}/{})", current, total);
    header(counter.cyan(), message.bold());
}

/// Indented, dimmed continuation line.
pub fn detail(message: &str) {
    println!("     {}", message.dimmed());
}

pub fn success(message: &str) {
    header("==>".green().bold(), message.green());
}

pub fn info(message: &str) {
    header("::".cyan(), message);
}

/// Nothing to do for this node.
pub fn skip(message: &str) {
    header("==>".dimmed(), message.dimmed());
}

pub fn warning(message: &str) {
    eprintln!("{} {}", "warning:".yellow().bold(), message);
}

pub fn error(message: &str) {
    eprintln!("{} {}", "error:".red().bold(), message);
}

/// One row of the run summary.
pub fn report_line(reference: &str, status: &str, ok: bool) {
    if ok {
        println!("  {:<48} {}", reference, status.green());
    } else {
        println!("  {:<48} {}", reference, status.red());
    }
}

/// Spinner shown while a stage runs.
pub fn stage_spinner(message: &str) -> ProgressBar {
    let style = ProgressStyle::default_spinner()
        .template(SPINNER_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(TICK_CHARS);
    let spinner = ProgressBar::new_spinner().with_style(style);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

pub fn progress_success(spinner: ProgressBar, message: &str) {
    spinner.finish_with_message(message.green().to_string());
}

pub fn progress_fail(spinner: ProgressBar, message: &str) {
    spinner.finish_with_message(message.red().to_string());
}

/// Remove the spinner line entirely.
pub fn progress_done(spinner: ProgressBar) {
    spinner.finish_and_clear();
}
