/// Set to false to hide date in logs
const LOG_SHOW_DATE: bool = false;
/// Set to false to hide time in logs
const LOG_SHOW_TIME: bool = true;

/// Log format character widths (hardcoded for precise alignment)
const TAG_WIDTH: usize = 8;
const LOG_TYPE_WIDTH: usize = 8;

use chrono::Local;
use colored::*;
use std::sync::atomic::{AtomicBool, Ordering};

/// Log tags for categorizing log messages.
#[derive(Debug, Clone)]
pub enum LogTag {
    Manager,
    Trader,
    Executor,
    Journal,
    Persist,
    Budget,
    System,
    Other(String),
}

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Toggle whether full prompts/responses are emitted to logs.
pub fn set_verbose_logging(enabled: bool) {
    VERBOSE.store(enabled, Ordering::Relaxed);
}

pub fn is_verbose_logging_enabled() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Initialize the logger system. Probes color support once before
/// concurrent tasks start printing.
pub fn init() {
    let _ = colored::control::SHOULD_COLORIZE.should_colorize();
}

/// Logs a message with time, tag and log type.
pub fn log(tag: LogTag, log_type: &str, message: &str) {
    let now = Local::now();
    let date = now.format("%Y-%m-%d").to_string();
    let time = now.format("%H:%M:%S").to_string();
    let mut prefix = String::new();
    if LOG_SHOW_DATE && LOG_SHOW_TIME {
        prefix = format!("{} {} ", date, time);
    } else if LOG_SHOW_DATE {
        prefix = format!("{} ", date);
    } else if LOG_SHOW_TIME {
        prefix = format!("{} ", time);
    }
    let prefix = if !prefix.is_empty() { prefix.dimmed().to_string() } else { String::new() };

    let tag_str = match tag {
        LogTag::Manager =>
            format!("{:<width$}", "MANAGER", width = TAG_WIDTH)
                .bright_yellow()
                .bold(),
        LogTag::Trader =>
            format!("{:<width$}", "TRADER", width = TAG_WIDTH)
                .bright_green()
                .bold(),
        LogTag::Executor =>
            format!("{:<width$}", "EXECUTOR", width = TAG_WIDTH)
                .bright_cyan()
                .bold(),
        LogTag::Journal =>
            format!("{:<width$}", "JOURNAL", width = TAG_WIDTH)
                .bright_blue()
                .bold(),
        LogTag::Persist =>
            format!("{:<width$}", "PERSIST", width = TAG_WIDTH)
                .bright_magenta()
                .bold(),
        LogTag::Budget =>
            format!("{:<width$}", "BUDGET", width = TAG_WIDTH)
                .bright_red()
                .bold(),
        LogTag::System =>
            format!("{:<width$}", "SYSTEM", width = TAG_WIDTH)
                .white()
                .bold(),
        LogTag::Other(ref s) =>
            format!("{:<width$}", s, width = TAG_WIDTH)
                .white()
                .bold(),
    };

    let log_type_str = match log_type.to_uppercase().as_str() {
        "ERROR" =>
            format!("{:<width$}", log_type, width = LOG_TYPE_WIDTH)
                .bright_red()
                .bold(),
        "WARN" | "WARNING" =>
            format!("{:<width$}", log_type, width = LOG_TYPE_WIDTH)
                .bright_yellow()
                .bold(),
        "SUCCESS" =>
            format!("{:<width$}", log_type, width = LOG_TYPE_WIDTH)
                .bright_green()
                .bold(),
        "INFO" =>
            format!("{:<width$}", log_type, width = LOG_TYPE_WIDTH)
                .bright_blue()
                .bold(),
        "DEBUG" =>
            format!("{:<width$}", log_type, width = LOG_TYPE_WIDTH)
                .bright_black()
                .bold(),
        "CYCLE" =>
            format!("{:<width$}", log_type, width = LOG_TYPE_WIDTH)
                .bright_cyan()
                .bold(),
        "OPEN" =>
            format!("{:<width$}", log_type, width = LOG_TYPE_WIDTH)
                .bright_green()
                .bold(),
        "CLOSE" =>
            format!("{:<width$}", log_type, width = LOG_TYPE_WIDTH)
                .bright_magenta()
                .bold(),
        _ =>
            format!("{:<width$}", log_type, width = LOG_TYPE_WIDTH)
                .white()
                .bold(),
    };

    println!("{}[{}] [{}] {}", prefix, tag_str, log_type_str, message.bright_white());
}

pub fn info(tag: LogTag, message: &str) {
    log(tag, "INFO", message);
}

pub fn warn(tag: LogTag, message: &str) {
    log(tag, "WARN", message);
}

pub fn error(tag: LogTag, message: &str) {
    log(tag, "ERROR", message);
}

/// Debug lines only appear when verbose logging is enabled.
pub fn debug(tag: LogTag, message: &str) {
    if is_verbose_logging_enabled() {
        log(tag, "DEBUG", message);
    }
}
