// Output formatting helpers for CLI commands
// Progress goes to stderr so a report printed on stdout stays machine-readable

use std::io::IsTerminal;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Bold,
    Action,
    Pass,
    Fail,
    Job,
    Green,
    Red,
    Yellow,
    Cyan,
    Dim,
}

impl Style {
    fn code(self) -> &'static str {
        match self {
            Style::Bold => "1",
            Style::Action => "1;36",
            Style::Pass => "1;32",
            Style::Fail => "1;31",
            Style::Job => "1;34",
            Style::Green => "32",
            Style::Red => "31",
            Style::Yellow => "33",
            Style::Cyan => "36",
            Style::Dim => "2",
        }
    }
}

/// Colors are used only on a terminal and never when `NO_COLOR` is set
fn color_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal())
}

fn styled(enabled: bool, style: Style, text: &str) -> String {
    if enabled {
        format!("\x1b[{}m{}\x1b[0m", style.code(), text)
    } else {
        text.to_string()
    }
}

fn paint(style: Style, text: &str) -> String {
    styled(color_enabled(), style, text)
}

/// Print a status message: "     Loading gantry.yml"
pub fn status(action: &str, message: &str) {
    eprintln!("{} {}", paint(Style::Action, &format!("{:>12}", action)), message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("{} {}", paint(Style::Pass, "  \u{2713}"), message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("{} {}", paint(Style::Fail, "  \u{2717}"), message);
}

/// Print a check/pass item
pub fn check(message: &str) {
    eprintln!("{} {}", paint(Style::Green, "  \u{2713}"), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    eprintln!("{} {}", paint(Style::Yellow, "  !"), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", paint(Style::Fail, "error:"), message);
}

/// Print an info message
pub fn info(message: &str) {
    eprintln!("{} {}", paint(Style::Cyan, "  i"), message);
}

/// Print a muted line for a job or instance that finished well
pub fn dim_success(message: &str) {
    eprintln!("{}", paint(Style::Green, message));
}

/// Print a muted line for a job or instance that failed
pub fn dim_failure(message: &str) {
    eprintln!("{}", paint(Style::Red, message));
}

/// Print the header of a starting instance
pub fn job_header(instance: &str, total_steps: usize) {
    eprintln!("{} '{}' ({} steps)", paint(Style::Job, "  Job"), instance, total_steps);
}

/// Print a line of step output, prefixed with the instance it came from.
///
/// Lines of concurrently running instances interleave.
pub fn step_output(instance: &str, line: &str) {
    eprintln!("{} {}", prefix(instance), line);
}

/// Print a line of step stderr (red)
pub fn step_error(instance: &str, line: &str) {
    eprintln!("{} {}", prefix(instance), paint(Style::Red, line));
}

fn prefix(instance: &str) -> String {
    paint(Style::Dim, &format!("  {} |", instance))
}

/// Print a header line
pub fn header(message: &str) {
    eprintln!("{}", paint(Style::Bold, &format!("==> {}", message)));
}
