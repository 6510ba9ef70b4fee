//! Dev-server URL detection in terminal output.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

/// CSI, OSC and single-character escape sequences.
fn ansi_escape_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"\x1b(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\)|[@-Z\\-_])")
            .expect("ANSI regex must compile")
    })
}

fn localhost_url_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d+)")
            .expect("localhost regex must compile")
    })
}

/// Removes terminal escape sequences.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ansi_escape_regex().replace_all(text, "")
}

/// Port of the first local dev-server URL in `text`.
///
/// Escape sequences are stripped first so colourised output still matches.
/// Ports that do not fit in a `u16` are ignored.
pub fn find_localhost_port(text: &str) -> Option<u16> {
    let plain = strip_ansi(text);
    localhost_url_regex()
        .captures_iter(&plain)
        .find_map(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
        .filter(|port| *port != 0)
}

/// Public preview URL for a sandbox host.
pub fn preview_url(host: &str) -> String {
    format!("https://{host}")
}
