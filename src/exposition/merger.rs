//! Appends an additional exposition document to a fetched one.
//!
//! OpenMetrics documents must end in exactly one `# EOF` line, so the fetched
//! document's terminator is moved behind the appended text. Text 0.0.4 has no
//! terminator and is plainly concatenated.

use crate::model::{ContentType, FetchResult};

const EOF_MARKER: &str = "# EOF";

/// Merges `additional` into `primary` honouring the primary's framing.
pub fn merge(primary: Option<&FetchResult>, additional: &str) -> String {
    let Some(primary) = primary else {
        return additional.to_string();
    };
    if additional.is_empty() {
        return primary.data.clone();
    }

    match primary.content_type {
        ContentType::Text004 => {
            let mut out = String::with_capacity(primary.data.len() + additional.len());
            out.push_str(&primary.data);
            out.push_str(additional);
            out
        }
        ContentType::OpenMetrics100 => {
            let trimmed = trim_line_endings(&primary.data);
            let trimmed = trimmed.strip_suffix(EOF_MARKER).unwrap_or(trimmed);
            let trimmed = trim_line_endings(trimmed);
            let additional = trim_line_endings(additional);

            format!("{trimmed}\n{additional}\n{EOF_MARKER}\n")
        }
    }
}

fn trim_line_endings(s: &str) -> &str {
    s.trim_end_matches(['\r', '\n'])
}
