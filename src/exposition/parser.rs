//! Parser for the Prometheus text exposition format.
//!
//! Turns a text 0.0.4 (or OpenMetrics-framed) document into a map of
//! [`MetricFamily`] values keyed by family name. Parsing is line oriented and
//! resilient: a malformed line is logged and skipped, never aborting the rest
//! of the document.
//!
//! Format reference: <https://prometheus.io/docs/instrumenting/exposition_formats/>

use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::model::{FamilyMap, MetricFamily, MetricType, Sample};

static PATTERN_HELP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#[ \t]+HELP[ \t]+").expect("static regex"));
static PATTERN_TYPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#[ \t]+TYPE[ \t]+").expect("static regex"));
static PATTERN_PARSE_HELP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^#[ \t]+HELP[ \t]+([a-zA-Z0-9:_"]+)(?:[ \t]+(.*))?$"#).expect("static regex")
});
static PATTERN_PARSE_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^#[ \t]+TYPE[ \t]+([a-zA-Z0-9:_"]+)[ \t]+([a-zA-Z]*)[ \t]*$"#)
        .expect("static regex")
});

/// Suffixes stripped from histogram/summary sample names to find the family.
///
/// `_max` is not part of the exposition grammar but is emitted by micrometer.
const COMPOUND_SUFFIXES: [&str; 4] = ["_bucket", "_sum", "_count", "_max"];

/// Parses an exposition document.
///
/// Never fails: lines that cannot be understood are skipped with a warning.
pub fn parse(text: &str) -> FamilyMap {
    let mut state = ParseState::default();

    for raw in text.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);

        // Order matters: HELP and TYPE are comments too.
        if is_empty_line(line) {
            continue;
        } else if PATTERN_HELP.is_match(line) {
            state.parse_help_line(line);
        } else if PATTERN_TYPE.is_match(line) {
            state.parse_type_line(line);
        } else if line.starts_with('#') {
            continue;
        } else {
            state.parse_sample_line(line);
        }
    }

    state.finish()
}

/// Returns the canonical family name of a possibly suffixed sample name.
pub fn base_metric_name(name: &str) -> &str {
    COMPOUND_SUFFIXES
        .iter()
        .find_map(|suffix| name.strip_suffix(suffix))
        .unwrap_or(name)
}

fn is_empty_line(line: &str) -> bool {
    line.chars().all(|c| c == ' ' || c == '\t')
}

/// Transient tables of a single `parse` call.
#[derive(Default)]
struct ParseState {
    helps: HashMap<String, String>,
    types: HashMap<String, MetricType>,
    families: FamilyMap,
}

impl ParseState {
    fn parse_help_line(&mut self, line: &str) {
        let Some(caps) = PATTERN_PARSE_HELP.captures(line) else {
            warn!("HELP line could not be properly matched: {}", line);
            return;
        };
        let name = unescape_token(&caps[1]);
        let help = caps.get(2).map(|m| unescape_help(m.as_str())).unwrap_or_default();
        self.helps.insert(name, help);
    }

    fn parse_type_line(&mut self, line: &str) {
        let Some(caps) = PATTERN_PARSE_TYPE.captures(line) else {
            warn!("TYPE line could not be properly matched: {}", line);
            return;
        };
        let name = unescape_token(&caps[1]);
        let metric_type = match MetricType::from_type_word(&caps[2]) {
            Some(t) => t,
            None => {
                warn!(
                    "Unknown type '{}' in TYPE line, assuming unknown: {}",
                    &caps[2], line
                );
                MetricType::Unknown
            }
        };
        self.types.insert(name, metric_type);
    }

    fn parse_sample_line(&mut self, line: &str) {
        let sample = match SampleLine::new(line).parse() {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Detected non-parsable metric line '{}': {}", line, e);
                return;
            }
        };

        let metric_type = self.resolve_type(&sample.name);
        if metric_type == MetricType::Unknown {
            info!(
                "Definition of metric {} without type information (assuming unknown)",
                sample.name
            );
        }

        let family_name = if metric_type.is_compound() {
            base_metric_name(&sample.name).to_string()
        } else {
            sample.name.clone()
        };

        self.families
            .entry(family_name)
            .or_insert_with_key(|key| MetricFamily::new(key.clone(), metric_type, String::new()))
            .samples
            .push(sample);
    }

    fn resolve_type(&self, name: &str) -> MetricType {
        if let Some(t) = self.types.get(name) {
            return *t;
        }

        match self.types.get(base_metric_name(name)) {
            Some(t) if t.is_compound() => *t,
            _ => MetricType::Unknown,
        }
    }

    fn finish(mut self) -> FamilyMap {
        for (key, family) in self.families.iter_mut() {
            if let Some(help) = self.helps.remove(key) {
                family.help = help;
            }
        }
        debug!("Parsed {} metric families", self.families.len());
        self.families
    }
}

/// Reason a sample line was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineError {
    #[error("missing metric name")]
    MissingName,
    #[error("malformed label block")]
    MalformedLabels,
    #[error("unable to parse value")]
    InvalidValue,
    #[error("unable to parse timestamp")]
    InvalidTimestamp,
}

/// Cursor over a single sample line.
struct SampleLine<'a> {
    rest: &'a str,
}

impl<'a> SampleLine<'a> {
    fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    fn parse(mut self) -> Result<Sample, LineError> {
        let name = self.take_token(is_name_char);
        if name.is_empty() {
            return Err(LineError::MissingName);
        }
        self.skip_blanks();

        let (label_names, label_values) = if self.rest.starts_with('{') {
            let labels = self.parse_label_block()?;
            self.skip_blanks();
            labels
        } else {
            (Vec::new(), Vec::new())
        };

        let value_token = self.take_token(|c| c != ' ' && c != '\t');
        let value = parse_float(value_token).ok_or(LineError::InvalidValue)?;
        self.skip_blanks();

        // The sample model carries no timestamp; it is validated and dropped.
        let timestamp = self.rest.trim_end_matches([' ', '\t']);
        if !timestamp.is_empty() && parse_float(timestamp).is_none() {
            return Err(LineError::InvalidTimestamp);
        }

        Ok(Sample::new(name, label_names, label_values, value))
    }

    fn take_token(&mut self, accept: impl Fn(char) -> bool) -> &'a str {
        let end = self
            .rest
            .char_indices()
            .find(|&(_, c)| !accept(c))
            .map_or(self.rest.len(), |(idx, _)| idx);
        let (token, rest) = self.rest.split_at(end);
        self.rest = rest;
        token
    }

    fn skip_blanks(&mut self) {
        self.rest = self.rest.trim_start_matches([' ', '\t']);
    }

    fn parse_label_block(&mut self) -> Result<(Vec<String>, Vec<String>), LineError> {
        let block_start = self.rest;
        self.rest = &self.rest[1..];

        let mut names = Vec::new();
        let mut values = Vec::new();

        loop {
            self.rest = self.rest.trim_start_matches([' ', '\t', ',']);
            if let Some(rest) = self.rest.strip_prefix('}') {
                self.rest = rest;
                return Ok((names, values));
            }

            let label_name = self.take_token(is_label_name_char);
            if label_name.is_empty() {
                return Err(LineError::MalformedLabels);
            }
            self.skip_blanks();
            let Some(rest) = self.rest.strip_prefix("=\"") else {
                return Err(LineError::MalformedLabels);
            };
            self.rest = rest;

            match index_end_of_value(self.rest) {
                Some(end) => {
                    names.push(unescape_token(label_name));
                    values.push(unescape_token(&self.rest[..end]));
                    self.rest = &self.rest[end + 1..];
                }
                None => {
                    // Unterminated value: keep what we have and resume after
                    // the last closing brace of the line.
                    warn!("Missing termination of value in label block: {}", block_start);
                    let close = block_start.rfind('}').ok_or(LineError::MalformedLabels)?;
                    self.rest = &block_start[close + 1..];
                    return Ok((names, values));
                }
            }
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '"'
}

fn is_label_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ':' || c == '_'
}

/// Finds the byte index of the first unescaped double quote.
fn index_end_of_value(buffer: &str) -> Option<usize> {
    let mut escaped = false;
    for (idx, c) in buffer.char_indices() {
        match c {
            '\\' => escaped = !escaped,
            '"' if !escaped => return Some(idx),
            _ => escaped = false,
        }
    }
    None
}

/// Parses a sample value or timestamp.
pub(crate) fn parse_float(token: &str) -> Option<f64> {
    match token {
        "NaN" | "Nan" => return Some(f64::NAN),
        "+Inf" => return Some(f64::INFINITY),
        "-Inf" => return Some(f64::NEG_INFINITY),
        "" => return None,
        _ => {}
    }

    // Restrict to decimal/exponent syntax; Rust's parser also accepts words like "inf".
    if !token
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '+' | '-' | 'e' | 'E'))
    {
        return None;
    }
    token.parse::<f64>().ok()
}

/// Unescapes a label value or name token.
fn unescape_token(s: &str) -> String {
    unescape(s, true)
}

/// Unescapes HELP text, where a double quote needs no escaping.
fn unescape_help(s: &str) -> String {
    unescape(s, false)
}

fn unescape(s: &str, quotes: bool) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('"') if quotes => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
