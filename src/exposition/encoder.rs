//! Serializer for the Prometheus text exposition format 0.0.4.

use std::fmt::Write;

use crate::model::{FamilyMap, MetricFamily, Sample};

/// Encodes all families as a text 0.0.4 document, sorted by family name.
pub fn encode_text(families: &FamilyMap) -> String {
    let mut sorted: Vec<&MetricFamily> = families.values().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut out = String::new();
    for family in sorted {
        encode_family(&mut out, family);
    }
    out
}

fn encode_family(out: &mut String, family: &MetricFamily) {
    // Writing into a String cannot fail.
    let _ = writeln!(out, "# HELP {} {}", family.name, escape_help(&family.help));
    let _ = writeln!(
        out,
        "# TYPE {} {}",
        family.name,
        family.metric_type.text004_word()
    );
    for sample in &family.samples {
        encode_sample(out, sample);
    }
}

fn encode_sample(out: &mut String, sample: &Sample) {
    out.push_str(&sample.name);
    if !sample.label_names.is_empty() {
        out.push('{');
        for (idx, (name, value)) in sample
            .label_names
            .iter()
            .zip(&sample.label_values)
            .enumerate()
        {
            if idx > 0 {
                out.push(',');
            }
            let _ = write!(out, "{}=\"{}\"", name, escape_label_value(value));
        }
        out.push('}');
    }
    out.push(' ');
    out.push_str(&format_value(sample.value));
    out.push('\n');
}

/// Formats a sample value the way Prometheus client libraries do.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
