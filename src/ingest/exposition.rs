//! Text exposition format parser
//!
//! Parses the line-oriented format served by metrics endpoints:
//!
//! ```text
//! # HELP http_requests_total Total requests
//! # TYPE http_requests_total counter
//! http_requests_total{method="get",code="200"} 1027 1395066363000
//! ```
//!
//! Comment lines are skipped. Samples without a timestamp take the
//! caller-supplied default.

use crate::data::{is_valid_metric_name, Labels, MetricSample};

/// Parse a full exposition payload. Any malformed line fails the payload.
pub fn parse_exposition(text: &str, default_timestamp: i64) -> Result<Vec<MetricSample>, ParseError> {
    let mut samples = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let sample = parse_line(line, default_timestamp).map_err(|reason| ParseError {
            line: idx + 1,
            reason,
        })?;
        samples.push(sample);
    }

    Ok(samples)
}

fn parse_line(line: &str, default_timestamp: i64) -> Result<MetricSample, String> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .ok_or_else(|| "missing value".to_string())?;
    let name = &line[..name_end];
    if !is_valid_metric_name(name) {
        return Err(format!("invalid metric name '{}'", name));
    }

    let mut rest = &line[name_end..];
    let labels = if rest.starts_with('{') {
        let (labels, consumed) = parse_labels(rest)?;
        rest = &rest[consumed..];
        labels
    } else {
        Labels::new()
    };

    let mut fields = rest.split_whitespace();
    let value = fields
        .next()
        .ok_or_else(|| "missing value".to_string())
        .and_then(parse_value)?;
    let timestamp = match fields.next() {
        Some(ts) => ts
            .parse::<i64>()
            .map_err(|_| format!("invalid timestamp '{}'", ts))?,
        None => default_timestamp,
    };
    if let Some(extra) = fields.next() {
        return Err(format!("unexpected trailing token '{}'", extra));
    }

    Ok(MetricSample::new(name, labels, value, timestamp))
}

/// Parse `{a="b",c="d"}` at the start of `input`. Returns the labels and the
/// number of bytes consumed.
fn parse_labels(input: &str) -> Result<(Labels, usize), String> {
    let bytes = input.as_bytes();
    let mut labels = Labels::new();
    let mut pos = 1;

    loop {
        while pos < bytes.len() && (bytes[pos] == b' ' || bytes[pos] == b',') {
            pos += 1;
        }
        if pos >= bytes.len() {
            return Err("unterminated label set".to_string());
        }
        if bytes[pos] == b'}' {
            return Ok((labels, pos + 1));
        }

        let name_start = pos;
        while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
            pos += 1;
        }
        let name = &input[name_start..pos];
        if name.is_empty() || name.as_bytes()[0].is_ascii_digit() {
            return Err(format!("invalid label name at offset {}", name_start));
        }

        if bytes.get(pos) != Some(&b'=') || bytes.get(pos + 1) != Some(&b'"') {
            return Err(format!("expected =\" after label '{}'", name));
        }
        pos += 2;

        let mut value = String::new();
        loop {
            match bytes.get(pos) {
                None => return Err(format!("unterminated value for label '{}'", name)),
                Some(b'"') => {
                    pos += 1;
                    break;
                }
                Some(b'\\') => {
                    match bytes.get(pos + 1) {
                        Some(b'n') => value.push('\n'),
                        Some(b'\\') => value.push('\\'),
                        Some(b'"') => value.push('"'),
                        _ => return Err(format!("invalid escape in label '{}'", name)),
                    }
                    pos += 2;
                }
                Some(_) => {
                    // Copy one full UTF-8 character
                    let ch = input[pos..]
                        .chars()
                        .next()
                        .ok_or_else(|| "invalid utf-8".to_string())?;
                    value.push(ch);
                    pos += ch.len_utf8();
                }
            }
        }

        labels.insert(name, value);
    }
}

fn parse_value(token: &str) -> Result<f64, String> {
    match token {
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        "NaN" => Ok(f64::NAN),
        _ => token
            .parse::<f64>()
            .map_err(|_| format!("invalid value '{}'", token)),
    }
}

/// Render samples back into the exposition format
pub fn render_exposition(samples: &[MetricSample]) -> String {
    let mut out = String::new();
    for sample in samples {
        out.push_str(&sample.name);
        if !sample.labels.is_empty() {
            out.push('{');
            for (i, (k, v)) in sample.labels.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(k);
                out.push_str("=\"");
                out.push_str(&escape_label_value(v));
                out.push('"');
            }
            out.push('}');
        }
        out.push(' ');
        out.push_str(&format_value(sample.value));
        out.push('\n');
    }
    out
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
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

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Exposition parse error on line {line}: {reason}")]
pub struct ParseError {
    pub line: usize,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typical_payload() {
        let text = r#"
# HELP http_requests_total The total number of HTTP requests.
# TYPE http_requests_total counter
http_requests_total{method="post",code="200"} 1027 1395066363000
http_requests_total{method="post",code="400"}    3 1395066363000
process_open_fds 42
"#;
        let samples = parse_exposition(text, 7).unwrap();
        assert_eq!(samples.len(), 3);

        assert_eq!(samples[0].name, "http_requests_total");
        assert_eq!(samples[0].labels.get("code"), Some("200"));
        assert_eq!(samples[0].value, 1027.0);
        assert_eq!(samples[0].timestamp, 1395066363000);

        assert_eq!(samples[2].name, "process_open_fds");
        assert!(samples[2].labels.is_empty());
        assert_eq!(samples[2].timestamp, 7);
    }

    #[test]
    fn test_parse_escapes_and_special_values() {
        let text = "msg{text=\"a \\\"quoted\\\" line\\nnext\",path=\"C:\\\\tmp\"} +Inf\nratio NaN\n";
        let samples = parse_exposition(text, 0).unwrap();
        assert_eq!(samples[0].labels.get("text"), Some("a \"quoted\" line\nnext"));
        assert_eq!(samples[0].labels.get("path"), Some("C:\\tmp"));
        assert!(samples[0].value.is_infinite());
        assert!(samples[1].value.is_nan());
    }

    #[test]
    fn test_parse_reports_line_number() {
        let text = "ok_metric 1\nbroken{job=\"api\" 1\n";
        let err = parse_exposition(text, 0).unwrap_err();
        assert_eq!(err.line, 2);

        let err = parse_exposition("value_missing\n", 0).unwrap_err();
        assert_eq!(err.line, 1);

        assert!(parse_exposition("m 1 2 3\n", 0).is_err());
        assert!(parse_exposition("m abc\n", 0).is_err());
    }

    #[test]
    fn test_render_parses_back() {
        let samples = vec![MetricSample::new(
            "klaxon_notifications_failed_total",
            Labels::from_pairs([("receiver", "pager \"primary\"")]),
            3.0,
            0,
        )];
        let text = render_exposition(&samples);
        let parsed = parse_exposition(&text, 0).unwrap();
        assert_eq!(parsed, samples);
    }
}
