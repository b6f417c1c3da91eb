//! Annotation templates
//!
//! Supported placeholders: `{{ $labels.<name> }}`, `{{ $value }}` and
//! `{{ $rule }}`. A label missing from the alert renders as an empty string;
//! any other `{{ ... }}` text is left untouched.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::data::Labels;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*\$(labels\.([a-zA-Z_][a-zA-Z0-9_]*)|value|rule)\s*\}\}")
            .expect("placeholder regex is valid")
    })
}

/// Render one template
pub fn render(template: &str, rule: &str, labels: &Labels, value: f64) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| match &caps[1] {
            "value" => format_value(value),
            "rule" => rule.to_string(),
            _ => caps
                .get(2)
                .and_then(|name| labels.get(name.as_str()))
                .unwrap_or("")
                .to_string(),
        })
        .into_owned()
}

/// Render every annotation template of a rule
pub fn render_all(
    templates: &BTreeMap<String, String>,
    rule: &str,
    labels: &Labels,
    value: f64,
) -> BTreeMap<String, String> {
    templates
        .iter()
        .map(|(k, t)| (k.clone(), render(t, rule, labels, value)))
        .collect()
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{:.4}", value)
            .trim_end_matches('0')
            .trim_end_matches('.')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_placeholders() {
        let labels = Labels::from_pairs([("job", "api"), ("instance", "10.0.0.1:9100")]);
        let out = render(
            "{{ $rule }}: {{$labels.job}} on {{ $labels.instance }} at {{ $value }}",
            "HighErrorRate",
            &labels,
            12.5,
        );
        assert_eq!(out, "HighErrorRate: api on 10.0.0.1:9100 at 12.5");
    }

    #[test]
    fn test_unknown_label_renders_empty() {
        let out = render("[{{ $labels.missing }}]", "r", &Labels::new(), 0.0);
        assert_eq!(out, "[]");
    }

    #[test]
    fn test_value_formatting() {
        assert_eq!(format_value(42.0), "42");
        assert_eq!(format_value(0.123456), "0.1235");
        assert_eq!(format_value(0.5), "0.5");
    }
}
