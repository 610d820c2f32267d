//! Text exposition format and its parser.
//!
//! The format is line oriented: `# HELP` and `# TYPE` comments per metric
//! name, then one value line per series with sorted `k="v"` tags and the
//! latest recorded value. Series that never recorded a point are skipped.
//! Tag values must not contain quotes or commas; nothing in the library
//! emits such tags.

use std::collections::{BTreeMap, HashMap};

use crate::errors::ServiceError;
use crate::metrics::{MetricKind, MetricsSnapshot};

/// Render a snapshot into the text exposition format.
pub fn to_text(snapshot: &MetricsSnapshot, descriptions: &BTreeMap<String, String>) -> String {
    let mut lines = Vec::new();
    let mut last_header: Option<(String, MetricKind)> = None;

    for series in &snapshot.series {
        let Some(latest) = series.latest else {
            continue;
        };

        let header = (series.name.clone(), series.kind);
        if last_header.as_ref() != Some(&header) {
            let help = descriptions
                .get(&series.name)
                .map(String::as_str)
                .unwrap_or(series.name.as_str());
            lines.push(format!("# HELP {} {}", series.name, help));
            lines.push(format!("# TYPE {} {}", series.name, series.kind));
            last_header = Some(header);
        }

        let mut line = series.name.clone();
        if !series.tags.is_empty() {
            let tags: Vec<String> = series
                .tags
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v))
                .collect();
            line.push('{');
            line.push_str(&tags.join(","));
            line.push('}');
        }
        line.push(' ');
        line.push_str(&latest.to_string());
        lines.push(line);
    }

    lines.join("\n")
}

/// One value line parsed back out of the text format.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSeries {
    pub name: String,
    pub kind: MetricKind,
    pub tags: BTreeMap<String, String>,
    pub value: f64,
}

/// Parse the text exposition format back into series identities.
pub fn parse_text(text: &str) -> Result<Vec<ParsedSeries>, ServiceError> {
    let mut kinds: HashMap<String, MetricKind> = HashMap::new();
    let mut parsed = Vec::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("# TYPE ") {
            let mut parts = rest.split_whitespace();
            let name = parts
                .next()
                .ok_or_else(|| ServiceError::validation("malformed # TYPE line"))?;
            let kind: MetricKind = parts
                .next()
                .ok_or_else(|| ServiceError::validation("malformed # TYPE line"))?
                .parse()
                .map_err(ServiceError::validation)?;
            kinds.insert(name.to_string(), kind);
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let (name, tags, value_str) = split_value_line(line)?;
        let kind = kinds.get(&name).copied().ok_or_else(|| {
            ServiceError::validation(format!("value line for '{}' without a # TYPE", name))
        })?;
        let value: f64 = value_str.parse().map_err(|_| {
            ServiceError::validation(format!("invalid value '{}' for '{}'", value_str, name))
        })?;

        parsed.push(ParsedSeries {
            name,
            kind,
            tags,
            value,
        });
    }

    Ok(parsed)
}

fn split_value_line(
    line: &str,
) -> Result<(String, BTreeMap<String, String>, String), ServiceError> {
    if let Some(open) = line.find('{') {
        let close = line
            .rfind('}')
            .ok_or_else(|| ServiceError::validation(format!("unclosed tag set: {}", line)))?;
        let name = line[..open].to_string();
        let mut tags = BTreeMap::new();
        let tag_body = &line[open + 1..close];
        if !tag_body.is_empty() {
            for pair in tag_body.split(',') {
                let eq = pair.find('=').ok_or_else(|| {
                    ServiceError::validation(format!("malformed tag '{}'", pair))
                })?;
                let key = pair[..eq].trim().to_string();
                let value = pair[eq + 1..].trim().trim_matches('"').to_string();
                tags.insert(key, value);
            }
        }
        let value_str = line[close + 1..].trim().to_string();
        Ok((name, tags, value_str))
    } else {
        let mut parts = line.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| ServiceError::validation("empty value line"))?
            .to_string();
        let value_str = parts
            .next()
            .ok_or_else(|| ServiceError::validation(format!("value line without value: {}", line)))?
            .to_string();
        Ok((name, BTreeMap::new(), value_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;

    #[test]
    fn test_export_parse_round_trip() {
        let registry = MetricsRegistry::new();
        registry.describe("orders_total", "Total orders placed");
        registry
            .counter("orders_total", &[("service", "trade")])
            .add(7.0);
        registry.gauge("connections", &[]).set(3.0);
        registry.histogram("latency_ms", &[("service", "trade")]).observe(12.5);

        let text = registry.export_text();
        let parsed = parse_text(&text).unwrap();
        assert_eq!(parsed.len(), 3);

        let snapshot = registry.snapshot();
        for series in snapshot.series.iter().filter(|s| s.latest.is_some()) {
            let matching = parsed
                .iter()
                .find(|p| p.name == series.name && p.tags == series.tags)
                .unwrap_or_else(|| panic!("series {} missing from parse", series.name));
            assert_eq!(matching.kind, series.kind);
            assert_eq!(Some(matching.value), series.latest);
        }
    }

    #[test]
    fn test_export_skips_empty_series() {
        let registry = MetricsRegistry::new();
        let _never_used = registry.counter("unused_total", &[]);
        registry.counter("used_total", &[]).increment();

        let text = registry.export_text();
        assert!(!text.contains("unused_total"));
        assert!(text.contains("used_total 1"));
    }

    #[test]
    fn test_export_contains_help_and_type() {
        let registry = MetricsRegistry::new();
        registry.describe("hits_total", "Request count");
        registry.counter("hits_total", &[]).increment();

        let text = registry.export_text();
        assert!(text.contains("# HELP hits_total Request count"));
        assert!(text.contains("# TYPE hits_total counter"));
    }

    #[test]
    fn test_tags_render_sorted() {
        let registry = MetricsRegistry::new();
        registry
            .counter("tagged_total", &[("zone", "a"), ("app", "x")])
            .increment();

        let text = registry.export_text();
        assert!(text.contains("tagged_total{app=\"x\",zone=\"a\"} 1"));
    }

    #[test]
    fn test_parse_rejects_value_without_type() {
        let err = parse_text("lonely_metric 4").unwrap_err();
        assert_eq!(err.category, crate::errors::ErrorCategory::Validation);
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        let text = "# TYPE odd summary\nodd 1";
        assert!(parse_text(text).is_err());
    }
}
