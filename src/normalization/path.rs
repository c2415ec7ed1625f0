//! Field-path resolution over JSON payloads.
//!
//! Paths use dot segments for object keys and brackets for arrays:
//! `total_tax_money.amount`, `checks[0].totalAmount`, `line_items[].taxes`.
//! A bare `[]` maps the rest of the path over every element. Missing intermediate
//! values resolve to nothing rather than an error.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    Each,
}

fn parse(path: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();

    for part in path.split('.').filter(|part| !part.is_empty()) {
        let (key, mut rest) = match part.find('[') {
            Some(idx) => part.split_at(idx),
            None => (part, ""),
        };
        if !key.is_empty() {
            segments.push(Segment::Key(key.to_string()));
        }

        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let inner = &stripped[..close];
            if inner.is_empty() {
                segments.push(Segment::Each);
            } else {
                segments.push(Segment::Index(inner.parse().ok()?));
            }
            rest = &stripped[close + 1..];
        }

        if !rest.is_empty() {
            return None;
        }
    }

    Some(segments)
}

/// Resolves a path to a single value. `[]` segments select the first element that
/// yields a value.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse(path)?;
    let mut found = Vec::new();
    walk(value, &segments, &mut found);
    found.into_iter().find(|value| !value.is_null())
}

/// Resolves a path to every value it reaches, flattening a terminal array so that
/// `tax_lines` and `line_items[].taxes` both yield individual entries.
pub fn collect_path<'a>(value: &'a Value, path: &str) -> Vec<&'a Value> {
    let Some(segments) = parse(path) else {
        return Vec::new();
    };
    let mut found = Vec::new();
    walk(value, &segments, &mut found);

    found
        .into_iter()
        .flat_map(|value| match value {
            Value::Array(items) => items.iter().collect::<Vec<_>>(),
            Value::Null => Vec::new(),
            other => vec![other],
        })
        .collect()
}

fn walk<'a>(value: &'a Value, segments: &[Segment], out: &mut Vec<&'a Value>) {
    let Some((head, tail)) = segments.split_first() else {
        out.push(value);
        return;
    };

    match head {
        Segment::Key(key) => {
            if let Some(next) = value.as_object().and_then(|map| map.get(key)) {
                walk(next, tail, out);
            }
        }
        Segment::Index(idx) => {
            if let Some(next) = value.as_array().and_then(|items| items.get(*idx)) {
                walk(next, tail, out);
            }
        }
        Segment::Each => {
            if let Some(items) = value.as_array() {
                for item in items {
                    walk(item, tail, out);
                }
            }
        }
    }
}
