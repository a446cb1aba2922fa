//! Stable pretty-printing of event payloads with highlight ranges.
//!
//! Object keys are emitted in sorted order. Arrays whose members render on a
//! single line within [`INLINE_WIDTH`] columns are collapsed to `[a, b, c]`.
//! Every key, string, number and keyword gets a [`Highlight`] whose byte
//! offsets point into the returned text.

use meshbar_core::{Highlight, HighlightClass};
use serde_json::Value;

/// Widest line (including indentation) a collapsed array may produce.
pub const INLINE_WIDTH: usize = 80;

const INDENT: &str = "  ";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pretty {
    pub text: String,
    pub highlights: Vec<Highlight>,
}

pub fn pretty_print(value: &Value) -> Pretty {
    let mut writer = Writer::default();
    writer.value(value, 0);
    Pretty {
        text: writer.out,
        highlights: writer.highlights,
    }
}

#[derive(Default)]
struct Writer {
    out: String,
    highlights: Vec<Highlight>,
}

impl Writer {
    fn value(&mut self, value: &Value, depth: usize) {
        match value {
            Value::Object(map) if !map.is_empty() => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                self.out.push_str("{\n");
                for (i, key) in keys.iter().enumerate() {
                    self.indent(depth + 1);
                    self.key(key);
                    self.value(&map[key.as_str()], depth + 1);
                    if i + 1 < keys.len() {
                        self.out.push(',');
                    }
                    self.out.push('\n');
                }
                self.indent(depth);
                self.out.push('}');
            }
            Value::Array(items) if !items.is_empty() => {
                if let Some(inline) = self.inline_array(items) {
                    self.append(inline);
                    return;
                }
                self.out.push_str("[\n");
                for (i, item) in items.iter().enumerate() {
                    self.indent(depth + 1);
                    self.value(item, depth + 1);
                    if i + 1 < items.len() {
                        self.out.push(',');
                    }
                    self.out.push('\n');
                }
                self.indent(depth);
                self.out.push(']');
            }
            other => self.inline(other),
        }
    }

    /// Single-line rendering, used for scalars and collapsed containers.
    fn inline(&mut self, value: &Value) {
        match value {
            Value::Null => self.token("null", HighlightClass::Keyword),
            Value::Bool(b) => self.token(if *b { "true" } else { "false" }, HighlightClass::Keyword),
            Value::Number(n) => self.token(&n.to_string(), HighlightClass::Number),
            Value::String(s) => self.token(&quote(s), HighlightClass::String),
            Value::Array(items) => {
                self.out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.inline(item);
                }
                self.out.push(']');
            }
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                self.out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    self.key(key);
                    self.inline(&map[key.as_str()]);
                }
                self.out.push('}');
            }
        }
    }

    fn inline_array(&self, items: &[Value]) -> Option<Writer> {
        let mut scratch = Writer::default();
        scratch.inline(&Value::Array(items.to_vec()));
        let column = self.current_column();
        // `,` after the closing bracket when followed by a sibling.
        if column + scratch.out.len() + 1 > INLINE_WIDTH {
            return None;
        }
        Some(scratch)
    }

    fn append(&mut self, other: Writer) {
        let base = self.out.len();
        self.out.push_str(&other.out);
        self.highlights
            .extend(other.highlights.into_iter().map(|mut h| {
                h.start += base;
                h
            }));
    }

    fn key(&mut self, key: &str) {
        let start = self.out.len();
        let quoted = quote(key);
        self.out.push_str(&quoted);
        self.highlights.push(Highlight {
            start,
            length: quoted.len(),
            class: HighlightClass::Key,
            emphasis: true,
        });
        self.out.push_str(": ");
    }

    fn token(&mut self, text: &str, class: HighlightClass) {
        let start = self.out.len();
        self.out.push_str(text);
        self.highlights.push(Highlight {
            start,
            length: text.len(),
            class,
            emphasis: false,
        });
    }

    fn indent(&mut self, depth: usize) {
        for _ in 0..depth {
            self.out.push_str(INDENT);
        }
    }

    fn current_column(&self) -> usize {
        match self.out.rfind('\n') {
            Some(newline) => self.out.len() - newline - 1,
            None => self.out.len(),
        }
    }
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_indented() {
        let pretty = pretty_print(&json!({"zeta": 1, "alpha": {"b": true, "a": null}}));
        assert_eq!(
            pretty.text,
            "{\n  \"alpha\": {\n    \"a\": null,\n    \"b\": true\n  },\n  \"zeta\": 1\n}"
        );
    }

    #[test]
    fn short_arrays_collapse_to_one_line() {
        let pretty = pretty_print(&json!({"ips": ["10.0.0.1", "10.0.0.2"]}));
        assert_eq!(pretty.text, "{\n  \"ips\": [\"10.0.0.1\", \"10.0.0.2\"]\n}");
    }

    #[test]
    fn long_arrays_stay_expanded() {
        let long: Vec<String> = (0..20).map(|i| format!("peer-{i:04}")).collect();
        let pretty = pretty_print(&json!({ "peers": long }));
        assert!(pretty.text.contains("[\n    \"peer-0000\",\n"));
    }

    #[test]
    fn highlights_cover_their_tokens() {
        let pretty = pretty_print(&json!({"id": 42, "name": "node", "ok": false}));
        let covered: Vec<(&str, HighlightClass)> = pretty
            .highlights
            .iter()
            .map(|h| (&pretty.text[h.start..h.start + h.length], h.class))
            .collect();
        assert_eq!(
            covered,
            vec![
                ("\"id\"", HighlightClass::Key),
                ("42", HighlightClass::Number),
                ("\"name\"", HighlightClass::Key),
                ("\"node\"", HighlightClass::String),
                ("\"ok\"", HighlightClass::Key),
                ("false", HighlightClass::Keyword),
            ]
        );
        assert!(pretty
            .highlights
            .iter()
            .all(|h| h.emphasis == (h.class == HighlightClass::Key)));
    }

    #[test]
    fn collapsed_array_highlights_are_shifted() {
        let pretty = pretty_print(&json!({"v": [1, "x"]}));
        let strings: Vec<&str> = pretty
            .highlights
            .iter()
            .filter(|h| h.class != HighlightClass::Key)
            .map(|h| &pretty.text[h.start..h.start + h.length])
            .collect();
        assert_eq!(strings, vec!["1", "\"x\""]);
    }

    #[test]
    fn scalars_and_empty_containers() {
        assert_eq!(pretty_print(&json!(7)).text, "7");
        assert_eq!(pretty_print(&json!({})).text, "{}");
        assert_eq!(pretty_print(&json!([])).text, "[]");
    }
}
