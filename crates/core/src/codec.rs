//! Canonical JSON text for messages.
//!
//! Every producer of the wire format writes the same bytes for the same
//! message, so payloads and golden files compare equal:
//!
//! - keys sorted (the `serde_json` map is ordered),
//! - compact form separates items with `", "` and keys with `": "`,
//! - indented form puts one item per line with no trailing spaces,
//! - non-ASCII text is written as UTF-8, not escaped.

use std::io;

use serde::Serialize;
use serde_json::Value;
use serde_json::ser::{Formatter, Serializer};

/// Formatter for the wire format's separators and indentation.
#[derive(Debug, Clone)]
pub struct CanonicalFormatter {
    indent: Option<Vec<u8>>,
    depth: usize,
    has_value: bool,
}

impl CanonicalFormatter {
    /// Single-line output: `{"a": 1, "b": [1, 2]}`.
    pub fn compact() -> Self {
        Self {
            indent: None,
            depth: 0,
            has_value: false,
        }
    }

    /// Multi-line output indented by `width` spaces per level.
    pub fn indented(width: usize) -> Self {
        Self {
            indent: Some(vec![b' '; width]),
            depth: 0,
            has_value: false,
        }
    }

    fn write_newline<W: ?Sized + io::Write>(&self, writer: &mut W) -> io::Result<()> {
        if let Some(indent) = &self.indent {
            writer.write_all(b"\n")?;
            for _ in 0..self.depth {
                writer.write_all(indent)?;
            }
        }
        Ok(())
    }

    fn write_separator<W: ?Sized + io::Write>(&self, writer: &mut W, first: bool) -> io::Result<()> {
        if !first {
            let separator: &[u8] = if self.indent.is_some() { b"," } else { b", " };
            writer.write_all(separator)?;
        }
        self.write_newline(writer)
    }

    fn open<W: ?Sized + io::Write>(&mut self, writer: &mut W, bracket: &[u8]) -> io::Result<()> {
        self.depth += 1;
        self.has_value = false;
        writer.write_all(bracket)
    }

    fn close<W: ?Sized + io::Write>(&mut self, writer: &mut W, bracket: &[u8]) -> io::Result<()> {
        self.depth -= 1;
        if self.has_value {
            self.write_newline(writer)?;
        }
        writer.write_all(bracket)
    }
}

impl Formatter for CanonicalFormatter {
    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.open(writer, b"[")
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.close(writer, b"]")
    }

    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.write_separator(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.open(writer, b"{")
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.close(writer, b"}")
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.write_separator(writer, first)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }
}

/// Renders `value` as canonical JSON text.
///
/// `indent` of `None` gives the single-line form.
pub fn to_canonical_string(value: &Value, indent: Option<usize>) -> serde_json::Result<String> {
    let formatter = match indent {
        Some(width) => CanonicalFormatter::indented(width),
        None => CanonicalFormatter::compact(),
    };
    let mut buf = Vec::with_capacity(128);
    let mut serializer = Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    // serde_json only ever writes valid UTF-8
    String::from_utf8(buf).map_err(|e| serde::ser::Error::custom(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compact_uses_spaced_separators() {
        let value = json!({"b": [1, 2], "a": "x", "c": {}});
        assert_eq!(
            to_canonical_string(&value, None).unwrap(),
            r#"{"a": "x", "b": [1, 2], "c": {}}"#
        );
    }

    #[test]
    fn nested_hierarchical_shape() {
        let value = json!({"source": {"ip": "1.2.3.4"}, "__type": "Event"});
        assert_eq!(
            to_canonical_string(&value, None).unwrap(),
            r#"{"__type": "Event", "source": {"ip": "1.2.3.4"}}"#
        );
    }

    #[test]
    fn indented_has_one_item_per_line() {
        let value = json!({"a": [1, {"b": null}], "c": [], "d": 1.5});
        let expected = "{\n  \"a\": [\n    1,\n    {\n      \"b\": null\n    }\n  ],\n  \"c\": [],\n  \"d\": 1.5\n}";
        assert_eq!(to_canonical_string(&value, Some(2)).unwrap(), expected);
    }

    #[test]
    fn unicode_is_not_escaped() {
        let value = json!({"t": "bücher\n"});
        assert_eq!(
            to_canonical_string(&value, None).unwrap(),
            "{\"t\": \"bücher\\n\"}"
        );
    }
}
