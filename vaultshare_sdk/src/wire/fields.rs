//! Flat key/value codec for STRUCTURED message bodies.
//!
//! One `key="value"` pair per line; no nesting. Values are UTF-8 with
//! backslash escapes for backslash, double quote and control
//! characters. Keys are restricted to `[A-Za-z0-9_-]+`.

use std::collections::BTreeMap;

pub type Fields = BTreeMap<String, String>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FieldError {
    #[error("invalid field key '{0}'")]
    Key(String),
    #[error("field line '{0}' is not of the form key=\"value\"")]
    Syntax(String),
    #[error("unterminated value for key '{0}'")]
    Unterminated(String),
    #[error("unknown escape sequence '\\{0}'")]
    Escape(char),
    #[error("dangling escape at end of value")]
    DanglingEscape,
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn escape_into(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
}

fn unescape(raw: &str) -> Result<String, FieldError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => return Err(FieldError::Escape(other)),
            None => return Err(FieldError::DanglingEscape),
        }
    }

    Ok(out)
}

pub fn encode(fields: &Fields) -> String {
    let mut out = String::new();
    for (key, value) in fields {
        debug_assert!(valid_key(key));
        out.push_str(key);
        out.push_str("=\"");
        escape_into(value, &mut out);
        out.push_str("\"\n");
    }
    out
}

pub fn decode(input: &str) -> Result<Fields, FieldError> {
    let mut fields = Fields::new();

    for line in input.lines() {
        if line.is_empty() {
            continue;
        }
        let (key, rest) = line
            .split_once("=\"")
            .ok_or_else(|| FieldError::Syntax(line.into()))?;
        if !valid_key(key) {
            return Err(FieldError::Key(key.into()));
        }

        // the value runs to the closing unescaped quote
        let raw = rest
            .strip_suffix('"')
            .filter(|raw| !ends_in_open_escape(raw))
            .ok_or_else(|| FieldError::Unterminated(key.into()))?;

        fields.insert(key.to_string(), unescape(raw)?);
    }

    Ok(fields)
}

fn ends_in_open_escape(raw: &str) -> bool {
    raw.bytes().rev().take_while(|&b| b == b'\\').count() % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(pairs: &[(&str, &str)]) {
        let fields: Fields = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(decode(&encode(&fields)).unwrap(), fields);
    }

    #[test]
    fn plain_values() {
        round_trip(&[("action", "init"), ("target", "report.txt"), ("size", "307200")]);
    }

    #[test]
    fn values_needing_escapes() {
        round_trip(&[
            ("a", "with \"quotes\""),
            ("b", "back\\slash"),
            ("c", "line\nbreak\tand tab"),
            ("d", ""),
            ("e", "trailing backslash\\"),
        ]);
    }

    #[test]
    fn empty_input_is_empty_map() {
        assert_eq!(decode("").unwrap(), Fields::new());
    }

    #[test]
    fn rejects_bad_keys() {
        assert_eq!(
            decode("bad key=\"x\"\n"),
            Err(FieldError::Key("bad key".into()))
        );
    }

    #[test]
    fn rejects_unterminated_value() {
        assert_eq!(
            decode("k=\"open\n"),
            Err(FieldError::Unterminated("k".into()))
        );
        // a quote hidden behind an escape does not terminate the value
        assert_eq!(
            decode("k=\"open\\\"\n"),
            Err(FieldError::Unterminated("k".into()))
        );
    }

    #[test]
    fn rejects_unknown_escape() {
        assert_eq!(decode("k=\"\\x\""), Err(FieldError::Escape('x')));
    }

    #[test]
    fn rejects_bare_line() {
        assert!(matches!(decode("not a field"), Err(FieldError::Syntax(_))));
    }
}
