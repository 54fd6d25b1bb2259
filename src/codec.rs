//! Embedding metadata inside SQL text.
//!
//! A tagged query is the original statement followed by a block comment that
//! carries a JSON object between two sentinels:
//!
//! ```text
//! select 1;  /* __META_START:{"cursor_id": "abc"}:META_END__ */
//! ```
//!
//! The comment is inert SQL, so the database runs the statement unchanged while
//! activity views such as `pg_stat_activity` expose the full text, tag included.
//!
//! `/` and `*` inside JSON strings are written as `\u002f` and `\u002a`, so no
//! key or value can open or close a SQL comment, and [`END`] can only appear
//! where the tag ends.

use std::io;

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::Value;

/// Opens the metadata comment.
pub const START: &str = "/* __META_START";

/// Closes the metadata comment.
pub const END: &str = "META_END__ */";

/// Decoded metadata: a JSON object with keys in wire order.
pub type Metadata = serde_json::Map<String, Value>;

/// Why a query could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The query carries no tag; it was issued by something else.
    #[error("query carries no metadata tag")]
    NotFound,

    /// The sentinels are present but the blob between them is not a JSON object.
    #[error("metadata tag is not a valid JSON object: {0}")]
    MalformedJson(#[source] serde_json::Error),
}

/// Append `metadata` to `query` as a metadata comment.
///
/// ```rust
/// use sea_orm_correlation::codec;
/// use serde_json::json;
///
/// let tagged = codec::encode("select 1;", &json!({"cursor_id": "abc"})).unwrap();
/// assert_eq!(tagged, r#"select 1;  /* __META_START:{"cursor_id": "abc"}:META_END__ */"#);
/// ```
pub fn encode<T>(query: &str, metadata: &T) -> Result<String, serde_json::Error>
where
    T: Serialize + ?Sized,
{
    let blob = to_json(metadata)?;
    Ok(format!("{query}  {START}:{blob}:{END}"))
}

/// Split a tagged query into its metadata and the query text before the tag.
///
/// The returned query has trailing whitespace removed.
pub fn decode(tagged: &str) -> Result<(Metadata, String), DecodeError> {
    let meta_start = tagged.find(START).ok_or(DecodeError::NotFound)?;
    let after_start = meta_start + START.len();
    let meta_end = tagged[after_start..]
        .find(END)
        .map(|offset| after_start + offset)
        .ok_or(DecodeError::NotFound)?;

    // Drop the ':' delimiters on either side of the blob.
    let mut inner = tagged[after_start..meta_end].chars();
    inner.next();
    inner.next_back();

    let metadata = serde_json::from_str(inner.as_str()).map_err(DecodeError::MalformedJson)?;
    let query = tagged[..meta_start].trim_end().to_owned();
    Ok((metadata, query))
}

fn to_json<T>(value: &T) -> Result<String, serde_json::Error>
where
    T: Serialize + ?Sized,
{
    let mut buf = Vec::with_capacity(128);
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    value.serialize(&mut ser)?;
    String::from_utf8(buf).map_err(<serde_json::Error as serde::ser::Error>::custom)
}

/// Single-line JSON with `", "` and `": "` separators and comment-safe strings.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut rest = fragment;
        while let Some(pos) = rest.find(['/', '*']) {
            writer.write_all(rest[..pos].as_bytes())?;
            let escaped: &[u8] = if rest.as_bytes()[pos] == b'/' {
                b"\\u002f"
            } else {
                b"\\u002a"
            };
            writer.write_all(escaped)?;
            rest = &rest[pos + 1..];
        }
        writer.write_all(rest.as_bytes())
    }

    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_map(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_encode_exact_wire_form() {
        let metadata = json!({"cursor_id": "abc", "context_type": "WEB"});
        let tagged = encode("select * from t;", &metadata).unwrap();
        assert_eq!(
            tagged,
            r#"select * from t;  /* __META_START:{"cursor_id": "abc", "context_type": "WEB"}:META_END__ */"#
        );

        let (decoded, query) = decode(&tagged).unwrap();
        assert_eq!(decoded, as_map(metadata));
        assert_eq!(query, "select * from t;");
    }

    #[test]
    fn test_round_trip_strips_trailing_whitespace() {
        let metadata = as_map(json!({
            "x": "x-val",
            "y": "y-val",
            "pid": 4242,
            "job_id": null,
            "ok": true,
        }));
        let query = "select col_x, col_y from bar where col_x > 10;  \n";

        let (decoded, clean) = decode(&encode(query, &metadata).unwrap()).unwrap();
        assert_eq!(decoded, metadata);
        assert_eq!(clean, "select col_x, col_y from bar where col_x > 10;");
    }

    #[test]
    fn test_decode_tolerates_key_order() {
        let tagged = r#"select 1;  /* __META_START:{"b": 2, "a": 1}:META_END__ */"#;
        let (decoded, _) = decode(tagged).unwrap();
        assert_eq!(decoded, as_map(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_nested_values_round_trip() {
        let metadata = json!({"outer": {"inner": [1, "two", null]}});
        let (decoded, _) = decode(&encode("select 1", &metadata).unwrap()).unwrap();
        assert_eq!(Value::Object(decoded), metadata);
    }

    #[test]
    fn test_clean_query_has_no_sentinels() {
        let tagged = encode("update t set x = 1", &json!({"k": "v"})).unwrap();
        let (_, clean) = decode(&tagged).unwrap();
        assert!(!clean.contains(START));
        assert!(!clean.contains(END));
    }

    #[test]
    fn test_comment_markers_in_values_are_escaped() {
        let request_id = "r*/ drop table users; /*";
        let metadata = json!({"web_request_id": request_id, "path": "/api/*"});
        let tagged = encode("select 1", &metadata).unwrap();

        assert_eq!(tagged.matches("*/").count(), 1);
        assert_eq!(tagged.matches("/*").count(), 1);
        assert!(tagged.ends_with(END));
        assert!(tagged.contains(r#""r\u002a\u002f drop table users; \u002f\u002a""#));

        let (decoded, query) = decode(&tagged).unwrap();
        assert_eq!(query, "select 1");
        assert_eq!(decoded["web_request_id"], request_id);
        assert_eq!(decoded["path"], "/api/*");
    }

    #[test]
    fn test_end_sentinel_in_value_stays_inside_tag() {
        let metadata = json!({"job_id": END});
        let (decoded, _) = decode(&encode("select 1", &metadata).unwrap()).unwrap();
        assert_eq!(decoded["job_id"], END);
    }

    #[test]
    fn test_untagged_query_not_found() {
        assert!(matches!(decode("select 1;"), Err(DecodeError::NotFound)));
        assert!(matches!(decode(""), Err(DecodeError::NotFound)));
    }

    #[test]
    fn test_missing_end_sentinel_not_found() {
        let truncated = r#"select 1;  /* __META_START:{"cursor_id": "ab"#;
        assert!(matches!(decode(truncated), Err(DecodeError::NotFound)));
    }

    #[test]
    fn test_end_before_start_not_found() {
        let tagged = "META_END__ */ select 1; /* __META_START:{}";
        assert!(matches!(decode(tagged), Err(DecodeError::NotFound)));
    }

    #[test]
    fn test_malformed_json() {
        let tagged = "select 1; /* __META_START:{not json}:META_END__ */";
        assert!(matches!(decode(tagged), Err(DecodeError::MalformedJson(_))));
    }

    #[test]
    fn test_empty_blob_is_malformed() {
        let tagged = "select 1; /* __META_START:META_END__ */";
        assert!(matches!(decode(tagged), Err(DecodeError::MalformedJson(_))));
    }

    #[test]
    fn test_non_object_blob_is_malformed() {
        let tagged = "select 1; /* __META_START:[1, 2]:META_END__ */";
        assert!(matches!(decode(tagged), Err(DecodeError::MalformedJson(_))));
    }
}
