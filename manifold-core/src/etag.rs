//! Weak ETag generation and `If-Match` / `If-None-Match` evaluation.
//!
//! ETags are content fingerprints over the JSON serialization of a record:
//! `W/"<first 16 hex chars of md5>"`. Comparisons ignore the weak prefix
//! and quoting, per the usual weak-comparison rules.

use serde::Serialize;

use crate::error::RpcError;

/// Compute the weak ETag for a serializable record.
pub fn weak_etag<T: Serialize>(record: &T) -> Result<String, RpcError> {
    let bytes = serde_json::to_vec(record)?;
    let digest = md5::compute(&bytes);
    let hex = format!("{digest:x}");
    Ok(format!("W/\"{}\"", &hex[..16]))
}

fn normalize(tag: &str) -> &str {
    tag.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
}

/// Evaluate an `If-Match` header against the current ETag.
///
/// `*` matches any existing representation; otherwise the header is a
/// comma-separated list and any entry equal to the current tag passes.
pub fn if_match(header: &str, current: &str) -> bool {
    let header = header.trim();
    if header == "*" {
        return true;
    }
    let current = normalize(current);
    header.split(',').any(|tag| normalize(tag) == current)
}

/// Evaluate an `If-None-Match` header against the current ETag.
///
/// Returns `true` when the client's cached representation is still fresh
/// (i.e. the caller should answer 304). `*` always reports fresh for an
/// existing resource.
pub fn if_none_match(header: &str, current: &str) -> bool {
    let header = header.trim();
    if header == "*" {
        return true;
    }
    let current = normalize(current);
    header.split(',').any(|tag| normalize(tag) == current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_etag_shape() {
        let tag = weak_etag(&serde_json::json!({ "id": 1, "name": "Alice" })).unwrap();
        assert!(tag.starts_with("W/\""));
        assert!(tag.ends_with('"'));
        // W/" + 16 hex + "
        assert_eq!(tag.len(), 3 + 16 + 1);
    }

    #[test]
    fn etag_is_deterministic_and_content_sensitive() {
        let a = weak_etag(&serde_json::json!({ "id": 1 })).unwrap();
        let b = weak_etag(&serde_json::json!({ "id": 1 })).unwrap();
        let c = weak_etag(&serde_json::json!({ "id": 2 })).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn if_match_round_trip() {
        let tag = weak_etag(&serde_json::json!({ "v": 1 })).unwrap();
        assert!(if_match(&tag, &tag));
        assert!(if_match("*", &tag));
    }

    #[test]
    fn if_match_list_and_normalization() {
        let tag = weak_etag(&serde_json::json!({ "v": 1 })).unwrap();
        let bare = tag.trim_start_matches("W/").trim_matches('"');
        assert!(if_match(&format!("\"other\", {bare}"), &tag));
        assert!(if_match(&format!("W/\"{bare}\""), &tag));
        assert!(!if_match("\"other\"", &tag));
    }

    #[test]
    fn if_none_match_semantics() {
        let tag = weak_etag(&serde_json::json!({ "v": 1 })).unwrap();
        // Matching tag: client copy is fresh.
        assert!(if_none_match(&tag, &tag));
        // Star: always fresh for an existing resource.
        assert!(if_none_match("*", &tag));
        // Different tag: stale, caller should re-send the body.
        assert!(!if_none_match("\"deadbeefdeadbeef\"", &tag));
    }
}
