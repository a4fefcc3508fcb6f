//! Cache key conventions.
//!
//! Keys of single entities embed the entity id. Keys of lists embed a hash of the list filter
//! and the pagination parameters, so distinct queries never share a key, and all lists of one
//! kind share a common prefix that can be invalidated at once.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// The key of a single entity, like `content_42`.
pub fn entity_key(kind: &str, id: impl fmt::Display) -> String {
    format!("{kind}_{id}")
}

/// The key of a page of a list of entities.
///
/// The filter is hashed in its canonical JSON form, so the order of fields in the filter does
/// not matter. A missing cursor denotes the first page.
pub fn list_key<F>(
    kind: &str,
    filter: &F,
    limit: usize,
    cursor: Option<&str>,
) -> Result<String, serde_json::Error>
where
    F: Serialize + ?Sized,
{
    let hash = filter_hash(filter)?;
    let cursor = cursor.unwrap_or("start");
    Ok(format!("{}{hash}_{limit}_{cursor}", list_prefix(kind)))
}

/// The prefix shared by the keys of all lists of `kind`.
pub fn list_prefix(kind: &str) -> String {
    format!("list_{kind}_")
}

fn filter_hash<F: Serialize + ?Sized>(filter: &F) -> Result<String, serde_json::Error> {
    // `Value` keeps object keys sorted, which makes this canonical.
    let canonical = serde_json::to_vec(&serde_json::to_value(filter)?)?;
    let digest = Sha256::digest(&canonical);
    Ok(hex::encode(&digest[..8]))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_entity_key() {
        assert_eq!(entity_key("content", 42), "content_42");
        assert_eq!(entity_key("user", "abc"), "user_abc");
    }

    #[test]
    fn test_list_key() {
        let key = list_key("content", &json!({"tag": "rust"}), 20, None).unwrap();
        let hash = key
            .strip_prefix("list_content_")
            .and_then(|rest| rest.strip_suffix("_20_start"))
            .unwrap();
        assert_eq!(hash.len(), 16);
        assert!(key.starts_with(&list_prefix("content")));

        let next = list_key("content", &json!({"tag": "rust"}), 20, Some("c2")).unwrap();
        assert_eq!(next, format!("list_content_{hash}_20_c2"));
    }

    #[test]
    fn test_list_key_is_canonical() {
        #[derive(Serialize)]
        struct Filter {
            tag: &'static str,
            author: u32,
        }

        let from_struct = list_key("content", &Filter { tag: "rust", author: 1 }, 10, None);
        let from_json = list_key("content", &json!({"author": 1, "tag": "rust"}), 10, None);
        let other = list_key("content", &json!({"author": 2, "tag": "rust"}), 10, None);

        let key = from_json.unwrap();
        assert_eq!(from_struct.unwrap(), key);
        assert_ne!(other.unwrap(), key);
    }
}
