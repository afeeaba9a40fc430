//! Namespace key index
//!
//! Emulates `"namespace:*"` enumeration on backends that only offer
//! exact-key lookup. For every indexable key (`namespace:identifier`) the
//! side table at `index:keys:<namespace>` holds the set of full keys that
//! are currently present.
//!
//! The side table is maintained next to the primary write: inside the same
//! native batch when the backend has one, immediately after it otherwise.
//! No locking is added here, so concurrent `set`/`find_keys` calls are only
//! as isolated as the backend's own batch primitive. A failure between the
//! primary write and its index write (non-batch backends) leaves the index
//! drifted; it is not repaired.

use futures::future::try_join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::adapter::{Adapter, BatchEntry, IndexStrategy};
use crate::bulk::BulkOperation;
use crate::error::{Result, StoreError};

/// Reserved key prefix of the side table
pub const INDEX_PREFIX: &str = "index:keys:";

/// Universal sub-key exclusion accepted by [`PatternQuery`]
pub const EXCLUDE_SUBKEYS: &str = "*:*:*";

static PATTERN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:*]+):\*$").expect("pattern grammar regex"));

/// Split an indexable key into `(namespace, identifier)`.
///
/// The first colon is the separator; both sides must be non-empty.
pub fn parse_indexable(key: &str) -> Option<(&str, &str)> {
    let (namespace, identifier) = key.split_once(':')?;
    if namespace.is_empty() || identifier.is_empty() {
        return None;
    }
    Some((namespace, identifier))
}

/// Side table key for a namespace
pub fn index_key(namespace: &str) -> String {
    format!("{}{}", INDEX_PREFIX, namespace)
}

/// Reject keys the facade must never hand to a backend
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key must not be empty".to_string()));
    }
    if key.starts_with(INDEX_PREFIX) {
        return Err(StoreError::InvalidKey(format!(
            "'{}' uses the reserved prefix '{}'",
            key, INDEX_PREFIX
        )));
    }
    Ok(())
}

/// A validated `find_keys` request
#[derive(Debug, Clone)]
pub struct PatternQuery {
    namespace: String,
    exclude: Option<Regex>,
}

impl PatternQuery {
    /// Parse `pattern` and the optional `exclude` pattern.
    ///
    /// `pattern` must be exactly `"<namespace>:*"`. `exclude` must be
    /// `"*:*:*"`, `"<namespace>:*"` or `"<namespace>:*:*"`. Anything else is
    /// rejected rather than approximated.
    pub fn parse(pattern: &str, exclude: Option<&str>) -> Result<Self> {
        let captures = PATTERN_RE.captures(pattern).ok_or_else(|| {
            StoreError::UnsupportedPattern(format!(
                "'{}' (only patterns like 'namespace:*' are supported)",
                pattern
            ))
        })?;
        let namespace = captures[1].to_string();

        let exclude = match exclude {
            None => None,
            Some(glob) => {
                let same_namespace = format!("{}:*", namespace);
                let same_namespace_subkeys = format!("{}:*:*", namespace);
                if glob != EXCLUDE_SUBKEYS && glob != same_namespace && glob != same_namespace_subkeys
                {
                    return Err(StoreError::UnsupportedPattern(format!(
                        "exclude pattern '{}' (expected '{}', '{}' or '{}')",
                        glob, EXCLUDE_SUBKEYS, same_namespace, same_namespace_subkeys
                    )));
                }
                Some(glob_to_regex(glob)?)
            }
        };

        Ok(Self { namespace, exclude })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// True if `key` belongs to the namespace and is not excluded
    pub fn matches(&self, key: &str) -> bool {
        match parse_indexable(key) {
            Some((namespace, _)) if namespace == self.namespace => {
                !self.exclude.as_ref().is_some_and(|re| re.is_match(key))
            }
            _ => false,
        }
    }
}

/// Compile a `*` glob into an anchored regex; `*` spans any characters
fn glob_to_regex(glob: &str) -> Result<Regex> {
    let body = glob
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body))
        .map_err(|e| StoreError::UnsupportedPattern(format!("'{}': {}", glob, e)))
}

/// Current members of a namespace
pub async fn load_members(adapter: &dyn Adapter, namespace: &str) -> Result<BTreeSet<String>> {
    match adapter.capabilities().index {
        IndexStrategy::NativeScan => {
            let prefix = format!("{}:", namespace);
            let keys = adapter.scan_prefix(&prefix).await?;
            Ok(keys
                .into_iter()
                .filter(|k| parse_indexable(k).is_some_and(|(ns, _)| ns == namespace))
                .collect())
        }
        IndexStrategy::NativeSet => {
            let members = adapter.set_members(&index_key(namespace)).await?;
            Ok(members.into_iter().collect())
        }
        IndexStrategy::SerializedList => match adapter.get(&index_key(namespace)).await? {
            Some(bytes) => serde_json::from_slice::<Vec<String>>(&bytes)
                .map(|list| list.into_iter().collect())
                .map_err(|e| {
                    StoreError::Deserialization(format!(
                        "Corrupt index entry for namespace '{}': {}",
                        namespace, e
                    ))
                }),
            None => Ok(BTreeSet::new()),
        },
    }
}

/// Resolve a pattern query against the backend
pub async fn find_keys(
    adapter: &dyn Adapter,
    pattern: &str,
    exclude: Option<&str>,
) -> Result<BTreeSet<String>> {
    let query = PatternQuery::parse(pattern, exclude)?;
    let members = load_members(adapter, query.namespace()).await?;

    let keys: BTreeSet<String> = members.into_iter().filter(|k| query.matches(k)).collect();
    debug!(
        "find_keys {} (exclude {:?}) -> {} keys",
        pattern,
        exclude,
        keys.len()
    );
    Ok(keys)
}

/// Index mutations required by `ops`, in the backend's representation.
///
/// For serialized lists this reads the current entry of every affected
/// namespace, replays `ops` over it in input order and emits one `Put` (or
/// `Delete` once the set is empty) per namespace that changed.
pub async fn index_entries(adapter: &dyn Adapter, ops: &[BulkOperation]) -> Result<Vec<BatchEntry>> {
    match adapter.capabilities().index {
        IndexStrategy::NativeScan => Ok(Vec::new()),
        IndexStrategy::NativeSet => Ok(ops
            .iter()
            .filter_map(|op| {
                let (namespace, _) = parse_indexable(op.key())?;
                let set_key = index_key(namespace);
                let member = op.key().to_string();
                Some(match op {
                    BulkOperation::Set { .. } => BatchEntry::SetAdd { set_key, member },
                    BulkOperation::Remove { .. } => BatchEntry::SetRemove { set_key, member },
                })
            })
            .collect()),
        IndexStrategy::SerializedList => serialized_list_entries(adapter, ops).await,
    }
}

async fn serialized_list_entries(
    adapter: &dyn Adapter,
    ops: &[BulkOperation],
) -> Result<Vec<BatchEntry>> {
    let namespaces: BTreeSet<&str> = ops
        .iter()
        .filter_map(|op| parse_indexable(op.key()).map(|(namespace, _)| namespace))
        .collect();
    if namespaces.is_empty() {
        return Ok(Vec::new());
    }

    let loaded = try_join_all(
        namespaces
            .iter()
            .map(|namespace| load_members(adapter, namespace)),
    )
    .await?;

    // namespace -> (members before, members after)
    let mut tables: BTreeMap<&str, (BTreeSet<String>, BTreeSet<String>)> = namespaces
        .into_iter()
        .zip(loaded)
        .map(|(namespace, current)| (namespace, (current.clone(), current)))
        .collect();

    for op in ops {
        let Some((namespace, _)) = parse_indexable(op.key()) else {
            continue;
        };
        if let Some((_, after)) = tables.get_mut(namespace) {
            match op {
                BulkOperation::Set { key, .. } => {
                    after.insert(key.clone());
                }
                BulkOperation::Remove { key } => {
                    after.remove(key);
                }
            }
        }
    }

    let mut entries = Vec::new();
    for (namespace, (before, after)) in tables {
        if before == after {
            continue;
        }
        let key = index_key(namespace);
        if after.is_empty() {
            entries.push(BatchEntry::Delete { key });
        } else {
            let list: Vec<&String> = after.iter().collect();
            entries.push(BatchEntry::Put {
                key,
                value: serde_json::to_vec(&list)?,
            });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryAdapter, MemoryConfig};
    use crate::adapter::Capabilities;
    use async_trait::async_trait;

    #[test]
    fn test_parse_indexable() {
        assert_eq!(parse_indexable("user:1"), Some(("user", "1")));
        assert_eq!(parse_indexable("pad:x:revs:3"), Some(("pad", "x:revs:3")));
        assert_eq!(parse_indexable("plain"), None);
        assert_eq!(parse_indexable(":1"), None);
        assert_eq!(parse_indexable("user:"), None);
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("user:1").is_ok());
        assert!(validate_key("plain").is_ok());
        assert!(matches!(validate_key(""), Err(StoreError::InvalidKey(_))));
        assert!(matches!(
            validate_key("index:keys:user"),
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_pattern_grammar() {
        assert_eq!(PatternQuery::parse("user:*", None).unwrap().namespace(), "user");

        for bad in ["a:b:*", "user*", "*", "user:", "user:1", "*:*", "us*er:*", ":*"] {
            assert!(
                matches!(
                    PatternQuery::parse(bad, None),
                    Err(StoreError::UnsupportedPattern(_))
                ),
                "pattern {:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_exclude_grammar() {
        assert!(PatternQuery::parse("pad:*", Some("*:*:*")).is_ok());
        assert!(PatternQuery::parse("pad:*", Some("pad:*")).is_ok());
        assert!(PatternQuery::parse("pad:*", Some("pad:*:*")).is_ok());

        for bad in ["other:*", "*", "pad:*:revs:*", "*:*", ""] {
            assert!(
                matches!(
                    PatternQuery::parse("pad:*", Some(bad)),
                    Err(StoreError::UnsupportedPattern(_))
                ),
                "exclude {:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_query_matches() {
        let all = PatternQuery::parse("pad:*", None).unwrap();
        assert!(all.matches("pad:1"));
        assert!(all.matches("pad:1:revs:0"));
        assert!(!all.matches("padding:1"));
        assert!(!all.matches("pad"));

        let no_subkeys = PatternQuery::parse("pad:*", Some("*:*:*")).unwrap();
        assert!(no_subkeys.matches("pad:1"));
        assert!(!no_subkeys.matches("pad:1:revs:0"));

        let nothing = PatternQuery::parse("pad:*", Some("pad:*")).unwrap();
        assert!(!nothing.matches("pad:1"));
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let re = glob_to_regex("a.b:*").unwrap();
        assert!(re.is_match("a.b:1"));
        assert!(!re.is_match("axb:1"));
    }

    /// Memory store that pretends to have no prefix scan
    struct ListIndexed(MemoryAdapter);

    #[async_trait]
    impl Adapter for ListIndexed {
        fn name(&self) -> &'static str {
            "list-indexed"
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                index: IndexStrategy::SerializedList,
                ..self.0.capabilities()
            }
        }
        async fn init(&self) -> Result<()> {
            self.0.init().await
        }
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
            self.0.set(key, value).await
        }
        async fn remove(&self, key: &str) -> Result<()> {
            self.0.remove(key).await
        }
        async fn write_batch(&self, entries: Vec<BatchEntry>) -> Result<()> {
            self.0.write_batch(entries).await
        }
        async fn close(&self) -> Result<()> {
            self.0.close().await
        }
    }

    fn set_op(key: &str) -> BulkOperation {
        BulkOperation::Set {
            key: key.to_string(),
            value: b"v".to_vec(),
        }
    }

    fn remove_op(key: &str) -> BulkOperation {
        BulkOperation::Remove {
            key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_serialized_list_entries_replay_in_order() {
        let adapter = ListIndexed(MemoryAdapter::new(MemoryConfig::default()));
        adapter.init().await.unwrap();

        let ops = vec![
            set_op("user:1"),
            set_op("user:2"),
            remove_op("user:1"),
            set_op("user:2"),
            set_op("plain"),
        ];
        let entries = index_entries(&adapter, &ops).await.unwrap();
        assert_eq!(
            entries,
            vec![BatchEntry::Put {
                key: "index:keys:user".to_string(),
                value: br#"["user:2"]"#.to_vec(),
            }]
        );
    }

    #[tokio::test]
    async fn test_serialized_list_empties_to_delete() {
        let adapter = ListIndexed(MemoryAdapter::new(MemoryConfig::default()));
        adapter.init().await.unwrap();
        adapter
            .set("index:keys:user", br#"["user:1"]"#.to_vec())
            .await
            .unwrap();

        let entries = index_entries(&adapter, &[remove_op("user:1")]).await.unwrap();
        assert_eq!(
            entries,
            vec![BatchEntry::Delete {
                key: "index:keys:user".to_string()
            }]
        );

        // Removing a key that was never indexed changes nothing
        let entries = index_entries(&adapter, &[remove_op("other:1")]).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_list_is_reported() {
        let adapter = ListIndexed(MemoryAdapter::new(MemoryConfig::default()));
        adapter.init().await.unwrap();
        adapter.set("index:keys:user", b"not json".to_vec()).await.unwrap();

        let result = find_keys(&adapter, "user:*", None).await;
        assert!(matches!(result, Err(StoreError::Deserialization(_))));
    }

    #[tokio::test]
    async fn test_native_set_entries() {
        struct SetIndexed;

        #[async_trait]
        impl Adapter for SetIndexed {
            fn name(&self) -> &'static str {
                "set-indexed"
            }
            fn capabilities(&self) -> Capabilities {
                Capabilities {
                    is_async: true,
                    native_batch: true,
                    index: IndexStrategy::NativeSet,
                }
            }
            async fn init(&self) -> Result<()> {
                Ok(())
            }
            async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
                Ok(None)
            }
            async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
                Ok(())
            }
            async fn remove(&self, _key: &str) -> Result<()> {
                Ok(())
            }
            async fn close(&self) -> Result<()> {
                Ok(())
            }
        }

        let entries = index_entries(&SetIndexed, &[set_op("user:1"), remove_op("user:2"), set_op("x")])
            .await
            .unwrap();
        assert_eq!(
            entries,
            vec![
                BatchEntry::SetAdd {
                    set_key: "index:keys:user".to_string(),
                    member: "user:1".to_string(),
                },
                BatchEntry::SetRemove {
                    set_key: "index:keys:user".to_string(),
                    member: "user:2".to_string(),
                },
            ]
        );
    }
}
