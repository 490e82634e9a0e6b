//! Canned substitutions for the kine key-value store.
//!
//! kine (the etcd shim used by k3s) issues a small set of heavy queries
//! that the engine either cannot plan well or cannot parse at all. Each
//! known shape is fingerprinted by substring co-occurrence and swapped
//! for an engine-friendly equivalent; the first matching fingerprint
//! wins and everything else passes through untouched.

struct Substitution {
    /// Statement prefix, matched case-sensitively at the start.
    prefix: Option<&'static str>,
    /// Substrings that must all occur somewhere in the statement.
    contains: &'static [&'static str],
    replacement: &'static str,
}

const KINE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kine (\
 id INTEGER PRIMARY KEY,\
 name TEXT NOT NULL,\
 created INTEGER,\
 deleted INTEGER,\
 create_revision INTEGER,\
 prev_revision INTEGER,\
 lease INTEGER,\
 value BLOB,\
 old_value BLOB)";

const KINE_LIST_CURRENT: &str = "SELECT (SELECT MAX(id) FROM kine) AS theid, \
 kv.id, kv.name, kv.created, kv.deleted, kv.create_revision, kv.prev_revision, \
 kv.lease, kv.value, kv.old_value \
 FROM kine AS kv \
 WHERE kv.id IN (SELECT MAX(id) FROM kine WHERE name LIKE $1 GROUP BY name) \
 AND kv.deleted = 0 \
 ORDER BY kv.id ASC";

const KINE_LIST_REVISION: &str = "SELECT (SELECT MAX(id) FROM kine) AS theid, \
 kv.id, kv.name, kv.created, kv.deleted, kv.create_revision, kv.prev_revision, \
 kv.lease, kv.value, kv.old_value \
 FROM kine AS kv \
 WHERE kv.id IN (SELECT MAX(id) FROM kine WHERE name LIKE $1 AND id <= $2 GROUP BY name) \
 AND kv.deleted = 0 \
 ORDER BY kv.id ASC";

const KINE_COUNT: &str = "SELECT (SELECT MAX(id) FROM kine) AS theid, COUNT(*) \
 FROM kine AS kv \
 WHERE kv.id IN (SELECT MAX(id) FROM kine WHERE name LIKE $1 GROUP BY name) \
 AND kv.deleted = 0";

const KINE_COMPACT: &str = "DELETE FROM kine \
 WHERE name != 'compact_rev_key' \
 AND prev_revision != 0 \
 AND id IN (SELECT prev_revision FROM kine WHERE name != 'compact_rev_key' AND id <= $1)";

static SUBSTITUTIONS: &[Substitution] = &[
    Substitution {
        prefix: Some("CREATE TABLE IF NOT EXISTS kine"),
        contains: &[],
        replacement: KINE_SCHEMA,
    },
    Substitution {
        prefix: Some("CREATE INDEX IF NOT EXISTS kine_list_query_index"),
        contains: &[],
        replacement: "PRAGMA wal_checkpoint(TRUNCATE)",
    },
    Substitution {
        prefix: None,
        contains: &["DELETE", "kine", "prev_revision", "compact_rev_key"],
        replacement: KINE_COMPACT,
    },
    Substitution {
        prefix: None,
        contains: &["kine", "COUNT(c.theid)"],
        replacement: KINE_COUNT,
    },
    Substitution {
        prefix: None,
        contains: &["kine", "mkv.id <="],
        replacement: KINE_LIST_REVISION,
    },
    Substitution {
        prefix: None,
        contains: &["kine", "MAX(mkv.id)"],
        replacement: KINE_LIST_CURRENT,
    },
];

pub(super) fn substitute(sql: &str) -> Option<String> {
    for sub in SUBSTITUTIONS {
        let prefix_hit = match sub.prefix {
            Some(prefix) => sql.starts_with(prefix),
            None => !sub.contains.is_empty(),
        };
        if prefix_hit && sub.contains.iter().all(|needle| sql.contains(needle)) {
            return Some(sub.replacement.to_string());
        }
    }
    None
}
