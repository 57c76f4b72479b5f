//! Encrypted long-term memory store
//!
//! Facts are key/value pairs. The key and value live only inside the sealed
//! record; the row is addressed by [`FactCipher::key_id`]. Because nothing
//! searchable is stored in clear, search decrypts and scores in process.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DbConn, DbPool, FactCipher};
use crate::config::MemoryConfig;
use crate::{Error, Result};

/// Half-life for temporal decay (in days)
const DECAY_HALF_LIFE_DAYS: f64 = 7.0;

/// Weight of temporal decay in combined scoring (0.0 = no decay effect, 1.0 = full effect)
const DECAY_WEIGHT: f64 = 0.3;

/// Max characters kept in an episode summary
pub const EPISODE_SUMMARY_CHARS: usize = 200;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "do", "does", "for", "how", "i", "in", "is", "it", "me", "my", "of",
    "on", "or", "s", "the", "to", "was", "what", "whats", "when", "where", "who", "you", "your",
];

/// Compute temporal decay factor from the time a fact was last updated.
///
/// Uses exponential decay with a configurable half-life.
/// Returns a value in `[0.0, 1.0]` where 1.0 means just updated and ~0.0 means very old.
#[must_use]
pub fn temporal_decay_factor(updated_at: &DateTime<Utc>, now: &DateTime<Utc>) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let elapsed_days = (*now - *updated_at).num_seconds().max(0) as f64 / 86400.0;
    // Exponential decay: 2^(-t/half_life)
    (-elapsed_days / DECAY_HALF_LIFE_DAYS).exp2()
}

/// Lowercase alphanumeric terms of `text`, minus stopwords
fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Canonical fact key: lowercase snake_case, anything else collapsed to underscores
///
/// Every path that writes or deletes facts by key goes through this, so
/// "User Name" and `user_name` address the same fact.
#[must_use]
pub fn normalize_key(raw: &str) -> String {
    let mut key = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_lowercase());
        } else if !key.ends_with('_') {
            key.push('_');
        }
    }
    key.trim_matches('_').to_string()
}

/// A remembered fact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFact {
    pub key: String,
    pub value: String,
    /// Transcript turn the fact was learned from
    pub source_turn_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sealed portion of a fact row
#[derive(Serialize, Deserialize)]
struct FactRecord {
    key: String,
    value: String,
    #[serde(default)]
    source_turn_ref: Option<String>,
}

/// Outcome of a logged tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeOutcome {
    Succeeded,
    Failed,
}

/// Entry in the episodic tool log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub tool: String,
    pub outcome: EpisodeOutcome,
    /// Result or error text, truncated to [`EPISODE_SUMMARY_CHARS`]
    pub summary: String,
    pub at: DateTime<Utc>,
}

impl Episode {
    /// Build an episode stamped now, truncating the summary
    #[must_use]
    pub fn new(tool: impl Into<String>, outcome: EpisodeOutcome, summary: &str) -> Self {
        Self {
            tool: tool.into(),
            outcome,
            summary: summary.chars().take(EPISODE_SUMMARY_CHARS).collect(),
            at: Utc::now(),
        }
    }
}

/// Ranks facts against a query
///
/// A score of zero means "not relevant"; such facts are dropped from search
/// results.
pub trait RelevanceScorer: Send + Sync {
    fn score(&self, query: &str, fact: &MemoryFact, now: DateTime<Utc>) -> f64;
}

/// Keyword overlap weighted by exponential recency decay
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordRecencyScorer;

impl RelevanceScorer for KeywordRecencyScorer {
    fn score(&self, query: &str, fact: &MemoryFact, now: DateTime<Utc>) -> f64 {
        let query_terms: HashSet<String> = terms(query).into_iter().collect();
        if query_terms.is_empty() {
            return 0.0;
        }

        let fact_terms: HashSet<String> = terms(&fact.key)
            .into_iter()
            .chain(terms(&fact.value))
            .collect();

        let matched = query_terms.intersection(&fact_terms).count();
        if matched == 0 {
            return 0.0;
        }

        #[allow(clippy::cast_precision_loss)]
        let overlap = matched as f64 / query_terms.len() as f64;
        let decay = temporal_decay_factor(&fact.updated_at, &now);
        overlap * DECAY_WEIGHT.mul_add(decay, 1.0 - DECAY_WEIGHT)
    }
}

/// Durable, encrypted fact store
#[derive(Clone)]
pub struct MemoryStore {
    pool: DbPool,
    cipher: Arc<FactCipher>,
    scorer: Arc<dyn RelevanceScorer>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Create a store over an initialized pool
    #[must_use]
    pub fn new(pool: DbPool, cipher: FactCipher) -> Self {
        Self {
            pool,
            cipher: Arc::new(cipher),
            scorer: Arc::new(KeywordRecencyScorer),
        }
    }

    /// Open the on-disk store described by `config`
    ///
    /// # Errors
    ///
    /// Returns error if the key cannot be loaded or the database cannot be opened
    pub fn open(config: &MemoryConfig) -> Result<Self> {
        let cipher = FactCipher::from_config(config)?;
        let pool = super::init(&config.db_path)?;
        Ok(Self::new(pool, cipher))
    }

    /// Replace the relevance scorer
    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::MemoryStore(e.to_string()))
    }

    /// Insert or update a fact; last write wins by timestamp
    ///
    /// # Errors
    ///
    /// Returns error if the key is empty or the write fails
    pub fn put(&self, key: &str, value: &str, source_turn_ref: Option<&str>) -> Result<MemoryFact> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::MemoryStore("fact key must not be empty".to_string()));
        }

        let record = FactRecord {
            key: key.to_string(),
            value: value.to_string(),
            source_turn_ref: source_turn_ref.map(ToString::to_string),
        };
        let sealed = self.cipher.seal(&serde_json::to_vec(&record)?)?;
        let key_id = self.cipher.key_id(key);
        let now = Utc::now().timestamp_micros();

        let conn = self.conn()?;
        conn.execute(
            r"INSERT INTO facts (key_id, record, created_at, updated_at)
              VALUES (?1, ?2, ?3, ?3)
              ON CONFLICT(key_id) DO UPDATE SET
                record = excluded.record,
                updated_at = excluded.updated_at
              WHERE excluded.updated_at >= facts.updated_at",
            rusqlite::params![key_id, sealed, now],
        )?;

        tracing::debug!(key_id = %&key_id[..12], "fact stored");

        self.get_with(&conn, key)?
            .ok_or_else(|| Error::MemoryStore("fact vanished after write".to_string()))
    }

    /// Get a fact by key
    ///
    /// # Errors
    ///
    /// Returns error if the read or decryption fails
    pub fn get(&self, key: &str) -> Result<Option<MemoryFact>> {
        let conn = self.conn()?;
        self.get_with(&conn, key.trim())
    }

    fn get_with(&self, conn: &DbConn, key: &str) -> Result<Option<MemoryFact>> {
        let result = conn.query_row(
            "SELECT record, created_at, updated_at FROM facts WHERE key_id = ?1",
            [self.cipher.key_id(key)],
            |row| {
                Ok(FactRow {
                    record: row.get(0)?,
                    created_at: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            },
        );

        match result {
            Ok(row) => self.decode(row).map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Facts matching `query`, best first
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryFact>> {
        let now = Utc::now();
        let mut scored: Vec<(f64, MemoryFact)> = self
            .scan("SELECT record, created_at, updated_at FROM facts", [])?
            .into_iter()
            .filter_map(|fact| {
                let score = self.scorer.score(query, &fact, now);
                (score > 0.0).then_some((score, fact))
            })
            .collect();

        scored.sort_by(|(sa, fa), (sb, fb)| {
            sb.total_cmp(sa)
                .then_with(|| fb.updated_at.cmp(&fa.updated_at))
                .then_with(|| fa.key.cmp(&fb.key))
        });

        Ok(scored.into_iter().take(limit).map(|(_, f)| f).collect())
    }

    /// Up to `k` facts for a query: keyword matches first, topped up by recency
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub fn relevant(&self, query: &str, k: usize) -> Result<Vec<MemoryFact>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut facts = self.search(query, k)?;
        if facts.len() < k {
            let seen: HashSet<String> = facts.iter().map(|f| f.key.clone()).collect();
            let extra = self
                .recent(k)?
                .into_iter()
                .filter(|f| !seen.contains(&f.key))
                .take(k - facts.len());
            facts.extend(extra);
        }
        Ok(facts)
    }

    /// Most recently updated facts
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub fn recent(&self, limit: usize) -> Result<Vec<MemoryFact>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.scan(
            "SELECT record, created_at, updated_at FROM facts ORDER BY updated_at DESC LIMIT ?1",
            [limit],
        )
    }

    /// All facts, ordered by key
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub fn list(&self) -> Result<Vec<MemoryFact>> {
        let mut facts = self.scan("SELECT record, created_at, updated_at FROM facts", [])?;
        facts.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(facts)
    }

    /// Number of stored facts
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub fn count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM facts", [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Remove a fact
    ///
    /// Returns `true` if a fact was removed.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails
    pub fn forget(&self, key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM facts WHERE key_id = ?1",
            [self.cipher.key_id(key.trim())],
        )?;
        Ok(n > 0)
    }

    /// Remove every fact and episode
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails
    pub fn clear(&self) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM facts", [])?;
        conn.execute("DELETE FROM episodes", [])?;
        tracing::info!(removed = n, "memory cleared");
        Ok(n)
    }

    /// Remove facts not updated within `max_age`
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails
    pub fn purge_stale(&self, max_age: chrono::Duration) -> Result<usize> {
        let cutoff = (Utc::now() - max_age).timestamp_micros();
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM facts WHERE updated_at < ?1", [cutoff])?;
        if n > 0 {
            tracing::info!(removed = n, "purged stale facts");
        }
        Ok(n)
    }

    /// Append an entry to the episodic tool log
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    pub fn log_episode(&self, episode: &Episode) -> Result<()> {
        let sealed = self.cipher.seal(&serde_json::to_vec(episode)?)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO episodes (id, record, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                format!("ep_{}", Uuid::new_v4()),
                sealed,
                episode.at.timestamp_micros()
            ],
        )?;
        Ok(())
    }

    /// Most recent episodes, newest first
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    pub fn recent_episodes(&self, limit: usize) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT record FROM episodes ORDER BY created_at DESC LIMIT ?1")?;
        let blobs = stmt
            .query_map([i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                row.get::<_, Vec<u8>>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        blobs
            .iter()
            .map(|b| Ok(serde_json::from_slice(&self.cipher.open(b)?)?))
            .collect()
    }

    /// Run a fact query, skipping rows that fail to decrypt
    fn scan<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<MemoryFact>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(FactRow {
                    record: row.get(0)?,
                    created_at: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match self.decode(row) {
                Ok(fact) => Some(fact),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable fact");
                    None
                }
            })
            .collect())
    }

    fn decode(&self, row: FactRow) -> Result<MemoryFact> {
        let record: FactRecord = serde_json::from_slice(&self.cipher.open(&row.record)?)?;
        Ok(MemoryFact {
            key: record.key,
            value: record.value,
            source_turn_ref: record.source_turn_ref,
            created_at: from_micros(row.created_at),
            updated_at: from_micros(row.updated_at),
        })
    }

    /// Format facts for inclusion in a system prompt
    #[must_use]
    pub fn format_for_prompt(facts: &[MemoryFact]) -> String {
        facts
            .iter()
            .map(|f| format!("- {}: {}", f.key, f.value))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Raw fact row from the database
struct FactRow {
    record: Vec<u8>,
    created_at: i64,
    updated_at: i64,
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn store() -> MemoryStore {
        MemoryStore::new(db::init_memory().unwrap(), FactCipher::from_key(&[9u8; 32]))
    }

    fn fact(key: &str, value: &str, age_days: i64) -> MemoryFact {
        let at = Utc::now() - chrono::Duration::days(age_days);
        MemoryFact {
            key: key.to_string(),
            value: value.to_string(),
            source_turn_ref: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn key_normalization() {
        assert_eq!(normalize_key("Favorite Color"), "favorite_color");
        assert_eq!(normalize_key("  user-name!! "), "user_name");
        assert_eq!(normalize_key("user_name"), "user_name");
        assert_eq!(normalize_key("***"), "");
    }

    #[test]
    fn test_fact_crud() {
        let store = store();

        let stored = store.put("favorite_color", "green", Some("turn-1")).unwrap();
        assert_eq!(stored.value, "green");
        assert_eq!(stored.source_turn_ref.as_deref(), Some("turn-1"));

        let fetched = store.get("favorite_color").unwrap().unwrap();
        assert_eq!(fetched, stored);

        assert!(store.forget("favorite_color").unwrap());
        assert!(!store.forget("favorite_color").unwrap());
        assert!(store.get("favorite_color").unwrap().is_none());
    }

    #[test]
    fn test_put_is_idempotent() {
        let store = store();
        store.put("user_name", "Alex", None).unwrap();
        store.put("user_name", "Alex", None).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_update_preserves_created_at() {
        let store = store();
        let first = store.put("city", "Lisbon", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = store.put("city", "Porto", None).unwrap();

        assert_eq!(second.value, "Porto");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[test]
    fn test_older_write_loses() {
        let store = store();
        store.put("city", "Porto", None).unwrap();

        // Simulate a write stamped before the current row
        let conn = store.conn().unwrap();
        let sealed = store
            .cipher
            .seal(br#"{"key":"city","value":"Stale"}"#)
            .unwrap();
        conn.execute(
            r"INSERT INTO facts (key_id, record, created_at, updated_at) VALUES (?1, ?2, 0, 0)
              ON CONFLICT(key_id) DO UPDATE SET record = excluded.record, updated_at = excluded.updated_at
              WHERE excluded.updated_at >= facts.updated_at",
            rusqlite::params![store.cipher.key_id("city"), sealed],
        )
        .unwrap();
        drop(conn);

        assert_eq!(store.get("city").unwrap().unwrap().value, "Porto");
    }

    #[test]
    fn test_empty_key_rejected() {
        let err = store().put("  ", "x", None).unwrap_err();
        assert!(matches!(err, Error::MemoryStore(_)));
    }

    #[test]
    fn test_search_matches_keywords() {
        let store = store();
        store.put("user_name", "Alex", None).unwrap();
        store.put("favorite_food", "ramen", None).unwrap();

        let found = store.search("What's my name?", 5).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "Alex");

        assert!(store.search("weather tomorrow", 5).unwrap().is_empty());
    }

    #[test]
    fn test_relevant_tops_up_with_recent() {
        let store = store();
        store.put("user_name", "Alex", None).unwrap();
        store.put("favorite_food", "ramen", None).unwrap();

        let facts = store.relevant("name", 2).unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].key, "user_name");
        assert_eq!(facts[1].key, "favorite_food");
    }

    #[test]
    fn test_list_and_clear() {
        let store = store();
        store.put("b_key", "2", None).unwrap();
        store.put("a_key", "1", None).unwrap();
        store
            .log_episode(&Episode::new("current_time", EpisodeOutcome::Succeeded, "noon"))
            .unwrap();

        let keys: Vec<String> = store.list().unwrap().into_iter().map(|f| f.key).collect();
        assert_eq!(keys, vec!["a_key", "b_key"]);

        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.list().unwrap().is_empty());
        assert!(store.recent_episodes(10).unwrap().is_empty());
    }

    #[test]
    fn test_purge_stale() {
        let store = store();
        store.put("old", "x", None).unwrap();
        let conn = store.conn().unwrap();
        conn.execute("UPDATE facts SET updated_at = 0", []).unwrap();
        drop(conn);
        store.put("fresh", "y", None).unwrap();

        assert_eq!(store.purge_stale(chrono::Duration::days(30)).unwrap(), 1);
        assert!(store.get("old").unwrap().is_none());
        assert!(store.get("fresh").unwrap().is_some());
    }

    #[test]
    fn test_episodes_are_truncated() {
        let store = store();
        let long = "x".repeat(500);
        store
            .log_episode(&Episode::new("read_file", EpisodeOutcome::Failed, &long))
            .unwrap();

        let episodes = store.recent_episodes(5).unwrap();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].summary.len(), EPISODE_SUMMARY_CHARS);
        assert_eq!(episodes[0].outcome, EpisodeOutcome::Failed);
    }

    #[test]
    fn test_values_not_stored_in_clear() {
        let store = store();
        store.put("user_name", "Alexandria", None).unwrap();
        let conn = store.conn().unwrap();
        let blob: Vec<u8> = conn
            .query_row("SELECT record FROM facts", [], |row| row.get(0))
            .unwrap();
        let needle = b"Alexandria";
        assert!(!blob.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn temporal_decay_recent_is_high() {
        let now = Utc::now();
        let factor = temporal_decay_factor(&now, &now);
        assert!(factor > 0.99, "factor for now should be ~1.0, got {factor}");
    }

    #[test]
    fn temporal_decay_half_life() {
        let now = Utc::now();
        let half = now - chrono::Duration::days(7);
        let factor = temporal_decay_factor(&half, &now);
        assert!(
            (factor - 0.5).abs() < 0.01,
            "factor at 7 days should be ~0.5, got {factor}"
        );
    }

    #[test]
    fn scorer_prefers_recent_on_equal_overlap() {
        let scorer = KeywordRecencyScorer;
        let now = Utc::now();
        let fresh = scorer.score("coffee order", &fact("coffee", "flat white", 0), now);
        let stale = scorer.score("coffee order", &fact("coffee", "flat white", 60), now);
        assert!(fresh > stale);
        assert!(stale > 0.0);
    }

    #[test]
    fn scorer_ignores_stopwords_only_queries() {
        let scorer = KeywordRecencyScorer;
        let score = scorer.score("what is my", &fact("user_name", "Alex", 0), Utc::now());
        assert!(score.abs() < f64::EPSILON);
    }

    #[test]
    fn test_format_for_prompt() {
        let facts = vec![fact("user_name", "Alex", 0), fact("city", "Lisbon", 0)];
        let formatted = MemoryStore::format_for_prompt(&facts);
        assert!(formatted.contains("- user_name: Alex"));
        assert!(formatted.contains("- city: Lisbon"));
    }
}
