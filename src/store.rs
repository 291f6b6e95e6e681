//! Tiered memory storage using SQLite
//!
//! Every session owns four ordered streams: elements, actions (per level),
//! consolidations (per level) and imaginations. Indices are assigned inside
//! a transaction that reads the current max and writes max+1; the
//! `(doc_id, [lvl,] idx)` primary keys turn a lost race into a unique
//! violation, which is retried up to `transaction_attempts` times.

use crate::config::MemoryConfig;
use crate::error::{ReverieError, Result};
use crate::types::{
    Action, ActionPayload, Consolidation, ConsolidationBody, ConsolidationStamp, Element,
    ElementPayload, Embedding, Extra, Latest, LongTermStream, Pinpoint, Pinpointed, SessionKey,
    Stamp, WindowItem,
};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Input handed to a consolidation function for one new index
#[derive(Debug, Clone)]
pub struct ConsolidationRequest {
    pub lvl: u32,
    pub index: i64,
    /// The `size` previous-level items this index summarizes, oldest first
    pub window: Vec<WindowItem>,
    /// Value returned by the previous call at the same level in this run
    pub pass_on: Option<Value>,
}

/// What a consolidation function produces for one index
#[derive(Debug, Clone)]
pub struct ConsolidationOutput {
    pub consolidation: ConsolidationBody,
    pub extra: Extra,
    pub pass_on: Option<Value>,
}

/// Outcome of one `imagine` sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImagineReport {
    pub due: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Elements,
    Actions(u32),
    Level(u32),
    Imaginations,
    Schedule,
}

impl Stream {
    fn name(&self) -> String {
        match self {
            Stream::Elements => "elements".into(),
            Stream::Actions(lvl) => format!("actions[{lvl}]"),
            Stream::Level(lvl) => format!("consolidations[{lvl}]"),
            Stream::Imaginations => "imaginations".into(),
            Stream::Schedule => "imagination schedule".into(),
        }
    }
}

/// Memory store for ordered appends, compaction and scheduling flags
#[derive(Clone)]
pub struct MemoryStore {
    pool: SqlitePool,
    config: MemoryConfig,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("pool", &"<SqlitePool>")
            .field("config", &self.config)
            .finish()
    }
}

impl MemoryStore {
    /// Create a store over an already-migrated pool
    pub fn new(pool: SqlitePool, config: MemoryConfig) -> Arc<Self> {
        Arc::new(Self { pool, config })
    }

    /// Open (or create) a file-backed store and run migrations
    pub async fn connect(path: impl AsRef<Path>, config: MemoryConfig) -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(path = %path.as_ref().display(), "memory store ready");

        Ok(Self::new(pool, config))
    }

    /// Create an in-memory store (single connection so every query sees the same database)
    pub async fn connect_in_memory(config: MemoryConfig) -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self::new(pool, config))
    }

    /// Get a reference to the SQLite pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Run `op` until it commits, retrying transient conflicts
    async fn transact<T, F, Fut>(&self, stream: Stream, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.transaction_attempts;
        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable_conflict() => {
                    debug!(stream = %stream.name(), attempt, error = %e, "transaction conflict, retrying");
                    tokio::time::sleep(Duration::from_millis(5 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ReverieError::StoreConflict {
            stream: stream.name(),
            attempts,
        })
    }

    // ─── Appends ──────────────────────────────────────────────────────────

    /// Append an element at the next index of the session
    pub async fn append_element(
        &self,
        key: &SessionKey,
        payload: &ElementPayload,
        extra: &Extra,
        is_internal: bool,
    ) -> Result<Stamp> {
        let payload_json = serde_json::to_string(payload)?;
        let extra_json = serde_json::to_string(extra)?;

        let stamp = self
            .transact(Stream::Elements, || async {
                let mut tx = self.pool.begin().await?;
                ensure_session(&mut tx, key).await?;
                let index = next_index(&mut tx, key, Stream::Elements).await?;
                let (millis, timestamp) = now_millis();

                sqlx::query(
                    r#"
                    INSERT INTO elements (doc_id, idx, timestamp, is_internal, payload, extra)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(key.doc_id())
                .bind(index)
                .bind(millis)
                .bind(is_internal)
                .bind(&payload_json)
                .bind(&extra_json)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                Ok(Stamp { index, timestamp })
            })
            .await?;

        debug!(doc_id = %key, index = stamp.index, is_internal, "element appended");
        Ok(stamp)
    }

    /// Append an action record at the next index of its level
    pub async fn append_action(
        &self,
        key: &SessionKey,
        lvl: u32,
        payload: &ActionPayload,
        extra: &Extra,
    ) -> Result<Stamp> {
        let payload_json = serde_json::to_string(payload)?;
        let extra_json = serde_json::to_string(extra)?;

        self.transact(Stream::Actions(lvl), || async {
            let mut tx = self.pool.begin().await?;
            ensure_session(&mut tx, key).await?;
            let index = next_index(&mut tx, key, Stream::Actions(lvl)).await?;
            let (millis, timestamp) = now_millis();

            sqlx::query(
                r#"
                INSERT INTO actions (doc_id, lvl, idx, timestamp, payload, extra)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(key.doc_id())
            .bind(i64::from(lvl))
            .bind(index)
            .bind(millis)
            .bind(&payload_json)
            .bind(&extra_json)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(Stamp { index, timestamp })
        })
        .await
    }

    /// Append an imagination to the top of the long-term stream
    pub async fn append_imagination(
        &self,
        key: &SessionKey,
        consolidation: &ConsolidationBody,
        extra: &Extra,
    ) -> Result<Stamp> {
        let embedding = encode_embedding(consolidation.embedding())?;
        let extra_json = serde_json::to_string(extra)?;
        let text = consolidation.text().to_string();

        self.transact(Stream::Imaginations, || async {
            let mut tx = self.pool.begin().await?;
            ensure_session(&mut tx, key).await?;
            let index = next_index(&mut tx, key, Stream::Imaginations).await?;
            let (millis, timestamp) = now_millis();

            sqlx::query(
                r#"
                INSERT INTO imaginations (doc_id, idx, timestamp, imagination, embedding, extra)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(key.doc_id())
            .bind(index)
            .bind(millis)
            .bind(&text)
            .bind(embedding.as_ref())
            .bind(&extra_json)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(Stamp { index, timestamp })
        })
        .await
    }

    // ─── Reads ────────────────────────────────────────────────────────────

    /// Most recent `n` elements (ascending) and the current max index, from one snapshot
    pub async fn get_latest(&self, key: &SessionKey, n: i64) -> Result<Latest> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT idx, timestamp, is_internal, payload, extra
            FROM elements
            WHERE doc_id = ?
            ORDER BY idx DESC
            LIMIT ?
            "#,
        )
        .bind(key.doc_id())
        .bind(n.max(0))
        .fetch_all(&mut *tx)
        .await?;

        let latest_index = max_index(&mut tx, key, Stream::Elements).await?;
        tx.commit().await?;

        let mut elements = rows.iter().map(row_to_element).collect::<Result<Vec<_>>>()?;
        elements.reverse();

        Ok(Latest {
            elements,
            latest_index,
        })
    }

    /// External elements in a newest-first window, returned oldest first
    pub async fn get_history(&self, key: &SessionKey, offset: i64, limit: i64) -> Result<Vec<Element>> {
        let rows = sqlx::query(
            r#"
            SELECT idx, timestamp, is_internal, payload, extra
            FROM elements
            WHERE doc_id = ? AND is_internal = 0
            ORDER BY idx DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(key.doc_id())
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        let mut elements = rows.iter().map(row_to_element).collect::<Result<Vec<_>>>()?;
        elements.reverse();
        Ok(elements)
    }

    /// Most recent `n` actions at a level, oldest first
    pub async fn get_actions(&self, key: &SessionKey, lvl: u32, n: i64) -> Result<Vec<Action>> {
        let rows = sqlx::query(
            r#"
            SELECT lvl, idx, timestamp, payload, extra
            FROM actions
            WHERE doc_id = ? AND lvl = ?
            ORDER BY idx DESC
            LIMIT ?
            "#,
        )
        .bind(key.doc_id())
        .bind(i64::from(lvl))
        .bind(n.max(0))
        .fetch_all(&self.pool)
        .await?;

        let mut actions = rows.iter().map(row_to_action).collect::<Result<Vec<_>>>()?;
        actions.reverse();
        Ok(actions)
    }

    /// Point lookup; `None` when out of range
    pub async fn get_pinpoint(&self, key: &SessionKey, condition: Pinpoint) -> Result<Option<Pinpointed>> {
        match condition {
            Pinpoint::Element { offset } => {
                if offset < 0 {
                    return Ok(None);
                }
                let mut window = self.get_history(key, offset, 1).await?;
                Ok(window.pop().map(Pinpointed::Element))
            }
            Pinpoint::Action { lvl, index } => {
                let row = sqlx::query(
                    r#"
                    SELECT lvl, idx, timestamp, payload, extra
                    FROM actions
                    WHERE doc_id = ? AND lvl = ? AND idx = ?
                    "#,
                )
                .bind(key.doc_id())
                .bind(i64::from(lvl))
                .bind(index)
                .fetch_optional(&self.pool)
                .await?;

                row.map(|r| row_to_action(&r).map(Pinpointed::Action))
                    .transpose()
            }
        }
    }

    /// Current max index of the element stream
    pub async fn latest_element_index(&self, key: &SessionKey) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        max_index(&mut conn, key, Stream::Elements).await
    }

    /// Current max index of a consolidation level
    pub async fn latest_level_index(&self, key: &SessionKey, lvl: u32) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await?;
        max_index(&mut conn, key, Stream::Level(lvl)).await
    }

    /// Consolidations of one level in `[start, end)`, ascending
    pub async fn get_level(&self, key: &SessionKey, lvl: u32, start: i64, end: i64) -> Result<Vec<Consolidation>> {
        let rows = sqlx::query(
            r#"
            SELECT lvl, idx, timestamp, summary, embedding, extra
            FROM consolidations
            WHERE doc_id = ? AND lvl = ? AND idx >= ? AND idx < ?
            ORDER BY idx ASC
            "#,
        )
        .bind(key.doc_id())
        .bind(i64::from(lvl))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_consolidation).collect()
    }

    // ─── Search scans ─────────────────────────────────────────────────────

    /// Score the most recent `short_term_lookback` elements and keep the top `n`.
    ///
    /// `score_fn` receives the element, its position from the newest (0 = newest)
    /// and its timestamp.
    pub async fn short_term_search<F>(&self, key: &SessionKey, score_fn: F, n: usize) -> Result<Vec<(Element, f32)>>
    where
        F: Fn(&Element, usize, DateTime<Utc>) -> f32,
    {
        let rows = sqlx::query(
            r#"
            SELECT idx, timestamp, is_internal, payload, extra
            FROM elements
            WHERE doc_id = ?
            ORDER BY idx DESC
            LIMIT ?
            "#,
        )
        .bind(key.doc_id())
        .bind(self.config.short_term_lookback.max(0))
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for (position, row) in rows.iter().enumerate() {
            let element = row_to_element(row)?;
            let score = score_fn(&element, position, element.timestamp);
            if score.is_finite() {
                scored.push((element, score));
            }
        }

        Ok(top_n(scored, n))
    }

    /// Score the recent window of every consolidation level, then the imagination
    /// stream, and keep the top `n`.
    ///
    /// `score_fn` receives the whole scan (levels ascending, imaginations last,
    /// each stream newest first) and the item being scored.
    pub async fn long_term_search<F>(&self, key: &SessionKey, score_fn: F, n: usize) -> Result<Vec<(Consolidation, f32)>>
    where
        F: Fn(&[Consolidation], &Consolidation) -> f32,
    {
        let scan = self.long_term_scan(key).await?;

        let scored = scan
            .iter()
            .filter_map(|item| {
                let score = score_fn(&scan, item);
                score.is_finite().then(|| (item.clone(), score))
            })
            .collect();

        Ok(top_n(scored, n))
    }

    /// Everything `long_term_search` looks at
    pub async fn long_term_scan(&self, key: &SessionKey) -> Result<Vec<Consolidation>> {
        let mut scan = Vec::new();

        for lvl in 0..self.config.max_lvl {
            let rows = sqlx::query(
                r#"
                SELECT lvl, idx, timestamp, summary, embedding, extra
                FROM consolidations
                WHERE doc_id = ? AND lvl = ?
                ORDER BY idx DESC
                LIMIT ?
                "#,
            )
            .bind(key.doc_id())
            .bind(i64::from(lvl))
            .bind(self.config.summary_lookback.max(0))
            .fetch_all(&self.pool)
            .await?;

            for row in &rows {
                scan.push(row_to_consolidation(row)?);
            }
        }

        let rows = sqlx::query(
            r#"
            SELECT idx, timestamp, imagination, embedding, extra
            FROM imaginations
            WHERE doc_id = ?
            ORDER BY idx DESC
            LIMIT ?
            "#,
        )
        .bind(key.doc_id())
        .bind(self.config.imagination_lookback.max(0))
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            scan.push(row_to_imagination(row)?);
        }

        Ok(scan)
    }

    // ─── Consolidation ────────────────────────────────────────────────────

    /// Append every consolidation index that has become computable, level by level.
    ///
    /// Level `lvl` index `i` covers previous-level indices `[i*freq, i*freq+size)`.
    /// Each level is computed from a snapshot and committed only if the level
    /// did not move in the meantime; a moved level is recomputed. Indices are
    /// never reprocessed or skipped, so any call frequency converges to the
    /// same records.
    pub async fn consolidate<F, Fut>(&self, key: &SessionKey, mut consolidation_fn: F) -> Result<Vec<ConsolidationStamp>>
    where
        F: FnMut(ConsolidationRequest) -> Fut,
        Fut: Future<Output = Result<ConsolidationOutput>>,
    {
        let mut written = Vec::new();

        for lvl in 0..self.config.max_lvl {
            let (size, freq) = self.config.window(lvl);
            let prev_stream = if lvl == 0 {
                Stream::Elements
            } else {
                Stream::Level(lvl - 1)
            };
            let mut attempt = 0;

            loop {
                attempt += 1;

                let (prev_max, this_max) = {
                    let mut conn = self.pool.acquire().await?;
                    let prev_max = max_index(&mut conn, key, prev_stream).await?.unwrap_or(-1);
                    let this_max = max_index(&mut conn, key, Stream::Level(lvl)).await?.unwrap_or(-1);
                    (prev_max, this_max)
                };

                let target = consolidation_target(prev_max, size, freq);
                if target < 0 {
                    debug!(doc_id = %key, lvl, prev_max, "no window complete at this level, stopping");
                    return Ok(written);
                }
                if target <= this_max {
                    break;
                }

                let start = (this_max + 1) * freq;
                let end = target * freq + size;
                let items = self.window_items(key, prev_stream, start, end).await?;
                if items.len() as i64 != end - start {
                    return Err(ReverieError::Validation(format!(
                        "{} of {key} has a gap in [{start}, {end})",
                        prev_stream.name()
                    )));
                }

                let mut outputs = Vec::new();
                let mut pass_on = None;
                for index in (this_max + 1)..=target {
                    let lo = (index * freq - start) as usize;
                    let window = items[lo..lo + size as usize].to_vec();
                    let output = consolidation_fn(ConsolidationRequest {
                        lvl,
                        index,
                        window,
                        pass_on: pass_on.take(),
                    })
                    .await?;
                    pass_on = output.pass_on.clone();
                    outputs.push((index, output));
                }

                match self.commit_level(key, lvl, this_max, &outputs).await {
                    Ok(Some(stamps)) => {
                        info!(doc_id = %key, lvl, from = this_max + 1, to = target, "consolidated");
                        written.extend(stamps);
                        break;
                    }
                    Ok(None) => {
                        warn!(doc_id = %key, lvl, attempt, "level moved during consolidation, recomputing");
                    }
                    Err(e) if e.is_retryable_conflict() => {
                        warn!(doc_id = %key, lvl, attempt, error = %e, "consolidation commit conflicted");
                    }
                    Err(e) => return Err(e),
                }

                if attempt >= self.config.transaction_attempts {
                    return Err(ReverieError::StoreConflict {
                        stream: Stream::Level(lvl).name(),
                        attempts: attempt,
                    });
                }
            }
        }

        Ok(written)
    }

    async fn window_items(&self, key: &SessionKey, stream: Stream, start: i64, end: i64) -> Result<Vec<WindowItem>> {
        match stream {
            Stream::Elements => {
                let rows = sqlx::query(
                    r#"
                    SELECT idx, timestamp, is_internal, payload, extra
                    FROM elements
                    WHERE doc_id = ? AND idx >= ? AND idx < ?
                    ORDER BY idx ASC
                    "#,
                )
                .bind(key.doc_id())
                .bind(start)
                .bind(end)
                .fetch_all(&self.pool)
                .await?;

                rows.iter()
                    .map(|r| row_to_element(r).map(WindowItem::Element))
                    .collect()
            }
            Stream::Level(lvl) => Ok(self
                .get_level(key, lvl, start, end)
                .await?
                .into_iter()
                .map(WindowItem::Consolidation)
                .collect()),
            other => Err(ReverieError::Validation(format!(
                "{} cannot feed a consolidation level",
                other.name()
            ))),
        }
    }

    /// Write a level's new indices if the level still ends at `expected_max`
    async fn commit_level(
        &self,
        key: &SessionKey,
        lvl: u32,
        expected_max: i64,
        outputs: &[(i64, ConsolidationOutput)],
    ) -> Result<Option<Vec<ConsolidationStamp>>> {
        let mut tx = self.pool.begin().await?;
        ensure_session(&mut tx, key).await?;

        let current = max_index(&mut tx, key, Stream::Level(lvl)).await?.unwrap_or(-1);
        if current != expected_max {
            tx.rollback().await?;
            return Ok(None);
        }

        let mut stamps = Vec::with_capacity(outputs.len());
        for (index, output) in outputs {
            let (millis, timestamp) = now_millis();
            let embedding = encode_embedding(output.consolidation.embedding())?;

            sqlx::query(
                r#"
                INSERT INTO consolidations (doc_id, lvl, idx, timestamp, summary, embedding, extra)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(key.doc_id())
            .bind(i64::from(lvl))
            .bind(*index)
            .bind(millis)
            .bind(output.consolidation.text())
            .bind(embedding.as_ref())
            .bind(serde_json::to_string(&output.extra)?)
            .execute(&mut *tx)
            .await?;

            stamps.push(ConsolidationStamp {
                lvl,
                index: *index,
                timestamp,
                extra: output.extra.clone(),
            });
        }

        tx.commit().await?;
        Ok(Some(stamps))
    }

    // ─── Imagination scheduling ───────────────────────────────────────────

    /// Current scheduled-imagination flag of a session
    pub async fn scheduled_imagination(&self, key: &SessionKey) -> Result<Option<DateTime<Utc>>> {
        let flag: Option<Option<i64>> =
            sqlx::query_scalar("SELECT scheduled_imagination FROM sessions WHERE doc_id = ?")
                .bind(key.doc_id())
                .fetch_optional(&self.pool)
                .await?;

        flag.flatten().map(from_millis).transpose()
    }

    /// Transactionally recompute the flag with `get_next(current)`, writing only on change.
    ///
    /// A pending flag is never replaced by a different due time.
    pub async fn schedule_imagination<F>(&self, key: &SessionKey, get_next: F) -> Result<Option<DateTime<Utc>>>
    where
        F: Fn(Option<DateTime<Utc>>) -> Option<DateTime<Utc>>,
    {
        let get_next = &get_next;
        self.transact(Stream::Schedule, || async move {
            let mut tx = self.pool.begin().await?;
            ensure_session(&mut tx, key).await?;

            let current: Option<i64> =
                sqlx::query_scalar("SELECT scheduled_imagination FROM sessions WHERE doc_id = ?")
                    .bind(key.doc_id())
                    .fetch_one(&mut *tx)
                    .await?;
            let current_at = current.map(from_millis).transpose()?;

            let mut next = get_next(current_at).map(|t| t.timestamp_millis());
            if current.is_some() && next.is_some() && next != current {
                warn!(doc_id = %key, "refusing to move a pending imagination");
                next = current;
            }

            if next != current {
                sqlx::query("UPDATE sessions SET scheduled_imagination = ? WHERE doc_id = ?")
                    .bind(next)
                    .bind(key.doc_id())
                    .execute(&mut *tx)
                    .await?;
            }

            tx.commit().await?;
            next.map(from_millis).transpose()
        })
        .await
    }

    /// Run `imagination_fn` for every session due at `ref_time`.
    ///
    /// Each session is claimed by clearing its flag only if it still holds the
    /// value seen by the sweep; sessions that changed underneath are skipped.
    /// A failed run puts the flag back (if nobody set a new one) so a later
    /// sweep retries it.
    pub async fn imagine<F, Fut>(&self, ref_time: DateTime<Utc>, imagination_fn: F) -> Result<ImagineReport>
    where
        F: Fn(SessionKey) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let rows = sqlx::query(
            r#"
            SELECT doc_id, user_id, session_id, scheduled_imagination
            FROM sessions
            WHERE scheduled_imagination IS NOT NULL AND scheduled_imagination <= ?
            ORDER BY scheduled_imagination ASC
            "#,
        )
        .bind(ref_time.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        let mut report = ImagineReport {
            due: rows.len(),
            ..Default::default()
        };

        for row in &rows {
            let doc_id: String = row.try_get("doc_id")?;
            let key = SessionKey::new(
                row.try_get::<String, _>("user_id")?,
                row.try_get::<String, _>("session_id")?,
            );
            let flag: i64 = row.try_get("scheduled_imagination")?;

            let claimed = sqlx::query(
                "UPDATE sessions SET scheduled_imagination = NULL WHERE doc_id = ? AND scheduled_imagination = ?",
            )
            .bind(&doc_id)
            .bind(flag)
            .execute(&self.pool)
            .await?
            .rows_affected()
                > 0;

            if !claimed {
                info!(doc_id = %doc_id, "imagination flag changed since sweep, skipping");
                report.skipped += 1;
                continue;
            }

            match imagination_fn(key).await {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    warn!(doc_id = %doc_id, error = %e, "imagination failed, restoring schedule");
                    sqlx::query(
                        "UPDATE sessions SET scheduled_imagination = ? WHERE doc_id = ? AND scheduled_imagination IS NULL",
                    )
                    .bind(flag)
                    .bind(&doc_id)
                    .execute(&self.pool)
                    .await?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Highest consolidation index computable from a previous level ending at `prev_max`
pub fn consolidation_target(prev_max: i64, size: i64, freq: i64) -> i64 {
    (prev_max - size + 1).div_euclid(freq)
}

fn top_n<T>(mut scored: Vec<(T, f32)>, n: usize) -> Vec<(T, f32)> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(n);
    scored
}

fn now_millis() -> (i64, DateTime<Utc>) {
    let millis = Utc::now().timestamp_millis();
    // Round-trip so callers see exactly what reads will return
    let timestamp = DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default();
    (millis, timestamp)
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| ReverieError::Parse(format!("timestamp out of range: {millis}")))
}

fn encode_embedding(embedding: Option<&[f32]>) -> Result<Option<Vec<u8>>> {
    embedding
        .map(|e| bincode::serialize(e).map_err(ReverieError::from))
        .transpose()
}

fn decode_embedding(bytes: Option<Vec<u8>>) -> Result<Option<Embedding>> {
    bytes
        .map(|b| bincode::deserialize::<Embedding>(&b).map_err(ReverieError::from))
        .transpose()
}

fn parse_extra(raw: &str) -> Result<Extra> {
    Ok(serde_json::from_str(raw)?)
}

async fn ensure_session(conn: &mut SqliteConnection, key: &SessionKey) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sessions (doc_id, user_id, session_id, scheduled_imagination, created_at)
        VALUES (?, ?, ?, NULL, ?)
        ON CONFLICT(doc_id) DO NOTHING
        "#,
    )
    .bind(key.doc_id())
    .bind(&key.user_id)
    .bind(&key.session_id)
    .bind(Utc::now().timestamp_millis())
    .execute(conn)
    .await?;
    Ok(())
}

async fn max_index(conn: &mut SqliteConnection, key: &SessionKey, stream: Stream) -> Result<Option<i64>> {
    let max: Option<i64> = match stream {
        Stream::Elements => {
            sqlx::query_scalar("SELECT MAX(idx) FROM elements WHERE doc_id = ?")
                .bind(key.doc_id())
                .fetch_one(conn)
                .await?
        }
        Stream::Actions(lvl) => {
            sqlx::query_scalar("SELECT MAX(idx) FROM actions WHERE doc_id = ? AND lvl = ?")
                .bind(key.doc_id())
                .bind(i64::from(lvl))
                .fetch_one(conn)
                .await?
        }
        Stream::Level(lvl) => {
            sqlx::query_scalar("SELECT MAX(idx) FROM consolidations WHERE doc_id = ? AND lvl = ?")
                .bind(key.doc_id())
                .bind(i64::from(lvl))
                .fetch_one(conn)
                .await?
        }
        Stream::Imaginations => {
            sqlx::query_scalar("SELECT MAX(idx) FROM imaginations WHERE doc_id = ?")
                .bind(key.doc_id())
                .fetch_one(conn)
                .await?
        }
        Stream::Schedule => {
            return Err(ReverieError::Validation(
                "the imagination schedule has no indices".into(),
            ))
        }
    };
    Ok(max)
}

async fn next_index(conn: &mut SqliteConnection, key: &SessionKey, stream: Stream) -> Result<i64> {
    Ok(max_index(conn, key, stream).await?.map_or(0, |max| max + 1))
}

fn row_to_element(row: &SqliteRow) -> Result<Element> {
    let payload: String = row.try_get("payload")?;
    let extra: String = row.try_get("extra")?;

    Ok(Element {
        index: row.try_get("idx")?,
        timestamp: from_millis(row.try_get("timestamp")?)?,
        is_internal: row.try_get("is_internal")?,
        payload: serde_json::from_str(&payload)?,
        extra: parse_extra(&extra)?,
    })
}

fn row_to_action(row: &SqliteRow) -> Result<Action> {
    let payload: String = row.try_get("payload")?;
    let extra: String = row.try_get("extra")?;
    let lvl: i64 = row.try_get("lvl")?;

    Ok(Action {
        index: row.try_get("idx")?,
        timestamp: from_millis(row.try_get("timestamp")?)?,
        lvl: lvl as u32,
        payload: serde_json::from_str(&payload)?,
        extra: parse_extra(&extra)?,
    })
}

fn row_to_consolidation(row: &SqliteRow) -> Result<Consolidation> {
    let lvl: i64 = row.try_get("lvl")?;
    let extra: String = row.try_get("extra")?;

    Ok(Consolidation {
        stream: LongTermStream::Level(lvl as u32),
        index: row.try_get("idx")?,
        timestamp: from_millis(row.try_get("timestamp")?)?,
        consolidation: ConsolidationBody::summary(
            row.try_get::<String, _>("summary")?,
            decode_embedding(row.try_get("embedding")?)?,
        ),
        extra: parse_extra(&extra)?,
    })
}

fn row_to_imagination(row: &SqliteRow) -> Result<Consolidation> {
    let extra: String = row.try_get("extra")?;

    Ok(Consolidation {
        stream: LongTermStream::Imagination,
        index: row.try_get("idx")?,
        timestamp: from_millis(row.try_get("timestamp")?)?,
        consolidation: ConsolidationBody::imagination(
            row.try_get::<String, _>("imagination")?,
            decode_embedding(row.try_get("embedding")?)?,
        ),
        extra: parse_extra(&extra)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActionKind;
    use chrono::Duration as ChronoDuration;
    use futures::future::join_all;
    use serde_json::json;

    fn session() -> SessionKey {
        SessionKey::new("user", "s1")
    }

    fn small_config() -> MemoryConfig {
        MemoryConfig {
            base_size: 10,
            base_freq: 5,
            higher_size: 3,
            higher_freq: 2,
            max_lvl: 2,
            ..MemoryConfig::default()
        }
    }

    async fn fill(store: &MemoryStore, key: &SessionKey, n: usize) {
        for i in 0..n {
            let payload = ElementPayload::exchange(format!("q{i}"), format!("r{i}"));
            store.append_element(key, &payload, &Extra::new(), false).await.unwrap();
        }
    }

    /// Summarizer that records which previous-level indices it saw
    async fn window_summary(req: ConsolidationRequest) -> Result<ConsolidationOutput> {
        let first = req.window.first().map(|w| w.index()).unwrap_or(-1);
        let last = req.window.last().map(|w| w.index()).unwrap_or(-1);
        let mut extra = Extra::new();
        extra.insert("first".into(), json!(first));
        extra.insert("last".into(), json!(last));
        Ok(ConsolidationOutput {
            consolidation: ConsolidationBody::summary(
                format!("lvl{} idx{} [{first}..{last}]", req.lvl, req.index),
                Some(vec![1.0, 0.0]),
            ),
            extra,
            pass_on: None,
        })
    }

    async fn all_levels(store: &MemoryStore, key: &SessionKey) -> Vec<(u32, i64, String)> {
        let mut out = Vec::new();
        for lvl in 0..store.config().max_lvl {
            for c in store.get_level(key, lvl, 0, i64::MAX).await.unwrap() {
                out.push((lvl, c.index, c.consolidation.text().to_string()));
            }
        }
        out
    }

    #[tokio::test]
    async fn concurrent_appends_are_gap_free() {
        let store = MemoryStore::connect_in_memory(MemoryConfig::default()).await.unwrap();
        let key = session();

        let appends = (0..20).map(|i| {
            let store = Arc::clone(&store);
            let key = key.clone();
            async move {
                let payload = ElementPayload::exchange(format!("q{i}"), "r");
                store.append_element(&key, &payload, &Extra::new(), false).await.unwrap()
            }
        });
        let mut indices: Vec<i64> = join_all(appends).await.iter().map(|s| s.index).collect();
        indices.sort();
        assert_eq!(indices, (0..20).collect::<Vec<_>>());

        for lvl in [0u32, 1] {
            for _ in 0..3 {
                let payload = ActionPayload {
                    kind: ActionKind::Think,
                    query: Some("why".into()),
                    note: None,
                    result: "because".into(),
                };
                store.append_action(&key, lvl, &payload, &Extra::new()).await.unwrap();
            }
            let actions = store.get_actions(&key, lvl, 10).await.unwrap();
            assert_eq!(actions.iter().map(|a| a.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        }
    }

    #[tokio::test]
    async fn concurrent_appends_on_file_store_are_gap_free() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::connect(dir.path().join("memory.db"), MemoryConfig::default())
            .await
            .unwrap();
        let key = session();

        let appends = (0..16).map(|_| {
            let store = Arc::clone(&store);
            let key = key.clone();
            async move {
                store
                    .append_imagination(&key, &ConsolidationBody::imagination("i", None), &Extra::new())
                    .await
                    .unwrap()
                    .index
            }
        });
        let mut indices: Vec<i64> = join_all(appends).await;
        indices.sort();
        assert_eq!(indices, (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn pinpoint_offsets_count_from_newest() {
        let store = MemoryStore::connect_in_memory(MemoryConfig::default()).await.unwrap();
        let key = session();

        store
            .append_element(&key, &ElementPayload::exchange("first", "a"), &Extra::new(), false)
            .await
            .unwrap();
        let hit = store.get_pinpoint(&key, Pinpoint::Element { offset: 0 }).await.unwrap();
        assert!(matches!(hit, Some(Pinpointed::Element(e)) if e.payload.query == "first"));

        store
            .append_element(&key, &ElementPayload::exchange("second", "b"), &Extra::new(), false)
            .await
            .unwrap();
        let hit = store.get_pinpoint(&key, Pinpoint::Element { offset: 0 }).await.unwrap();
        assert!(matches!(hit, Some(Pinpointed::Element(e)) if e.payload.query == "second"));

        assert!(store
            .get_pinpoint(&key, Pinpoint::Element { offset: 2 })
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_pinpoint(&key, Pinpoint::Action { lvl: 0, index: 0 })
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn history_skips_internal_elements() {
        let store = MemoryStore::connect_in_memory(MemoryConfig::default()).await.unwrap();
        let key = session();

        for (i, internal) in [false, true, false, false].into_iter().enumerate() {
            let payload = ElementPayload::exchange(format!("q{i}"), "r");
            store.append_element(&key, &payload, &Extra::new(), internal).await.unwrap();
        }

        let history = store.get_history(&key, 0, 10).await.unwrap();
        assert_eq!(history.iter().map(|e| e.index).collect::<Vec<_>>(), vec![0, 2, 3]);

        let window = store.get_history(&key, 1, 1).await.unwrap();
        assert_eq!(window[0].index, 2);

        let latest = store.get_latest(&key, 2).await.unwrap();
        assert_eq!(latest.latest_index, Some(3));
        assert_eq!(latest.elements.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn short_term_search_respects_lookback_and_limit() {
        let config = MemoryConfig {
            short_term_lookback: 5,
            ..MemoryConfig::default()
        };
        let store = MemoryStore::connect_in_memory(config).await.unwrap();
        let key = session();
        fill(&store, &key, 12).await;

        // Older elements score higher, so the lookback is what bounds the result
        let results = store
            .short_term_search(&key, |e, _, _| 100.0 - e.index as f32, 3)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(e, _)| e.index >= 7));
        assert!(results.windows(2).all(|w| w[0].1 >= w[1].1));
        assert_eq!(results[0].0.index, 7);
    }

    #[tokio::test]
    async fn long_term_search_covers_levels_and_imaginations() {
        let store = MemoryStore::connect_in_memory(small_config()).await.unwrap();
        let key = session();
        fill(&store, &key, 15).await;
        store.consolidate(&key, window_summary).await.unwrap();
        store
            .append_imagination(&key, &ConsolidationBody::imagination("dream", None), &Extra::new())
            .await
            .unwrap();

        let results = store
            .long_term_search(
                &key,
                |scan, item| {
                    assert_eq!(scan.len(), 4);
                    match item.stream {
                        LongTermStream::Imagination => 10.0,
                        LongTermStream::Level(lvl) => lvl as f32 + item.index as f32 / 10.0,
                    }
                },
                2,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.stream, LongTermStream::Imagination);
        assert_eq!(results[1].0.stream, LongTermStream::Level(1));
    }

    #[tokio::test]
    async fn consolidation_catches_up_with_backlog() {
        let config = MemoryConfig {
            max_lvl: 1,
            ..small_config()
        };
        let store = MemoryStore::connect_in_memory(config).await.unwrap();
        let key = session();
        fill(&store, &key, 37).await;

        let written = store.consolidate(&key, window_summary).await.unwrap();
        assert_eq!(written.iter().map(|s| s.index).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);

        let level = store.get_level(&key, 0, 0, 100).await.unwrap();
        assert_eq!(level[5].extra["first"], json!(25));
        assert_eq!(level[5].extra["last"], json!(34));

        let again = store.consolidate(&key, window_summary).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn consolidation_is_independent_of_call_frequency() {
        let eager = MemoryStore::connect_in_memory(small_config()).await.unwrap();
        let lazy = MemoryStore::connect_in_memory(small_config()).await.unwrap();
        let key = session();

        for i in 0..41 {
            let payload = ElementPayload::exchange(format!("q{i}"), format!("r{i}"));
            eager.append_element(&key, &payload, &Extra::new(), false).await.unwrap();
            eager.consolidate(&key, window_summary).await.unwrap();
        }
        fill(&lazy, &key, 41).await;
        lazy.consolidate(&key, window_summary).await.unwrap();

        let eager_levels = all_levels(&eager, &key).await;
        assert_eq!(eager_levels, all_levels(&lazy, &key).await);
        // 41 elements: level 0 reaches index 6, level 1 covers [0..2], [2..4], [4..6]
        assert_eq!(eager_levels.iter().filter(|(lvl, _, _)| *lvl == 0).count(), 7);
        assert_eq!(eager_levels.iter().filter(|(lvl, _, _)| *lvl == 1).count(), 3);
    }

    #[tokio::test]
    async fn consolidation_with_too_few_elements_writes_nothing() {
        let store = MemoryStore::connect_in_memory(small_config()).await.unwrap();
        let key = session();
        fill(&store, &key, 9).await;
        assert!(store.consolidate(&key, window_summary).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn consolidation_threads_pass_on_within_a_level() {
        let config = MemoryConfig {
            max_lvl: 1,
            ..small_config()
        };
        let store = MemoryStore::connect_in_memory(config).await.unwrap();
        let key = session();
        fill(&store, &key, 20).await;

        let seen = std::sync::Mutex::new(Vec::new());
        store
            .consolidate(&key, |req| {
                seen.lock().unwrap().push(req.pass_on.clone());
                async move {
                    Ok(ConsolidationOutput {
                        consolidation: ConsolidationBody::summary("s", None),
                        extra: Extra::new(),
                        pass_on: Some(json!(req.index)),
                    })
                }
            })
            .await
            .unwrap();

        assert_eq!(
            seen.into_inner().unwrap(),
            vec![None, Some(json!(0)), Some(json!(1))]
        );
    }

    #[tokio::test]
    async fn consolidation_failure_writes_nothing_for_the_level() {
        let store = MemoryStore::connect_in_memory(small_config()).await.unwrap();
        let key = session();
        fill(&store, &key, 20).await;

        let result = store
            .consolidate(&key, |req| async move {
                if req.index == 2 {
                    Err(ReverieError::Validation("summarizer down".into()))
                } else {
                    window_summary(req).await
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.latest_level_index(&key, 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn schedule_only_moves_between_null_and_due() {
        let store = MemoryStore::connect_in_memory(MemoryConfig::default()).await.unwrap();
        let key = session();
        let due = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();
        let other = due + ChronoDuration::hours(1);

        let set = store.schedule_imagination(&key, |_| Some(due)).await.unwrap();
        assert_eq!(set, Some(due));

        let kept = store.schedule_imagination(&key, |_| Some(other)).await.unwrap();
        assert_eq!(kept, Some(due));
        assert_eq!(store.scheduled_imagination(&key).await.unwrap(), Some(due));
    }

    #[tokio::test]
    async fn imagine_claims_due_sessions_once() {
        let store = MemoryStore::connect_in_memory(MemoryConfig::default()).await.unwrap();
        let due_key = SessionKey::new("user", "due");
        let later_key = SessionKey::new("user", "later");
        let now = Utc::now();

        store
            .schedule_imagination(&due_key, |_| Some(now - ChronoDuration::minutes(1)))
            .await
            .unwrap();
        store
            .schedule_imagination(&later_key, |_| Some(now + ChronoDuration::hours(1)))
            .await
            .unwrap();

        let ran = std::sync::Mutex::new(Vec::new());
        let report = store
            .imagine(now, |key| {
                ran.lock().unwrap().push(key.doc_id());
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(ran.into_inner().unwrap(), vec!["user_due".to_string()]);
        assert_eq!(store.scheduled_imagination(&due_key).await.unwrap(), None);
        assert!(store.scheduled_imagination(&later_key).await.unwrap().is_some());

        let second = store.imagine(now, |_| async { Ok(()) }).await.unwrap();
        assert_eq!(second.due, 0);
    }

    #[tokio::test]
    async fn failed_imagination_restores_the_flag() {
        let store = MemoryStore::connect_in_memory(MemoryConfig::default()).await.unwrap();
        let key = session();
        let due = Utc::now() - ChronoDuration::minutes(5);
        store.schedule_imagination(&key, |_| Some(due)).await.unwrap();

        let report = store
            .imagine(Utc::now(), |_| async {
                Err(ReverieError::Validation("no partners".into()))
            })
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert!(store.scheduled_imagination(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn flag_changed_mid_sweep_is_skipped_and_kept() {
        let store = MemoryStore::connect_in_memory(MemoryConfig::default()).await.unwrap();
        let first = SessionKey::new("user", "first");
        let second = SessionKey::new("user", "second");
        let now = Utc::now();
        let first_due = now - ChronoDuration::minutes(10);
        let second_due = now - ChronoDuration::minutes(5);
        let moved = (now + ChronoDuration::hours(2)).timestamp_millis();

        store.schedule_imagination(&first, |_| Some(first_due)).await.unwrap();
        store.schedule_imagination(&second, |_| Some(second_due)).await.unwrap();

        let pool = store.pool().clone();
        let second_doc = second.doc_id();
        let ran = std::sync::Mutex::new(Vec::new());
        let report = store
            .imagine(now, |key| {
                ran.lock().unwrap().push(key.doc_id());
                let pool = pool.clone();
                let second_doc = second_doc.clone();
                async move {
                    // Another writer reschedules the second session before its claim
                    sqlx::query("UPDATE sessions SET scheduled_imagination = ? WHERE doc_id = ?")
                        .bind(moved)
                        .bind(&second_doc)
                        .execute(&pool)
                        .await?;
                    Ok::<_, ReverieError>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(report.due, 2);
        assert_eq!(report.processed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(ran.into_inner().unwrap(), vec!["user_first".to_string()]);
        assert_eq!(
            store.scheduled_imagination(&second).await.unwrap().map(|t| t.timestamp_millis()),
            Some(moved)
        );
        assert_eq!(store.scheduled_imagination(&first).await.unwrap(), None);
    }

    #[tokio::test]
    async fn schedule_conflicts_name_the_schedule() {
        let config = MemoryConfig {
            transaction_attempts: 2,
            ..MemoryConfig::default()
        };
        let store = MemoryStore::connect_in_memory(config).await.unwrap();
        let key = session();
        store.schedule_imagination(&key, |_| None).await.unwrap();

        // Re-inserting an existing session is a unique violation on every attempt
        let result: Result<()> = store
            .transact(Stream::Schedule, || async {
                sqlx::query(
                    "INSERT INTO sessions (doc_id, user_id, session_id, scheduled_imagination, created_at) VALUES (?, ?, ?, NULL, 0)",
                )
                .bind(key.doc_id())
                .bind(&key.user_id)
                .bind(&key.session_id)
                .execute(store.pool())
                .await?;
                Ok::<_, ReverieError>(())
            })
            .await;

        match result {
            Err(ReverieError::StoreConflict { stream, attempts }) => {
                assert_eq!(stream, "imagination schedule");
                assert_eq!(attempts, 2);
            }
            other => panic!("expected a store conflict, got {other:?}"),
        }
    }

    #[test]
    fn target_uses_floor_division() {
        assert_eq!(consolidation_target(36, 10, 5), 5);
        assert_eq!(consolidation_target(9, 10, 5), 0);
        assert_eq!(consolidation_target(8, 10, 5), -1);
        assert_eq!(consolidation_target(-1, 10, 5), -2);
    }
}
