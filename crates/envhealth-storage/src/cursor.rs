use chrono::Utc;
use tracing::debug;

use crate::{Store, StoreError};

/// Cursor value of a source nothing has been consumed from yet.
pub const UNCONSUMED: i64 = -1;

/// Positions to visit on the next walk plus the index the cursor lands on afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorPlan {
    pub indices: Vec<usize>,
    pub advanced_to: usize,
}

/// Plan a circular walk over a list of `len` items starting just after `last_index`.
///
/// At most `batch_size` items are selected and no position is visited twice. The cursor
/// lands on the last *visited* position, so a run whose items all turn out to be duplicates
/// still moves forward. Returns `None` when there is nothing to walk.
pub fn plan_batch(last_index: i64, len: usize, batch_size: usize) -> Option<CursorPlan> {
    if batch_size == 0 {
        return None;
    }
    let mut walk = CursorWalk::new(last_index, len)?;
    let indices: Vec<usize> = std::iter::from_fn(|| walk.next_index())
        .take(batch_size)
        .collect();
    let advanced_to = walk.last_visited()?;
    Some(CursorPlan {
        indices,
        advanced_to,
    })
}

/// Circular walk that hands out positions one at a time, so the caller decides how far to
/// go. A position only counts toward the batch once the caller says it was processed; the
/// walk itself stops after every position has been visited once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorWalk {
    start: usize,
    len: usize,
    visited: usize,
}

impl CursorWalk {
    /// Start just after `last_index`. `None` for an empty list.
    pub fn new(last_index: i64, len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        Some(Self {
            start: (last_index + 1).rem_euclid(len as i64) as usize,
            len,
            visited: 0,
        })
    }

    pub fn next_index(&mut self) -> Option<usize> {
        if self.visited == self.len {
            return None;
        }
        let index = (self.start + self.visited) % self.len;
        self.visited += 1;
        Some(index)
    }

    pub fn visited(&self) -> usize {
        self.visited
    }

    /// Index to persist: the last position handed out, `None` before the first one.
    pub fn last_visited(&self) -> Option<usize> {
        self.visited
            .checked_sub(1)
            .map(|offset| (self.start + offset) % self.len)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch<'a, T> {
    pub items: Vec<&'a T>,
    /// Index persisted (or to be persisted) for the source; `None` when the cursor stays put.
    pub advanced_to: Option<usize>,
}

impl<T> Batch<'_, T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Store {
    /// Open an incremental walk over `len` items from the persisted cursor of `source`.
    /// Commit [`CursorWalk::last_visited`] with [`Store::commit_cursor`] when done.
    pub async fn open_walk(&self, source: &str, len: usize) -> Result<Option<CursorWalk>, StoreError> {
        let last_index = self.cursor_position(source).await?;
        Ok(CursorWalk::new(last_index, len))
    }

    pub async fn cursor_position(&self, source: &str) -> Result<i64, StoreError> {
        let last: Option<i64> =
            sqlx::query_scalar("SELECT last_index FROM ingestion_cursors WHERE source = ?1")
                .bind(source)
                .fetch_optional(&self.pool)
                .await?;
        Ok(last.unwrap_or(UNCONSUMED))
    }

    pub async fn commit_cursor(&self, source: &str, index: usize) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ingestion_cursors (source, last_index, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (source) DO UPDATE
             SET last_index = excluded.last_index, updated_at = excluded.updated_at",
        )
        .bind(source)
        .bind(index as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        debug!(source, index, "persisted ingestion cursor");
        Ok(())
    }

    /// Select the next batch without moving the cursor. Pair with [`Store::commit_cursor`]
    /// once the batch has been processed.
    pub async fn plan_next_batch<'a, T>(
        &self,
        source: &str,
        items: &'a [T],
        batch_size: usize,
    ) -> Result<Batch<'a, T>, StoreError> {
        let last_index = self.cursor_position(source).await?;
        Ok(match plan_batch(last_index, items.len(), batch_size) {
            Some(plan) => Batch {
                items: plan.indices.iter().map(|&i| &items[i]).collect(),
                advanced_to: Some(plan.advanced_to),
            },
            None => Batch {
                items: Vec::new(),
                advanced_to: None,
            },
        })
    }

    /// Select the next batch and persist the advanced cursor in one step.
    pub async fn next_batch<'a, T>(
        &self,
        source: &str,
        items: &'a [T],
        batch_size: usize,
    ) -> Result<Batch<'a, T>, StoreError> {
        let batch = self.plan_next_batch(source, items, batch_size).await?;
        if let Some(index) = batch.advanced_to {
            self.commit_cursor(source, index).await?;
        }
        Ok(batch)
    }
}
