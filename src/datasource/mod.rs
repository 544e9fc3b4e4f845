//! The `DataSource` abstraction (component B): enumerates replayable tables
//! and hands the replay orchestrator a time-ordered async batch iterator,
//! filtered by a symbol set. Concrete backends (relational databases,
//! column-oriented files) are out of scope per spec §1 — this module only
//! defines the collaborator interface and the batch/row types every other
//! subsystem is built against.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RouterError;
use crate::timeutil::EpochUnit;

/// Advertised metadata for one replayable table. `epoch_unit` is the unit a
/// `replay` request against this table must encode its `from`/`to` bounds
/// in (component A, spec §2/§6: "timestamps on the wire are always integers
/// ... in the unit declared by the table").
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub name: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub end_time: DateTime<Utc>,
    pub epoch_unit: EpochUnit,
}

/// A top-of-book quote or an OHLC bar. Distinguished at the boundary by an
/// explicit tag rather than the duck-typed "does `open` exist?" check the
/// untyped source uses (spec §9) — the broker's matching pass dispatches on
/// this tag instead of probing for field presence.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MarketRow {
    Quote {
        price: f64,
        bid: Option<f64>,
        ask: Option<f64>,
        volume: Option<f64>,
    },
    Bar {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: Option<f64>,
    },
}

impl MarketRow {
    /// The price used to mark-to-market positions when the row is not
    /// consumed by the matching pass (the shared snapshot, §4.2).
    pub fn mark_price(&self) -> f64 {
        match self {
            MarketRow::Quote { price, .. } => *price,
            MarketRow::Bar { close, .. } => *close,
        }
    }
}

/// One row plus the symbol it refers to, resolved to a concrete string once
/// at the edges of the replay loop so the hot path can move small, `Copy`
/// rows around.
#[derive(Clone, Debug, Serialize)]
pub struct SymbolRow {
    pub symbol: String,
    pub row: MarketRow,
}

/// All rows sharing one distinct epoch in the replay table (the "replay
/// batch" of the glossary).
#[derive(Clone, Debug)]
pub struct Batch {
    pub timestamp: DateTime<Utc>,
    pub rows: Vec<SymbolRow>,
}

/// An open replay stream over one table. `next_batch` yields strictly
/// non-decreasing timestamps; `close` releases backing resources
/// (connection pool handles, file descriptors) and must be safe to call
/// more than once.
#[async_trait]
pub trait BatchIterator: Send {
    async fn next_batch(&mut self) -> Result<Option<Batch>, RouterError>;

    async fn close(&mut self);
}

/// The external collaborator interface. Backing stores are shared across
/// connections (§5) and so implementations must be `Send + Sync`.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn enumerate_tables(&self) -> Result<Vec<TableInfo>, RouterError>;

    /// Opens an iterator scoped to `(table, from, to, symbols)`. An empty
    /// `symbols` set means "no filter" (spec §4.4 step 2).
    async fn open(
        &self,
        table: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        symbols: &BTreeSet<String>,
    ) -> Result<Box<dyn BatchIterator>, RouterError>;
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// An in-memory `DataSource` test double standing in for the external
    /// collaborator. Not part of the public API.
    pub struct InMemoryDataSource {
        pub tables: Vec<TableInfo>,
        pub batches: Vec<Batch>,
    }

    struct InMemoryIterator {
        remaining: Mutex<VecDeque<Batch>>,
    }

    #[async_trait]
    impl BatchIterator for InMemoryIterator {
        async fn next_batch(&mut self) -> Result<Option<Batch>, RouterError> {
            Ok(self.remaining.get_mut().pop_front())
        }

        async fn close(&mut self) {
            self.remaining.get_mut().clear();
        }
    }

    #[async_trait]
    impl DataSource for InMemoryDataSource {
        async fn enumerate_tables(&self) -> Result<Vec<TableInfo>, RouterError> {
            Ok(self.tables.clone())
        }

        async fn open(
            &self,
            _table: &str,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
            symbols: &BTreeSet<String>,
        ) -> Result<Box<dyn BatchIterator>, RouterError> {
            let filtered = self
                .batches
                .iter()
                .map(|batch| {
                    let rows = if symbols.is_empty() {
                        batch.rows.clone()
                    } else {
                        batch
                            .rows
                            .iter()
                            .filter(|r| symbols.contains(&r.symbol))
                            .cloned()
                            .collect()
                    };
                    Batch {
                        timestamp: batch.timestamp,
                        rows,
                    }
                })
                .collect::<VecDeque<_>>();
            Ok(Box::new(InMemoryIterator {
                remaining: Mutex::new(filtered),
            }))
        }
    }
}
