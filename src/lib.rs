//! # backtest-server
//!
//! A multiplexed backtest simulation server: one transport, many logical
//! clients, each replaying historical market data against its own broker
//! and metrics engine in event time. Built around a request/response/event
//! envelope protocol (component H) dispatched against per-connection
//! session state (components E, F), with a single long-running `replay`
//! method (component G) driving a pluggable `DataSource` (component B).
//!
//! ## Key features
//! - FIFO lot-based position accounting with configurable commission and
//!   slippage models.
//! - Online Sharpe/Sortino/drawdown/win-rate estimators, reported
//!   periodically, per trade, and at end of day.
//! - A fixed method-routing table with one connection-scoped long-running
//!   operation (`replay`) that interleaves with every other client-scoped
//!   request on the same transport.

/// Error codes and the router's internal error type.
pub mod error;

/// Epoch/timezone conversions (component A).
pub mod timeutil;

/// The `DataSource`/`BatchIterator` collaborator interface (component B).
pub mod datasource;

/// Order matching, position accounting, and broker configuration
/// (component C).
pub mod broker;

/// The online metrics engine (component D).
pub mod metrics;

/// Client and connection session state (components E, F).
pub mod session;

/// Wire protocol envelopes and per-method params (component H).
pub mod protocol;

/// Request handlers (component I).
pub mod handlers;

/// The method router (component H dispatch).
pub mod router;

/// The `replay` orchestrator (component G).
pub mod replay;
