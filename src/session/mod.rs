//! Client and connection session types (components E and F).

pub mod client;
pub mod connection;

pub use client::ClientSession;
pub use connection::{ConnectionSession, TimeConfig};
