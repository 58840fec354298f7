#![forbid(unsafe_code)]

//! Scan broker: hands scan tasks to agents, persists their results into the
//! per-scope stores and keeps the manager informed.

pub mod agents;
pub mod api;
pub mod background;
pub mod cache;
pub mod config;
pub mod cycle;
pub mod db;
pub mod error;
pub mod locks;
pub mod manager;
pub mod service;

pub use service::{Broker, BrokerOptions};
