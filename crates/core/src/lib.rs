#![forbid(unsafe_code)]

//! Contract types and pure scheduling logic for the scan broker.

pub mod api;
pub mod derive;
pub mod hours;
pub mod model;
pub mod nmap;
pub mod results;
pub mod sanitize;

mod util;

pub use util::{from_ms, now_ms, Clock, EpochMs, FixedClock, SystemClock};

/// Separator used when list values are stored in a single column.
pub const LIST_SEPARATOR: &str = ",";
