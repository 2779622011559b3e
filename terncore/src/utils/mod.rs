//! Selector helpers: query-parameter and time-range parsing.

pub mod query_params;
pub mod time_range;

pub use query_params::{query_params, QueryParams};
pub use time_range::{TimeBound, TimeRange};
