//! Ratekeeper Common Types
//!
//! Value types shared by the rate engine and its callers: currency codes,
//! currency pairs, checked amount conversion with the subunit rounding policy, and
//! the calendar clock used to decide how "recent" a date is.

pub mod currency;
pub mod monetary;
pub mod error;
pub mod time;

pub use currency::*;
pub use monetary::*;
pub use error::*;
pub use time::*;
