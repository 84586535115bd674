//! stori-core: Shared value types for the Stori coordination core
//!
//! Timing values, track/project records, configuration and the core error
//! type used by `stori-engine`.

mod config;
mod error;
mod time;
mod track;

pub use config::*;
pub use error::*;
pub use time::*;
pub use track::*;
