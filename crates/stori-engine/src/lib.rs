//! stori-engine: Real-time coordination core
//!
//! Sits between the control thread and the render callback:
//! - Transport clock with lock-free position reads and cycle looping
//! - Graph mutation coordinator (snapshot-gated, debounced rebuilds)
//! - Plugin delay compensation
//! - Recording buffer pool with bounded overflow
//! - Generation-tagged project load state machine
//! - Error/health tracking and diagnostics
//!
//! ## Threading
//! ```text
//!   control thread ──► Transport / GraphCoordinator / ProjectLoader
//!                                  │ RT cells (try-read)
//!   render callback ◄──────────────┘  RenderView, BufferPool
//! ```

mod clock;
mod context;
mod diagnostics;
mod engine;
mod error;
mod graph;
mod health;
mod load;
mod pdc;
mod plugin;
mod priority;
mod publisher;
mod recording;
mod render;
mod rt;
mod timer;
mod transport;

#[cfg(test)]
mod test_support;

pub use clock::*;
pub use context::*;
pub use diagnostics::*;
pub use engine::*;
pub use error::*;
pub use graph::*;
pub use health::*;
pub use load::*;
pub use pdc::*;
pub use plugin::*;
pub use priority::*;
pub use publisher::*;
pub use recording::*;
pub use render::*;
pub use rt::*;
pub use timer::*;
pub use transport::*;
