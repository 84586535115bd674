//! Engine error types

use stori_core::{CoreError, TrackId};
use thiserror::Error;

use crate::plugin::PluginSlotId;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Unknown track: {0}")]
    UnknownTrack(TrackId),

    #[error("Track already exists: {0}")]
    DuplicateTrack(TrackId),

    #[error("Unknown plugin slot {1:?} on {0}")]
    UnknownPluginSlot(TrackId, PluginSlotId),

    #[error("Graph is unstable, mutation refused")]
    GraphUnstable,

    #[error("Plugin install already in progress")]
    PluginInstallInProgress,

    #[error("Stale generation {captured} (current {current})")]
    StaleGeneration { captured: u64, current: u64 },

    #[error("Render engine error: {0}")]
    Render(String),

    #[error("Render engine not running after {0} attempts")]
    EngineNotRunning(u32),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
