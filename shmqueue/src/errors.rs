use shared_memory::ShmemError;
use thiserror::Error;

/// Setup failures. Once a queue is open, nothing it does returns an error:
/// a full ring, an empty ring and a recovered corruption are plain
/// `bool`/`Option` results.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid queue config: {0}")]
    Config(String),

    #[error("failed to create shared memory {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: ShmemError,
    },

    #[error("failed to open shared memory {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: ShmemError,
    },

    #[error("failed to size shared memory {name} to {size} bytes: {source}")]
    Resize {
        name: String,
        size: usize,
        #[source]
        source: ShmemError,
    },

    #[error("shared memory {name} has an unusable layout: {reason}")]
    Layout { name: String, reason: String },
}

impl QueueError {
    /// Sorts a `shared_memory` failure on the create path into the sizing
    /// bucket or the generic create bucket.
    pub(crate) fn on_create(name: &str, size: usize, source: ShmemError) -> Self {
        match source {
            ShmemError::MapSizeZero | ShmemError::UnknownOsError(_) => QueueError::Resize {
                name: name.to_string(),
                size,
                source,
            },
            source => QueueError::Create {
                name: name.to_string(),
                source,
            },
        }
    }

    pub(crate) fn on_open(name: &str, source: ShmemError) -> Self {
        QueueError::Open {
            name: name.to_string(),
            source,
        }
    }

    pub(crate) fn layout<S: Into<String>>(name: &str, reason: S) -> Self {
        QueueError::Layout {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}
