//! Transport error types.

use thiserror::Error;

/// Specialized Result type for transport operations.
pub type Result<T> = std::result::Result<T, IpcError>;

/// Errors raised by the shared-memory transport.
#[derive(Error, Debug)]
pub enum IpcError {
    /// Segment creation, mapping, or kernel-event setup failed. Fatal.
    #[error("ipc init failed for '{name}': {source}")]
    Init {
        /// Resource being initialized.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A producer spun out waiting for a free slot; the ring is full.
    #[error("timed out waiting for a free slot (request {request_id}); consumer stuck or ring full")]
    SlotTimeout {
        /// Request the producer was trying to publish.
        request_id: u64,
    },

    /// The bulk segment could not satisfy an allocation.
    #[error("bulk segment exhausted: requested {requested} bytes")]
    BulkExhausted {
        /// Bytes requested.
        requested: usize,
    },

    /// A bounded wire field cannot hold the supplied value.
    #[error("{field} exceeds wire capacity ({len} > {max})")]
    FieldTooLarge {
        /// Field name.
        field: &'static str,
        /// Supplied length.
        len: usize,
        /// Wire capacity.
        max: usize,
    },

    /// The request failed parameter validation before submission.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] pageflow_core::Error),

    /// The process-scope client handle was used before `client::init`.
    #[error("ipc client not initialized")]
    NotInitialized,

    /// Everything else the OS can throw at us.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IpcError {
    pub(crate) fn init(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Init {
            name: name.into(),
            source,
        }
    }

    pub(crate) fn last_os_error(name: impl Into<String>) -> Self {
        Self::init(name, std::io::Error::last_os_error())
    }
}
