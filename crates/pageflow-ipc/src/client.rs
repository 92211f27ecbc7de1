//! Process-scope client handle.
//!
//! Foreign-language bindings want a single transport instance per process
//! rather than objects to thread through. This module owns that instance
//! behind a process lock: `init` once, then every entry point works or
//! reports [`IpcError::NotInitialized`].

use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{IpcError, Result};
use crate::manager::IpcConfig;
use crate::request::{RequestWriter, SubmitRequest};
use crate::response::{ResponseDelta, ResponseReader};

struct ClientHandle {
    writer: RequestWriter,
    reader: ResponseReader,
}

static CLIENT: Mutex<Option<ClientHandle>> = Mutex::new(None);

/// Connect this process to a running engine's rings. Idempotent re-init
/// replaces the previous handle.
pub fn init(config: &IpcConfig) -> Result<()> {
    let writer = RequestWriter::open(config, None)?;
    let reader = ResponseReader::open(config)?;
    *CLIENT.lock() = Some(ClientHandle { writer, reader });
    Ok(())
}

/// Drop the process's transport handle.
pub fn shutdown() {
    *CLIENT.lock() = None;
}

/// True once [`init`] has succeeded.
pub fn is_initialized() -> bool {
    CLIENT.lock().is_some()
}

/// Submit a request through the process handle.
pub fn submit(request: &SubmitRequest) -> Result<()> {
    let guard = CLIENT.lock();
    let client = guard.as_ref().ok_or(IpcError::NotInitialized)?;
    client.writer.submit(request)
}

/// Poll for the next response delta through the process handle.
pub fn next_delta(timeout: Duration) -> Result<Option<ResponseDelta>> {
    let guard = CLIENT.lock();
    let client = guard.as_ref().ok_or(IpcError::NotInitialized)?;
    Ok(client.reader.next_delta(timeout))
}
