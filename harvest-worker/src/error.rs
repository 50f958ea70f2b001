use thiserror::Error;

use harvest_common::buffer::FlushError;

/// Errors that end a stage worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker {worker} could not store {unsaved} buffered records on exit: {error}")]
    FinalFlush {
        worker: String,
        unsaved: usize,
        error: FlushError,
    },
}
