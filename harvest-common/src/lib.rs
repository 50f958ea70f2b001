pub mod backoff;
pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod dedup;
pub mod health;
pub mod metrics;
pub mod pgqueue;
pub mod queue;
pub mod records;
pub mod shutdown;
pub mod storage;
pub mod upstream;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
