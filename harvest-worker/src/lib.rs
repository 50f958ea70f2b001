pub mod config;
pub mod detail;
pub mod error;
pub mod lookup;
pub mod profile;
pub mod worker;
