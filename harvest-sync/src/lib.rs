pub mod config;
pub mod materialize;
