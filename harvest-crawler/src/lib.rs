pub mod config;
pub mod crawl;
pub mod search;
