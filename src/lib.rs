pub mod config;
pub mod control;
pub mod db;
pub mod discord;
mod error;
pub mod gallery;
pub mod http;
pub mod ledger;
pub mod library;
pub mod media;
pub mod naming;
pub mod paths;
pub mod proxies;
pub mod proxy_pool;
pub mod scraper;
pub mod state;
pub mod status;

pub use error::{EngineError, Result};
