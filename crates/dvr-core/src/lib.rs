pub mod config;
pub mod types;

pub use config::DvrConfig;
pub use types::*;
