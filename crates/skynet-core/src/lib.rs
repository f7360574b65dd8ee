pub mod config;
pub mod error;
pub mod reminder;
pub mod types;
pub mod update;

pub use config::SkynetConfig;
pub use error::{Result, SkynetError};
