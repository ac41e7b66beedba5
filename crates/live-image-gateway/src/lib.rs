// Live image gateway: HTTP surface of the createLiveImage server action

pub mod config;
pub mod live_image;

pub use config::{ApiServerConfig, ConfigError};
pub use live_image::*;
