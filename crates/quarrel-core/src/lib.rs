pub mod config;
pub mod error;
pub mod event;
pub mod hooks;
pub mod routing;
pub mod settings;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{QuarrelError, Result};
pub use event::EventBus;
pub use types::*;
