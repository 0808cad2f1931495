pub mod config;
pub mod error;
pub mod model;
pub mod schedule;

pub use config::Config;
pub use error::*;
pub use model::*;
