pub mod config;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

pub use config::AppConfig;
pub use models::Job;
