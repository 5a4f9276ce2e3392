pub mod config;
pub mod error;
pub mod message;
pub mod model;
pub mod provider;
pub mod session;
