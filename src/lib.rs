pub mod admin;
pub mod api;
pub mod app;
pub mod bridge;
pub mod context;
pub mod error;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use error::{ChatError, Result};
