pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod store;
pub mod telemetry;

pub use error::{Error, ErrorKind, Result, StoreError};
