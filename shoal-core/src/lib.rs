pub mod command;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod net;
pub mod scheduler;
pub mod session;
pub mod sql_parser;
pub mod storage;
pub mod transaction;
pub mod types;

pub use crate::config::ServerConfig;
pub use crate::context::{ServerContext, ServerSnapshot};
pub use crate::error::ServerError;
pub use crate::net::{ServerHandle, ShoalServer};
pub use crate::transaction::ParticipantValidator;
