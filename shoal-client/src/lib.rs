//! Async client for the shoal wire protocol.
//!
//! One [`ClientConnection`] multiplexes any number of [`ClientSession`]s over a
//! single TCP socket. Requests are correlated with responses by packet id, so
//! sessions on the same connection may have requests in flight concurrently.
//!
//! ## Example
//!
//! ```rust,ignore
//! use shoal_client::{ClientConnection, SessionOptions};
//!
//! let conn = ClientConnection::connect("127.0.0.1:9210").await?;
//! let session = conn.create_session(SessionOptions::default()).await?;
//! session.update("CREATE TABLE t(id INT)").await?;
//! let mut rows = session.query("SELECT id FROM t").await?;
//! while let Some(row) = rows.next().await? {
//!     println!("{row:?}");
//! }
//! # Ok::<(), shoal_client::ClientError>(())
//! ```

pub mod connection;
pub mod error;
pub mod result;
pub mod session;

pub use connection::{ClientConnection, PendingResponse};
pub use error::{ClientError, Result};
pub use result::{ClientColumn, ClientResult};
pub use session::{
    ClientSession, ClientStatement, Distributed, ParameterInfo, SessionOptions, UpdateResult,
};
