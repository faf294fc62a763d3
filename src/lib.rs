//! shadowlink: a transparent forwarding proxy that mirrors fd-backed
//! shared-memory, dmabuf, and pipe resources across a byte-oriented channel
//! alongside a display-protocol connection.

pub mod channel;
pub mod codec;
pub mod config;
pub mod constants;
pub mod env;
pub mod error;
pub mod pool;
pub mod reconnect;
pub mod shadow;
pub mod supervisor;
pub mod token;
pub mod transfer;
pub mod worker;

pub use channel::{checked_close, connect_to_socket, recv_one_fd, send_one_fd};
pub use codec::CompressionMode;
pub use config::{SessionConfig, SessionMode};
pub use error::SessionError;
pub use shadow::{FdTranslationMap, Side};
pub use supervisor::run_server;
pub use token::ConnectionToken;
