pub mod archive;
pub mod client;
pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod frame;
pub mod message;
pub mod payload;
pub mod registry;
pub mod server;
pub mod session;
pub mod source;

// Re-export the entry points for easy access
pub use client::{Download, LpmClient};
pub use config::{ClientConfig, ServerConfig, SessionConfig};
pub use error::LpmError;
pub use frame::{Command, Frame};
pub use server::{LpmServer, ShutdownHandle};
