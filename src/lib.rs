//! Minecraft server controller.
//!
//! Supervises a server process and drives it through its console, an RCON
//! session, and generated datapack functions for command sets too large
//! for either.

pub mod batch;
pub mod client;
pub mod config;
pub mod datapack;
pub mod error;
pub mod facade;
pub mod pending;
pub mod plugin;
pub mod plugins;
pub mod promise;
pub mod protocol;
pub mod server;
pub mod shell;
pub mod tailer;

pub use batch::BatchOutcome;
pub use client::RconSession;
pub use error::{Error, Result};
pub use facade::{Dispatch, FlushMode, Flushed, McServer};
pub use promise::Promise;
