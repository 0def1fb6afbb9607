#![deny(clippy::mod_module_files)]
//! Streams a git object database to a graph observer: one snapshot of every
//! object on connect, then an update per object written while connected.

pub mod config;
pub mod decode;
pub mod error;
pub mod graph;
pub mod history;
pub mod identity;
pub mod session;
pub mod store;
pub mod transport;
pub mod watch;

pub use error::Error;
