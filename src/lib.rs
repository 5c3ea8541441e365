//! fcgi-pool - A FastCGI process manager
//!
//! This library keeps a pool of FastCGI worker processes (such as `php-cgi`)
//! behind one or more TCP listeners:
//! - Spawns workers on private UNIX domain sockets (named pipes on Windows)
//! - Hands each accepted client to an idle worker and proxies bytes both ways
//! - Recycles workers after a request budget or an idle timeout
//! - Replaces workers that exit unexpectedly
//! - Reloads configuration by swapping in fresh pools while old ones drain

pub mod config;
pub mod error;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod server;
pub mod supervisor;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
