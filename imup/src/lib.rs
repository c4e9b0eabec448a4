//! The imUp agent: a long-running process that characterises a host's
//! Internet connectivity and reports it to the imUp API.
//!
//! The crates underneath carry the subsystems — probing
//! (`imup-connectivity`), throughput (`imup-speedtest`), realtime
//! operations (`imup-realtime`) and the reloadable configuration
//! (`imup-config`). This crate wires them together: the supervisor in
//! [`run`], the durable send queue in [`sender`], the on-disk spool in
//! [`cache`] and the error aggregator in [`errors`].

pub mod cache;
pub mod errors;
pub mod run;
pub mod sender;

/// Client version stamped onto every measurement and payload.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
