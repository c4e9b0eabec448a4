//! Shared building blocks for the imUp agent.
//!
//! Everything in here is deliberately small and side-effect free (except
//! [`http`], which performs the actual POSTs): settings resolution with
//! flag > environment > default precedence, allow/block list evaluation,
//! CIDR expansion, and the jittered scheduling/backoff draws used by the
//! periodic tasks.

pub mod backoff;
pub mod env;
pub mod http;
pub mod net;

pub use http::{HttpError, RetryPolicy};
