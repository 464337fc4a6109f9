//! HTTP surface exposed to external clients.

pub mod v1;
