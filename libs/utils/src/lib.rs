//! `utils` is intended to be a place to put code that is shared
//! between the tunnelkeeper service and any future workspace members.

/// HMAC-signed capability token plumbing.
pub mod auth;

/// Exponential backoff helpers for retrying external calls.
pub mod backoff;

/// Ignoring `NotFound` errors on filesystem cleanup paths.
pub mod fs_ext;

/// HTTP server pieces: router construction, error mapping, JSON helpers.
pub mod http;

/// Newtypes for the ids that cross component boundaries.
pub mod id;

/// Logging / tracing subscriber initialization.
pub mod logging;

/// Process shutdown signal handling.
pub mod signals;
