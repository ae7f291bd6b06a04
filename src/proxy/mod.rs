// src/proxy/mod.rs
//! Reverse-proxy plumbing around the inspector
//!
//! - **Forwarder**: delivers inspected requests to the backend
//! - **Server**: accepts client connections and hands each exchange to the
//!   inspector on its own task

pub mod forwarder;
pub mod server;

pub use forwarder::{Forwarder, HttpForwarder};
pub use server::InspectorServer;
