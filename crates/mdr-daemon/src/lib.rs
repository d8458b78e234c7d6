//! mdr-daemon library target.
//!
//! Router, handlers and shared state live here so scenario tests can drive
//! them in-process; `main.rs` only wires them to Postgres and a socket.

pub mod api_types;
pub mod routes;
pub mod state;
