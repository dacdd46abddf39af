//! # rust_mx
//!
//! Application crate for the `mxserver` binary. The instrument-control
//! machinery lives in the workspace crates; this crate wires them into a
//! running server:
//!
//! - **`config`**: layered server configuration (defaults, TOML file,
//!   `RUST_MX_` environment variables) with validation.
//! - **`database`**: loads a TOML device database into a
//!   [`mx_core::RecordList`], constructing and opening every record.
//! - **`driverinfo`**: text listing of the driver taxonomy.
//! - **`logging`**: `tracing-subscriber` setup.
//!
//! ## Workspace crates
//!
//! - [`mx_core`]: driver registry, records, fields, process functions and
//!   the handle table.
//! - [`mx_driver_soft`]: software-simulated drivers (motor, scaler, MCA,
//!   variables) and the list head.
//! - [`mx_server`]: socket handler table, event loop, request dispatch,
//!   value-changed callbacks and a client.

pub mod config;
pub mod database;
pub mod driverinfo;
pub mod logging;

pub use config::{ConfigError, ServerConfig};
pub use database::{load_database, DatabaseError};

pub use mx_core;
pub use mx_driver_soft;
pub use mx_server;
