//! # devlink-server
//!
//! Relay server between main devices and their sub devices.
//!
//! A main device connects to [`handlers::MAIN_DEVICE_PATH`] and owns a room
//! for as long as it stays connected. Sub devices bound to the same account
//! connect to [`handlers::SUB_DEVICE_PATH`], join that room, and receive every
//! text frame the main device sends. When the main device goes away, every
//! sub device is closed with "main device offline".

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod session;

pub use auth::{BindingError, DeviceBindings, StaticBindings};
pub use config::Config;
pub use error::RelayError;
pub use handlers::{app, run_server, serve, AppState};
pub use session::{run_main_session, run_sub_session, SessionContext, SessionEnd};
