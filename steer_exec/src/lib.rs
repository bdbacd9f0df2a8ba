//! # Steering library.
//!
//! This library allows other crates in the workspace, and the benchmarks, to access items defined
//! inside the steering crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// PID controller - bounded integral window with speed scheduled gains
pub mod pid;

/// Steering control module - converts telemetry records into steering and throttle commands
pub mod steer_ctrl;

/// Client manager - keeps a separate steering control session for each simulator client
pub mod client_mgr;

/// Simulator server - receives packets from the simulator clients and routes replies back
pub mod sim_server;
