//! Drives a remote Colab GPU/TPU runtime as a Jupyter kernel over WebSocket:
//! assignment, connection, execution, and the durable state around them.

#![deny(unsafe_code)]

pub mod auth;
pub mod cli;
pub mod codec;
pub mod colab;
pub mod config;
pub mod connection;
pub mod connection_pool;
pub mod error;
pub mod error_handler;
pub mod history;
pub mod kernel_client;
pub mod logging;
pub mod output;
pub mod runtime_manager;
pub mod session_manager;

pub use error::Error;
