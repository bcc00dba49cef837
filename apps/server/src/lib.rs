// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! castd - the HTTP/ICY glue around `castcore`'s streaming core: config
//! loading, structured logging and telemetry, and the axum router that
//! terminates producer (PUT/SOURCE) and listener (GET) connections.

pub mod cli;
pub mod config;
pub mod logging;
pub mod server;
pub mod telemetry;

pub use config::Config;
