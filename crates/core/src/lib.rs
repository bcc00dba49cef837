// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! StreamKit Core - the streaming core of an Icecast-style audio broadcast
//! server: mountpoint registry, reference-counted source queues, codec-aware
//! framing and the listener write loop.
//!
//! ## Core Modules
//!
//! - [`refbuf`]: reference-counted immutable buffers shared between the
//!   source queue and every attached listener
//! - [`queue`]: per-source ring queue with burst-on-connect and lag trimming
//! - [`format`]: stream format tags and per-mount runtime configuration
//! - [`framer`]: codec-aware framing (Ogg, MP3/AAC, WebM, MPEG-TS, text, FLV)
//! - [`source`]: the per-source listener loop and its shared/exclusive split
//! - [`registry`]: mountpoint registry, fallback resolution, move-clients
//! - [`listener`]: per-listener cursor state and the non-blocking write path
//! - [`stats`]: the stats-sink collaborator interface
//! - [`auth`]: the authentication-hook collaborator interface
//! - [`error`]: error types and handling
//!
//! ## Quick Start
//!
//! ```ignore
//! use streamkit_core::registry::MountRegistry;
//! use streamkit_core::format::{FormatType, MountRuntimeConfig};
//!
//! let registry: MountRegistry<MySink> = MountRegistry::new();
//! let handle = registry.reserve("/live", FormatType::Mp3, MountRuntimeConfig::default())?;
//! ```

pub use async_trait::async_trait;

pub mod auth;
pub mod error;
pub mod format;
pub mod framer;
pub mod listener;
pub mod queue;
pub mod refbuf;
pub mod registry;
pub mod source;
pub mod stats;

pub use auth::{AllowAll, AuthOutcome, AuthRequest, Authenticator};
pub use error::{CoreError, Result};
pub use format::{FormatType, MountRuntimeConfig};
pub use framer::{build_framer, Framer};
pub use listener::{CodecAdapter, IcyState, Listener, ListenerSink};
pub use queue::SourceQueue;
pub use refbuf::Refbuf;
pub use registry::{MountRegistry, MAX_FALLBACK_DEPTH};
pub use source::{ProducerRead, Source, SourceHandle, SourceShared};
pub use stats::{NullStatsSink, StatsSink};
