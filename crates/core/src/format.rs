// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared small types referenced across the framer, source and registry
//! modules.

use serde::{Deserialize, Serialize};

/// Codec family selected from the producer's declared `content-type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatType {
    Ogg,
    Mp3,
    Aac,
    Webm,
    MpegTs,
    Text,
    /// FLV container synthesized from MP3/AAC input.
    Flv,
}

impl FormatType {
    /// Selects a format from a producer-declared `content-type`, mirroring
    /// the dispatch table in the framing layer's documentation.
    #[must_use]
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let ct = content_type.split(';').next().unwrap_or(content_type).trim();
        match ct {
            "application/ogg" | "audio/ogg" | "video/ogg" => Some(Self::Ogg),
            "audio/mpeg" => Some(Self::Mp3),
            "audio/aac" | "audio/aacp" => Some(Self::Aac),
            "video/webm" | "audio/webm" => Some(Self::Webm),
            "video/mp2t" => Some(Self::MpegTs),
            _ if ct.starts_with("text/") => Some(Self::Text),
            _ => None,
        }
    }
}

impl std::fmt::Display for FormatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ogg => "ogg",
            Self::Mp3 => "mp3",
            Self::Aac => "aac",
            Self::Webm => "webm",
            Self::MpegTs => "mpegts",
            Self::Text => "text",
            Self::Flv => "flv",
        };
        f.write_str(s)
    }
}

/// Per-mount configuration read once, at source activation, and never
/// re-read for the lifetime of the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountRuntimeConfig {
    pub fallback_mount: Option<String>,
    pub fallback_override: bool,
    pub fallback_when_full: bool,
    pub max_listeners: Option<u32>,
    pub queue_size_limit: u64,
    pub burst_size_bytes: u64,
    pub source_timeout_secs: u64,
    pub mp3_sync_frames: u32,
    pub desync_tolerance_bytes: u64,
    pub icy_metaint: u32,
}

impl Default for MountRuntimeConfig {
    fn default() -> Self {
        Self {
            fallback_mount: None,
            fallback_override: false,
            fallback_when_full: false,
            max_listeners: None,
            queue_size_limit: 1024 * 1024,
            burst_size_bytes: 65536,
            source_timeout_secs: 10,
            mp3_sync_frames: 4,
            desync_tolerance_bytes: 20000,
            icy_metaint: 16000,
        }
    }
}
