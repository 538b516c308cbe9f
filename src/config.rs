// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device configuration read once at attach time.
//!
//! Values come from a [`Registry`]. Any key that is absent or unreadable falls back to its
//! default, so a device can always be brought up.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::fbl::MAX_FRAMES;
use crate::rpc::MAX_STREAMS;
use crate::Resolution;

pub const DEFAULT_MAX_CONTEXTS: u32 = 2;
pub const DEFAULT_FRAME_BUFFERS: u32 = 22;
pub const DEFAULT_OUT_FRAME_BUFFERS: u32 = 3;
pub const DEFAULT_STREAM_BUFF_SIZE: u32 = 2 * 1024 * 1024;
pub const DEFAULT_MAX_WIDTH: u32 = 1920;
pub const DEFAULT_MAX_HEIGHT: u32 = 1088;
/// Largest frame dimensions the decoder pools can be sized for.
pub const MAX_WIDTH: u32 = 8192;
pub const MAX_HEIGHT: u32 = 8192;

/// Source of persisted configuration values.
pub trait Registry {
    /// Returns the value stored under `key`, or `None` if it is absent or unreadable.
    fn read_u32(&self, key: &str) -> Option<u32>;
}

impl Registry for HashMap<String, u32> {
    fn read_u32(&self, key: &str) -> Option<u32> {
        self.get(key).copied()
    }
}

/// A registry that holds no values. Every key resolves to its default.
pub struct EmptyRegistry;

impl Registry for EmptyRegistry {
    fn read_u32(&self, _: &str) -> Option<u32> {
        None
    }
}

/// Registry values parsed from `Key=Value` lines.
///
/// Blank lines and lines starting with `#` are skipped. Values may be decimal or `0x`-prefixed
/// hexadecimal. Malformed lines are logged and ignored, which makes their key fall back to its
/// default.
#[derive(Debug, Default, Clone)]
pub struct RegistryValues(HashMap<String, u32>);

impl RegistryValues {
    pub fn parse(text: &str) -> Self {
        let mut values = HashMap::new();

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                log::warn!("ignoring malformed registry line {line:?}");
                continue;
            };

            let value = value.trim();
            let parsed = match value.strip_prefix("0x") {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => u32::from_str(value),
            };

            match parsed {
                Ok(v) => {
                    values.insert(key.trim().to_string(), v);
                }
                Err(e) => log::warn!("ignoring unreadable registry value {key}={value}: {e}"),
            }
        }

        Self(values)
    }
}

impl Registry for RegistryValues {
    fn read_u32(&self, key: &str) -> Option<u32> {
        self.0.read_u32(key)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VpuConfig {
    /// Number of stream slots the device exposes.
    pub max_contexts: usize,
    /// Capacity of the VPU-tiled frame buffer pool of each stream.
    pub frame_buffers: usize,
    /// Capacity of the linear output frame buffer pool of each stream.
    pub out_frame_buffers: usize,
    /// Size in bytes of the bitstream ring buffer of each stream.
    pub stream_buff_size: usize,
    pub enable_hevc: bool,
    pub allow_10bit: bool,
    /// Largest coded resolution the frame pools are sized for.
    pub max_resolution: Resolution,
    /// Bound on the waits that otherwise only end when the firmware answers.
    pub watchdog: Option<Duration>,
}

impl Default for VpuConfig {
    fn default() -> Self {
        Self {
            max_contexts: DEFAULT_MAX_CONTEXTS as usize,
            frame_buffers: DEFAULT_FRAME_BUFFERS as usize,
            out_frame_buffers: DEFAULT_OUT_FRAME_BUFFERS as usize,
            stream_buff_size: DEFAULT_STREAM_BUFF_SIZE as usize,
            enable_hevc: true,
            allow_10bit: false,
            max_resolution: Resolution::from((DEFAULT_MAX_WIDTH, DEFAULT_MAX_HEIGHT)),
            watchdog: None,
        }
    }
}

/// Reads a non-zero count or size, logging when the default is used.
fn read_nonzero(registry: &dyn Registry, key: &str, default: u32) -> u32 {
    match registry.read_u32(key) {
        Some(0) => {
            log::debug!("{key} is zero, using default {default}");
            default
        }
        Some(v) => v,
        None => {
            log::debug!("{key} not set, using default {default}");
            default
        }
    }
}

/// Reads a non-zero value, clamping it to `max`.
fn read_clamped(registry: &dyn Registry, key: &str, default: u32, max: u32) -> u32 {
    let value = read_nonzero(registry, key, default);
    if value > max {
        log::warn!("{key}={value} exceeds {max}, clamping");
        return max;
    }
    value
}

fn read_bool(registry: &dyn Registry, key: &str, default: bool) -> bool {
    match registry.read_u32(key) {
        Some(v) => v != 0,
        None => {
            log::debug!("{key} not set, using default {default}");
            default
        }
    }
}

impl VpuConfig {
    pub fn from_registry(registry: &dyn Registry) -> Self {
        let max_frames = MAX_FRAMES as u32;
        let frame_buffers =
            read_clamped(registry, "FrameBuffers", DEFAULT_FRAME_BUFFERS, max_frames) as usize;
        let out_frame_buffers =
            read_clamped(registry, "OutFrameBuffers", DEFAULT_OUT_FRAME_BUFFERS, max_frames)
                as usize;
        let max_contexts =
            read_clamped(registry, "MaxContexts", DEFAULT_MAX_CONTEXTS, MAX_STREAMS as u32)
                as usize;

        let watchdog = match registry.read_u32("WatchdogMs") {
            None | Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms as u64)),
        };

        let config = Self {
            max_contexts,
            frame_buffers,
            out_frame_buffers,
            stream_buff_size: read_nonzero(registry, "StreamBuffSize", DEFAULT_STREAM_BUFF_SIZE)
                as usize,
            enable_hevc: read_bool(registry, "EnableHEVC", true),
            allow_10bit: read_bool(registry, "Allow10BitFormat", false),
            max_resolution: Resolution {
                width: read_clamped(registry, "MaxWidth", DEFAULT_MAX_WIDTH, MAX_WIDTH),
                height: read_clamped(registry, "MaxHeight", DEFAULT_MAX_HEIGHT, MAX_HEIGHT),
            },
            watchdog,
        };

        log::debug!("VPU configuration: {config:?}");
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_absent() {
        let config = VpuConfig::from_registry(&EmptyRegistry);
        assert_eq!(config, VpuConfig::default());
        assert_eq!(config.max_contexts, 2);
        assert_eq!(config.frame_buffers, 22);
        assert_eq!(config.out_frame_buffers, 3);
        assert_eq!(config.stream_buff_size, 2 * 1024 * 1024);
        assert!(config.watchdog.is_none());
    }

    #[test]
    fn parse_registry_text() {
        let registry = RegistryValues::parse(
            "# decoder tuning\n\
             MaxContexts=4\n\
             StreamBuffSize=0x100000\n\
             FrameBuffers = 12\n\
             OutFrameBuffers=abc\n\
             Allow10BitFormat=1\n\
             garbage line\n\
             WatchdogMs=250\n",
        );
        let config = VpuConfig::from_registry(&registry);

        assert_eq!(config.max_contexts, 4);
        assert_eq!(config.stream_buff_size, 0x100000);
        assert_eq!(config.frame_buffers, 12);
        // Unreadable values fall back to the default.
        assert_eq!(config.out_frame_buffers, 3);
        assert!(config.allow_10bit);
        assert!(config.enable_hevc);
        assert_eq!(config.watchdog, Some(Duration::from_millis(250)));
    }

    #[test]
    fn zero_and_oversized_values() {
        let mut registry = HashMap::new();
        registry.insert("MaxContexts".to_string(), 0);
        registry.insert("FrameBuffers".to_string(), 100);
        registry.insert("EnableHEVC".to_string(), 0);
        let config = VpuConfig::from_registry(&registry);

        assert_eq!(config.max_contexts, 2);
        assert_eq!(config.frame_buffers, MAX_FRAMES);
        assert!(!config.enable_hevc);
    }

    #[test]
    fn limits_are_clamped() {
        let registry = RegistryValues::parse(
            "MaxContexts=300
             MaxWidth=0x40000001
             MaxHeight=100000
             OutFrameBuffers=64
",
        );
        let config = VpuConfig::from_registry(&registry);

        assert_eq!(config.max_contexts, MAX_STREAMS);
        assert_eq!(config.max_resolution, Resolution::from((MAX_WIDTH, MAX_HEIGHT)));
        assert_eq!(config.out_frame_buffers, MAX_FRAMES);
    }
}
