//! Domain settings
//!
//! The settings object arrives once at startup (JSON from the domain
//! handshake). Missing keys fall back to defaults; a missing or unreadable
//! settings object is fatal before the loop starts.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use aura_core::{
    AuraError, AuraResult, DEFAULT_MAX_NODE_BANDWIDTH_MBPS, MAX_AVATAR_HEIGHT, MIN_AVATAR_HEIGHT,
};

/// Nodes silent longer than this are treated as departed.
pub const SILENT_NODE_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed mixer settings.
#[derive(Clone, Debug)]
pub struct MixerSettings {
    /// Per-node send ceiling in megabits per second.
    pub max_node_bandwidth_mbps: f32,
    /// Worker thread count; `None` means auto (CPU count).
    pub num_threads: Option<usize>,
    pub min_avatar_height: f32,
    pub max_avatar_height: f32,
    /// Allowed skeleton URL prefixes; empty means no restriction.
    pub skeleton_whitelist: Vec<String>,
    /// Replacement skeleton URL for whitelist misses; empty means default.
    pub skeleton_replacement: String,
}

impl Default for MixerSettings {
    fn default() -> Self {
        MixerSettings {
            max_node_bandwidth_mbps: DEFAULT_MAX_NODE_BANDWIDTH_MBPS,
            num_threads: None,
            min_avatar_height: MIN_AVATAR_HEIGHT,
            max_avatar_height: MAX_AVATAR_HEIGHT,
            skeleton_whitelist: Vec::new(),
            skeleton_replacement: String::new(),
        }
    }
}

impl MixerSettings {
    /// Parse the domain settings object.
    pub fn from_domain_settings(settings: &Value) -> AuraResult<Self> {
        if !settings.is_object() {
            return Err(AuraError::Settings("domain settings is not an object".into()));
        }

        let mixer_group = &settings["avatar_mixer"];
        let avatars_group = &settings["avatars"];
        let mut parsed = MixerSettings::default();

        match mixer_group["max_node_send_bandwidth"].as_f64() {
            Some(mbps) if mbps > 0.0 => parsed.max_node_bandwidth_mbps = mbps as f32,
            Some(_) | None => {
                debug!(
                    "max_node_send_bandwidth missing or invalid - using default {} Mb/s",
                    parsed.max_node_bandwidth_mbps
                );
            }
        }

        let auto_threads = mixer_group["auto_threads"].as_bool().unwrap_or(true);
        if !auto_threads {
            // the domain server historically delivers this one as a string
            let requested = mixer_group["num_threads"]
                .as_u64()
                .or_else(|| {
                    mixer_group["num_threads"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                });
            match requested {
                Some(n) if n > 0 => parsed.num_threads = Some(n as usize),
                _ => {
                    warn!("could not read num_threads - using 1 thread");
                    parsed.num_threads = Some(1);
                }
            }
        }

        let min_height = avatars_group["min_avatar_height"]
            .as_f64()
            .map(|h| h as f32)
            .unwrap_or(MIN_AVATAR_HEIGHT)
            .clamp(MIN_AVATAR_HEIGHT, MAX_AVATAR_HEIGHT);
        let max_height = avatars_group["max_avatar_height"]
            .as_f64()
            .map(|h| h as f32)
            .unwrap_or(MAX_AVATAR_HEIGHT)
            .clamp(MIN_AVATAR_HEIGHT, MAX_AVATAR_HEIGHT);
        // the domain owner may have flipped min and max
        parsed.min_avatar_height = min_height.min(max_height);
        parsed.max_avatar_height = min_height.max(max_height);

        if let Some(whitelist) = avatars_group["avatar_whitelist"].as_str() {
            parsed.skeleton_whitelist = whitelist
                .split(',')
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty())
                .collect();
        }

        if let Some(replacement) = avatars_group["replacement_avatar"].as_str() {
            parsed.skeleton_replacement = replacement.trim().to_string();
        }

        Ok(parsed)
    }

    /// Data-byte budget per recipient per tick, derived from the per-node
    /// bandwidth ceiling and the broadcast rate.
    pub fn budget_bytes_per_tick(&self, rate_hz: u32) -> usize {
        let bytes_per_second = self.max_node_bandwidth_mbps as f64 * 1_000_000.0 / 8.0;
        (bytes_per_second / rate_hz as f64) as usize
    }

    /// Effective worker count.
    pub fn worker_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}
