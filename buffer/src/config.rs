//! Tunables for a buffer's loader, cache and layout passes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on a single loader read, keeping cancellation responsive.
    pub read_chunk: usize,
    /// Bytes of prefetch margin around the viewport.
    pub load_radius: u64,
    /// Advisory cap on resident cache bytes.
    pub memory_budget: usize,
    /// Inserts up to this size are laid out on the caller's thread; larger
    /// ones go through the background pass.
    pub inline_layout_threshold: usize,
    /// Bytes of deferred literal content laid out per background step.
    pub scan_batch: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_chunk: 256 << 10,
            load_radius: 1 << 20,
            memory_budget: 256 << 20,
            inline_layout_threshold: 64 << 10,
            scan_batch: 256 << 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_a_serde_round_trip() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.read_chunk, cfg.read_chunk);
        assert_eq!(back.load_radius, cfg.load_radius);

        // Partial configs fill in defaults.
        let sparse: Config = serde_json::from_str(r#"{"read_chunk": 1024}"#).unwrap();
        assert_eq!(sparse.read_chunk, 1024);
        assert_eq!(sparse.memory_budget, cfg.memory_budget);
    }
}
