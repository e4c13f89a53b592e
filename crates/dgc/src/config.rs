//! Device alignment rules and runtime configuration.
//!
//! Tracing markers can be forced on without code changes with `DGC_TRACE_MARKERS=1`, and the
//! preamble threshold can be overridden with `DGC_PREAMBLE_THRESHOLD=<count>`.

use crate::arena::align_up;

/// Env var enabling debug markers in every generated sequence.
pub const TRACE_MARKERS_ENV: &str = "DGC_TRACE_MARKERS";

/// Env var overriding [`DgcConfig::preamble_threshold`].
pub const PREAMBLE_THRESHOLD_ENV: &str = "DGC_PREAMBLE_THRESHOLD";

/// Command engines that can consume a generated buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Engine {
    Graphics,
    /// Asynchronous compute; also runs the secondary (task shader) stream.
    Compute,
}

/// How one engine consumes indirect buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineRules {
    /// Required start alignment of an indirect buffer, in bytes. Power of two.
    pub ib_alignment: u32,
    /// Indirect buffer sizes must be a multiple of `pad_dw_mask + 1` dwords.
    pub pad_dw_mask: u32,
    /// Whether the engine can call into a nested buffer and return.
    pub supports_nesting: bool,
}

impl EngineRules {
    /// Alignment applied to every region offset and size consumed by this engine.
    pub const fn region_alignment(&self) -> u64 {
        let pad = (self.pad_dw_mask as u64 + 1) * 4;
        if self.ib_alignment as u64 > pad {
            self.ib_alignment as u64
        } else {
            pad
        }
    }

    /// Round `size` up so it can be handed to the engine as an indirect buffer.
    pub fn align_cmdbuf(&self, size: u64) -> u64 {
        align_up(size, self.region_alignment())
    }
}

/// Per-engine rules of one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceRules {
    pub graphics: EngineRules,
    pub compute: EngineRules,
}

impl DeviceRules {
    /// Graphics can nest, compute must chain.
    pub const fn nesting_graphics() -> Self {
        Self {
            graphics: EngineRules {
                ib_alignment: 32,
                pad_dw_mask: 7,
                supports_nesting: true,
            },
            compute: EngineRules {
                ib_alignment: 32,
                pad_dw_mask: 7,
                supports_nesting: false,
            },
        }
    }

    /// Neither engine can nest; every generated buffer is chained through its trailer.
    pub const fn chaining_only() -> Self {
        Self {
            graphics: EngineRules {
                ib_alignment: 32,
                pad_dw_mask: 7,
                supports_nesting: false,
            },
            compute: EngineRules {
                ib_alignment: 64,
                pad_dw_mask: 15,
                supports_nesting: false,
            },
        }
    }

    pub fn engine(&self, engine: Engine) -> &EngineRules {
        match engine {
            Engine::Graphics => &self.graphics,
            Engine::Compute => &self.compute,
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.graphics, self.compute].iter().all(|r| {
            r.ib_alignment.is_power_of_two() && (r.pad_dw_mask + 1).is_power_of_two()
        })
    }
}

impl Default for DeviceRules {
    fn default() -> Self {
        Self::nesting_graphics()
    }
}

/// Runtime knobs of the generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DgcConfig {
    /// Threads per generator workgroup.
    pub threads_per_group: u32,
    /// Minimum maximum-sequence-count for which a preamble is used with a GPU count.
    pub preamble_threshold: u32,
    /// Emit a debug marker at the start of every sequence.
    pub trace_markers: bool,
}

impl DgcConfig {
    pub const DEFAULT_THREADS_PER_GROUP: u32 = 64;
    pub const DEFAULT_PREAMBLE_THRESHOLD: u32 = 64;

    /// Defaults overridden by `DGC_TRACE_MARKERS` / `DGC_PREAMBLE_THRESHOLD`.
    pub fn from_env() -> Self {
        let trace = std::env::var(TRACE_MARKERS_ENV).ok();
        let threshold = std::env::var(PREAMBLE_THRESHOLD_ENV).ok();
        Self::from_vars(trace.as_deref(), threshold.as_deref())
    }

    fn from_vars(trace_markers: Option<&str>, preamble_threshold: Option<&str>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = trace_markers {
            config.trace_markers = is_truthy(raw);
        }
        if let Some(raw) = preamble_threshold {
            match raw.trim().parse::<u32>() {
                Ok(v) => config.preamble_threshold = v,
                Err(_) => tracing::warn!(
                    "ignoring invalid {PREAMBLE_THRESHOLD_ENV}={raw:?}; using {}",
                    config.preamble_threshold
                ),
            }
        }
        config
    }
}

impl Default for DgcConfig {
    fn default() -> Self {
        Self {
            threads_per_group: Self::DEFAULT_THREADS_PER_GROUP,
            preamble_threshold: Self::DEFAULT_PREAMBLE_THRESHOLD,
            trace_markers: false,
        }
    }
}

fn is_truthy(raw: &str) -> bool {
    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_alignment_covers_padding_and_ib_alignment() {
        let rules = EngineRules {
            ib_alignment: 16,
            pad_dw_mask: 7,
            supports_nesting: true,
        };
        assert_eq!(rules.region_alignment(), 32);
        assert_eq!(rules.align_cmdbuf(33), 64);

        let rules = EngineRules {
            ib_alignment: 256,
            pad_dw_mask: 0,
            supports_nesting: false,
        };
        assert_eq!(rules.region_alignment(), 256);
    }

    #[test]
    fn presets_are_valid() {
        assert!(DeviceRules::nesting_graphics().is_valid());
        assert!(DeviceRules::chaining_only().is_valid());
        assert!(DeviceRules::nesting_graphics().graphics.supports_nesting);
        assert!(!DeviceRules::chaining_only().graphics.supports_nesting);
    }

    #[test]
    fn config_env_parsing() {
        assert_eq!(DgcConfig::from_vars(None, None), DgcConfig::default());

        let config = DgcConfig::from_vars(Some(" On "), Some("128"));
        assert!(config.trace_markers);
        assert_eq!(config.preamble_threshold, 128);

        let config = DgcConfig::from_vars(Some("0"), Some("lots"));
        assert!(!config.trace_markers);
        assert_eq!(config.preamble_threshold, DgcConfig::DEFAULT_PREAMBLE_THRESHOLD);
    }
}
