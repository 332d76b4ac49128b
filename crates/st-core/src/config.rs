//! Device configuration.

use serde::{Deserialize, Serialize};
use st_block::MetaLayout;
use st_error::{Result, StError};
use st_journal::default_ring_slots;
use st_types::{AL_MAX_EXTENTS, AL_MIN_EXTENTS, IoErrorPolicy};
use std::time::Duration;

/// Largest single request accepted by the sync accounting calls.
pub const MAX_IO_SIZE: u32 = 1 << 20;

/// Tunables for one tracked device.
///
/// Every field has a default so partial JSON documents deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Name used in log events and worker thread names.
    pub name: String,
    /// Size of the replicated data device in 512-byte sectors.
    pub capacity_sectors: u64,
    /// Activity-log cache slots (hot 4 MiB extents).
    pub al_extents: u32,
    /// Transaction ring slots. `None` derives `ceil(al_extents / 61) + 1`.
    pub al_ring_slots: Option<u32>,
    /// Resync cache slots (256 MiB extents).
    pub rs_extents: u32,
    /// Resync extents that may hold writes off at once. `None` means half
    /// the resync cache.
    pub rs_admission_limit: Option<u32>,
    /// How many times a blocking resync acquire yields to a waiting
    /// application write before it stops yielding.
    pub resync_step_aside_steps: u32,
    /// Poll and back-off interval for blocking waits, in milliseconds.
    pub resync_step_ms: u64,
    /// Failed acquire attempts before an application write logs that the
    /// activity log is too small.
    pub al_starve_warn_after: u32,
    /// Metadata placement. `None` uses [`MetaLayout::for_capacity`].
    pub layout: Option<MetaLayout>,
    /// Reaction to metadata I/O errors.
    pub on_io_error: IoErrorPolicy,
    /// Background worker threads.
    pub worker_threads: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "st0".to_owned(),
            capacity_sectors: 1 << 21,
            al_extents: 127,
            al_ring_slots: None,
            rs_extents: 61,
            rs_admission_limit: None,
            resync_step_aside_steps: 200,
            resync_step_ms: 100,
            al_starve_warn_after: 10,
            layout: None,
            on_io_error: IoErrorPolicy::PassOn,
            worker_threads: 1,
        }
    }
}

impl DeviceConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.capacity_sectors == 0 {
            return Err(StError::InvalidGeometry("capacity_sectors is zero".into()));
        }
        if !(AL_MIN_EXTENTS..=AL_MAX_EXTENTS).contains(&self.al_extents) {
            return Err(StError::InvalidGeometry(format!(
                "al_extents {} outside {AL_MIN_EXTENTS}..={AL_MAX_EXTENTS}",
                self.al_extents
            )));
        }
        if self.rs_extents < 2 {
            return Err(StError::InvalidGeometry(format!(
                "rs_extents {} is below 2",
                self.rs_extents
            )));
        }
        if let Some(limit) = self.rs_admission_limit
            && (limit == 0 || limit > self.rs_extents)
        {
            return Err(StError::InvalidGeometry(format!(
                "rs_admission_limit {limit} outside 1..={}",
                self.rs_extents
            )));
        }
        if self.resync_step_ms == 0 {
            return Err(StError::InvalidGeometry("resync_step_ms is zero".into()));
        }
        if self.worker_threads == 0 {
            return Err(StError::InvalidGeometry("worker_threads is zero".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn layout(&self) -> MetaLayout {
        self.layout
            .unwrap_or_else(|| MetaLayout::for_capacity(self.capacity_sectors))
    }

    #[must_use]
    pub fn ring_slots(&self) -> u32 {
        self.al_ring_slots
            .unwrap_or_else(|| default_ring_slots(self.al_extents))
    }

    #[must_use]
    pub fn rs_admission_limit(&self) -> u32 {
        self.rs_admission_limit
            .unwrap_or(self.rs_extents / 2)
            .max(1)
    }

    #[must_use]
    pub fn resync_step(&self) -> Duration {
        Duration::from_millis(self.resync_step_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DeviceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ring_slots(), 4);
        assert_eq!(config.rs_admission_limit(), 30);
        assert_eq!(config.resync_step(), Duration::from_millis(100));
    }

    #[test]
    fn al_extent_bounds() {
        let mut config = DeviceConfig {
            al_extents: 6,
            ..DeviceConfig::default()
        };
        assert!(matches!(config.validate(), Err(StError::InvalidGeometry(_))));
        config.al_extents = AL_MAX_EXTENTS + 1;
        assert!(config.validate().is_err());
        config.al_extents = AL_MAX_EXTENTS;
        config.validate().unwrap();
    }

    #[test]
    fn zero_values_rejected() {
        for broken in [
            DeviceConfig {
                capacity_sectors: 0,
                ..DeviceConfig::default()
            },
            DeviceConfig {
                worker_threads: 0,
                ..DeviceConfig::default()
            },
            DeviceConfig {
                resync_step_ms: 0,
                ..DeviceConfig::default()
            },
            DeviceConfig {
                rs_admission_limit: Some(0),
                ..DeviceConfig::default()
            },
        ] {
            assert!(broken.validate().is_err(), "{broken:?}");
        }
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: DeviceConfig =
            serde_json::from_str(r#"{"name":"r0","al_extents":7,"on_io_error":"detach"}"#)
                .unwrap();
        assert_eq!(config.name, "r0");
        assert_eq!(config.al_extents, 7);
        assert_eq!(config.on_io_error, IoErrorPolicy::Detach);
        assert_eq!(config.rs_extents, 61);
        assert_eq!(config.ring_slots(), 2);
    }

    #[test]
    fn explicit_layout_wins() {
        let layout = MetaLayout {
            al_offset_sectors: 8,
            al_size_sectors: 16,
            bm_offset_sectors: 64,
            bm_size_sectors: 8,
        };
        let config = DeviceConfig {
            layout: Some(layout),
            ..DeviceConfig::default()
        };
        assert_eq!(config.layout(), layout);
    }
}
