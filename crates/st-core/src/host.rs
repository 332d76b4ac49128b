//! Callbacks into the replication layer that owns the device.

use st_types::ConnState;

/// Hooks the tracking engine invokes on its host.
///
/// Every method has a default so hosts implement only what they observe.
/// Methods may be called from worker threads and must not call back into
/// blocking device operations.
pub trait Host: Send + Sync {
    /// Current replication link state.
    fn conn_state(&self) -> ConnState {
        ConnState::StandAlone
    }

    /// Every out-of-sync bit left is accounted as failed; the resync is
    /// done.
    fn resync_finished(&self) {}

    /// Resync accounting went inconsistent; drop the connection.
    fn force_disconnect(&self, _reason: &str) {}

    /// Local metadata I/O failed under the `call-helper` policy.
    fn local_io_error(&self, _context: &str) {}
}

/// A host with no peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandAloneHost;

impl Host for StandAloneHost {}
