//! Background workers.
//!
//! Metadata writes that must not run on the caller's stack (activity-log
//! transactions, per-extent bitmap flushes, the transition to diskless) are
//! queued here. Two channels feed every worker: `urgent` is always drained
//! first, `normal` carries bitmap flushes and the stop marker.

use crate::Device;
use crossbeam_channel::{Receiver, Sender};
use st_error::{Result, StError};
use st_journal::AlTransaction;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

/// Result of one queued activity-log transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AlWriteOutcome {
    /// The record reached the ring.
    Written,
    /// The write was attempted and failed; the error has been reported.
    Failed,
    /// The local disk could not take the write; nothing was submitted.
    Bypassed,
}

impl AlWriteOutcome {
    /// The ring position was consumed.
    pub(crate) fn advances_ring(self) -> bool {
        matches!(self, Self::Written | Self::Failed)
    }
}

pub(crate) struct AlWrite {
    pub(crate) slot: u32,
    pub(crate) txn: AlTransaction,
    /// Extent the changing cache slot is giving up.
    pub(crate) evicted: u32,
    pub(crate) done: Sender<AlWriteOutcome>,
}

pub(crate) enum Work {
    AlWrite(AlWrite),
    UpdateOnDiskBitmap { enr: u32 },
    GoDiskless,
    Stop,
}

impl Work {
    fn kind(&self) -> &'static str {
        match self {
            Self::AlWrite(_) => "al_write",
            Self::UpdateOnDiskBitmap { .. } => "update_on_disk_bitmap",
            Self::GoDiskless => "go_diskless",
            Self::Stop => "stop",
        }
    }
}

/// Start `count` workers for `device`.
pub(crate) fn spawn(
    device: &Arc<Device>,
    urgent: &Receiver<Work>,
    normal: &Receiver<Work>,
    count: usize,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(count);
    for id in 0..count {
        let device = Arc::clone(device);
        let urgent = urgent.clone();
        let normal = normal.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-worker-{id}", device.name()))
            .spawn(move || run(&device, id, &urgent, &normal))
            .map_err(StError::Io)?;
        handles.push(handle);
    }
    Ok(handles)
}

fn next(urgent: &Receiver<Work>, normal: &Receiver<Work>) -> Option<Work> {
    if let Ok(work) = urgent.try_recv() {
        return Some(work);
    }
    crossbeam_channel::select! {
        recv(urgent) -> work => work.ok(),
        recv(normal) -> work => work.ok(),
    }
}

fn run(device: &Device, id: usize, urgent: &Receiver<Work>, normal: &Receiver<Work>) {
    debug!(target: "synctrack::worker", device = %device.name(), id, "worker_started");
    while let Some(work) = next(urgent, normal) {
        trace!(target: "synctrack::worker", id, work = work.kind(), "worker_dequeued");
        match work {
            Work::AlWrite(req) => {
                let outcome = device.write_al_transaction(&req);
                // The submitter may have been torn down; nothing to report to.
                let _ = req.done.send(outcome);
            }
            Work::UpdateOnDiskBitmap { enr } => device.update_on_disk_bitmap(enr),
            Work::GoDiskless => device.go_diskless(),
            Work::Stop => break,
        }
    }
    debug!(target: "synctrack::worker", device = %device.name(), id, "worker_stopped");
}
