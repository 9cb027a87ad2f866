//! Hold-timeout enforcement.
//!
//! Every connection-holding period gets one reaper task. If the unit of
//! work has not settled when the timer fires, the reaper rolls back any
//! open transaction, releases the connection, and marks the unit
//! `TimedOut`. Settling first wins: `commit`, `rollback`, and `finish`
//! disarm the reaper, and a reaper that loses the race to the lock finds
//! the connection already gone and stands down.

use crate::context::{HoldOutcome, UnitInner};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Arm a reaper for the holding period that just began.
///
/// Caller must hold the unit lock and have just attached a connection. The
/// reaper keeps only a weak reference, so an abandoned unit can still be
/// dropped and salvaged before the timer fires.
pub(crate) fn arm(unit: &mut UnitInner, unit_ref: Weak<Mutex<UnitInner>>, hold: Duration) {
    unit.epoch = unit.epoch.wrapping_add(1);
    let expected = unit.epoch;
    let id = Arc::clone(&unit.id);

    let handle = tokio::spawn(async move {
        tokio::time::sleep(hold).await;
        let Some(unit) = unit_ref.upgrade() else {
            return;
        };
        let mut unit = unit.lock().await;
        if unit.epoch != expected || unit.conn.is_none() {
            debug!(unit = %id, "Hold settled before the timeout fired");
            return;
        }
        // this task is the armed reaper; drop the handle without aborting,
        // or the rollback below would be cancelled mid-flight
        drop(unit.reaper.take());
        let _ = unit.close_hold(HoldOutcome::Timeout).await;
    });

    unit.reaper = Some(handle);
}

/// Cancel the armed reaper, if any, and invalidate its epoch.
///
/// Abort alone is not enough: a reaper already past its sleep may be
/// queued on the unit lock, so the epoch bump is what actually makes it
/// stand down.
pub(crate) fn disarm(unit: &mut UnitInner) {
    if let Some(handle) = unit.reaper.take() {
        handle.abort();
    }
    unit.epoch = unit.epoch.wrapping_add(1);
}
