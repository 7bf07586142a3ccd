//! Async ingestion and aggregation loops around a shared [`Bridge`].
//!
//! Both loops stop when the shutdown flag turns `true` or its sender is
//! dropped. The bridge keeps the last computed state afterwards.

use crate::bridge::Bridge;
use crate::protocol::RawFrame;
use crate::state::PackState;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Feeds frames into the bridge until the channel closes or shutdown is
/// requested. Returns the number of frames taken from the channel.
pub async fn ingest(
    bridge: Arc<Bridge>,
    mut frames: mpsc::Receiver<RawFrame>,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut count = 0;
    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            frame = frames.recv() => match frame {
                Some(frame) => {
                    count += 1;
                    // dropped frames are counted and logged by the bridge
                    let _ = bridge.ingest(&frame);
                }
                None => {
                    log::debug!("Frame source closed");
                    break;
                }
            },
        }
    }
    count
}

/// Recomputes the pack state every configured interval and publishes it.
/// Returns the last state once shutdown is requested.
pub async fn aggregate(
    bridge: Arc<Bridge>,
    states: watch::Sender<Arc<PackState>>,
    mut shutdown: watch::Receiver<bool>,
) -> Arc<PackState> {
    let mut interval = tokio::time::interval(bridge.config().interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            _ = interval.tick() => {
                let state = bridge.tick(Instant::now());
                states.send_replace(state);
            }
        }
    }
    bridge.current_state()
}
