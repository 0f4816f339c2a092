use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::runtime::Runtime;

/// Pumps `runtime` once per `frame` until `shutdown` turns true or its sender is dropped.
/// Returns the number of frames pumped.
///
/// The runtime is not `Send`, so this future has to run on a local task or a
/// current-thread runtime.
pub async fn run_frame_loop(
    runtime: &mut Runtime,
    frame: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut ticker = interval(frame);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut frames = 0;
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                runtime.pump_once();
                frames += 1;
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!(target: "hearth", "Frame loop stopped after {} frames", frames);
    frames
}
