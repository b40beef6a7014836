//! Start command watchdog
//!
//! The device forgets its stream destinations when it is power cycled, and a
//! start command sent before it was reachable is simply lost. While no
//! datagram has arrived on either socket for the silence threshold, the
//! watchdog re-sends the start commands, backing off while the device cannot
//! be reached.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::constants::{
    RETRY_BACKOFF_STEP, RETRY_BASE_DELAY, RETRY_MAX_DELAY, RETRY_POLL_INTERVAL,
    RETRY_UNCONFIGURED_WAIT,
};
use crate::network::ControlSender;
use crate::protocol::ControlCommand;

/// Time of the last datagram on any stream socket
#[derive(Debug)]
pub(crate) struct PacketActivity {
    epoch: Instant,
    /// Nanoseconds after `epoch`
    last: AtomicU64,
}

impl PacketActivity {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    pub(crate) fn mark(&self, now: Instant) {
        let offset = now.saturating_duration_since(self.epoch).as_nanos() as u64;
        self.last.store(offset, Ordering::Relaxed);
    }

    pub(crate) fn silent_for(&self, now: Instant) -> Duration {
        let last = self.epoch + Duration::from_nanos(self.last.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }
}

/// Pause before the next attempt after `failures` consecutive failed ones
pub(crate) fn retry_delay(failures: u32) -> Duration {
    if failures == 0 {
        return RETRY_BASE_DELAY;
    }
    RETRY_BASE_DELAY
        .saturating_add(RETRY_BACKOFF_STEP.saturating_mul(failures))
        .min(RETRY_MAX_DELAY)
}

/// Runs until `shutdown` is disconnected
pub(crate) fn run_retry_loop(
    shutdown: &Receiver<()>,
    activity: &PacketActivity,
    control: &dyn ControlSender,
    commands: &[ControlCommand],
    silence: Duration,
) {
    info!("Start command watchdog running, retrying after {:?} of silence", silence);
    let mut attempts: u32 = 0;
    let mut failures: u32 = 0;

    loop {
        let wait = if activity.silent_for(Instant::now()) <= silence {
            RETRY_POLL_INTERVAL
        } else if !control.is_configured() {
            debug!("Start command retry skipped, no device address configured");
            RETRY_UNCONFIGURED_WAIT
        } else {
            attempts = attempts.saturating_add(1);
            info!("No stream data, re-sending start commands (attempt {})", attempts);

            let mut delivered = true;
            for command in commands {
                if let Err(e) = control.send(command) {
                    warn!("Failed to re-send {} start command: {}", command.stream(), e);
                    delivered = false;
                }
            }

            failures = if delivered { 0 } else { failures.saturating_add(1) };
            let delay = retry_delay(failures);
            if failures > 0 {
                info!(
                    "Device unreachable ({} consecutive failures), next attempt in {:?}",
                    failures, delay
                );
            }
            delay
        };

        match shutdown.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("Start command watchdog stopped after {} attempts", attempts);
}
