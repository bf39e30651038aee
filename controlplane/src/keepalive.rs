//! # Keepalive Monitor
//!
//! Once a machine is running, one monitor task per machine probes the remote
//! until the machine stops:
//!
//! ```text
//! loop:
//!   probe (Keepalive for owners, Ping otherwise), bounded by keepalive_rpc_timeout
//!     ok        → last_keepalive = now; sleep negotiated interval
//!     failed    → if now - last_keepalive > keepalive_timeout: stop machine
//!                 else sleep retry interval
//! ```
//!
//! A keepalive reply with `healthy = false` counts as a failed probe. The
//! task exits as soon as the machine's cancellation token fires.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use workerd::{Error, Result};

use crate::machine::Machine;

/// Floor for the interval between probes.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Runs until the machine stops.
pub(crate) async fn monitor(machine: Machine) {
    let cancel = machine.cancel_token().clone();
    let cfg = machine.config().clone();
    let mut seq = 0u64;
    info!(id = %machine.id(), period = ?cfg.keepalive_period, "keepalive monitor started");

    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = probe(&machine, &mut seq) => outcome,
        };

        let wait = match outcome {
            Ok(next) => {
                machine.touch();
                next.clamp(MIN_INTERVAL, cfg.keepalive_period.max(MIN_INTERVAL))
            }
            Err(err) => {
                let last = machine.last_keepalive().unwrap_or_else(Instant::now);
                let silent = last.elapsed();
                if silent > cfg.keepalive_timeout {
                    machine.stop(Error::Unavailable(format!(
                        "no successful keepalive in {silent:?}: {err}"
                    )));
                    break;
                }
                warn!(id = %machine.id(), error = %err, silent = ?silent, "keepalive failed");
                cfg.retry_interval()
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!(id = %machine.id(), "keepalive monitor stopped");
}

/// One probe; returns the interval until the next one.
async fn probe(machine: &Machine, seq: &mut u64) -> Result<Duration> {
    let cfg = machine.config();
    let ctx = machine.internal_context(cfg.keepalive_rpc_timeout);
    if cfg.owner {
        let reply = machine
            .supervisor()
            .keepalive(&ctx, cfg.keepalive_period)
            .await?;
        if !reply.healthy {
            return Err(Error::Unavailable("remote reported unhealthy".to_string()));
        }
        Ok(reply.next)
    } else {
        let n = *seq;
        *seq += 1;
        let echoed = machine.supervisor().ping(&ctx, n).await?;
        if echoed != n {
            return Err(Error::Remote(format!("ping echoed {echoed}, sent {n}")));
        }
        Ok(cfg.keepalive_period)
    }
}
