//! Background flush worker.
//!
//! One task per running manager. It owns the periodic timer and the single
//! pending wake-up (retry after a failed batch, or follow-up after a batch
//! that left work behind). Flushes run inline, so the worker never races
//! itself; other callers are kept out by the flush guard. Flush requests
//! that pile up while a flush runs collapse into one.
//!
//! Threshold and manual flushes run outside the worker. Their outcomes are
//! reported back as [`Command::Settled`] so a failed batch still gets its
//! backoff retry.

use super::{FlushOutcome, Shared};
use crate::scheduler::FlushTrigger;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Requests from the facade to the worker.
#[derive(Debug)]
pub(super) enum Command {
    Flush(FlushTrigger),
    /// A flush finished elsewhere; arm the wake-up it calls for.
    Settled(FlushOutcome),
}

/// Next one-shot flush the worker owes.
#[derive(Debug, Clone, Copy)]
struct Wake {
    at: Instant,
    trigger: FlushTrigger,
}

pub(super) async fn run(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = shared.config.flush_interval_duration();
    let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut wake: Option<Wake> = None;

    info!(interval_ms = interval.as_millis() as u64, "Flush worker started");

    loop {
        let deadline = wake.map(|w| w.at);
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Settled(outcome)) => {
                        wake = next_wake(&shared, &outcome).or(wake);
                    }
                    Some(Command::Flush(trigger)) => {
                        let coalesced = drain_pending(&shared, &mut commands, &mut wake);
                        if coalesced > 0 {
                            debug!(coalesced, "Coalesced flush requests");
                        }
                        let outcome = shared.flush(trigger).await;
                        wake = next_wake(&shared, &outcome).or(wake);
                    }
                    None => break,
                }
            }

            _ = sleep_until(deadline) => {
                let trigger = wake.take().map(|w| w.trigger).unwrap_or(FlushTrigger::Retry);
                let outcome = shared.flush(trigger).await;
                wake = next_wake(&shared, &outcome);
            }

            _ = timer.tick() => {
                let due = shared
                    .schedule
                    .lock()
                    .timer_due(Instant::now(), shared.pending_count());
                if due {
                    let outcome = shared.flush(FlushTrigger::Timer).await;
                    wake = next_wake(&shared, &outcome).or(wake);
                }
            }
        }
    }

    info!("Flush worker stopped");
}

/// The wake-up a flush outcome calls for, if any.
fn next_wake(shared: &Shared, outcome: &FlushOutcome) -> Option<Wake> {
    let now = Instant::now();
    match outcome {
        FlushOutcome::Committed { remaining, .. } if *remaining > 0 => {
            let at = now + shared.config.flush_interval_duration();
            debug!(remaining, "Scheduling follow-up flush");
            Some(Wake {
                at,
                trigger: FlushTrigger::FollowUp,
            })
        }
        FlushOutcome::Failed { retry_in, .. } => {
            debug!(retry_in_ms = retry_in.as_millis() as u64, "Scheduling retry flush");
            Some(Wake {
                at: now + *retry_in,
                trigger: FlushTrigger::Retry,
            })
        }
        _ => None,
    }
}

/// Discard flush requests already queued behind the one being served,
/// keeping any wake-ups reported in between.
fn drain_pending(
    shared: &Shared,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    wake: &mut Option<Wake>,
) -> usize {
    let mut drained = 0;
    while let Ok(cmd) = commands.try_recv() {
        match cmd {
            Command::Flush(_) => drained += 1,
            Command::Settled(outcome) => *wake = next_wake(shared, &outcome).or(*wake),
        }
    }
    drained
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
