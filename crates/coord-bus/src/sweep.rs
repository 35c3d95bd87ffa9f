use std::sync::Weak;
use std::time::Duration;

use crate::in_process::InProcessBus;

/// How often the sweep runs. TTL/idle/SLA deadlines only need to be caught
/// within a bounded slop, not exactly on time, so one shared tick beats a
/// timer per lock/agent/conflict.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Spawn the background sweep loop, grounded in the teacher's single
/// `tokio::select!` poll-and-act dispatch idiom (`OrchestratorEngine::run_execution_loop`).
/// Holds only a `Weak` reference so the task exits on its own once every
/// `Arc<InProcessBus>` handle is dropped, instead of needing an explicit
/// shutdown signal.
pub(crate) fn spawn_sweep(bus: Weak<InProcessBus>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(bus) = bus.upgrade() else {
                tracing::debug!("context_bus_sweep_stopping_no_handles_remain");
                return;
            };
            bus.sweep_once().await;
        }
    });
}
