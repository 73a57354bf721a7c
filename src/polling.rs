//! Per-context status polling.
//!
//! Every context gets its own timer task. The active context polls at the
//! short interval, the rest at the long one. A tick that fires while the
//! previous poll is still running is skipped, never queued. Failures back off
//! exponentially but never beyond the inactive interval, and never stop the
//! timer: only removing the context does that.

use crate::backend::PrinterStatus;
use crate::config::PollingConfig;
use crate::context::{ConnectionState, ContextId, PrinterContext};
use crate::context_manager::ContextLifecycleHook;
use backon::{BackoffBuilder, ExponentialBuilder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Consecutive failures after which an errored link is reported as reconnecting.
const RECONNECTING_AFTER: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub context_id: ContextId,
    pub status: PrinterStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollPhase {
    Stopped,
    Scheduled,
    Polling,
    Backoff,
}

/// Result of a manual [`PollingCoordinator::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Started,
    /// A poll for this context is still in flight.
    Skipped,
    UnknownContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollOutcome {
    Succeeded,
    Failed,
    Skipped,
    /// The context went away while the poll was running.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheduling {
    Timer,
    Manual,
}

struct PollSlot {
    context: Arc<PrinterContext>,
    active: bool,
    in_flight: Arc<AtomicBool>,
    failures: u32,
    phase: PollPhase,
    last_status: Option<PrinterStatus>,
    timer: Option<JoinHandle<()>>,
}

impl Drop for PollSlot {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Clears the in-flight flag however the poll ends.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum PollStart {
    Started(JoinHandle<PollOutcome>),
    Skipped,
    Unknown,
}

pub struct PollingCoordinator {
    config: PollingConfig,
    scheduling: Scheduling,
    slots: Mutex<HashMap<ContextId, PollSlot>>,
    updates: broadcast::Sender<StatusUpdate>,
    me: Weak<Self>,
}

impl PollingCoordinator {
    /// Coordinator that runs a timer per context.
    pub fn new(config: PollingConfig) -> Arc<Self> {
        Self::build(config, Scheduling::Timer)
    }

    /// Coordinator that only polls when [`tick`](Self::tick) is called.
    pub fn manual(config: PollingConfig) -> Arc<Self> {
        Self::build(config, Scheduling::Manual)
    }

    fn build(config: PollingConfig, scheduling: Scheduling) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new_cyclic(|me| Self {
            config,
            scheduling,
            slots: Mutex::new(HashMap::new()),
            updates,
            me: me.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    pub fn register(&self, context: Arc<PrinterContext>, active: bool) {
        let id = context.id();
        let mut slot = PollSlot {
            context,
            active,
            in_flight: Arc::new(AtomicBool::new(false)),
            failures: 0,
            phase: PollPhase::Stopped,
            last_status: None,
            timer: None,
        };
        let replaced = {
            // The timer's first poll looks the slot up, so it must be in the
            // map before the timer can run.
            let mut slots = self.slots.lock();
            self.start_timer(id, &mut slot, Duration::ZERO);
            slots.insert(id, slot)
        };
        // Dropping a replaced slot aborts its timer.
        drop(replaced);

        debug!("Polling registered for {} (active: {})", id, active);
    }

    /// Stop polling a context. Aborts its timer before returning.
    pub fn unregister(&self, id: ContextId) -> bool {
        let removed = self.slots.lock().remove(&id);
        match removed {
            Some(slot) => {
                slot.context.set_polling_enabled(false);
                drop(slot);
                debug!("Polling stopped for {}", id);
                true
            }
            None => false,
        }
    }

    pub fn set_active(&self, id: ContextId, active: bool) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&id) else {
            return;
        };
        if slot.active == active && slot.timer.is_some() {
            return;
        }
        slot.active = active;
        // Newly focused printers refresh right away.
        let first_delay = if active {
            Duration::ZERO
        } else {
            self.config.inactive_interval()
        };
        self.start_timer(id, slot, first_delay);
    }

    fn start_timer(&self, id: ContextId, slot: &mut PollSlot, first_delay: Duration) {
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        if self.scheduling == Scheduling::Manual {
            slot.phase = PollPhase::Scheduled;
            slot.context.set_polling_enabled(true);
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                slot.timer = Some(handle.spawn(run_timer(self.me.clone(), id, first_delay)));
                slot.phase = PollPhase::Scheduled;
                slot.context.set_polling_enabled(true);
            }
            Err(_) => {
                warn!("No async runtime; polling for {} not scheduled", id);
                slot.phase = PollPhase::Stopped;
            }
        }
    }

    /// Start a poll now unless one is already in flight.
    pub fn tick(&self, id: ContextId) -> TickOutcome {
        match self.start_poll(id) {
            PollStart::Started(_) => TickOutcome::Started,
            PollStart::Skipped => TickOutcome::Skipped,
            PollStart::Unknown => TickOutcome::UnknownContext,
        }
    }

    fn start_poll(&self, id: ContextId) -> PollStart {
        let Some(this) = self.me.upgrade() else {
            return PollStart::Unknown;
        };

        let (context, guard) = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&id) else {
                return PollStart::Unknown;
            };
            if slot.in_flight.swap(true, Ordering::AcqRel) {
                debug!("Poll for {} still in flight, skipping tick", id);
                return PollStart::Skipped;
            }
            slot.phase = PollPhase::Polling;
            (slot.context.clone(), InFlight(slot.in_flight.clone()))
        };

        // Spawned separately from the timer so that an in-flight call runs to
        // completion even if the timer is aborted.
        PollStart::Started(tokio::spawn(this.execute_poll(id, context, guard)))
    }

    async fn execute_poll(
        self: Arc<Self>,
        id: ContextId,
        context: Arc<PrinterContext>,
        _guard: InFlight,
    ) -> PollOutcome {
        let result = context.backend().get_status().await;

        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&id) else {
            debug!("Context {} removed during poll, discarding result", id);
            return PollOutcome::Discarded;
        };

        match result {
            Ok(status) => {
                slot.failures = 0;
                slot.phase = PollPhase::Scheduled;
                slot.last_status = Some(status.clone());
                drop(slots);

                if context.connection().transition(
                    &[ConnectionState::Error, ConnectionState::Reconnecting],
                    ConnectionState::Connected,
                ) {
                    info!("Context {} recovered", id);
                }
                let _ = self.updates.send(StatusUpdate {
                    context_id: id,
                    status,
                });
                PollOutcome::Succeeded
            }
            Err(e) => {
                slot.failures += 1;
                slot.phase = PollPhase::Backoff;
                let failures = slot.failures;
                drop(slots);

                if failures >= RECONNECTING_AFTER {
                    context
                        .connection()
                        .transition(&[ConnectionState::Error], ConnectionState::Reconnecting);
                }
                if failures == 1 {
                    warn!("Status poll for {} failed: {}", id, e);
                } else {
                    debug!("Status poll for {} failed ({} in a row): {}", id, failures, e);
                }
                PollOutcome::Failed
            }
        }
    }

    /// Delay before the next poll.
    pub fn delay_for(&self, active: bool, failures: u32) -> Duration {
        let base = if active {
            self.config.active_interval()
        } else {
            self.config.inactive_interval()
        };
        if failures == 0 {
            return base;
        }

        let cap = self.config.inactive_interval().max(base);
        ExponentialBuilder::default()
            .with_min_delay(base)
            .with_max_delay(cap)
            .with_max_times(usize::MAX)
            .build()
            .nth(failures.min(32) as usize)
            .unwrap_or(cap)
    }

    fn next_delay(&self, id: ContextId) -> Option<Duration> {
        let slots = self.slots.lock();
        let slot = slots.get(&id)?;
        Some(self.delay_for(slot.active, slot.failures))
    }

    pub fn is_registered(&self, id: ContextId) -> bool {
        self.slots.lock().contains_key(&id)
    }

    pub fn is_in_flight(&self, id: ContextId) -> bool {
        self.slots
            .lock()
            .get(&id)
            .map_or(false, |s| s.in_flight.load(Ordering::Acquire))
    }

    pub fn phase(&self, id: ContextId) -> Option<PollPhase> {
        self.slots.lock().get(&id).map(|s| s.phase)
    }

    pub fn consecutive_failures(&self, id: ContextId) -> Option<u32> {
        self.slots.lock().get(&id).map(|s| s.failures)
    }

    pub fn latest_status(&self, id: ContextId) -> Option<PrinterStatus> {
        self.slots.lock().get(&id).and_then(|s| s.last_status.clone())
    }

    /// Status from the most recent poll, only if that poll succeeded.
    pub fn fresh_status(&self, id: ContextId) -> Option<PrinterStatus> {
        self.slots
            .lock()
            .get(&id)
            .filter(|s| s.failures == 0)
            .and_then(|s| s.last_status.clone())
    }

    pub fn registered_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Stop every timer.
    pub fn stop_all(&self) {
        let drained: Vec<PollSlot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for slot in &drained {
            slot.context.set_polling_enabled(false);
        }
        info!("Stopped polling for {} contexts", drained.len());
    }
}

impl ContextLifecycleHook for PollingCoordinator {
    fn context_created(&self, context: &Arc<PrinterContext>, is_active: bool) {
        self.register(context.clone(), is_active);
    }

    fn context_switched(&self, previous: Option<ContextId>, current: ContextId) {
        if let Some(previous) = previous {
            self.set_active(previous, false);
        }
        self.set_active(current, true);
    }

    fn context_removing(&self, context: &Arc<PrinterContext>) {
        self.unregister(context.id());
    }
}

async fn run_timer(coordinator: Weak<PollingCoordinator>, id: ContextId, first_delay: Duration) {
    let mut delay = first_delay;
    loop {
        tokio::time::sleep(delay).await;

        let poll = match coordinator.upgrade() {
            Some(this) => this.start_poll(id),
            None => return,
        };
        let outcome = match poll {
            PollStart::Started(handle) => handle.await.unwrap_or(PollOutcome::Failed),
            PollStart::Skipped => PollOutcome::Skipped,
            PollStart::Unknown => return,
        };
        if outcome == PollOutcome::Discarded {
            return;
        }

        delay = match coordinator.upgrade().and_then(|this| this.next_delay(id)) {
            Some(delay) => delay,
            None => return,
        };
    }
}
