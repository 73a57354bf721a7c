//! Owner of every live [`PrinterContext`] and of the active-context pointer.
//!
//! All mutations take the internal lock synchronously, so no caller can
//! observe a half-finished switch or removal. Lifecycle observers run outside
//! the lock, and removal observers run before the context leaves the map.

use crate::backend::PrinterBackend;
use crate::context::{ContextId, ContextInfo, PrinterContext, PrinterDetails};
use crate::errors::{DaemonError, Result};
use crate::port_allocator::PortAllocator;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEventKind {
    Created,
    Removed,
    Switched,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub context_id: ContextId,
    pub event: LifecycleEventKind,
    /// Set on `switched` when another context was active before.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_context_id: Option<ContextId>,
}

/// Outcome of [`ContextManager::create_unique_context`].
pub enum Registration {
    Created(ContextId),
    /// The printer already has a context; the unused backend is handed back
    /// so the caller can close it.
    AlreadyConnected { id: ContextId, backend: PrinterBackend },
}

/// Synchronous observer of context lifecycle.
///
/// Polling and streaming register here so that their per-context resources
/// are torn down before the context disappears.
pub trait ContextLifecycleHook: Send + Sync {
    fn context_created(&self, _context: &Arc<PrinterContext>, _is_active: bool) {}

    fn context_switched(&self, _previous: Option<ContextId>, _current: ContextId) {}

    fn context_removing(&self, _context: &Arc<PrinterContext>) {}
}

#[derive(Default)]
struct ManagerState {
    contexts: HashMap<ContextId, Arc<PrinterContext>>,
    /// Creation order, used for listing and for picking a new active context.
    order: Vec<ContextId>,
    active: Option<ContextId>,
    removing: HashSet<ContextId>,
}

pub struct ContextManager {
    state: RwLock<ManagerState>,
    ports: Arc<PortAllocator>,
    hooks: RwLock<Vec<Arc<dyn ContextLifecycleHook>>>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl ContextManager {
    pub fn new(ports: Arc<PortAllocator>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(ManagerState::default()),
            ports,
            hooks: RwLock::new(Vec::new()),
            events,
        }
    }

    pub fn add_hook(&self, hook: Arc<dyn ContextLifecycleHook>) {
        self.hooks.write().push(hook);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn port_allocator(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    fn hooks(&self) -> Vec<Arc<dyn ContextLifecycleHook>> {
        self.hooks.read().clone()
    }

    fn emit(&self, context_id: ContextId, event: LifecycleEventKind, previous: Option<ContextId>) {
        // No subscribers is fine.
        let _ = self.events.send(LifecycleEvent {
            context_id,
            event,
            previous_context_id: previous,
        });
    }

    /// Register a new context. The first context becomes active.
    pub fn create_context(&self, details: PrinterDetails, backend: PrinterBackend) -> ContextId {
        match self.insert_context(details, backend, false) {
            Registration::Created(id) | Registration::AlreadyConnected { id, .. } => id,
        }
    }

    /// Register a context unless a live one already exists for the same
    /// serial number. The check and the insert happen under one lock.
    pub fn create_unique_context(
        &self,
        details: PrinterDetails,
        backend: PrinterBackend,
    ) -> Registration {
        self.insert_context(details, backend, true)
    }

    fn insert_context(
        &self,
        details: PrinterDetails,
        backend: PrinterBackend,
        unique: bool,
    ) -> Registration {
        let id = ContextId::new();
        let serial = details.serial_number.clone();

        let (context, became_active) = {
            let mut state = self.state.write();
            if unique && !serial.is_empty() {
                if let Some(existing) = Self::live_by_serial(&state, &serial) {
                    let id = existing.id();
                    drop(state);
                    debug!("Printer {} already registered as {}", serial, id);
                    return Registration::AlreadyConnected { id, backend };
                }
            }
            let context = Arc::new(PrinterContext::new(id, details, backend));
            state.contexts.insert(id, context.clone());
            state.order.push(id);
            let became_active = if state.active.is_none() {
                state.active = Some(id);
                true
            } else {
                false
            };
            (context, became_active)
        };

        info!(
            "Context {} created for {} ({:?})",
            id,
            context.details().serial_number,
            context.backend().kind()
        );

        for hook in self.hooks() {
            hook.context_created(&context, became_active);
        }
        self.emit(id, LifecycleEventKind::Created, None);

        if became_active {
            for hook in self.hooks() {
                hook.context_switched(None, id);
            }
            self.emit(id, LifecycleEventKind::Switched, None);
        }

        Registration::Created(id)
    }

    /// Remove a context, tearing down everything it owns.
    ///
    /// Returns the removed context so the caller can dispose its backend.
    pub fn remove_context(&self, id: ContextId) -> Result<Arc<PrinterContext>> {
        let context = {
            let mut state = self.state.write();
            if state.removing.contains(&id) {
                return Err(DaemonError::NotFound(format!("context {}", id)));
            }
            let context = state
                .contexts
                .get(&id)
                .cloned()
                .ok_or_else(|| DaemonError::NotFound(format!("context {}", id)))?;
            state.removing.insert(id);
            context
        };
        context.mark_removed();

        for hook in self.hooks() {
            hook.context_removing(&context);
        }

        if let Some(port) = context.take_camera_port() {
            if !self.ports.release_port(port) {
                warn!("Camera port {} for context {} was not allocated", port, id);
            }
        }
        context.set_polling_enabled(false);

        let new_active = {
            let mut state = self.state.write();
            state.contexts.remove(&id);
            state.order.retain(|c| *c != id);
            state.removing.remove(&id);

            if state.active == Some(id) {
                let next = state.order.first().copied();
                state.active = next;
                Some(next)
            } else {
                None
            }
        };

        info!("Context {} removed", id);
        self.emit(id, LifecycleEventKind::Removed, None);

        if let Some(Some(next)) = new_active {
            debug!("Active context moved from {} to {}", id, next);
            for hook in self.hooks() {
                hook.context_switched(Some(id), next);
            }
            self.emit(next, LifecycleEventKind::Switched, Some(id));
        }

        Ok(context)
    }

    pub fn switch_active_context(&self, id: ContextId) -> Result<()> {
        let previous = {
            let mut state = self.state.write();
            if !state.contexts.contains_key(&id) || state.removing.contains(&id) {
                return Err(DaemonError::NotFound(format!("context {}", id)));
            }
            if state.active == Some(id) {
                return Ok(());
            }
            state.active.replace(id)
        };

        info!("Active context switched to {}", id);
        for hook in self.hooks() {
            hook.context_switched(previous, id);
        }
        self.emit(id, LifecycleEventKind::Switched, previous);
        Ok(())
    }

    pub fn active_context_id(&self) -> Option<ContextId> {
        self.state.read().active
    }

    pub fn get_active_context(&self) -> Option<Arc<PrinterContext>> {
        let state = self.state.read();
        state.active.and_then(|id| state.contexts.get(&id).cloned())
    }

    pub fn get_context(&self, id: ContextId) -> Option<Arc<PrinterContext>> {
        self.state.read().contexts.get(&id).cloned()
    }

    /// Look up `id`, or the active context when `None`.
    pub fn resolve(&self, id: Option<ContextId>) -> Result<Arc<PrinterContext>> {
        match id {
            Some(id) => self
                .get_context(id)
                .ok_or_else(|| DaemonError::NotFound(format!("context {}", id))),
            None => self
                .get_active_context()
                .ok_or_else(|| DaemonError::NotFound("no active context".to_string())),
        }
    }

    pub fn is_active(&self, id: ContextId) -> bool {
        self.state.read().active == Some(id)
    }

    /// Live context for `serial`. Contexts being removed are skipped.
    pub fn find_by_serial(&self, serial: &str) -> Option<Arc<PrinterContext>> {
        Self::live_by_serial(&self.state.read(), serial)
    }

    fn live_by_serial(state: &ManagerState, serial: &str) -> Option<Arc<PrinterContext>> {
        state
            .order
            .iter()
            .filter(|id| !state.removing.contains(id))
            .filter_map(|id| state.contexts.get(id))
            .find(|c| !c.is_removed() && c.details().serial_number == serial)
            .cloned()
    }

    pub fn list_contexts(&self) -> Vec<ContextInfo> {
        let state = self.state.read();
        state
            .order
            .iter()
            .filter_map(|id| state.contexts.get(id))
            .map(|c| c.info(state.active == Some(c.id())))
            .collect()
    }

    pub fn context_ids(&self) -> Vec<ContextId> {
        self.state.read().order.clone()
    }

    pub fn len(&self) -> usize {
        self.state.read().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
