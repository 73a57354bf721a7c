//! Public facade over the daemon's managers.
//!
//! Every operation resolves an optional context id (defaulting to the active
//! context) and answers with a [`CommandResponse`]; failures never escape as
//! `Err` or panics.

use crate::backend::{
    BackendCapabilities, BackendKind, JobSpec, PrinterBackend, PrinterFamily, PrinterStatus,
};
use crate::config::AppConfig;
use crate::connection::{BatchConnectResult, ConnectRequest, ConnectionFlowManager, ConnectionProgress};
use crate::context::{ConnectionState, ContextId, ContextInfo};
use crate::context_manager::{ContextManager, LifecycleEvent};
use crate::discovery::{DiscoveredPrinter, PrinterDiscovery};
use crate::errors::{CommandResponse, DaemonError, Result};
use crate::polling::{PollingCoordinator, StatusUpdate};
use crate::port_allocator::PortAllocator;
use crate::printer_store::PrinterDetailsStore;
use crate::protocol::{FiltrationMode, PrinterConnector, UploadRequest};
use crate::stream_proxy::{resolve_camera_url, StreamInfo, StreamOptions, StreamProxyService};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Capability answer for one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterFeatures {
    pub context_id: ContextId,
    pub family: PrinterFamily,
    pub backend_kind: BackendKind,
    pub capabilities: BackendCapabilities,
}

pub struct PrinterService {
    config: AppConfig,
    ports: Arc<PortAllocator>,
    contexts: Arc<ContextManager>,
    polling: Arc<PollingCoordinator>,
    streams: Arc<StreamProxyService>,
    connections: ConnectionFlowManager,
}

impl PrinterService {
    pub fn new(
        config: AppConfig,
        connector: Arc<dyn PrinterConnector>,
        discovery: Arc<dyn PrinterDiscovery>,
        store: Arc<dyn PrinterDetailsStore>,
    ) -> Result<Self> {
        let polling = PollingCoordinator::new(config.polling.clone());
        Self::with_polling(config, connector, discovery, store, polling)
    }

    /// Build the service around an existing polling coordinator.
    pub fn with_polling(
        config: AppConfig,
        connector: Arc<dyn PrinterConnector>,
        discovery: Arc<dyn PrinterDiscovery>,
        store: Arc<dyn PrinterDetailsStore>,
        polling: Arc<PollingCoordinator>,
    ) -> Result<Self> {
        config.validate()?;

        let ports = Arc::new(PortAllocator::new(
            config.camera.port_range_start,
            config.camera.port_range_end,
        )?);
        let contexts = Arc::new(ContextManager::new(ports.clone()));
        let streams = Arc::new(StreamProxyService::new(config.camera.clone(), ports.clone())?);

        contexts.add_hook(polling.clone());
        contexts.add_hook(streams.clone());

        let connections = ConnectionFlowManager::new(
            config.connection.clone(),
            connector,
            discovery,
            store,
            contexts.clone(),
        );

        info!(
            "Printer service ready (camera ports {}-{})",
            config.camera.port_range_start, config.camera.port_range_end
        );

        Ok(Self {
            config,
            ports,
            contexts,
            polling,
            streams,
            connections,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn context_manager(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    pub fn polling(&self) -> &Arc<PollingCoordinator> {
        &self.polling
    }

    pub fn streams(&self) -> &Arc<StreamProxyService> {
        &self.streams
    }

    pub fn port_allocator(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusUpdate> {
        self.polling.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.contexts.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ConnectionProgress> {
        self.connections.subscribe_progress()
    }

    // Context lifecycle

    pub fn list_contexts(&self) -> Vec<ContextInfo> {
        self.contexts.list_contexts()
    }

    pub fn active_context_id(&self) -> Option<ContextId> {
        self.contexts.active_context_id()
    }

    pub fn switch_active_context(&self, id: ContextId) -> CommandResponse<()> {
        self.contexts.switch_active_context(id).into()
    }

    pub async fn discover(&self) -> CommandResponse<Vec<DiscoveredPrinter>> {
        self.connections.discover().await.into()
    }

    pub async fn connect(&self, request: ConnectRequest) -> CommandResponse<ContextId> {
        self.connections.connect(request).await.into()
    }

    pub async fn connect_many(
        &self,
        requests: Vec<ConnectRequest>,
    ) -> CommandResponse<BatchConnectResult> {
        self.connections.connect_many(requests).await.into()
    }

    pub async fn reconnect_saved(&self, serial: &str) -> CommandResponse<ContextId> {
        self.connections.reconnect_saved(serial).await.into()
    }

    pub async fn auto_connect_saved(&self) -> CommandResponse<BatchConnectResult> {
        self.connections.auto_connect_saved().await.into()
    }

    /// Remove a context, stopping its polling and camera proxy and closing
    /// its printer links.
    pub async fn remove_context(&self, id: ContextId) -> CommandResponse<()> {
        self.connections.disconnect(id).await.into()
    }

    // Queries

    pub fn get_features(&self, context_id: Option<ContextId>) -> CommandResponse<PrinterFeatures> {
        self.contexts
            .resolve(context_id)
            .map(|context| {
                let backend = context.backend();
                PrinterFeatures {
                    context_id: context.id(),
                    family: backend.family(),
                    backend_kind: backend.kind(),
                    capabilities: backend.capabilities().clone(),
                }
            })
            .into()
    }

    /// Latest polled status while the link is healthy, otherwise a live query.
    pub async fn get_status(&self, context_id: Option<ContextId>) -> CommandResponse<PrinterStatus> {
        let context = match self.contexts.resolve(context_id) {
            Ok(context) => context,
            Err(e) => return CommandResponse::failure(&e),
        };
        if context.connection_state() == ConnectionState::Connected {
            if let Some(status) = self.polling.fresh_status(context.id()) {
                return CommandResponse::ok(status);
            }
        }
        context.backend().get_status().await.into()
    }

    // Commands

    pub async fn pause(&self, context_id: Option<ContextId>) -> CommandResponse<bool> {
        self.run(context_id, "pause", |backend| async move { backend.pause().await })
            .await
    }

    pub async fn resume(&self, context_id: Option<ContextId>) -> CommandResponse<bool> {
        self.run(context_id, "resume", |backend| async move { backend.resume().await })
            .await
    }

    pub async fn cancel(&self, context_id: Option<ContextId>) -> CommandResponse<bool> {
        self.run(context_id, "cancel", |backend| async move { backend.cancel().await })
            .await
    }

    pub async fn start_job(
        &self,
        context_id: Option<ContextId>,
        spec: JobSpec,
    ) -> CommandResponse<bool> {
        self.run(context_id, "start_job", move |backend| async move {
            backend.start_job(&spec).await
        })
        .await
    }

    pub async fn upload_file(
        &self,
        context_id: Option<ContextId>,
        path: PathBuf,
        request: UploadRequest,
    ) -> CommandResponse<bool> {
        self.run(context_id, "upload_file", move |backend| async move {
            backend.upload_file(&path, &request).await
        })
        .await
    }

    pub async fn execute_raw_command(
        &self,
        context_id: Option<ContextId>,
        command: String,
    ) -> CommandResponse<String> {
        self.run(context_id, "execute_raw_command", move |backend| async move {
            backend.execute_raw_command(&command).await
        })
        .await
    }

    pub async fn set_led(&self, context_id: Option<ContextId>, on: bool) -> CommandResponse<bool> {
        self.run(context_id, "set_led", move |backend| async move {
            backend.set_led(on).await
        })
        .await
    }

    pub async fn set_filtration(
        &self,
        context_id: Option<ContextId>,
        mode: FiltrationMode,
    ) -> CommandResponse<bool> {
        self.run(context_id, "set_filtration", move |backend| async move {
            backend.set_filtration(mode).await
        })
        .await
    }

    pub async fn list_local_jobs(&self, context_id: Option<ContextId>) -> CommandResponse<Vec<String>> {
        self.run(context_id, "list_local_jobs", |backend| async move {
            backend.list_local_jobs().await
        })
        .await
    }

    pub async fn list_recent_jobs(
        &self,
        context_id: Option<ContextId>,
    ) -> CommandResponse<Vec<String>> {
        self.run(context_id, "list_recent_jobs", |backend| async move {
            backend.list_recent_jobs().await
        })
        .await
    }

    // Camera

    pub fn start_camera_stream(&self, context_id: Option<ContextId>) -> CommandResponse<StreamInfo> {
        self.start_stream(context_id).into()
    }

    fn start_stream(&self, context_id: Option<ContextId>) -> Result<StreamInfo> {
        let context = self.contexts.resolve(context_id)?;
        let details = context.details();
        let source = resolve_camera_url(&details, context.backend().capabilities())?;
        let options = StreamOptions::resolve(&details.settings, &self.config.camera)?;
        self.streams.start(&context, &source, options).map_err(|e| {
            warn!("Camera stream for {} failed to start: {}", context.id(), e);
            e
        })
    }

    /// Returns whether a stream was running.
    pub fn stop_camera_stream(&self, context_id: Option<ContextId>) -> CommandResponse<bool> {
        self.contexts
            .resolve(context_id)
            .map(|context| self.streams.stop(&context))
            .into()
    }

    pub fn camera_stream(&self, context_id: Option<ContextId>) -> CommandResponse<StreamInfo> {
        self.contexts
            .resolve(context_id)
            .and_then(|context| {
                self.streams
                    .stream_info(context.id())
                    .ok_or_else(|| DaemonError::NotFound(format!("camera stream for {}", context.id())))
            })
            .into()
    }

    /// Remove every context, releasing ports, polling timers and printer links.
    pub async fn shutdown(&self) {
        let ids = self.contexts.context_ids();
        info!("Shutting down {} printer contexts", ids.len());
        for id in ids {
            if let Err(e) = self.connections.disconnect(id).await {
                warn!("Failed to disconnect {} during shutdown: {}", id, e);
            }
        }
        self.streams.stop_all();
        self.polling.stop_all();
    }

    #[tracing::instrument(skip(self, context_id, op), fields(context))]
    async fn run<T, F, Fut>(
        &self,
        context_id: Option<ContextId>,
        operation: &'static str,
        op: F,
    ) -> CommandResponse<T>
    where
        F: FnOnce(Arc<PrinterBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let context = match self.contexts.resolve(context_id) {
            Ok(context) => context,
            Err(e) => return CommandResponse::failure(&e),
        };
        tracing::Span::current().record("context", tracing::field::display(context.id()));

        let result = op(context.backend().clone()).await;
        if let Err(e) = &result {
            warn!("{} on {} failed: {}", operation, context.id(), e);
        }
        result.into()
    }
}
