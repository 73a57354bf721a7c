//! Connection flow: identify the printer, pair if needed, build the right
//! backend and register a context.
//!
//! A context is registered only as the very last step, so a failed attempt
//! never leaves anything behind in the context manager.

use crate::backend::{BackendKind, BackendVariant, PrinterBackend, PrinterFamily};
use crate::config::ConnectionConfig;
use crate::context::{
    ConnectionHandle, ConnectionState, ContextId, PrinterDetails, PrinterSettings,
};
use crate::context_manager::{ContextManager, Registration};
use crate::discovery::{DiscoveredPrinter, PrinterDiscovery};
use crate::errors::{DaemonError, ErrorKind, Result};
use crate::printer_store::PrinterDetailsStore;
use crate::protocol::{Credentials, LegacyClient, LegacyPrinterInfo, PrinterConnector};
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, info, warn};

const PROGRESS_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "phase")]
pub enum ConnectionPhase {
    Idle,
    Discovering,
    #[serde(rename_all = "camelCase")]
    AwaitingCheckCode { serial_number: String },
    Connecting,
    #[serde(rename_all = "camelCase")]
    Connected { context_id: ContextId },
    Failed { error: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProgress {
    /// Address or serial the attempt is for.
    pub target: String,
    #[serde(flatten)]
    pub phase: ConnectionPhase,
}

/// Direct connection to a known address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub ip_address: Option<IpAddr>,
    pub check_code: Option<String>,
    pub name: Option<String>,
    pub settings: Option<PrinterSettings>,
}

impl ConnectRequest {
    pub fn to(ip: IpAddr) -> Self {
        Self {
            ip_address: Some(ip),
            ..Self::default()
        }
    }

    pub fn with_check_code(mut self, code: impl Into<String>) -> Self {
        self.check_code = Some(code.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailure {
    pub target: String,
    pub error: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConnectResult {
    pub connected: Vec<ContextId>,
    pub failures: Vec<BatchFailure>,
}

pub struct ConnectionFlowManager {
    config: ConnectionConfig,
    connector: Arc<dyn PrinterConnector>,
    discovery: Arc<dyn PrinterDiscovery>,
    store: Arc<dyn PrinterDetailsStore>,
    contexts: Arc<ContextManager>,
    progress: broadcast::Sender<ConnectionProgress>,
    /// Attempts for the same serial run one at a time.
    serial_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConnectionFlowManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn PrinterConnector>,
        discovery: Arc<dyn PrinterDiscovery>,
        store: Arc<dyn PrinterDetailsStore>,
        contexts: Arc<ContextManager>,
    ) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            config,
            connector,
            discovery,
            store,
            contexts,
            progress,
            serial_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ConnectionProgress> {
        self.progress.subscribe()
    }

    fn report(&self, target: &str, phase: ConnectionPhase) {
        debug!("Connection {}: {:?}", target, phase);
        let _ = self.progress.send(ConnectionProgress {
            target: target.to_string(),
            phase,
        });
    }

    fn report_failure(&self, target: &str, err: &DaemonError) {
        match err {
            DaemonError::PairingRequired { serial } => self.report(
                target,
                ConnectionPhase::AwaitingCheckCode {
                    serial_number: serial.clone(),
                },
            ),
            _ => self.report(
                target,
                ConnectionPhase::Failed {
                    error: err.kind(),
                    message: err.to_string(),
                },
            ),
        }
    }

    pub async fn discover(&self) -> Result<Vec<DiscoveredPrinter>> {
        self.report("network", ConnectionPhase::Discovering);
        let result = self.discovery.discover(self.config.discovery_timeout()).await;
        match &result {
            Ok(_) => self.report("network", ConnectionPhase::Idle),
            Err(e) => self.report_failure("network", e),
        }
        result
    }

    /// Connect directly to an address.
    #[tracing::instrument(skip(self, request), fields(ip = ?request.ip_address))]
    pub async fn connect(&self, request: ConnectRequest) -> Result<ContextId> {
        let ip = request
            .ip_address
            .ok_or_else(|| DaemonError::Validation("printer address is required".into()))?;
        let target = ip.to_string();

        self.report(&target, ConnectionPhase::Connecting);
        match self.establish(ip, request, None).await {
            Ok(id) => {
                self.report(&target, ConnectionPhase::Connected { context_id: id });
                Ok(id)
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", target, e);
                self.report_failure(&target, &e);
                Err(e)
            }
        }
    }

    /// Reconnect to a persisted printer, following it if its address changed.
    #[tracing::instrument(skip(self))]
    pub async fn reconnect_saved(&self, serial: &str) -> Result<ContextId> {
        let saved = self
            .store
            .get(serial)
            .await?
            .ok_or_else(|| DaemonError::NotFound(format!("saved printer {}", serial)))?;

        self.report(serial, ConnectionPhase::Discovering);
        let ip = match self
            .discovery
            .locate(serial, self.config.discovery_timeout())
            .await
        {
            Ok(Some(found)) if found.ip_address != saved.ip_address => {
                info!(
                    "Printer {} moved from {} to {}",
                    serial, saved.ip_address, found.ip_address
                );
                found.ip_address
            }
            Ok(Some(found)) => found.ip_address,
            Ok(None) => {
                debug!("Printer {} did not answer discovery, using saved address", serial);
                saved.ip_address
            }
            Err(e) => {
                warn!("Discovery failed while locating {}: {}", serial, e);
                saved.ip_address
            }
        };

        self.report(serial, ConnectionPhase::Connecting);
        let request = ConnectRequest {
            ip_address: Some(ip),
            check_code: saved.check_code.clone(),
            name: Some(saved.name.clone()),
            settings: Some(saved.settings.clone()),
        };

        match self.establish(ip, request, Some(saved)).await {
            Ok(id) => {
                self.report(serial, ConnectionPhase::Connected { context_id: id });
                Ok(id)
            }
            Err(e) => {
                warn!("Reconnect to {} failed: {}", serial, e);
                self.report_failure(serial, &e);
                Err(e)
            }
        }
    }

    /// Connect to several printers independently.
    ///
    /// Fails only when every attempt failed.
    pub async fn connect_many(&self, requests: Vec<ConnectRequest>) -> Result<BatchConnectResult> {
        let targets: Vec<String> = requests
            .iter()
            .map(|r| r.ip_address.map_or_else(|| "unknown".to_string(), |ip| ip.to_string()))
            .collect();
        let attempts = requests.into_iter().map(|request| self.connect(request));
        let results = join_all(attempts).await;
        Self::collect_batch(targets, results)
    }

    /// Reconnect every persisted printer.
    pub async fn auto_connect_saved(&self) -> Result<BatchConnectResult> {
        let saved = self.store.load_all().await?;
        if saved.is_empty() {
            info!("No saved printers to reconnect");
            return Ok(BatchConnectResult::default());
        }

        info!("Reconnecting {} saved printers", saved.len());
        let targets: Vec<String> = saved.iter().map(|d| d.serial_number.clone()).collect();
        let attempts = saved
            .iter()
            .map(|details| self.reconnect_saved(&details.serial_number));
        let results = join_all(attempts).await;
        Self::collect_batch(targets, results)
    }

    fn collect_batch(
        targets: Vec<String>,
        results: Vec<Result<ContextId>>,
    ) -> Result<BatchConnectResult> {
        let total = results.len();
        let mut batch = BatchConnectResult::default();
        let mut first_error = None;

        for (target, result) in targets.into_iter().zip(results) {
            match result {
                Ok(id) => batch.connected.push(id),
                Err(e) => {
                    batch.failures.push(BatchFailure {
                        target,
                        error: e.kind(),
                        message: e.to_string(),
                    });
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            "Batch connect: {} of {} succeeded",
            batch.connected.len(),
            total
        );

        match first_error {
            Some(e) if batch.connected.is_empty() => Err(e),
            _ => Ok(batch),
        }
    }

    /// Remove the context and close its printer links.
    pub async fn disconnect(&self, id: ContextId) -> Result<()> {
        let context = self.contexts.remove_context(id)?;
        context.backend().dispose().await;
        info!("Disconnected context {}", id);
        Ok(())
    }

    async fn establish(
        &self,
        ip: IpAddr,
        request: ConnectRequest,
        saved: Option<PrinterDetails>,
    ) -> Result<ContextId> {
        // G-code channel first: it identifies the printer.
        let (legacy, info) = match self.connector.connect_legacy(ip).await {
            Ok(client) => match client.printer_info().await {
                Ok(info) => (Some(client), Some(info)),
                Err(e) => {
                    close_legacy(&client).await;
                    return Err(e);
                }
            },
            Err(e) => match &saved {
                // A known modern printer can run on the HTTP API alone.
                Some(saved) if saved.family.is_modern() && !saved.settings.force_legacy_mode => {
                    warn!(
                        "G-code channel to {} unavailable ({}), continuing without it",
                        ip, e
                    );
                    (None, None)
                }
                _ => return Err(e),
            },
        };

        let serial = info
            .as_ref()
            .map(|i| i.serial_number.clone())
            .filter(|s| !s.is_empty())
            .or_else(|| saved.as_ref().map(|s| s.serial_number.clone()))
            .unwrap_or_default();

        let _serial_guard = self.lock_serial(&serial).await;

        let saved = match saved {
            Some(saved) => Some(saved),
            None if !serial.is_empty() => self.store.get(&serial).await.unwrap_or_else(|e| {
                warn!("Could not read saved details for {}: {}", serial, e);
                None
            }),
            None => None,
        };

        if let Some(existing) = self.contexts.find_by_serial(&serial).filter(|_| !serial.is_empty()) {
            if let Some(client) = &legacy {
                close_legacy(client).await;
            }
            info!("Printer {} already connected as {}", serial, existing.id());
            return Ok(existing.id());
        }

        let details = build_details(ip, &serial, info.as_ref(), &request, saved.as_ref());
        let kind = BackendKind::for_family(details.family, details.settings.force_legacy_mode);

        let primary = if kind.uses_modern_api() {
            let Some(check_code) = details.check_code.clone().filter(|c| !c.is_empty()) else {
                if let Some(client) = &legacy {
                    close_legacy(client).await;
                }
                return Err(DaemonError::PairingRequired { serial });
            };
            let credentials = Credentials {
                serial_number: serial.clone(),
                check_code,
            };
            match self.connector.connect_modern(ip, &credentials).await {
                Ok(client) => Some(client),
                Err(e) => {
                    if let Some(client) = &legacy {
                        close_legacy(client).await;
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        if kind.uses_modern_api() && legacy.is_none() {
            warn!("Printer {} connected without G-code channel; raw commands unavailable", serial);
        }

        let variant = BackendVariant::for_kind(kind, primary, legacy)?;
        let backend = PrinterBackend::new(
            details.family,
            variant,
            &details.settings,
            ConnectionHandle::new(ConnectionState::Connected),
        );

        if !details.serial_number.is_empty() {
            if let Err(e) = self.store.save(&details).await {
                warn!("Could not persist printer {}: {}", details.serial_number, e);
            }
        }

        info!(
            "Connected to {} ({}) at {} using {:?} backend",
            details.name,
            details.family.display_name(),
            ip,
            kind
        );
        match self.contexts.create_unique_context(details, backend) {
            Registration::Created(id) => Ok(id),
            Registration::AlreadyConnected { id, backend } => {
                info!("Printer {} already connected as {}", serial, id);
                backend.dispose().await;
                Ok(id)
            }
        }
    }

    async fn lock_serial(&self, serial: &str) -> Option<OwnedMutexGuard<()>> {
        if serial.is_empty() {
            return None;
        }
        let lock = {
            let mut locks = self.serial_locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(serial.to_string()).or_default().clone()
        };
        Some(lock.lock_owned().await)
    }
}

async fn close_legacy(client: &Arc<dyn LegacyClient>) {
    if let Err(e) = client.disconnect().await {
        debug!("Closing G-code channel failed: {}", e);
    }
}

fn build_details(
    ip: IpAddr,
    serial: &str,
    info: Option<&LegacyPrinterInfo>,
    request: &ConnectRequest,
    saved: Option<&PrinterDetails>,
) -> PrinterDetails {
    let model = info
        .map(|i| i.machine_type.clone())
        .or_else(|| saved.map(|s| s.model.clone()))
        .unwrap_or_default();

    let family = match (info, saved) {
        (Some(_), _) => PrinterFamily::detect(&model),
        (None, Some(saved)) => saved.family,
        (None, None) => PrinterFamily::Legacy,
    };

    let name = request
        .name
        .clone()
        .or_else(|| saved.map(|s| s.name.clone()))
        .or_else(|| info.map(|i| i.machine_name.clone()))
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| family.display_name().to_string());

    PrinterDetails {
        name,
        ip_address: ip,
        serial_number: serial.to_string(),
        model,
        family,
        check_code: request
            .check_code
            .clone()
            .or_else(|| saved.and_then(|s| s.check_code.clone())),
        settings: request
            .settings
            .clone()
            .or_else(|| saved.map(|s| s.settings.clone()))
            .unwrap_or_default(),
        last_connected: Some(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(machine_type: &str) -> LegacyPrinterInfo {
        LegacyPrinterInfo {
            machine_type: machine_type.into(),
            machine_name: "Workshop".into(),
            serial_number: "SN1".into(),
            ..LegacyPrinterInfo::default()
        }
    }

    #[test]
    fn test_details_prefer_request_then_saved() {
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        let mut saved = crate::test_support::details("SN1");
        saved.check_code = Some("saved-code".into());
        saved.name = "Saved name".into();

        let request = ConnectRequest::to(ip).with_check_code("fresh-code");
        let details = build_details(
            ip,
            "SN1",
            Some(&info("Flashforge Adventurer 5M Pro")),
            &request,
            Some(&saved),
        );

        assert_eq!(details.family, PrinterFamily::Adventurer5MPro);
        assert_eq!(details.check_code.as_deref(), Some("fresh-code"));
        assert_eq!(details.name, "Saved name");
        assert_eq!(details.ip_address, ip);
        assert!(details.last_connected.is_some());
    }

    #[test]
    fn test_details_fall_back_to_saved_family_without_info() {
        let ip: IpAddr = "10.0.0.3".parse().unwrap();
        let mut saved = crate::test_support::details("SN9");
        saved.family = PrinterFamily::Ad5x;
        saved.model = "Flashforge AD5X".into();

        let details = build_details(ip, "SN9", None, &ConnectRequest::to(ip), Some(&saved));
        assert_eq!(details.family, PrinterFamily::Ad5x);
        assert_eq!(details.model, "Flashforge AD5X");
    }

    #[test]
    fn test_batch_fails_only_when_nothing_connected() {
        let ok = ContextId::new();
        let batch = ConnectionFlowManager::collect_batch(
            vec!["a".into(), "b".into()],
            vec![Ok(ok), Err(DaemonError::Transport("refused".into()))],
        )
        .unwrap();
        assert_eq!(batch.connected, vec![ok]);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].error, ErrorKind::TransportError);

        let err = ConnectionFlowManager::collect_batch(
            vec!["a".into()],
            vec![Err(DaemonError::Transport("refused".into()))],
        )
        .unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn test_progress_serializes_phase_tag() {
        let progress = ConnectionProgress {
            target: "10.0.0.2".into(),
            phase: ConnectionPhase::AwaitingCheckCode {
                serial_number: "SN1".into(),
            },
        };
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["phase"], "awaitingCheckCode");
        assert_eq!(json["target"], "10.0.0.2");
    }
}
