//! Unified operation surface over both printer protocol generations.
//!
//! A [`PrinterBackend`] is built once per context from the detected
//! [`PrinterFamily`]. Capabilities are computed at construction and never
//! change; every optional operation checks them before touching a client.

pub mod capabilities;
pub mod material;
pub mod status;

pub use capabilities::{BackendCapabilities, BackendKind, PrinterFamily};
pub use status::{JobProgress, MachineState, MaterialSlot, MaterialStationStatus, PrinterStatus, Temperatures};

use crate::context::{ConnectionHandle, ConnectionState, PrinterSettings};
use crate::errors::{DaemonError, Result};
use crate::protocol::{
    FiltrationMode, JobAction, LegacyClient, LocalJobRequest, MaterialMapping, ModernClient,
    UploadRequest,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the file for a job comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "source")]
pub enum JobSource {
    /// A file already stored on the printer.
    #[serde(rename_all = "camelCase")]
    Local { file_name: String },
    /// A file on this machine, uploaded first.
    Upload { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(flatten)]
    pub source: JobSource,
    #[serde(default)]
    pub leveling_before_print: bool,
    #[serde(default = "default_true")]
    pub start_immediately: bool,
    #[serde(default)]
    pub material_mappings: Option<Vec<MaterialMapping>>,
}

fn default_true() -> bool {
    true
}

/// Protocol clients held by each backend kind.
pub enum BackendVariant {
    Legacy {
        client: Arc<dyn LegacyClient>,
    },
    DualProtocol {
        primary: Arc<dyn ModernClient>,
        /// Absent when the G-code channel could not be opened.
        secondary: Option<Arc<dyn LegacyClient>>,
    },
    MaterialStation {
        primary: Arc<dyn ModernClient>,
        secondary: Option<Arc<dyn LegacyClient>>,
        /// Last station snapshot seen by a status poll.
        station: RwLock<Option<MaterialStationStatus>>,
    },
}

impl BackendVariant {
    pub fn legacy(client: Arc<dyn LegacyClient>) -> Self {
        BackendVariant::Legacy { client }
    }

    pub fn for_kind(
        kind: BackendKind,
        primary: Option<Arc<dyn ModernClient>>,
        secondary: Option<Arc<dyn LegacyClient>>,
    ) -> Result<Self> {
        match (kind, primary) {
            (BackendKind::Legacy, _) => secondary
                .map(BackendVariant::legacy)
                .ok_or_else(|| DaemonError::Validation("legacy backend needs a G-code client".into())),
            (BackendKind::DualProtocol, Some(primary)) => {
                Ok(BackendVariant::DualProtocol { primary, secondary })
            }
            (BackendKind::MaterialStation, Some(primary)) => Ok(BackendVariant::MaterialStation {
                primary,
                secondary,
                station: RwLock::new(None),
            }),
            (kind, None) => Err(DaemonError::Validation(format!(
                "{:?} backend needs an HTTP API client",
                kind
            ))),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            BackendVariant::Legacy { .. } => BackendKind::Legacy,
            BackendVariant::DualProtocol { .. } => BackendKind::DualProtocol,
            BackendVariant::MaterialStation { .. } => BackendKind::MaterialStation,
        }
    }

    fn legacy_client(&self) -> Option<&Arc<dyn LegacyClient>> {
        match self {
            BackendVariant::Legacy { client } => Some(client),
            BackendVariant::DualProtocol { secondary, .. }
            | BackendVariant::MaterialStation { secondary, .. } => secondary.as_ref(),
        }
    }

    fn modern_client(&self) -> Option<&Arc<dyn ModernClient>> {
        match self {
            BackendVariant::Legacy { .. } => None,
            BackendVariant::DualProtocol { primary, .. }
            | BackendVariant::MaterialStation { primary, .. } => Some(primary),
        }
    }
}

pub struct PrinterBackend {
    family: PrinterFamily,
    variant: BackendVariant,
    capabilities: BackendCapabilities,
    connection: ConnectionHandle,
}

impl PrinterBackend {
    /// Build a backend, deriving capabilities from family and settings.
    pub fn new(
        family: PrinterFamily,
        variant: BackendVariant,
        settings: &PrinterSettings,
        connection: ConnectionHandle,
    ) -> Self {
        let has_legacy = variant.legacy_client().is_some();
        let capabilities =
            BackendCapabilities::derive(family, variant.kind(), settings, has_legacy);
        Self::with_capabilities(family, variant, capabilities, connection)
    }

    pub fn with_capabilities(
        family: PrinterFamily,
        variant: BackendVariant,
        capabilities: BackendCapabilities,
        connection: ConnectionHandle,
    ) -> Self {
        Self {
            family,
            variant,
            capabilities,
            connection,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.variant.kind()
    }

    pub fn family(&self) -> PrinterFamily {
        self.family
    }

    pub fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Last material station snapshot, if this is a material-station backend.
    pub fn cached_station(&self) -> Option<MaterialStationStatus> {
        match &self.variant {
            BackendVariant::MaterialStation { station, .. } => station.read().clone(),
            _ => None,
        }
    }

    /// Run a client call, marking the shared connection state on transport failure.
    async fn tracked<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match fut.await {
            Ok(value) => {
                self.connection.transition(
                    &[ConnectionState::Error, ConnectionState::Reconnecting],
                    ConnectionState::Connected,
                );
                Ok(value)
            }
            Err(e) => {
                if e.is_transport()
                    && self.connection.transition(
                        &[
                            ConnectionState::Connected,
                            ConnectionState::Connecting,
                            ConnectionState::Reconnecting,
                        ],
                        ConnectionState::Error,
                    )
                {
                    warn!("{} failed, link marked as error: {}", operation, e);
                }
                Err(e)
            }
        }
    }

    fn require(available: bool, operation: &str) -> Result<()> {
        if available {
            Ok(())
        } else {
            Err(DaemonError::unsupported(operation))
        }
    }

    pub async fn get_status(&self) -> Result<PrinterStatus> {
        self.tracked("get_status", async {
            match &self.variant {
                BackendVariant::Legacy { client } => legacy_status(client.as_ref()).await,
                BackendVariant::DualProtocol { primary, .. } => {
                    let detail = primary.detail().await?;
                    Ok(PrinterStatus::from_modern(&detail))
                }
                BackendVariant::MaterialStation {
                    primary, station, ..
                } => {
                    let detail = primary.detail().await?;
                    let status = PrinterStatus::from_modern(&detail);
                    *station.write() = status.material_station.clone();
                    Ok(status)
                }
            }
        })
        .await
    }

    pub async fn pause(&self) -> Result<bool> {
        self.job_control(JobAction::Pause).await
    }

    pub async fn resume(&self) -> Result<bool> {
        self.job_control(JobAction::Resume).await
    }

    pub async fn cancel(&self) -> Result<bool> {
        self.job_control(JobAction::Cancel).await
    }

    async fn job_control(&self, action: JobAction) -> Result<bool> {
        Self::require(self.capabilities.job_management.job_control, action.as_wire())?;
        self.tracked("job_control", async {
            match (&self.variant, self.variant.modern_client()) {
                (_, Some(primary)) => primary.job_control(action).await,
                (BackendVariant::Legacy { client }, None) => match action {
                    JobAction::Pause => client.pause().await,
                    JobAction::Resume => client.resume().await,
                    JobAction::Cancel => client.cancel().await,
                },
                _ => Err(DaemonError::unsupported(action.as_wire())),
            }
        })
        .await
    }

    #[tracing::instrument(skip(self, spec), fields(backend = ?self.kind()))]
    pub async fn start_job(&self, spec: &JobSpec) -> Result<bool> {
        Self::require(self.capabilities.job_management.start_jobs, "start job")?;

        match &spec.source {
            JobSource::Upload { path } => {
                let request = UploadRequest {
                    start_now: spec.start_immediately,
                    leveling_before_print: spec.leveling_before_print,
                    material_mappings: spec.material_mappings.clone(),
                };
                self.upload_file(path, &request).await
            }
            JobSource::Local { file_name } => {
                if file_name.trim().is_empty() {
                    return Err(DaemonError::Validation("file name is empty".into()));
                }
                if !spec.start_immediately {
                    return Err(DaemonError::Validation(
                        "a stored file can only be started immediately".into(),
                    ));
                }
                self.check_mappings(spec.material_mappings.as_deref()).await?;

                info!("Starting stored job {}", file_name);
                self.tracked("start_job", async {
                    match &self.variant {
                        BackendVariant::Legacy { client } => {
                            if spec.leveling_before_print {
                                debug!("G-code channel ignores the leveling flag");
                            }
                            client.start_local_job(file_name).await
                        }
                        BackendVariant::DualProtocol { primary, .. }
                        | BackendVariant::MaterialStation { primary, .. } => {
                            let request = LocalJobRequest {
                                file_name: file_name.clone(),
                                leveling_before_print: spec.leveling_before_print,
                                material_mappings: spec.material_mappings.clone(),
                            };
                            primary.start_local_job(&request).await
                        }
                    }
                })
                .await
            }
        }
    }

    #[tracing::instrument(skip(self, request), fields(backend = ?self.kind()))]
    pub async fn upload_file(&self, path: &Path, request: &UploadRequest) -> Result<bool> {
        Self::require(self.capabilities.job_management.upload_jobs, "upload file")?;

        let primary = self
            .variant
            .modern_client()
            .ok_or_else(|| DaemonError::unsupported("upload file"))?;

        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            _ => {
                return Err(DaemonError::Validation(format!(
                    "{} is not a readable file",
                    path.display()
                )))
            }
        }

        self.check_mappings(request.material_mappings.as_deref()).await?;

        info!(
            "Uploading {} (start now: {})",
            path.display(),
            request.start_now
        );
        self.tracked("upload_file", primary.upload_file(path, request))
            .await
    }

    /// Mappings are only meaningful on the material station, and there they
    /// must match the station's current slots.
    async fn check_mappings(&self, mappings: Option<&[MaterialMapping]>) -> Result<()> {
        let Some(mappings) = mappings else {
            return Ok(());
        };

        match &self.variant {
            BackendVariant::MaterialStation {
                primary, station, ..
            } => {
                let detail = self.tracked("material_station", primary.detail()).await?;
                let snapshot = PrinterStatus::from_modern(&detail).material_station;
                *station.write() = snapshot.clone();
                let snapshot = snapshot.ok_or_else(|| {
                    DaemonError::Validation("printer did not report a material station".into())
                })?;
                material::validate_mappings(mappings, &snapshot)
            }
            _ => Err(DaemonError::unsupported("material mappings")),
        }
    }

    pub async fn execute_raw_command(&self, command: &str) -> Result<String> {
        Self::require(self.capabilities.gcode_commands.available, "raw G-code")?;
        let client = self
            .variant
            .legacy_client()
            .ok_or_else(|| DaemonError::unsupported("raw G-code"))?;

        let command = command.trim();
        if command.is_empty() {
            return Err(DaemonError::Validation("command is empty".into()));
        }
        debug!("Raw command: {}", command);
        self.tracked("execute_raw_command", client.send_raw(command))
            .await
    }

    pub async fn set_led(&self, on: bool) -> Result<bool> {
        Self::require(self.capabilities.led_available(), "LED control")?;

        if self.capabilities.led.custom_control_enabled {
            if let Some(client) = self.variant.legacy_client() {
                return self.tracked("set_led", client.set_led(on)).await;
            }
        }
        match self.variant.modern_client() {
            Some(primary) => self.tracked("set_led", primary.set_led(on)).await,
            None => Err(DaemonError::unsupported("LED control")),
        }
    }

    pub async fn set_filtration(&self, mode: FiltrationMode) -> Result<bool> {
        Self::require(self.capabilities.filtration.available, "filtration")?;
        let primary = self
            .variant
            .modern_client()
            .ok_or_else(|| DaemonError::unsupported("filtration"))?;
        self.tracked("set_filtration", primary.set_filtration(mode))
            .await
    }

    pub async fn list_local_jobs(&self) -> Result<Vec<String>> {
        Self::require(self.capabilities.job_management.local_jobs, "local jobs")?;
        self.tracked("list_local_jobs", async {
            match &self.variant {
                BackendVariant::Legacy { client } => client.list_local_files().await,
                BackendVariant::DualProtocol { primary, .. }
                | BackendVariant::MaterialStation { primary, .. } => primary.local_files().await,
            }
        })
        .await
    }

    pub async fn list_recent_jobs(&self) -> Result<Vec<String>> {
        Self::require(self.capabilities.job_management.recent_jobs, "recent jobs")?;
        let primary = self
            .variant
            .modern_client()
            .ok_or_else(|| DaemonError::unsupported("recent jobs"))?;
        self.tracked("list_recent_jobs", primary.recent_files())
            .await
    }

    /// Close every client. Errors are logged, not returned.
    pub async fn dispose(&self) {
        self.connection.set(ConnectionState::Disconnected);

        if let Some(primary) = self.variant.modern_client() {
            if let Err(e) = primary.disconnect().await {
                debug!("HTTP client disconnect failed: {}", e);
            }
        }
        if let Some(client) = self.variant.legacy_client() {
            if let Err(e) = client.disconnect().await {
                debug!("G-code client disconnect failed: {}", e);
            }
        }
    }
}

async fn legacy_status(client: &dyn LegacyClient) -> Result<PrinterStatus> {
    let machine = client.machine_status().await?;
    let temps = client.temperatures().await?;

    let state = MachineState::from_legacy(&machine.machine_status, &machine.move_mode);
    let progress = if state.is_job_active() {
        Some(client.print_progress().await?)
    } else {
        None
    };

    Ok(PrinterStatus::from_legacy(&machine, &temps, progress.as_ref()))
}
