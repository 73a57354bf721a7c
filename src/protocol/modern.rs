use super::{
    Credentials, FiltrationMode, JobAction, LocalJobRequest, ModernClient, ModernDetail,
    UploadRequest,
};
use crate::errors::{DaemonError, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Reply codes the firmware uses for a rejected serial/check code pair.
const AUTH_FAILURE_CODES: [i64; 2] = [1, 401];

/// Common reply envelope of the modern API.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
}

/// Client for the HTTP API exposed by current-generation printers.
pub struct HttpModernClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpModernClient {
    pub fn new(base_url: String, credentials: Credentials, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                error!("Failed to create HTTP client with custom config: {}. Using defaults.", e);
                Client::new()
            });

        let base_url = base_url.trim_end_matches('/').to_string();
        debug!("Initialized modern API client for {} ({})", base_url, credentials.serial_number);

        Self {
            client,
            base_url,
            credentials,
        }
    }

    fn auth_body(&self) -> serde_json::Map<String, Value> {
        let mut body = serde_json::Map::new();
        body.insert("serialNumber".into(), json!(self.credentials.serial_number));
        body.insert("checkCode".into(), json!(self.credentials.check_code));
        body
    }

    /// POST `body` (merged with credentials) and return the raw reply once
    /// the envelope reports success.
    async fn post(&self, path: &str, extra: Value) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut body = self.auth_body();
        if let Value::Object(fields) = extra {
            body.extend(fields);
        }

        let response = self
            .client
            .post(&url)
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(|e| {
                warn!("Request to {} failed: {}", url, e);
                DaemonError::Transport(e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!("{} returned {}: {}", url, status, text);
            return Err(DaemonError::Transport(format!("{} returned {}", path, status)));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| DaemonError::Transport(format!("Parse error from {}: {}", path, e)))?;

        self.check_envelope(path, &value)?;
        Ok(value)
    }

    fn check_envelope(&self, path: &str, value: &Value) -> Result<()> {
        let envelope: Envelope = serde_json::from_value(value.clone())
            .map_err(|e| DaemonError::Transport(format!("Malformed reply from {}: {}", path, e)))?;

        if envelope.code == 0 {
            return Ok(());
        }

        let message = envelope.message.to_ascii_lowercase();
        if AUTH_FAILURE_CODES.contains(&envelope.code)
            || message.contains("check code")
            || message.contains("checkcode")
        {
            warn!(
                "Printer {} rejected credentials on {}: {}",
                self.credentials.serial_number, path, envelope.message
            );
            return Err(DaemonError::PairingRequired {
                serial: self.credentials.serial_number.clone(),
            });
        }

        Err(DaemonError::Validation(format!(
            "{} rejected (code {}): {}",
            path, envelope.code, envelope.message
        )))
    }

    async fn control(&self, cmd: &str, args: Value) -> Result<bool> {
        let payload = json!({ "payload": { "cmd": cmd, "args": args } });
        match self.post("/control", payload).await {
            Ok(_) => Ok(true),
            Err(DaemonError::Validation(reason)) => {
                warn!("Control command {} refused: {}", cmd, reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn file_names(value: &Value, key: &str) -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| match entry {
                        Value::String(name) => Some(name.clone()),
                        Value::Object(obj) => obj
                            .get("gcodeFileName")
                            .and_then(|v| v.as_str())
                            .map(String::from),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn encode_mappings(request: &UploadRequest) -> Result<Option<String>> {
    match &request.material_mappings {
        Some(mappings) if !mappings.is_empty() => {
            let raw = serde_json::to_vec(mappings)?;
            Ok(Some(base64::engine::general_purpose::STANDARD.encode(raw)))
        }
        _ => Ok(None),
    }
}

#[async_trait]
impl ModernClient for HttpModernClient {
    async fn detail(&self) -> Result<ModernDetail> {
        let value = self.post("/detail", json!({})).await?;
        let detail = value
            .get("detail")
            .cloned()
            .ok_or_else(|| DaemonError::Transport("Detail reply missing 'detail'".to_string()))?;
        serde_json::from_value(detail)
            .map_err(|e| DaemonError::Transport(format!("Malformed detail reply: {}", e)))
    }

    async fn job_control(&self, action: JobAction) -> Result<bool> {
        self.control("jobCtl_cmd", json!({ "jobID": "", "action": action.as_wire() }))
            .await
    }

    async fn start_local_job(&self, request: &LocalJobRequest) -> Result<bool> {
        let mut body = json!({
            "fileName": request.file_name,
            "levelingBeforePrint": request.leveling_before_print,
        });

        if let Some(mappings) = &request.material_mappings {
            body["useMatlStation"] = json!(!mappings.is_empty());
            body["gcodeToolCnt"] = json!(mappings.len());
            body["materialMappings"] = serde_json::to_value(mappings)?;
            body["flowCalibration"] = json!(false);
        }

        info!("Starting local job {} on {}", request.file_name, self.credentials.serial_number);
        match self.post("/printGcode", body).await {
            Ok(_) => Ok(true),
            Err(DaemonError::Validation(reason)) => {
                warn!("Printer refused to start {}: {}", request.file_name, reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn upload_file(&self, path: &Path, request: &UploadRequest) -> Result<bool> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DaemonError::Validation(format!("Not a file path: {}", path.display())))?;

        let data = tokio::fs::read(path).await?;
        let size = data.len();
        let part = Part::bytes(data)
            .file_name(file_name.clone())
            .mime_str("application/octet-stream")
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        let form = Form::new().part("gcodeFile", part);

        let mut builder = self
            .client
            .post(format!("{}/uploadGcode", self.base_url))
            .header("serialNumber", &self.credentials.serial_number)
            .header("checkCode", &self.credentials.check_code)
            .header("fileSize", size.to_string())
            .header("printNow", request.start_now.to_string())
            .header("levelingBeforePrint", request.leveling_before_print.to_string());

        if let Some(encoded) = encode_mappings(request)? {
            let tool_count = request.material_mappings.as_ref().map_or(0, |m| m.len());
            builder = builder
                .header("flowCalibration", "false")
                .header("useMatlStation", "true")
                .header("gcodeToolCnt", tool_count.to_string())
                .header("materialMappings", encoded);
        }

        info!("Uploading {} ({} bytes) to {}", file_name, size, self.credentials.serial_number);

        let response = builder
            .multipart(form)
            .send()
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            warn!("Upload of {} failed with HTTP {}", file_name, status);
            return Err(DaemonError::Transport(format!("Upload returned {}", status)));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| DaemonError::Transport(format!("Parse error from /uploadGcode: {}", e)))?;
        match self.check_envelope("/uploadGcode", &value) {
            Ok(()) => Ok(true),
            Err(DaemonError::Validation(reason)) => {
                warn!("Printer refused upload of {}: {}", file_name, reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn recent_files(&self) -> Result<Vec<String>> {
        let value = self.post("/gcodeList", json!({})).await?;
        let mut files = Self::file_names(&value, "gcodeList");
        if files.is_empty() {
            files = Self::file_names(&value, "gcodeListDetail");
        }
        Ok(files)
    }

    async fn local_files(&self) -> Result<Vec<String>> {
        let value = self.post("/gcodeList", json!({ "all": true })).await?;
        Ok(Self::file_names(&value, "gcodeList"))
    }

    async fn set_led(&self, on: bool) -> Result<bool> {
        let status = if on { "open" } else { "close" };
        self.control("lightControl_cmd", json!({ "status": status }))
            .await
    }

    async fn set_filtration(&self, mode: FiltrationMode) -> Result<bool> {
        let (internal, external) = match mode {
            FiltrationMode::Internal => ("open", "close"),
            FiltrationMode::External => ("close", "open"),
            FiltrationMode::Off => ("close", "close"),
        };
        self.control(
            "circulateCtrl_cmd",
            json!({ "internal": internal, "external": external }),
        )
        .await
    }

    async fn disconnect(&self) -> Result<()> {
        // Stateless HTTP; nothing to tear down on the printer.
        debug!("Modern API client for {} released", self.credentials.serial_number);
        Ok(())
    }
}
