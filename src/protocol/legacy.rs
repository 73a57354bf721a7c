use super::{
    LegacyClient, LegacyMachineStatus, LegacyPrinterInfo, LegacyProgress, LegacyTemperatures,
    TempReading,
};
use crate::errors::{DaemonError, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

static TEMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(T\d|B):\s*(-?\d+(?:\.\d+)?)\s*/\s*(-?\d+(?:\.\d+)?)").expect("valid regex")
});
static PROGRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"byte\s+(\d+)\s*/\s*(\d+)").expect("valid regex"));
static LAYER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Layer:\s*(\d+)\s*/\s*(\d+)").expect("valid regex"));

/// Largest reply we are willing to buffer (file listings can be long).
const MAX_REPLY_BYTES: usize = 256 * 1024;

/// G-code client over a single persistent TCP connection.
///
/// Commands are strictly request/response, so the stream sits behind a mutex
/// and only one command is ever in flight. A broken stream is dropped and the
/// next command reopens it and claims control again. After `disconnect` the
/// channel stays closed.
pub struct TcpLegacyClient {
    address: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    connect_timeout: Duration,
    command_timeout: Duration,
    closed: AtomicBool,
}

impl TcpLegacyClient {
    pub async fn connect(
        address: SocketAddr,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self> {
        debug!("Opening G-code channel to {}", address);

        let client = Self {
            address,
            stream: Mutex::new(None),
            connect_timeout,
            command_timeout,
            closed: AtomicBool::new(false),
        };
        let stream = client.open().await?;
        *client.stream.lock().await = Some(stream);

        info!("G-code channel established to {}", address);
        Ok(client)
    }

    /// Open a socket and claim control of the printer with M601.
    async fn open(&self) -> Result<TcpStream> {
        let address = self.address;
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| DaemonError::Transport(format!("Connection timed out to {}", address)))?
            .map_err(|e| DaemonError::Transport(format!("Connection to {} failed: {}", address, e)))?;

        Self::set_tcp_keepalive(&stream);

        let reply = tokio::time::timeout(self.command_timeout, Self::exchange(&mut stream, "M601 S1"))
            .await
            .map_err(|_| {
                DaemonError::Transport(format!("Control request timed out on {}", address))
            })??;
        if !reply.contains("Control Success") {
            warn!("Printer at {} refused control: {}", address, reply.trim());
            stream.shutdown().await.ok();
            return Err(DaemonError::Transport(format!(
                "Printer at {} refused control",
                address
            )));
        }
        Ok(stream)
    }

    /// Keepalive: idle 30s, interval 10s.
    fn set_tcp_keepalive(stream: &TcpStream) {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(30))
            .with_interval(Duration::from_secs(10));

        let socket = socket2::SockRef::from(stream);
        if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
            debug!("Failed to set TCP keepalive: {} (non-fatal)", e);
        }
    }

    async fn close(&self) {
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            stream.shutdown().await.ok();
        }
    }

    /// Send `~<command>` and collect the reply up to the terminating `ok`.
    async fn command(&self, command: &str) -> Result<String> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() && !self.closed.load(Ordering::Acquire) {
            debug!("Reopening G-code channel to {}", self.address);
            *guard = Some(self.open().await?);
            info!("G-code channel to {} reopened", self.address);
        }
        let stream = guard.as_mut().ok_or_else(|| {
            DaemonError::Transport(format!("G-code channel to {} is closed", self.address))
        })?;

        let result = tokio::time::timeout(self.command_timeout, Self::exchange(stream, command))
            .await
            .map_err(|_| {
                DaemonError::Transport(format!("Command {} timed out on {}", command, self.address))
            })
            .and_then(|r| r);

        if let Err(e) = &result {
            warn!("G-code channel to {} failed: {}", self.address, e);
            *guard = None;
        }
        result
    }

    async fn exchange(stream: &mut TcpStream, command: &str) -> Result<String> {
        let line = format!("~{}\r\n", command);
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| DaemonError::Transport(e.to_string()))?;

        let mut reply = Vec::with_capacity(512);
        let mut buf = [0u8; 4096];
        loop {
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| DaemonError::Transport(e.to_string()))?;
            if n == 0 {
                return Err(DaemonError::Transport("Connection closed by printer".to_string()));
            }
            reply.extend_from_slice(&buf[..n]);

            if is_reply_complete(&reply) {
                break;
            }
            if reply.len() > MAX_REPLY_BYTES {
                return Err(DaemonError::Transport(format!(
                    "Reply to {} exceeded {} bytes",
                    command, MAX_REPLY_BYTES
                )));
            }
        }

        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    async fn acknowledged(&self, command: &str) -> Result<bool> {
        let reply = self.command(command).await?;
        Ok(reply.contains("Received") && !reply.to_ascii_lowercase().contains("error"))
    }
}

fn is_reply_complete(reply: &[u8]) -> bool {
    let text = String::from_utf8_lossy(reply);
    let trimmed = text.trim_end();
    trimmed.ends_with("\nok") || trimmed == "ok"
}

#[async_trait]
impl LegacyClient for TcpLegacyClient {
    async fn printer_info(&self) -> Result<LegacyPrinterInfo> {
        let reply = self.command("M115").await?;
        Ok(parse_printer_info(&reply))
    }

    async fn temperatures(&self) -> Result<LegacyTemperatures> {
        let reply = self.command("M105").await?;
        parse_temperatures(&reply)
    }

    async fn machine_status(&self) -> Result<LegacyMachineStatus> {
        let reply = self.command("M119").await?;
        Ok(parse_machine_status(&reply))
    }

    async fn print_progress(&self) -> Result<LegacyProgress> {
        let reply = self.command("M27").await?;
        Ok(parse_progress(&reply))
    }

    async fn pause(&self) -> Result<bool> {
        self.acknowledged("M25").await
    }

    async fn resume(&self) -> Result<bool> {
        self.acknowledged("M24").await
    }

    async fn cancel(&self) -> Result<bool> {
        self.acknowledged("M26").await
    }

    async fn start_local_job(&self, file_name: &str) -> Result<bool> {
        let name = file_name.trim_start_matches("0:/user/");
        self.acknowledged(&format!("M23 0:/user/{}", name)).await
    }

    async fn list_local_files(&self) -> Result<Vec<String>> {
        let reply = self.command("M661").await?;
        Ok(parse_file_list(&reply))
    }

    async fn set_led(&self, on: bool) -> Result<bool> {
        let level = if on { 255 } else { 0 };
        self.acknowledged(&format!("M146 r{0} g{0} b{0} F0", level))
            .await
    }

    async fn send_raw(&self, command: &str) -> Result<String> {
        let command = command.trim().trim_start_matches('~');
        self.command(command).await
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if self.stream.lock().await.is_some() {
            // Best effort; the printer drops control on socket close anyway.
            if let Err(e) = self.command("M602").await {
                debug!("M602 on {} failed during disconnect: {}", self.address, e);
            }
        }
        self.close().await;
        info!("G-code channel to {} closed", self.address);
        Ok(())
    }
}

/// Split `Key: value` lines, skipping the `CMD ... Received.` echo and `ok`.
fn reply_fields(reply: &str) -> impl Iterator<Item = (&str, &str)> {
    reply.lines().filter_map(|line| {
        let line = line.trim();
        if line.starts_with("CMD") || line == "ok" {
            return None;
        }
        let (key, value) = line.split_once(':')?;
        Some((key.trim(), value.trim()))
    })
}

pub(crate) fn parse_printer_info(reply: &str) -> LegacyPrinterInfo {
    let mut info = LegacyPrinterInfo {
        tool_count: 1,
        ..LegacyPrinterInfo::default()
    };
    for (key, value) in reply_fields(reply) {
        match key {
            "Machine Type" => info.machine_type = value.to_string(),
            "Machine Name" => info.machine_name = value.to_string(),
            "Firmware" => info.firmware_version = value.to_string(),
            "SN" => info.serial_number = value.to_string(),
            "Tool Count" | "Tool count" => info.tool_count = value.parse().unwrap_or(1),
            "Mac Address" => info.mac_address = Some(value.to_string()),
            _ => {}
        }
    }
    info
}

pub(crate) fn parse_temperatures(reply: &str) -> Result<LegacyTemperatures> {
    let mut temps = LegacyTemperatures::default();
    let mut found = false;

    for cap in TEMP_RE.captures_iter(reply) {
        let reading = TempReading {
            current: cap[2].parse().unwrap_or(0.0),
            target: cap[3].parse().unwrap_or(0.0),
        };
        match &cap[1] {
            "T0" => temps.extruder = reading,
            "T1" => temps.secondary_extruder = Some(reading),
            "B" => temps.bed = reading,
            _ => continue,
        }
        found = true;
    }

    if !found {
        return Err(DaemonError::Transport(format!(
            "Unrecognised temperature reply: {}",
            reply.trim()
        )));
    }
    Ok(temps)
}

pub(crate) fn parse_machine_status(reply: &str) -> LegacyMachineStatus {
    let mut status = LegacyMachineStatus::default();
    for (key, value) in reply_fields(reply) {
        match key {
            "MachineStatus" => status.machine_status = value.to_string(),
            "MoveMode" => status.move_mode = value.to_string(),
            "LED" => status.led_on = value == "1",
            "CurrentFile" if !value.is_empty() => status.current_file = Some(value.to_string()),
            _ => {}
        }
    }
    status
}

pub(crate) fn parse_progress(reply: &str) -> LegacyProgress {
    let percent = PROGRESS_RE
        .captures(reply)
        .and_then(|cap| {
            let done: f64 = cap[1].parse().ok()?;
            let total: f64 = cap[2].parse().ok()?;
            (total > 0.0).then(|| (done / total * 100.0).clamp(0.0, 100.0))
        })
        .unwrap_or(0.0);

    let layer = LAYER_RE.captures(reply).and_then(|cap| {
        let current = cap[1].parse().ok()?;
        let total = cap[2].parse().ok()?;
        Some((current, total))
    });

    LegacyProgress { percent, layer }
}

pub(crate) fn parse_file_list(reply: &str) -> Vec<String> {
    // Entries are separated by `::` markers and prefixed with the storage path.
    reply
        .split("::")
        .flat_map(|chunk| chunk.split("/data/"))
        .filter_map(|chunk| {
            let name = chunk
                .chars()
                .take_while(|c| !c.is_control())
                .collect::<String>()
                .trim()
                .to_string();
            let lower = name.to_ascii_lowercase();
            let is_job = lower.ends_with(".gcode")
                || lower.ends_with(".gx")
                || lower.ends_with(".g")
                || lower.ends_with(".3mf");
            (is_job && !name.contains("Received")).then_some(name)
        })
        .collect()
}
