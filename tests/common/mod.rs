// Common test utilities and fixtures

use async_trait::async_trait;
use parking_lot::Mutex;
use printfleet::config::AppConfig;
use printfleet::discovery::{DiscoveredPrinter, PrinterDiscovery};
use printfleet::errors::{DaemonError, Result};
use printfleet::polling::PollingCoordinator;
use printfleet::printer_store::{MemoryStore, PrinterDetailsStore};
use printfleet::protocol::{
    Credentials, FiltrationMode, JobAction, LegacyClient, LegacyMachineStatus, LegacyPrinterInfo,
    LegacyProgress, LegacyTemperatures, LocalJobRequest, MaterialStationInfo, ModernClient,
    ModernDetail, PrinterConnector, SlotInfo, UploadRequest,
};
use printfleet::service::PrinterService;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Identity a mock printer reports on its G-code channel.
#[derive(Clone, Debug)]
#[allow(dead_code)]
pub struct MockPrinter {
    pub serial: String,
    pub machine_type: String,
    pub name: String,
    /// Check code the modern API accepts, if the printer speaks it.
    pub check_code: Option<String>,
}

#[allow(dead_code)]
impl MockPrinter {
    pub fn legacy(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            machine_type: "FlashForge Adventurer 4".to_string(),
            name: format!("Adventurer {}", serial),
            check_code: None,
        }
    }

    pub fn adventurer_5m(serial: &str, check_code: &str) -> Self {
        Self {
            serial: serial.to_string(),
            machine_type: "Flashforge Adventurer 5M".to_string(),
            name: format!("5M {}", serial),
            check_code: Some(check_code.to_string()),
        }
    }

    pub fn adventurer_5m_pro(serial: &str, check_code: &str) -> Self {
        Self {
            machine_type: "Flashforge Adventurer 5M Pro".to_string(),
            name: format!("5M Pro {}", serial),
            ..Self::adventurer_5m(serial, check_code)
        }
    }

    pub fn ad5x(serial: &str, check_code: &str) -> Self {
        Self {
            machine_type: "Flashforge AD5X".to_string(),
            name: format!("AD5X {}", serial),
            ..Self::adventurer_5m(serial, check_code)
        }
    }

    fn info(&self) -> LegacyPrinterInfo {
        LegacyPrinterInfo {
            machine_type: self.machine_type.clone(),
            machine_name: self.name.clone(),
            firmware_version: "v2.7.6".to_string(),
            serial_number: self.serial.clone(),
            tool_count: 1,
            mac_address: None,
        }
    }
}

/// Mock G-code channel
#[allow(dead_code)]
pub struct MockLegacyClient {
    pub info: LegacyPrinterInfo,
    pub status_calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub delay: Mutex<Option<Duration>>,
    pub should_fail: AtomicBool,
    pub raw_commands: Mutex<Vec<String>>,
    pub started_files: Mutex<Vec<String>>,
    pub disconnected: AtomicBool,
}

#[allow(dead_code)]
impl MockLegacyClient {
    pub fn new(info: LegacyPrinterInfo) -> Self {
        Self {
            info,
            status_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: Mutex::new(None),
            should_fail: AtomicBool::new(false),
            raw_commands: Mutex::new(Vec::new()),
            started_files: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(DaemonError::Transport("simulated printer failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LegacyClient for MockLegacyClient {
    async fn printer_info(&self) -> Result<LegacyPrinterInfo> {
        self.check()?;
        Ok(self.info.clone())
    }

    async fn temperatures(&self) -> Result<LegacyTemperatures> {
        self.check()?;
        Ok(LegacyTemperatures::default())
    }

    async fn machine_status(&self) -> Result<LegacyMachineStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.check()?;
        Ok(LegacyMachineStatus {
            machine_status: "READY".to_string(),
            move_mode: "READY".to_string(),
            led_on: true,
            current_file: None,
        })
    }

    async fn print_progress(&self) -> Result<LegacyProgress> {
        self.check()?;
        Ok(LegacyProgress::default())
    }

    async fn pause(&self) -> Result<bool> {
        self.check()?;
        Ok(true)
    }

    async fn resume(&self) -> Result<bool> {
        self.check()?;
        Ok(true)
    }

    async fn cancel(&self) -> Result<bool> {
        self.check()?;
        Ok(true)
    }

    async fn start_local_job(&self, file_name: &str) -> Result<bool> {
        self.check()?;
        self.started_files.lock().push(file_name.to_string());
        Ok(true)
    }

    async fn list_local_files(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(vec!["benchy.gx".to_string()])
    }

    async fn set_led(&self, _on: bool) -> Result<bool> {
        self.check()?;
        Ok(true)
    }

    async fn send_raw(&self, command: &str) -> Result<String> {
        self.check()?;
        self.raw_commands.lock().push(command.to_string());
        Ok(format!("CMD {} Received.\r\nok", command))
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Mock HTTP API client
#[allow(dead_code)]
pub struct MockModernClient {
    pub detail: Mutex<ModernDetail>,
    pub calls: AtomicUsize,
    pub actions: Mutex<Vec<JobAction>>,
    pub started: Mutex<Vec<LocalJobRequest>>,
    pub disconnected: AtomicBool,
}

#[allow(dead_code)]
impl MockModernClient {
    pub fn new(detail: ModernDetail) -> Self {
        Self {
            detail: Mutex::new(detail),
            calls: AtomicUsize::new(0),
            actions: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn ready() -> Self {
        Self::new(ModernDetail {
            status: Some("ready".to_string()),
            ..ModernDetail::default()
        })
    }

    /// Four-slot station with slots 1 and 2 loaded.
    pub fn with_station() -> Self {
        Self::new(ModernDetail {
            status: Some("ready".to_string()),
            has_matl_station: Some(true),
            matl_station_info: Some(MaterialStationInfo {
                current_slot: 1,
                slot_cnt: 4,
                state_action: 0,
                state_step: 0,
                slot_infos: vec![
                    SlotInfo {
                        slot_id: 1,
                        has_filament: true,
                        material_name: "PLA".to_string(),
                        material_color: "#FFFFFF".to_string(),
                    },
                    SlotInfo {
                        slot_id: 2,
                        has_filament: true,
                        material_name: "PETG".to_string(),
                        material_color: "#000000".to_string(),
                    },
                ],
            }),
            ..ModernDetail::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModernClient for MockModernClient {
    async fn detail(&self) -> Result<ModernDetail> {
        self.hit();
        Ok(self.detail.lock().clone())
    }

    async fn job_control(&self, action: JobAction) -> Result<bool> {
        self.hit();
        self.actions.lock().push(action);
        Ok(true)
    }

    async fn start_local_job(&self, request: &LocalJobRequest) -> Result<bool> {
        self.hit();
        self.started.lock().push(request.clone());
        Ok(true)
    }

    async fn upload_file(&self, _path: &Path, _request: &UploadRequest) -> Result<bool> {
        self.hit();
        Ok(true)
    }

    async fn recent_files(&self) -> Result<Vec<String>> {
        self.hit();
        Ok(vec!["recent.gcode".to_string()])
    }

    async fn local_files(&self) -> Result<Vec<String>> {
        self.hit();
        Ok(vec!["benchy.gcode".to_string()])
    }

    async fn set_led(&self, _on: bool) -> Result<bool> {
        self.hit();
        Ok(true)
    }

    async fn set_filtration(&self, _mode: FiltrationMode) -> Result<bool> {
        self.hit();
        Ok(true)
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector that hands out mock clients for a fixed set of addresses.
/// Unknown addresses refuse the connection.
#[derive(Default)]
#[allow(dead_code)]
pub struct MockConnector {
    printers: Mutex<HashMap<IpAddr, MockPrinter>>,
    legacy_down: Mutex<HashSet<IpAddr>>,
    pub legacy_connects: AtomicUsize,
    pub modern_connects: AtomicUsize,
    /// Yield to the scheduler inside `connect_modern`, like a real HTTP round trip.
    modern_yields: AtomicBool,
    pub legacy_clients: Mutex<Vec<Arc<MockLegacyClient>>>,
    pub modern_clients: Mutex<Vec<Arc<MockModernClient>>>,
}

#[allow(dead_code)]
impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_printer(self, ip: &str, printer: MockPrinter) -> Self {
        self.add_printer(ip, printer);
        self
    }

    pub fn add_printer(&self, ip: &str, printer: MockPrinter) {
        self.printers.lock().insert(ip_addr(ip), printer);
    }

    /// Make the G-code channel at `ip` refuse connections.
    pub fn set_legacy_down(&self, ip: &str) {
        self.legacy_down.lock().insert(ip_addr(ip));
    }

    pub fn set_modern_yields(&self) {
        self.modern_yields.store(true, Ordering::SeqCst);
    }

    pub fn last_legacy(&self) -> Option<Arc<MockLegacyClient>> {
        self.legacy_clients.lock().last().cloned()
    }

    pub fn last_modern(&self) -> Option<Arc<MockModernClient>> {
        self.modern_clients.lock().last().cloned()
    }
}

#[async_trait]
impl PrinterConnector for MockConnector {
    async fn connect_legacy(&self, ip: IpAddr) -> Result<Arc<dyn LegacyClient>> {
        self.legacy_connects.fetch_add(1, Ordering::SeqCst);
        if self.legacy_down.lock().contains(&ip) {
            return Err(DaemonError::Transport(format!("{}:8899 refused", ip)));
        }
        let printer = self
            .printers
            .lock()
            .get(&ip)
            .cloned()
            .ok_or_else(|| DaemonError::Transport(format!("{} is unreachable", ip)))?;

        let client = Arc::new(MockLegacyClient::new(printer.info()));
        self.legacy_clients.lock().push(client.clone());
        Ok(client)
    }

    async fn connect_modern(
        &self,
        ip: IpAddr,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ModernClient>> {
        self.modern_connects.fetch_add(1, Ordering::SeqCst);
        if self.modern_yields.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        let printer = self
            .printers
            .lock()
            .get(&ip)
            .cloned()
            .ok_or_else(|| DaemonError::Transport(format!("{} is unreachable", ip)))?;

        if printer.check_code.as_deref() != Some(credentials.check_code.as_str()) {
            return Err(DaemonError::PairingRequired {
                serial: credentials.serial_number.clone(),
            });
        }

        let client = if printer.machine_type.contains("AD5X") {
            MockModernClient::with_station()
        } else {
            MockModernClient::ready()
        };
        let client = Arc::new(client);
        self.modern_clients.lock().push(client.clone());
        Ok(client)
    }
}

/// Discovery that answers with a fixed list.
#[derive(Default)]
#[allow(dead_code)]
pub struct MockDiscovery {
    pub printers: Mutex<Vec<DiscoveredPrinter>>,
    pub calls: AtomicUsize,
}

#[allow(dead_code)]
impl MockDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn announce(&self, serial: &str, ip: &str) {
        let mut printers = self.printers.lock();
        printers.retain(|p| p.serial_number != serial);
        printers.push(DiscoveredPrinter {
            name: format!("Printer {}", serial),
            serial_number: serial.to_string(),
            ip_address: ip_addr(ip),
        });
    }
}

#[async_trait]
impl PrinterDiscovery for MockDiscovery {
    async fn discover(&self, _timeout: Duration) -> Result<Vec<DiscoveredPrinter>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.printers.lock().clone())
    }
}

#[allow(dead_code)]
pub fn ip_addr(ip: &str) -> IpAddr {
    ip.parse().expect("valid test address")
}

/// Config with its own camera port range so test binaries don't collide.
#[allow(dead_code)]
pub fn test_config(port_start: u16, port_end: u16) -> AppConfig {
    let mut config = AppConfig::default();
    config.camera.port_range_start = port_start;
    config.camera.port_range_end = port_end;
    config.polling.active_interval_ms = 50;
    config.polling.inactive_interval_ms = 200;
    config
}

/// Everything a service test needs to poke at.
#[allow(dead_code)]
pub struct TestHarness {
    pub service: PrinterService,
    pub connector: Arc<MockConnector>,
    pub discovery: Arc<MockDiscovery>,
    pub store: Arc<MemoryStore>,
    pub polling: Arc<PollingCoordinator>,
}

/// Service with manually ticked polling.
#[allow(dead_code)]
pub fn harness(connector: MockConnector, port_start: u16, port_end: u16) -> TestHarness {
    harness_with_store(connector, MemoryStore::new(), port_start, port_end)
}

#[allow(dead_code)]
pub fn harness_with_store(
    connector: MockConnector,
    store: MemoryStore,
    port_start: u16,
    port_end: u16,
) -> TestHarness {
    let config = test_config(port_start, port_end);
    let connector = Arc::new(connector);
    let discovery = Arc::new(MockDiscovery::new());
    let store = Arc::new(store);
    let polling = PollingCoordinator::manual(config.polling.clone());

    let service = PrinterService::with_polling(
        config,
        connector.clone(),
        discovery.clone(),
        store.clone() as Arc<dyn PrinterDetailsStore>,
        polling.clone(),
    )
    .expect("service builds");

    TestHarness {
        service,
        connector,
        discovery,
        store,
        polling,
    }
}
