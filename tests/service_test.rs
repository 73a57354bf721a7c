// Integration tests for the service facade: context lifecycle, commands,
// polling and camera streams

mod common;

use common::{harness, ip_addr, MockConnector, MockModernClient, MockPrinter};
use pretty_assertions::assert_eq;
use printfleet::backend::{
    BackendCapabilities, BackendKind, BackendVariant, JobSource, JobSpec, PrinterBackend,
    PrinterFamily,
};
use printfleet::connection::ConnectRequest;
use printfleet::context::{ConnectionHandle, ConnectionState, PrinterDetails, PrinterSettings};
use printfleet::context_manager::LifecycleEventKind;
use printfleet::polling::TickOutcome;
use printfleet::protocol::{FiltrationMode, MaterialMapping, ModernClient};
use printfleet::ContextId;
use std::sync::Arc;
use std::time::Duration;

async fn connect_legacy(h: &common::TestHarness, ip: &str) -> ContextId {
    h.service
        .connect(ConnectRequest::to(ip_addr(ip)))
        .await
        .data
        .expect("legacy printer connects")
}

fn active_count(h: &common::TestHarness) -> usize {
    h.service
        .list_contexts()
        .iter()
        .filter(|c| c.is_active)
        .count()
}

#[tokio::test]
async fn test_remove_twice_returns_not_found() {
    let connector = MockConnector::new().with_printer("10.1.0.1", MockPrinter::legacy("SN-1"));
    let h = harness(connector, 19200, 19201);
    let id = connect_legacy(&h, "10.1.0.1").await;

    let first = h.service.remove_context(id).await;
    assert!(first.success);
    assert!(h.connector.last_legacy().unwrap().is_disconnected());

    let second = h.service.remove_context(id).await;
    assert!(!second.success);
    assert_eq!(second.error_kind(), Some("NotFound"));
}

#[tokio::test]
async fn test_at_most_one_active_context() {
    let connector = MockConnector::new()
        .with_printer("10.1.0.1", MockPrinter::legacy("SN-1"))
        .with_printer("10.1.0.2", MockPrinter::legacy("SN-2"))
        .with_printer("10.1.0.3", MockPrinter::legacy("SN-3"));
    let h = harness(connector, 19202, 19203);

    let a = connect_legacy(&h, "10.1.0.1").await;
    assert_eq!(h.service.active_context_id(), Some(a));
    let b = connect_legacy(&h, "10.1.0.2").await;
    let c = connect_legacy(&h, "10.1.0.3").await;
    assert_eq!(active_count(&h), 1);

    assert!(h.service.switch_active_context(c).success);
    assert_eq!(h.service.active_context_id(), Some(c));
    assert_eq!(active_count(&h), 1);

    assert!(h.service.remove_context(c).await.success);
    assert_eq!(active_count(&h), 1);
    assert_eq!(h.service.active_context_id(), Some(a));

    assert!(h.service.remove_context(a).await.success);
    assert_eq!(h.service.active_context_id(), Some(b));
    assert!(h.service.remove_context(b).await.success);
    assert_eq!(active_count(&h), 0);
    assert_eq!(h.service.active_context_id(), None);

    let unknown = h.service.switch_active_context(ContextId::new());
    assert_eq!(unknown.error_kind(), Some("NotFound"));
}

#[tokio::test]
async fn test_lifecycle_events() {
    let connector = MockConnector::new()
        .with_printer("10.1.0.1", MockPrinter::legacy("SN-1"))
        .with_printer("10.1.0.2", MockPrinter::legacy("SN-2"));
    let h = harness(connector, 19204, 19205);
    let mut events = h.service.subscribe_lifecycle();

    let a = connect_legacy(&h, "10.1.0.1").await;
    let b = connect_legacy(&h, "10.1.0.2").await;
    h.service.remove_context(a).await;

    let received: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e| (e.context_id, e.event, e.previous_context_id))
        .collect();
    assert_eq!(
        received,
        vec![
            (a, LifecycleEventKind::Created, None),
            (a, LifecycleEventKind::Switched, None),
            (b, LifecycleEventKind::Created, None),
            (a, LifecycleEventKind::Removed, None),
            (b, LifecycleEventKind::Switched, Some(a)),
        ]
    );
}

#[tokio::test]
async fn test_start_job_unsupported_without_contacting_printer() {
    let h = harness(MockConnector::new(), 19206, 19207);

    let modern = Arc::new(MockModernClient::ready());
    let primary: Arc<dyn ModernClient> = modern.clone();
    let mut capabilities = BackendCapabilities::derive(
        PrinterFamily::Adventurer5M,
        BackendKind::DualProtocol,
        &PrinterSettings::default(),
        false,
    );
    capabilities.job_management.start_jobs = false;
    let backend = PrinterBackend::with_capabilities(
        PrinterFamily::Adventurer5M,
        BackendVariant::for_kind(BackendKind::DualProtocol, Some(primary), None).unwrap(),
        capabilities,
        ConnectionHandle::new(ConnectionState::Connected),
    );
    let details = PrinterDetails {
        name: "No jobs".to_string(),
        ip_address: ip_addr("10.1.0.9"),
        serial_number: "SN-NOJOBS".to_string(),
        model: "Flashforge Adventurer 5M".to_string(),
        family: PrinterFamily::Adventurer5M,
        check_code: Some("code".to_string()),
        settings: PrinterSettings::default(),
        last_connected: None,
    };
    let id = h.service.context_manager().create_context(details, backend);

    let response = h
        .service
        .start_job(
            Some(id),
            JobSpec {
                source: JobSource::Local {
                    file_name: "benchy.gcode".to_string(),
                },
                leveling_before_print: false,
                start_immediately: true,
                material_mappings: None,
            },
        )
        .await;

    assert!(!response.success);
    assert_eq!(response.error_kind(), Some("Unsupported"));
    assert_eq!(modern.calls(), 0);
}

#[tokio::test]
async fn test_commands_default_to_active_context() {
    let connector = MockConnector::new().with_printer("10.1.0.1", MockPrinter::legacy("SN-1"));
    let h = harness(connector, 19208, 19209);

    let none = h.service.pause(None).await;
    assert_eq!(none.error_kind(), Some("NotFound"));

    connect_legacy(&h, "10.1.0.1").await;
    assert_eq!(h.service.pause(None).await.data, Some(true));

    let raw = h
        .service
        .execute_raw_command(None, "~M119".to_string())
        .await;
    assert!(raw.success);
    assert_eq!(
        h.connector.last_legacy().unwrap().raw_commands.lock().clone(),
        vec!["~M119".to_string()]
    );

    let filtration = h.service.set_filtration(None, FiltrationMode::Internal).await;
    assert_eq!(filtration.error_kind(), Some("Unsupported"));
    let recent = h.service.list_recent_jobs(None).await;
    assert_eq!(recent.error_kind(), Some("Unsupported"));
    let local = h.service.list_local_jobs(None).await;
    assert_eq!(local.data, Some(vec!["benchy.gx".to_string()]));
}

#[tokio::test]
async fn test_material_station_job_validates_mappings() {
    let connector =
        MockConnector::new().with_printer("10.1.0.5", MockPrinter::ad5x("SN-AD5X", "code"));
    let h = harness(connector, 19210, 19211);
    let id = h
        .service
        .connect(ConnectRequest::to(ip_addr("10.1.0.5")).with_check_code("code"))
        .await
        .data
        .unwrap();

    let features = h.service.get_features(Some(id)).data.unwrap();
    assert_eq!(features.backend_kind, BackendKind::MaterialStation);
    assert!(features.capabilities.material_station.available);

    let mapping = |slot_id: u8| MaterialMapping {
        tool_id: 0,
        slot_id,
        material_name: "PLA".to_string(),
        tool_material_color: "#FFFFFF".to_string(),
        slot_material_color: "#FFFFFF".to_string(),
    };
    let job = |slot_id: u8| JobSpec {
        source: JobSource::Local {
            file_name: "multicolor.3mf".to_string(),
        },
        leveling_before_print: true,
        start_immediately: true,
        material_mappings: Some(vec![mapping(slot_id)]),
    };

    let ok = h.service.start_job(Some(id), job(1)).await;
    assert!(ok.success, "{:?}", ok.message);
    let modern = h.connector.last_modern().unwrap();
    let started = modern.started.lock().clone();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].material_mappings, Some(vec![mapping(1)]));

    // Slot 3 exists but is empty.
    let empty_slot = h.service.start_job(Some(id), job(3)).await;
    assert_eq!(empty_slot.error_kind(), Some("ValidationError"));
    let missing_slot = h.service.start_job(Some(id), job(9)).await;
    assert_eq!(missing_slot.error_kind(), Some("ValidationError"));
    assert_eq!(modern.started.lock().len(), 1);
}

#[tokio::test]
async fn test_mappings_rejected_on_printer_without_station() {
    let connector = MockConnector::new()
        .with_printer("10.1.0.6", MockPrinter::adventurer_5m("SN-5M", "code"));
    let h = harness(connector, 19212, 19213);
    h.service
        .connect(ConnectRequest::to(ip_addr("10.1.0.6")).with_check_code("code"))
        .await
        .data
        .unwrap();

    let response = h
        .service
        .start_job(
            None,
            JobSpec {
                source: JobSource::Local {
                    file_name: "part.gcode".to_string(),
                },
                leveling_before_print: false,
                start_immediately: true,
                material_mappings: Some(vec![MaterialMapping {
                    tool_id: 0,
                    slot_id: 1,
                    material_name: "PLA".to_string(),
                    tool_material_color: "#FFFFFF".to_string(),
                    slot_material_color: "#FFFFFF".to_string(),
                }]),
            },
        )
        .await;
    assert_eq!(response.error_kind(), Some("Unsupported"));
}

#[tokio::test]
async fn test_overlapping_ticks_issue_one_poll() {
    let connector = MockConnector::new().with_printer("10.1.0.1", MockPrinter::legacy("SN-1"));
    let h = harness(connector, 19214, 19215);
    let id = connect_legacy(&h, "10.1.0.1").await;
    let client = h.connector.last_legacy().unwrap();
    client.set_delay(Duration::from_millis(200));
    let mut updates = h.service.subscribe_status();

    assert_eq!(h.polling.tick(id), TickOutcome::Started);
    assert_eq!(h.polling.tick(id), TickOutcome::Skipped);

    let update = tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .expect("status published")
        .unwrap();
    assert_eq!(update.context_id, id);
    assert_eq!(client.status_calls(), 1);
    assert_eq!(
        client
            .max_in_flight
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    let status = h.service.get_status(Some(id)).await.data.unwrap();
    assert_eq!(status.led_on, update.status.led_on);
    // Served from the poll cache, no extra call.
    assert_eq!(client.status_calls(), 1);
}

#[tokio::test]
async fn test_failed_polls_keep_context_visible() {
    let connector = MockConnector::new().with_printer("10.1.0.1", MockPrinter::legacy("SN-1"));
    let h = harness(connector, 19216, 19217);
    let id = connect_legacy(&h, "10.1.0.1").await;
    let client = h.connector.last_legacy().unwrap();
    client.set_should_fail(true);

    for _ in 0..3 {
        assert_eq!(h.polling.tick(id), TickOutcome::Started);
        for _ in 0..100 {
            if !h.polling.is_in_flight(id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    let info = h.service.list_contexts().pop().unwrap();
    assert_eq!(info.id, id);
    assert_eq!(info.connection_state, ConnectionState::Reconnecting);
    assert!(h.polling.is_registered(id));
    assert_eq!(h.polling.consecutive_failures(id), Some(3));

    client.set_should_fail(false);
    let mut updates = h.service.subscribe_status();
    assert_eq!(h.polling.tick(id), TickOutcome::Started);
    tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .expect("recovered poll published")
        .unwrap();
    assert_eq!(h.polling.consecutive_failures(id), Some(0));
    assert_eq!(
        h.service.list_contexts().pop().unwrap().connection_state,
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn test_status_after_failed_poll_reports_failure() {
    let connector = MockConnector::new().with_printer("10.1.0.1", MockPrinter::legacy("SN-1"));
    let h = harness(connector, 19226, 19227);
    let id = connect_legacy(&h, "10.1.0.1").await;
    let client = h.connector.last_legacy().unwrap();

    let mut updates = h.service.subscribe_status();
    assert_eq!(h.polling.tick(id), TickOutcome::Started);
    tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .expect("first poll published")
        .unwrap();
    let calls_before = client.status_calls();
    assert!(h.service.get_status(Some(id)).await.success);
    // Served from the poll, no extra round trip.
    assert_eq!(client.status_calls(), calls_before);

    client.set_should_fail(true);
    assert_eq!(h.polling.tick(id), TickOutcome::Started);
    for _ in 0..100 {
        if !h.polling.is_in_flight(id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.polling.consecutive_failures(id), Some(1));

    let response = h.service.get_status(Some(id)).await;
    assert!(!response.success);
    assert_eq!(response.error_kind(), Some("TransportError"));
}

#[tokio::test]
async fn test_camera_stream_restart_and_teardown() {
    let connector = MockConnector::new().with_printer("10.1.0.1", MockPrinter::legacy("SN-CAM"));
    let h = harness(connector, 19218, 19221);

    let no_camera = connect_legacy(&h, "10.1.0.1").await;
    let response = h.service.start_camera_stream(Some(no_camera));
    assert_eq!(response.error_kind(), Some("Unsupported"));
    h.service.remove_context(no_camera).await;

    let settings = PrinterSettings {
        custom_camera_enabled: true,
        custom_camera_url: Some("http://127.0.0.1:9/?action=stream".to_string()),
        ..PrinterSettings::default()
    };
    let id = h
        .service
        .connect(ConnectRequest {
            settings: Some(settings),
            ..ConnectRequest::to(ip_addr("10.1.0.1"))
        })
        .await
        .data
        .unwrap();

    let first = h.service.start_camera_stream(Some(id)).data.unwrap();
    let second = h.service.start_camera_stream(Some(id)).data.unwrap();
    let ports = h.service.port_allocator();
    assert_eq!(ports.allocated_count(), 1);
    assert!(ports.is_allocated(second.port));
    if first.port != second.port {
        assert!(!ports.is_allocated(first.port));
    }
    assert_eq!(
        h.service.camera_stream(Some(id)).data.map(|s| s.port),
        Some(second.port)
    );

    assert!(h.service.remove_context(id).await.success);
    assert_eq!(ports.allocated_count(), 0);
    assert_eq!(ports.allocated_count() + ports.available_count(), ports.total_ports());
    assert!(h.service.streams().active_streams().is_empty());
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let settings = PrinterSettings {
        custom_camera_enabled: true,
        custom_camera_url: Some("http://127.0.0.1:9/".to_string()),
        ..PrinterSettings::default()
    };
    let connector = MockConnector::new()
        .with_printer("10.1.0.1", MockPrinter::legacy("SN-1"))
        .with_printer("10.1.0.2", MockPrinter::legacy("SN-2"));
    let h = harness(connector, 19222, 19225);

    let a = h
        .service
        .connect(ConnectRequest {
            settings: Some(settings),
            ..ConnectRequest::to(ip_addr("10.1.0.1"))
        })
        .await
        .data
        .unwrap();
    connect_legacy(&h, "10.1.0.2").await;
    assert!(h.service.start_camera_stream(Some(a)).success);
    assert_eq!(h.polling.registered_count(), 2);

    h.service.shutdown().await;

    assert!(h.service.list_contexts().is_empty());
    assert_eq!(h.polling.registered_count(), 0);
    assert_eq!(h.service.port_allocator().allocated_count(), 0);
    assert!(h
        .connector
        .legacy_clients
        .lock()
        .iter()
        .all(|c| c.is_disconnected()));
}
