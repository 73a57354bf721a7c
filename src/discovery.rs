use crate::errors::{DaemonError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Probe payload the printers answer on the discovery port.
const DISCOVERY_PROBE: [u8; 20] = [
    0x77, 0x77, 0x77, 0x2e, 0x75, 0x73, 0x72, 0x22, 0x65, 0x36, 0xc0, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Size of a discovery reply.
pub const RESPONSE_LEN: usize = 0xC4;
const NAME_FIELD: std::ops::Range<usize> = 0x00..0x20;
const SERIAL_FIELD: std::ops::Range<usize> = 0x92..0xB2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPrinter {
    pub name: String,
    /// Empty when the firmware does not report one.
    pub serial_number: String,
    pub ip_address: IpAddr,
}

#[async_trait]
pub trait PrinterDiscovery: Send + Sync {
    /// Broadcast a probe and collect replies until `timeout` elapses.
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredPrinter>>;

    /// Current address of the printer with this serial, if it answers.
    async fn locate(&self, serial: &str, timeout: Duration) -> Result<Option<DiscoveredPrinter>> {
        if serial.is_empty() {
            return Ok(None);
        }
        let printers = self.discover(timeout).await?;
        Ok(printers.into_iter().find(|p| p.serial_number == serial))
    }
}

/// Discovery over UDP broadcast on the local network.
pub struct UdpDiscovery {
    port: u16,
}

impl UdpDiscovery {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    fn broadcast_socket() -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    /// Limited broadcast plus the directed broadcast of the primary interface.
    fn targets(&self) -> Vec<SocketAddr> {
        let mut targets = vec![SocketAddr::from((Ipv4Addr::BROADCAST, self.port))];

        match local_ip_address::local_ip() {
            Ok(IpAddr::V4(local)) => {
                let [a, b, c, _] = local.octets();
                let directed = Ipv4Addr::new(a, b, c, 255);
                debug!("Local address {}, directed broadcast {}", local, directed);
                targets.push(SocketAddr::from((directed, self.port)));
            }
            Ok(other) => debug!("Primary address {} is not IPv4", other),
            Err(e) => warn!("Could not determine local address: {}", e),
        }

        targets
    }
}

#[async_trait]
impl PrinterDiscovery for UdpDiscovery {
    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredPrinter>> {
        info!("Starting printer discovery (timeout: {:?})", timeout);

        let socket = Self::broadcast_socket()
            .map_err(|e| DaemonError::Discovery(format!("Failed to open socket: {}", e)))?;

        let mut sent = 0;
        for target in self.targets() {
            match socket.send_to(&DISCOVERY_PROBE, target).await {
                Ok(_) => sent += 1,
                Err(e) => warn!("Discovery probe to {} failed: {}", target, e),
            }
        }
        if sent == 0 {
            return Err(DaemonError::Discovery(
                "Could not send discovery probe on any interface".to_string(),
            ));
        }

        let deadline = Instant::now() + timeout;
        let mut printers: Vec<DiscoveredPrinter> = Vec::new();
        let mut buf = [0u8; 512];

        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;
            let (len, from) = match received {
                Err(_) => break,
                Ok(Err(e)) => {
                    warn!("Discovery receive failed: {}", e);
                    break;
                }
                Ok(Ok(reply)) => reply,
            };

            match parse_response(&buf[..len], from.ip()) {
                Some(printer) => {
                    if printers.iter().any(|p| p.ip_address == printer.ip_address) {
                        continue;
                    }
                    info!(
                        "Discovered printer {} ({}) at {}",
                        printer.name, printer.serial_number, printer.ip_address
                    );
                    printers.push(printer);
                }
                None => debug!("Ignoring {} byte reply from {}", len, from),
            }
        }

        info!("Discovery complete: {} printers found", printers.len());
        Ok(printers)
    }
}

/// Decode a discovery reply. Returns `None` for anything that is not one.
pub fn parse_response(buf: &[u8], ip: IpAddr) -> Option<DiscoveredPrinter> {
    if buf.len() < RESPONSE_LEN {
        return None;
    }

    let name = fixed_string(&buf[NAME_FIELD]);
    if name.is_empty() {
        return None;
    }

    Some(DiscoveredPrinter {
        name,
        serial_number: fixed_string(&buf[SERIAL_FIELD]),
        ip_address: ip,
    })
}

/// NUL-padded ASCII field.
fn fixed_string(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim().to_string()
}
