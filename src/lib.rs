//! Multi-printer session daemon for FlashForge printers.
//!
//! [`PrinterService`] is the entry point: it owns the context manager, the
//! polling coordinator, the camera proxies and the connection flow.

pub mod backend;
pub mod config;
pub mod connection;
pub mod context;
pub mod context_manager;
pub mod discovery;
pub mod errors;
pub mod logging;
pub mod polling;
pub mod port_allocator;
pub mod printer_store;
pub mod protocol;
pub mod service;
pub mod stream_proxy;

#[cfg(test)]
mod test_support;

pub use context::{ContextId, ContextInfo, PrinterContext, PrinterDetails, PrinterSettings};
pub use errors::{CommandResponse, DaemonError, ErrorKind, Result};
pub use service::PrinterService;
