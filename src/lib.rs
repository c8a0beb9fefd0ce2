//! SyncProxy - A man-in-the-middle proxy for e-reader sync traffic
//!
//! Devices talk to the proxy instead of the vendor's todo/cde services. The proxy:
//! - Identifies each device (by cookie or ip) and remembers it in SQLite
//! - Forwards device requests upstream with the device's own client certificate
//! - Rewrites getItems responses: filters, rewrites urls and injects queued commands
//! - Health check endpoint

pub mod catalog;
pub mod certificate;
pub mod config;
pub mod database;
pub mod device;
pub mod document;
pub mod engine;
pub mod proxy;
pub mod registry;
pub mod rewrite;
pub mod upstream;

pub use catalog::{Catalog, CatalogItem, NoCatalog};
pub use certificate::{CertificateError, CertificateProvider, FileCertificateProvider, TlsContext};
pub use config::{Features, ProxyConfig, UpstreamHosts};
pub use database::{DatabaseManager, DeviceStore};
pub use device::{Action, ActionQueue, DeviceRecord, ItemType, Verb};
pub use document::{Document, Element};
pub use engine::RewriteEngine;
pub use proxy::ProxyServer;
pub use registry::{Device, Registry, RegistryError};
pub use rewrite::{RewriteRule, RewriteRules};
pub use upstream::UpstreamClient;
