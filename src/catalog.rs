//! Content catalog
//! Tells the proxy which library items must be delivered to a device again

use crate::device::DeviceRecord;

/// A library item that changed since a device last fetched it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogItem {
    pub key: String,
    pub title: String,
    pub content_type: String,
}

/// Source of content updates for devices
pub trait Catalog: Send + Sync {
    fn items_needing_update_for(&self, device: &DeviceRecord) -> Vec<CatalogItem>;
}

/// Catalog with no content; nothing ever needs updating
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCatalog;

impl Catalog for NoCatalog {
    fn items_needing_update_for(&self, _device: &DeviceRecord) -> Vec<CatalogItem> {
        Vec::new()
    }
}
