//! Device registry
//! In-memory index of every known device, owning the provisional -> confirmed lifecycle
//! and the acquisition of each device's TLS client context.
//!
//! Lock order is always index -> device; nothing takes the index lock while holding a
//! device lock. Each index entry also keeps a copy of the device's last ip and cookie
//! under its own leaf lock, so `detect` can scan without touching device locks.

use crate::certificate::{CertificateError, CertificateProvider, TlsContext};
use crate::database::DeviceStore;
use crate::device::{seen_as, truncate_cookie, DeviceRecord};
use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A device record behind its own lock
pub type Device = Arc<Mutex<DeviceRecord>>;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tried to confirm already known device {current} as {serial}")]
    InvariantViolation { current: String, serial: String },
}

/// Where a device was last seen
#[derive(Debug, Default)]
struct Seen {
    ip: Option<String>,
    cookie: Option<String>,
}

impl Seen {
    fn of(record: &DeviceRecord) -> Self {
        Self {
            ip: record.last_ip.clone(),
            cookie: record.last_cookie.clone(),
        }
    }
}

/// Index slot. `seen` mirrors the record's ip and cookie so a scan never waits on a
/// device lock; it is a leaf lock, nothing else is taken while it is held.
struct Entry {
    device: Device,
    seen: Mutex<Seen>,
}

impl Entry {
    fn from_record(record: DeviceRecord) -> Arc<Self> {
        let seen = Seen::of(&record);
        Arc::new(Self {
            device: Arc::new(Mutex::new(record)),
            seen: Mutex::new(seen),
        })
    }

    fn wrap(device: Device, record: &DeviceRecord) -> Arc<Self> {
        Arc::new(Self {
            device,
            seen: Mutex::new(Seen::of(record)),
        })
    }

    fn matches(&self, ip: Option<&str>, cookie: Option<&str>) -> bool {
        let seen = self.seen.lock();
        seen_as(seen.ip.as_deref(), seen.cookie.as_deref(), ip, cookie)
    }
}

/// Index of known devices, keyed by serial
pub struct Registry {
    devices: RwLock<HashMap<String, Arc<Entry>>>,
    store: Arc<dyn DeviceStore>,
    certificates: Arc<dyn CertificateProvider>,
}

impl Registry {
    /// Load every stored device and try to build its TLS context.
    ///
    /// Devices whose context cannot be built are kept and retried on their next detection.
    pub fn load(store: Arc<dyn DeviceStore>, certificates: Arc<dyn CertificateProvider>) -> Result<Self> {
        let registry = Self {
            devices: RwLock::new(HashMap::new()),
            store,
            certificates,
        };

        let records = registry.store.load_all()?;
        let mut devices = HashMap::with_capacity(records.len());
        for mut record in records {
            registry.build_context(&mut record);
            devices.insert(record.serial.clone(), Entry::from_record(record));
        }
        info!("Loaded {} devices", devices.len());
        *registry.devices.write() = devices;

        Ok(registry)
    }

    /// Get a device by serial
    pub fn get(&self, serial: &str) -> Option<Device> {
        self.devices.read().get(serial).map(|e| e.device.clone())
    }

    /// Snapshot of all device handles
    pub fn devices(&self) -> Vec<Device> {
        self.devices.read().values().map(|e| e.device.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Guess the device behind a connection, creating a provisional one if nothing matches.
    ///
    /// The first device whose cookie or ip matches wins. Iteration order of the index is
    /// unspecified, so when several devices share an ip or overlapping cookies the one
    /// returned is not defined.
    pub fn detect(&self, ip: Option<&str>, cookie: Option<&str>) -> Device {
        let found = self.devices.read().values().find(|e| e.matches(ip, cookie)).cloned();

        let entry = match found {
            Some(entry) => entry,
            None => {
                let mut index = self.devices.write();
                // another request may have added it since the scan
                let found = index.values().find(|e| e.matches(ip, cookie)).cloned();
                match found {
                    Some(entry) => entry,
                    None => {
                        let record = DeviceRecord::provisional(ip, cookie);
                        info!("New provisional device {}", record);
                        let serial = record.serial.clone();
                        let entry = Entry::from_record(record);
                        index.insert(serial, entry.clone());
                        return entry.device.clone();
                    }
                }
            }
        };

        let mut record = entry.device.lock();
        if record.context_failed {
            // the certificate may have been put into place since the last attempt
            if !self.build_context(&mut record) {
                drop(record);
                return entry.device.clone();
            }
            info!("Recovered TLS context for {}", record);
            self.persist(&record, true);
        }
        self.touch(&entry, &mut record, ip, cookie);
        drop(record);

        entry.device.clone()
    }

    /// Give a provisional device its real serial.
    ///
    /// If the serial is already known (the device showed up before under another ip or
    /// cookie, or a concurrent confirmation got there first) that device is refreshed and
    /// returned instead, and the provisional stand-in is dropped. Returns `Ok(None)` when
    /// the device's TLS context cannot be built yet; the device keeps its serial and the
    /// next detection retries.
    pub fn confirm_device(&self, device: &Device, serial: &str) -> Result<Option<Device>, RegistryError> {
        let (provisional_serial, mut candidate) = {
            let record = device.lock();
            if !record.is_provisional() {
                return Err(RegistryError::InvariantViolation {
                    current: record.serial.clone(),
                    serial: serial.to_string(),
                });
            }
            (record.serial.clone(), record.clone())
        };

        if let Some(known) = self.find_confirmed(serial) {
            return Ok(Some(self.adopt(known, &provisional_serial, &candidate)));
        }

        // built outside any lock; only the re-key below is serialized
        candidate.serial = serial.to_string();
        let built = self.build_context(&mut candidate);

        {
            let mut index = self.devices.write();
            if let Some(known) = index.get(serial).cloned() {
                drop(index);
                return Ok(Some(self.adopt(known, &provisional_serial, &candidate)));
            }

            let mut record = device.lock();
            if !record.is_provisional() {
                return Err(RegistryError::InvariantViolation {
                    current: record.serial.clone(),
                    serial: serial.to_string(),
                });
            }
            record.serial = candidate.serial;
            record.certificate_material = candidate.certificate_material;
            record.tls_context = candidate.tls_context;
            record.context_failed = candidate.context_failed;

            let entry = match index.remove(&provisional_serial) {
                Some(entry) => entry,
                None => Entry::wrap(device.clone(), &record),
            };
            index.insert(serial.to_string(), entry);
        }

        if !built {
            warn!("Confirmation of {} deferred until its certificate is available", serial);
            return Ok(None);
        }

        let record = device.lock();
        self.persist(&record, true);
        info!("Registered device {}", record);
        drop(record);

        Ok(Some(device.clone()))
    }

    /// Set a device's external id and/or certificate material and store it.
    ///
    /// Empty values are ignored. New material replaces the TLS context when it builds.
    pub fn update(&self, device: &Device, external_id: Option<&str>, material: Option<Vec<u8>>) {
        let mut record = device.lock();
        if let Some(external_id) = external_id.filter(|id| !id.is_empty()) {
            record.external_id = Some(external_id.to_string());
        }
        if let Some(material) = material.filter(|m| !m.is_empty()) {
            record.certificate_material = Some(material);
            if self.build_context(&mut record) {
                info!("Rebuilt TLS context for {}", record);
            }
        }
        // a device without a context is only stored once it has one
        let insert = !record.context_failed;
        self.persist(&record, insert);
    }

    /// Write one confirmed device to the store
    pub fn save(&self, device: &Device) {
        let record = device.lock();
        self.persist(&record, false);
    }

    /// Write every confirmed device to the store
    pub fn save_all(&self) -> Result<()> {
        let records: Vec<DeviceRecord> = self
            .devices()
            .iter()
            .map(|d| d.lock().clone())
            .filter(|r| !r.is_provisional())
            .collect();

        self.store.update_all(&records)?;
        debug!("Saved {} devices", records.len());

        Ok(())
    }

    /// Fold a provisional stand-in into the confirmed device it turned out to be
    fn adopt(&self, known: Arc<Entry>, provisional_serial: &str, provisional: &DeviceRecord) -> Device {
        self.devices.write().remove(provisional_serial);

        let mut record = known.device.lock();
        self.touch(
            &known,
            &mut record,
            provisional.last_ip.as_deref(),
            provisional.last_cookie.as_deref(),
        );
        info!("Device {} seen before, dropped provisional {}", record, provisional_serial);
        drop(record);

        known.device.clone()
    }

    /// A confirmed device with this serial, from memory or from the store
    fn find_confirmed(&self, serial: &str) -> Option<Arc<Entry>> {
        let cached = self.devices.read().get(serial).cloned();
        if cached.is_some() {
            return cached;
        }

        match self.store.find(serial) {
            Ok(Some(mut record)) => {
                self.build_context(&mut record);
                let mut index = self.devices.write();
                let entry = index
                    .entry(serial.to_string())
                    .or_insert_with(|| Entry::from_record(record));
                Some(entry.clone())
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to look up device {}: {}", serial, e);
                None
            }
        }
    }

    /// Record the latest ip and cookie, writing to the store only if either changed
    fn touch(&self, entry: &Entry, record: &mut DeviceRecord, ip: Option<&str>, cookie: Option<&str>) -> bool {
        let cookie = cookie.filter(|c| !c.is_empty()).map(truncate_cookie);
        let ip_changed = ip.is_some() && record.last_ip.as_deref() != ip;
        let cookie_changed = cookie.is_some() && record.last_cookie.as_deref() != cookie;

        if !ip_changed && !cookie_changed {
            return false;
        }
        if ip_changed {
            record.last_ip = ip.map(str::to_string);
        }
        if cookie_changed {
            record.last_cookie = cookie.map(str::to_string);
        }
        *entry.seen.lock() = Seen::of(record);

        self.persist(record, false);
        true
    }

    /// Store a confirmed device; provisional devices never reach the store
    fn persist(&self, record: &DeviceRecord, insert: bool) {
        if record.is_provisional() {
            return;
        }
        let result = if insert {
            self.store.insert(record)
        } else {
            self.store.update(record)
        };
        if let Err(e) = result {
            warn!("Failed to store device {}: {}", record.serial, e);
        }
    }

    /// Build the device's TLS context, marking it failed if that is not possible
    fn build_context(&self, record: &mut DeviceRecord) -> bool {
        match self.make_context(record) {
            Ok(context) => {
                record.tls_context = Some(context);
                record.context_failed = false;
                true
            }
            Err(e) => {
                warn!("No TLS context for device {}: {}", record.serial, e);
                record.mark_context_failed();
                false
            }
        }
    }

    fn make_context(&self, record: &mut DeviceRecord) -> Result<TlsContext, CertificateError> {
        if let Some(material) = &record.certificate_material {
            match self.certificates.build_context(&record.serial, material) {
                Ok(context) => return Ok(context),
                Err(e) => debug!("Stored certificate for {} unusable, reloading: {}", record.serial, e),
            }
        }

        let material = self.certificates.load_material(&record.serial)?;
        let context = self.certificates.build_context(&record.serial, &material)?;
        record.certificate_material = Some(material);
        Ok(context)
    }
}
