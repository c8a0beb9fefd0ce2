//! Database manager for SQLite operations
//! Durable storage of confirmed device records

use crate::device::DeviceRecord;
use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// Durable storage for device records
pub trait DeviceStore: Send + Sync {
    /// Load every stored device
    fn load_all(&self) -> Result<Vec<DeviceRecord>>;

    /// Find a device by serial
    fn find(&self, serial: &str) -> Result<Option<DeviceRecord>>;

    /// Insert a device, replacing any stored record with the same serial
    fn insert(&self, device: &DeviceRecord) -> Result<()>;

    /// Update the stored fields of an existing device
    fn update(&self, device: &DeviceRecord) -> Result<()>;

    /// Update many devices in one go
    fn update_all(&self, devices: &[DeviceRecord]) -> Result<()>;
}

const DEVICE_COLUMNS: &str = "serial, external_id, last_ip, last_cookie, certificate, lto, configuration_updated";

/// Thread-safe database manager for SQLite operations
/// Uses a Mutex to ensure only one thread accesses the connection at a time
pub struct DatabaseManager {
    conn: Mutex<Connection>,
    db_path: String,
}

impl DatabaseManager {
    /// Create a new database manager
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let manager = Self {
            conn: Mutex::new(conn),
            db_path: db_path_str,
        };

        manager.initialize()?;

        Ok(manager)
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS devices (
                serial TEXT PRIMARY KEY,
                external_id TEXT DEFAULT NULL,
                last_ip TEXT DEFAULT NULL,
                last_cookie TEXT DEFAULT NULL,
                certificate BLOB DEFAULT NULL,
                lto INTEGER DEFAULT NULL,
                configuration_updated INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// Store certificate material for a serial, creating the record if needed
    pub fn set_certificate(&self, serial: &str, material: &[u8]) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT INTO devices (serial, certificate) VALUES (?1, ?2)
             ON CONFLICT(serial) DO UPDATE SET certificate = excluded.certificate,
                updated_at = ?3",
            params![serial, material, chrono::Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }

    /// Delete a device by serial
    pub fn delete(&self, serial: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM devices WHERE serial = ?1", params![serial])?;
        Ok(affected > 0)
    }

    fn row_to_device(row: &Row<'_>) -> rusqlite::Result<DeviceRecord> {
        let mut device = DeviceRecord::new(row.get::<_, String>(0)?);
        device.external_id = row.get(1)?;
        device.last_ip = row.get(2)?;
        device.last_cookie = row.get(3)?;
        device.certificate_material = row.get(4)?;
        device.lto = row.get(5)?;
        device.configuration_updated = row.get(6)?;
        Ok(device)
    }

    fn update_with(conn: &Connection, device: &DeviceRecord) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE devices SET external_id = ?2, last_ip = ?3, last_cookie = ?4,
                certificate = ?5, lto = ?6, configuration_updated = ?7, updated_at = ?8
             WHERE serial = ?1",
            params![
                device.serial,
                device.external_id,
                device.last_ip,
                device.last_cookie,
                device.certificate_material,
                device.lto,
                device.configuration_updated,
                chrono::Utc::now().to_rfc3339(),
            ],
        )
    }
}

impl DeviceStore for DatabaseManager {
    fn load_all(&self) -> Result<Vec<DeviceRecord>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices ORDER BY serial",
            DEVICE_COLUMNS
        ))?;

        let devices = stmt
            .query_map([], Self::row_to_device)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(devices)
    }

    fn find(&self, serial: &str) -> Result<Option<DeviceRecord>> {
        let conn = self.conn.lock();

        let device = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE serial = ?1", DEVICE_COLUMNS),
                params![serial],
                Self::row_to_device,
            )
            .optional()?;

        Ok(device)
    }

    fn insert(&self, device: &DeviceRecord) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "INSERT OR REPLACE INTO devices
                (serial, external_id, last_ip, last_cookie, certificate, lto, configuration_updated, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                device.serial,
                device.external_id,
                device.last_ip,
                device.last_cookie,
                device.certificate_material,
                device.lto,
                device.configuration_updated,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    fn update(&self, device: &DeviceRecord) -> Result<()> {
        let conn = self.conn.lock();
        Self::update_with(&conn, device)?;
        Ok(())
    }

    fn update_all(&self, devices: &[DeviceRecord]) -> Result<()> {
        let mut conn = self.conn.lock();

        let tx = conn.transaction()?;
        for device in devices {
            Self::update_with(&tx, device)?;
        }
        tx.commit()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn confirmed(serial: &str, ip: &str) -> DeviceRecord {
        let mut device = DeviceRecord::new(serial);
        device.last_ip = Some(ip.to_string());
        device.last_cookie = Some("session=1".to_string());
        device.certificate_material = Some(b"pem".to_vec());
        device
    }

    #[test]
    fn test_create_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let db = DatabaseManager::new(&db_path).unwrap();
        assert!(db_path.exists());
        assert!(db.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_insert_and_find_device() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();

        db.insert(&confirmed("B001", "10.0.0.1")).unwrap();

        let device = db.find("B001").unwrap().unwrap();
        assert_eq!(device.last_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(device.last_cookie.as_deref(), Some("session=1"));
        assert_eq!(device.certificate_material.as_deref(), Some(&b"pem"[..]));
        assert!(device.tls_context.is_none());
        assert!(db.find("B002").unwrap().is_none());
    }

    #[test]
    fn test_insert_replaces_existing() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();

        db.insert(&confirmed("B001", "10.0.0.1")).unwrap();
        db.insert(&confirmed("B001", "10.0.0.2")).unwrap();

        let all = db.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_ip.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn test_update_all() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();

        db.insert(&confirmed("B001", "10.0.0.1")).unwrap();
        db.insert(&confirmed("B002", "10.0.0.2")).unwrap();

        let mut devices = db.load_all().unwrap();
        for d in devices.iter_mut() {
            d.external_id = Some(format!("ext-{}", d.serial));
        }
        db.update_all(&devices).unwrap();

        assert_eq!(db.find("B002").unwrap().unwrap().external_id.as_deref(), Some("ext-B002"));
    }

    #[test]
    fn test_configuration_flag_survives_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        let db = DatabaseManager::new(&db_path).unwrap();
        db.insert(&confirmed("B001", "10.0.0.1")).unwrap();
        assert!(!db.find("B001").unwrap().unwrap().configuration_updated);

        let mut device = confirmed("B001", "10.0.0.1");
        device.configuration_updated = true;
        db.update(&device).unwrap();
        drop(db);

        let db = DatabaseManager::new(&db_path).unwrap();
        assert!(db.find("B001").unwrap().unwrap().configuration_updated);
    }

    #[test]
    fn test_set_certificate_and_delete() {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("test.db")).unwrap();

        db.set_certificate("B009", b"new-pem").unwrap();
        assert_eq!(
            db.find("B009").unwrap().unwrap().certificate_material.as_deref(),
            Some(&b"new-pem"[..])
        );

        db.insert(&confirmed("B001", "10.0.0.1")).unwrap();
        db.set_certificate("B001", b"repaired").unwrap();
        let device = db.find("B001").unwrap().unwrap();
        assert_eq!(device.certificate_material.as_deref(), Some(&b"repaired"[..]));
        assert_eq!(device.last_ip.as_deref(), Some("10.0.0.1"));

        assert!(db.delete("B009").unwrap());
        assert!(!db.delete("B009").unwrap());
    }
}
