//! SQLite persistence for storage records.
//!
//! One row per mounted storage. The mount path is unique; ids are UUIDv7
//! text so rows sort by creation time.

use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::vfs::{FsError, FsResult, Proxy, Sort, StorageRecord, StorageRepository};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS storages (
    id TEXT PRIMARY KEY,
    mount_path TEXT NOT NULL UNIQUE,
    ord INTEGER NOT NULL DEFAULT 0,
    driver TEXT NOT NULL,
    cache_expiration INTEGER NOT NULL DEFAULT 30,
    status TEXT NOT NULL DEFAULT '',
    addition TEXT NOT NULL DEFAULT '',
    remark TEXT NOT NULL DEFAULT '',
    modified INTEGER NOT NULL,
    disabled INTEGER NOT NULL DEFAULT 0,
    disable_index INTEGER NOT NULL DEFAULT 0,
    enable_sign INTEGER NOT NULL DEFAULT 0,
    order_by TEXT NOT NULL DEFAULT '',
    order_direction TEXT NOT NULL DEFAULT '',
    extract_folder TEXT NOT NULL DEFAULT '',
    web_proxy INTEGER NOT NULL DEFAULT 0,
    webdav_policy TEXT NOT NULL DEFAULT '',
    proxy_range INTEGER NOT NULL DEFAULT 0,
    down_proxy_url TEXT NOT NULL DEFAULT '',
    disable_proxy_sign INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_storages_order ON storages(ord, mount_path);
"#;

const COLUMNS: &str = "id, mount_path, ord, driver, cache_expiration, status, addition, remark, \
    modified, disabled, disable_index, enable_sign, order_by, order_direction, extract_folder, \
    web_proxy, webdav_policy, proxy_range, down_proxy_url, disable_proxy_sign";

fn db_err(e: rusqlite::Error) -> FsError {
    match &e {
        rusqlite::Error::SqliteFailure(err, msg) if err.code == ErrorCode::ConstraintViolation => {
            FsError::AlreadyExists(msg.clone().unwrap_or_else(|| e.to_string()))
        }
        _ => FsError::Persistence(e.to_string()),
    }
}

fn to_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn from_millis(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<StorageRecord> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(StorageRecord {
        id,
        mount_path: row.get(1)?,
        order: row.get(2)?,
        driver: row.get(3)?,
        cache_expiration: row.get(4)?,
        status: row.get(5)?,
        addition: row.get(6)?,
        remark: row.get(7)?,
        modified: from_millis(row.get(8)?),
        disabled: row.get(9)?,
        disable_index: row.get(10)?,
        enable_sign: row.get(11)?,
        sort: Sort {
            order_by: row.get(12)?,
            order_direction: row.get(13)?,
            extract_folder: row.get(14)?,
        },
        proxy: Proxy {
            web_proxy: row.get(15)?,
            webdav_policy: row.get(16)?,
            proxy_range: row.get(17)?,
            down_proxy_url: row.get(18)?,
            disable_proxy_sign: row.get(19)?,
        },
    })
}

/// Storage repository backed by SQLite.
pub struct SqliteStorageRepository {
    conn: Mutex<Connection>,
}

impl SqliteStorageRepository {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> FsResult<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> FsResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn select(&self, filter: &str, args: impl rusqlite::Params) -> FsResult<Vec<StorageRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {COLUMNS} FROM storages {filter} ORDER BY ord, mount_path");
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt.query_map(args, record_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn select_one(&self, filter: &str, arg: &str) -> FsResult<Option<StorageRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {COLUMNS} FROM storages {filter}");
        conn.query_row(&sql, params![arg], record_from_row)
            .optional()
            .map_err(db_err)
    }
}

impl std::fmt::Debug for SqliteStorageRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorageRepository").finish_non_exhaustive()
    }
}

impl StorageRepository for SqliteStorageRepository {
    fn create_storage(&self, r: &StorageRecord) -> FsResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO storages ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                         ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
            ),
            params![
                r.id.to_string(),
                r.mount_path,
                r.order,
                r.driver,
                r.cache_expiration,
                r.status,
                r.addition,
                r.remark,
                to_millis(r.modified),
                r.disabled,
                r.disable_index,
                r.enable_sign,
                r.sort.order_by,
                r.sort.order_direction,
                r.sort.extract_folder,
                r.proxy.web_proxy,
                r.proxy.webdav_policy,
                r.proxy.proxy_range,
                r.proxy.down_proxy_url,
                r.proxy.disable_proxy_sign,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn update_storage(&self, r: &StorageRecord) -> FsResult<()> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE storages SET mount_path = ?2, ord = ?3, driver = ?4,
                    cache_expiration = ?5, status = ?6, addition = ?7, remark = ?8,
                    modified = ?9, disabled = ?10, disable_index = ?11, enable_sign = ?12,
                    order_by = ?13, order_direction = ?14, extract_folder = ?15,
                    web_proxy = ?16, webdav_policy = ?17, proxy_range = ?18,
                    down_proxy_url = ?19, disable_proxy_sign = ?20
                 WHERE id = ?1",
                params![
                    r.id.to_string(),
                    r.mount_path,
                    r.order,
                    r.driver,
                    r.cache_expiration,
                    r.status,
                    r.addition,
                    r.remark,
                    to_millis(r.modified),
                    r.disabled,
                    r.disable_index,
                    r.enable_sign,
                    r.sort.order_by,
                    r.sort.order_direction,
                    r.sort.extract_folder,
                    r.proxy.web_proxy,
                    r.proxy.webdav_policy,
                    r.proxy.proxy_range,
                    r.proxy.down_proxy_url,
                    r.proxy.disable_proxy_sign,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(FsError::not_found(format!("storage id {}", r.id)));
        }
        Ok(())
    }

    fn delete_storage_by_id(&self, id: Uuid) -> FsResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM storages WHERE id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        Ok(())
    }

    fn get_storage_by_id(&self, id: Uuid) -> FsResult<Option<StorageRecord>> {
        self.select_one("WHERE id = ?1", &id.to_string())
    }

    fn get_storage_by_mount_path(&self, mount_path: &str) -> FsResult<Option<StorageRecord>> {
        self.select_one("WHERE mount_path = ?1", mount_path)
    }

    fn get_enabled_storages(&self) -> FsResult<Vec<StorageRecord>> {
        self.select("WHERE disabled = 0", params![])
    }

    fn get_storages(&self) -> FsResult<Vec<StorageRecord>> {
        self.select("", params![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(mount: &str, order: i32) -> StorageRecord {
        let mut r = StorageRecord::new(mount, "memory")
            .with_order(order)
            .with_remark("note")
            .with_addition(serde_json::json!({ "link_expiration_secs": 5 }));
        r.id = Uuid::now_v7();
        r.sort.order_by = "size".into();
        r.proxy.webdav_policy = "302_redirect".into();
        r
    }

    #[test]
    fn test_storage_crud() {
        let db = SqliteStorageRepository::in_memory().unwrap();
        let mut r = record("/a", 0);
        db.create_storage(&r).unwrap();

        let loaded = db.get_storage_by_id(r.id).unwrap().unwrap();
        assert_eq!(loaded.mount_path, "/a");
        assert_eq!(loaded.sort.order_by, "size");
        assert!(loaded.webdav_302());
        assert_eq!(to_millis(loaded.modified), to_millis(r.modified));
        assert_eq!(loaded.addition, r.addition);

        r.status = "work".into();
        r.mount_path = "/b".into();
        db.update_storage(&r).unwrap();
        assert!(db.get_storage_by_mount_path("/a").unwrap().is_none());
        assert!(db.get_storage_by_mount_path("/b").unwrap().unwrap().is_working());

        db.delete_storage_by_id(r.id).unwrap();
        assert!(db.get_storage_by_id(r.id).unwrap().is_none());
        assert!(db.update_storage(&r).unwrap_err().is_not_found());
    }

    #[test]
    fn test_duplicate_mount_path() {
        let db = SqliteStorageRepository::in_memory().unwrap();
        db.create_storage(&record("/a", 0)).unwrap();
        let err = db.create_storage(&record("/a", 1)).unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));
    }

    #[test]
    fn test_enabled_storages_ordered() {
        let db = SqliteStorageRepository::in_memory().unwrap();
        db.create_storage(&record("/b", 1)).unwrap();
        db.create_storage(&record("/a", 1)).unwrap();
        db.create_storage(&record("/z", 0)).unwrap();
        let mut off = record("/off", 0);
        off.disabled = true;
        db.create_storage(&off).unwrap();

        let mounts: Vec<String> = db
            .get_enabled_storages()
            .unwrap()
            .into_iter()
            .map(|r| r.mount_path)
            .collect();
        assert_eq!(mounts, vec!["/z", "/a", "/b"]);
        assert_eq!(db.get_storages().unwrap().len(), 4);
    }

    #[test]
    fn test_reopen_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tessera.db");
        let r = record("/persisted", 0);
        {
            let db = SqliteStorageRepository::open(&path).unwrap();
            db.create_storage(&r).unwrap();
        }
        let db = SqliteStorageRepository::open(&path).unwrap();
        assert_eq!(db.get_storages().unwrap()[0].id, r.id);
    }
}
