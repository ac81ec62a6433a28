//! SQLite-backed acquisition registry.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::{
    AcquisitionRecord, AcquisitionRegistry, MarkOutcome, NewRecord, RecordQuery,
    RegisterOutcome, RegistryError, RegistryStats,
};
use crate::planner::TimeWindow;

const DATE_FORMAT: &str = "%Y-%m-%d";

const SELECT_COLUMNS: &str = "SELECT id, image_id, quadrant_id, acquired, cloud_cover, visibility,
        product_type, season, downloaded, created_at, downloaded_at
     FROM acquisitions";

/// SQLite-backed registry.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

/// Row as stored, before decoding dates and labels.
struct RawRecord {
    id: i64,
    image_id: String,
    quadrant_id: String,
    acquired: String,
    cloud_cover: f64,
    visibility: f64,
    product_type: Option<String>,
    season: String,
    downloaded: bool,
    created_at: String,
    downloaded_at: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            image_id: row.get(1)?,
            quadrant_id: row.get(2)?,
            acquired: row.get(3)?,
            cloud_cover: row.get(4)?,
            visibility: row.get(5)?,
            product_type: row.get(6)?,
            season: row.get(7)?,
            downloaded: row.get(8)?,
            created_at: row.get(9)?,
            downloaded_at: row.get(10)?,
        })
    }

    fn decode(self) -> Result<AcquisitionRecord, RegistryError> {
        let acquired = NaiveDate::parse_from_str(&self.acquired, DATE_FORMAT).map_err(|e| {
            RegistryError::InvalidData(format!("acquired '{}': {}", self.acquired, e))
        })?;
        let season = self
            .season
            .parse()
            .map_err(|e: String| RegistryError::InvalidData(e))?;

        Ok(AcquisitionRecord {
            id: self.id,
            image_id: self.image_id,
            quadrant_id: self.quadrant_id,
            acquired,
            cloud_cover: self.cloud_cover,
            visibility: self.visibility,
            product_type: self.product_type,
            season,
            downloaded: self.downloaded,
            created_at: parse_timestamp(&self.created_at),
            downloaded_at: self.downloaded_at.as_deref().map(parse_timestamp),
        })
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// `?, ?, ?` for an IN clause.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl SqliteRegistry {
    /// Open (or create) the registry database at `path`.
    pub fn new(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path).map_err(|e| RegistryError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory registry (useful for testing).
    pub fn in_memory() -> Result<Self, RegistryError> {
        let conn =
            Connection::open_in_memory().map_err(|e| RegistryError::Database(e.to_string()))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), RegistryError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS acquisitions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                image_id TEXT NOT NULL UNIQUE,
                quadrant_id TEXT NOT NULL,
                acquired TEXT NOT NULL,
                cloud_cover REAL NOT NULL,
                visibility REAL NOT NULL,
                product_type TEXT,
                season TEXT NOT NULL,
                downloaded INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                downloaded_at TEXT,
                UNIQUE(quadrant_id, image_id)
            );

            CREATE INDEX IF NOT EXISTS idx_acquisitions_quadrant ON acquisitions(quadrant_id, downloaded);
            CREATE INDEX IF NOT EXISTS idx_acquisitions_acquired ON acquisitions(acquired);
            "#,
        )
        .map_err(|e| RegistryError::Database(e.to_string()))?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn
            .lock()
            .map_err(|e| RegistryError::Internal(format!("registry lock poisoned: {}", e)))
    }

    fn query_records<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<AcquisitionRecord>, RegistryError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, RawRecord::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.decode()?);
        }
        Ok(records)
    }

    fn insert(conn: &Connection, record: &NewRecord) -> Result<Option<i64>, RegistryError> {
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO acquisitions
                (image_id, quadrant_id, acquired, cloud_cover, visibility, product_type, season,
                 downloaded, created_at, downloaded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                &record.image_id,
                &record.quadrant_id,
                format_date(record.acquired),
                record.cloud_cover,
                record.visibility,
                &record.product_type,
                record.season.as_str(),
                record.downloaded,
                &now,
                if record.downloaded { Some(&now) } else { None },
            ],
        )?;
        Ok((changed == 1).then(|| conn.last_insert_rowid()))
    }
}

impl AcquisitionRegistry for SqliteRegistry {
    fn exists(&self, quadrant_id: &str) -> Result<bool, RegistryError> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM acquisitions WHERE quadrant_id = ? LIMIT 1",
                params![quadrant_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn pending_for(&self, quadrant_ids: &[String]) -> Result<BTreeSet<String>, RegistryError> {
        if quadrant_ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "SELECT DISTINCT quadrant_id FROM acquisitions
             WHERE downloaded = 0 AND quadrant_id IN ({})",
            placeholders(quadrant_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(quadrant_ids.iter()), |row| {
            row.get::<_, String>(0)
        })?;

        let mut pending = BTreeSet::new();
        for row in rows {
            pending.insert(row?);
        }
        Ok(pending)
    }

    fn records_for(&self, query: &RecordQuery) -> Result<Vec<AcquisitionRecord>, RegistryError> {
        let conn = self.lock()?;
        match query {
            RecordQuery::Quadrant(quadrant_id) => Self::query_records(
                &conn,
                &format!("{SELECT_COLUMNS} WHERE quadrant_id = ? ORDER BY id"),
                params![quadrant_id],
            ),
            RecordQuery::AcquiredSince(date) => Self::query_records(
                &conn,
                &format!("{SELECT_COLUMNS} WHERE acquired >= ? ORDER BY id"),
                params![format_date(*date)],
            ),
            RecordQuery::Downloaded(downloaded) => Self::query_records(
                &conn,
                &format!("{SELECT_COLUMNS} WHERE downloaded = ? ORDER BY id"),
                params![downloaded],
            ),
        }
    }

    fn pending_records(
        &self,
        quadrant_ids: &[String],
    ) -> Result<Vec<AcquisitionRecord>, RegistryError> {
        if quadrant_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let sql = format!(
            "{SELECT_COLUMNS} WHERE downloaded = 0 AND quadrant_id IN ({}) ORDER BY id",
            placeholders(quadrant_ids.len())
        );
        Self::query_records(&conn, &sql, params_from_iter(quadrant_ids.iter()))
    }

    fn get(&self, image_id: &str) -> Result<Option<AcquisitionRecord>, RegistryError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE image_id = ?"),
                params![image_id],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    fn covering(
        &self,
        quadrant_id: &str,
        window: &TimeWindow,
    ) -> Result<Option<AcquisitionRecord>, RegistryError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!(
                    "{SELECT_COLUMNS}
                     WHERE quadrant_id = ? AND season = ? AND downloaded = 1
                       AND acquired >= ? AND acquired <= ?
                     ORDER BY id LIMIT 1"
                ),
                params![
                    quadrant_id,
                    window.season.as_str(),
                    format_date(window.start.date_naive()),
                    format_date(window.end.date_naive()),
                ],
                RawRecord::from_row,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    fn register(&self, record: &NewRecord) -> Result<RegisterOutcome, RegistryError> {
        let conn = self.lock()?;
        if let Some(id) = Self::insert(&conn, record)? {
            debug!(
                image_id = %record.image_id,
                quadrant = %record.quadrant_id,
                id,
                "Registered image"
            );
            return Ok(RegisterOutcome::Inserted { id });
        }

        let (id, quadrant_id, downloaded): (i64, String, bool) = conn.query_row(
            "SELECT id, quadrant_id, downloaded FROM acquisitions WHERE image_id = ?",
            params![&record.image_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        if quadrant_id != record.quadrant_id {
            debug!(
                image_id = %record.image_id,
                registered_quadrant = %quadrant_id,
                quadrant = %record.quadrant_id,
                "Image already registered under another quadrant"
            );
        }
        Ok(RegisterOutcome::AlreadyPresent { id, downloaded })
    }

    fn mark_downloaded(&self, image_id: &str) -> Result<MarkOutcome, RegistryError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE acquisitions SET downloaded = 1, downloaded_at = ?
             WHERE image_id = ? AND downloaded = 0",
            params![Utc::now().to_rfc3339(), image_id],
        )?;
        if changed == 1 {
            return Ok(MarkOutcome::Marked);
        }

        let present = conn
            .query_row(
                "SELECT 1 FROM acquisitions WHERE image_id = ?",
                params![image_id],
                |_| Ok(()),
            )
            .optional()?;
        match present {
            Some(()) => Ok(MarkOutcome::AlreadyDownloaded),
            None => {
                warn!(
                    image_id = %image_id,
                    "Data integrity: mark_downloaded on an image with no record"
                );
                Err(RegistryError::NotFound(image_id.to_string()))
            }
        }
    }

    fn bulk_load(&self, records: &[NewRecord]) -> Result<u32, RegistryError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for record in records {
            if Self::insert(&tx, record)?.is_some() {
                inserted += 1;
            }
        }
        tx.commit()?;
        debug!(
            offered = records.len(),
            inserted,
            "Bulk load complete"
        );
        Ok(inserted)
    }

    fn stats(&self) -> Result<RegistryStats, RegistryError> {
        let conn = self.lock()?;
        let (total, downloaded, quadrants): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(downloaded), 0), COUNT(DISTINCT quadrant_id)
             FROM acquisitions",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(RegistryStats {
            total_records: total as u64,
            downloaded: downloaded as u64,
            pending: (total - downloaded) as u64,
            quadrants: quadrants as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{Season, TimeWindowPlanner};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(image_id: &str, quadrant_id: &str, acquired: &str) -> NewRecord {
        NewRecord {
            image_id: image_id.to_string(),
            quadrant_id: quadrant_id.to_string(),
            acquired: NaiveDate::parse_from_str(acquired, DATE_FORMAT).unwrap(),
            cloud_cover: 0.05,
            visibility: 0.95,
            product_type: Some("ortho_analytic_8b_sr".to_string()),
            season: Season::Completo,
            downloaded: false,
        }
    }

    #[test]
    fn test_register_and_get() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let outcome = registry.register(&record("img-1", "B27", "2021-03-04")).unwrap();
        assert!(matches!(outcome, RegisterOutcome::Inserted { .. }));

        let stored = registry.get("img-1").unwrap().unwrap();
        assert_eq!(stored.quadrant_id, "B27");
        assert_eq!(stored.acquired, NaiveDate::from_ymd_opt(2021, 3, 4).unwrap());
        assert_eq!(stored.season, Season::Completo);
        assert!(!stored.downloaded);
        assert!(stored.downloaded_at.is_none());
        assert!(registry.exists("B27").unwrap());
        assert!(!registry.exists("C01").unwrap());
    }

    #[test]
    fn test_register_twice_is_already_present() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let first = registry.register(&record("img-1", "B27", "2021-03-04")).unwrap();
        let second = registry.register(&record("img-1", "B27", "2021-03-04")).unwrap();

        let RegisterOutcome::Inserted { id } = first else {
            panic!("expected insert");
        };
        assert_eq!(
            second,
            RegisterOutcome::AlreadyPresent {
                id,
                downloaded: false
            }
        );
        assert_eq!(registry.stats().unwrap().total_records, 1);
    }

    #[test]
    fn test_mark_downloaded_idempotent() {
        let registry = SqliteRegistry::in_memory().unwrap();
        registry.register(&record("img-1", "B27", "2021-03-04")).unwrap();

        assert_eq!(registry.mark_downloaded("img-1").unwrap(), MarkOutcome::Marked);
        assert_eq!(
            registry.mark_downloaded("img-1").unwrap(),
            MarkOutcome::AlreadyDownloaded
        );

        let stored = registry.get("img-1").unwrap().unwrap();
        assert!(stored.downloaded);
        assert!(stored.downloaded_at.is_some());
    }

    #[test]
    fn test_mark_downloaded_missing_is_not_found() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let err = registry.mark_downloaded("ghost").unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(id) if id == "ghost"));
    }

    #[test]
    fn test_mark_downloaded_concurrent_single_winner() {
        let registry = Arc::new(SqliteRegistry::in_memory().unwrap());
        registry.register(&record("img-1", "B27", "2021-03-04")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.mark_downloaded("img-1").unwrap())
            })
            .collect();
        let marked = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == MarkOutcome::Marked)
            .count();
        assert_eq!(marked, 1);
    }

    #[test]
    fn test_bulk_load_skips_existing_ids() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let batch = vec![
            record("img-1", "B27", "2021-03-04"),
            record("img-2", "B27", "2021-07-10"),
            record("img-3", "C01", "2020-01-15"),
        ];

        assert_eq!(registry.bulk_load(&batch).unwrap(), 3);
        assert_eq!(registry.bulk_load(&batch).unwrap(), 0);

        let mut more = batch.clone();
        more.push(record("img-4", "C01", "2022-02-02"));
        assert_eq!(registry.bulk_load(&more).unwrap(), 1);
        assert_eq!(registry.stats().unwrap().total_records, 4);
    }

    #[test]
    fn test_bulk_load_keeps_downloaded_flag() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let mut done = record("img-1", "B27", "2021-03-04");
        done.downloaded = true;
        registry.bulk_load(&[done]).unwrap();

        let stored = registry.get("img-1").unwrap().unwrap();
        assert!(stored.downloaded);
        assert!(stored.downloaded_at.is_some());
    }

    #[test]
    fn test_pending_for_and_pending_records() {
        let registry = SqliteRegistry::in_memory().unwrap();
        registry
            .bulk_load(&[
                record("img-1", "B27", "2021-03-04"),
                record("img-2", "B27", "2021-07-10"),
                record("img-3", "C01", "2020-01-15"),
            ])
            .unwrap();
        registry.mark_downloaded("img-3").unwrap();

        let ids = vec!["B27".to_string(), "C01".to_string(), "D99".to_string()];
        let pending = registry.pending_for(&ids).unwrap();
        assert_eq!(pending.into_iter().collect::<Vec<_>>(), vec!["B27"]);

        let records = registry.pending_records(&ids).unwrap();
        let image_ids: Vec<_> = records.iter().map(|r| r.image_id.as_str()).collect();
        assert_eq!(image_ids, vec!["img-1", "img-2"]);

        assert!(registry.pending_for(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_records_for_queries() {
        let registry = SqliteRegistry::in_memory().unwrap();
        registry
            .bulk_load(&[
                record("img-1", "B27", "2021-03-04"),
                record("img-2", "B27", "2022-07-10"),
                record("img-3", "C01", "2020-01-15"),
            ])
            .unwrap();
        registry.mark_downloaded("img-2").unwrap();

        let by_quadrant = registry
            .records_for(&RecordQuery::Quadrant("B27".to_string()))
            .unwrap();
        assert_eq!(by_quadrant.len(), 2);
        assert_eq!(by_quadrant[0].image_id, "img-1");

        let since = registry
            .records_for(&RecordQuery::AcquiredSince(
                NaiveDate::from_ymd_opt(2021, 3, 4).unwrap(),
            ))
            .unwrap();
        let ids: Vec<_> = since.iter().map(|r| r.image_id.as_str()).collect();
        assert_eq!(ids, vec!["img-1", "img-2"]);

        let downloaded = registry.records_for(&RecordQuery::Downloaded(true)).unwrap();
        assert_eq!(downloaded.len(), 1);
        assert_eq!(downloaded[0].image_id, "img-2");

        let not_downloaded = registry.records_for(&RecordQuery::Downloaded(false)).unwrap();
        assert_eq!(not_downloaded.len(), 2);
    }

    #[test]
    fn test_covering_matches_window_and_season() {
        let registry = SqliteRegistry::in_memory().unwrap();
        let mut rainy = record("img-1", "B27", "2021-07-10");
        rainy.season = Season::Lluvias;
        registry.register(&rainy).unwrap();

        let windows: Vec<_> = TimeWindowPlanner::new(2021, 2021, true).collect();
        // Not downloaded yet.
        assert!(registry.covering("B27", &windows[0]).unwrap().is_none());

        registry.mark_downloaded("img-1").unwrap();
        assert_eq!(
            registry.covering("B27", &windows[0]).unwrap().unwrap().image_id,
            "img-1"
        );
        assert!(registry.covering("B27", &windows[1]).unwrap().is_none());
        assert!(registry.covering("B27", &windows[2]).unwrap().is_none());
        assert!(registry.covering("C01", &windows[0]).unwrap().is_none());

        let full_year = TimeWindowPlanner::new(2021, 2021, false).next().unwrap();
        assert!(registry.covering("B27", &full_year).unwrap().is_none());
    }

    #[test]
    fn test_stats() {
        let registry = SqliteRegistry::in_memory().unwrap();
        assert_eq!(registry.stats().unwrap(), RegistryStats::default());

        registry
            .bulk_load(&[
                record("img-1", "B27", "2021-03-04"),
                record("img-2", "C01", "2021-03-04"),
            ])
            .unwrap();
        registry.mark_downloaded("img-1").unwrap();

        let stats = registry.stats().unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.quadrants, 2);
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("registry.db");
        {
            let registry = SqliteRegistry::new(&path).unwrap();
            registry.register(&record("img-1", "B27", "2021-03-04")).unwrap();
            registry.mark_downloaded("img-1").unwrap();
        }
        let registry = SqliteRegistry::new(&path).unwrap();
        assert!(registry.get("img-1").unwrap().unwrap().downloaded);
    }
}
