//! Persistence for missions, the model catalog, detections and victims.
//!
//! Deletes cascade through foreign keys: mission → detections → victims →
//! posture classifications. The "selected model" and the shared confidence
//! threshold live in a single `model_registry` row, so the catalog rows carry no
//! selection flag that could disagree with each other.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

use crate::detect::{BoundingBox, PersonBox};
use crate::error::{PipelineError, PipelineResult};

pub const UNKNOWN_CATEGORY: &str = "unknown";

// -------------------- Records --------------------

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Mission {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Mission {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PersonDetectionModel {
    pub id: i64,
    pub model_type: String,
    pub is_selected: bool,
    pub confidence: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RegistryState {
    pub selected_model_id: Option<i64>,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub id: i64,
    pub mission_id: i64,
    pub person_detection_model_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub is_live: bool,
    pub snapshot: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Victim {
    pub id: i64,
    pub detection_id: i64,
    pub person_id: String,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    pub movement_category: String,
    #[serde(rename = "risk_category")]
    pub condition: String,
    pub is_found: bool,
    pub estimated_latitude: f64,
    pub estimated_longitude: f64,
}

/// Fields an operator may change during triage. Box and confidence are fixed.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct VictimTriage {
    pub movement_category: Option<String>,
    #[serde(alias = "risk_category")]
    pub condition: Option<String>,
    pub is_found: Option<bool>,
    pub estimated_latitude: Option<f64>,
    pub estimated_longitude: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PostureClassification {
    pub id: i64,
    pub victim_id: i64,
    pub posture_class: String,
    pub confidence: f32,
}

/// Detection row about to be written by a capture.
#[derive(Clone, Debug)]
pub struct NewDetection {
    pub mission_id: i64,
    pub model_id: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub is_live: bool,
}

pub fn person_id(detection_id: i64, ordinal: usize) -> String {
    format!("person_{}_{}", detection_id, ordinal)
}

// -------------------- Store --------------------

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database. `initial_confidence` seeds the shared
    /// threshold only when the registry row does not exist yet.
    pub fn open(db_path: &str, initial_confidence: f32) -> PipelineResult<Self> {
        let conn = open_db_connection(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema(initial_confidence)?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_schema(&self, initial_confidence: f32) -> PipelineResult<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS missions (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              started_at TEXT NOT NULL,
              ended_at TEXT
            );

            CREATE TABLE IF NOT EXISTS person_detection_models (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              model_type TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS model_registry (
              id INTEGER PRIMARY KEY CHECK (id = 1),
              selected_model_id INTEGER
                REFERENCES person_detection_models(id) ON DELETE SET NULL,
              confidence REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              mission_id INTEGER NOT NULL
                REFERENCES missions(id) ON DELETE CASCADE,
              person_detection_model_id INTEGER NOT NULL
                REFERENCES person_detection_models(id) ON DELETE CASCADE,
              latitude REAL NOT NULL DEFAULT 0.0,
              longitude REAL NOT NULL DEFAULT 0.0,
              timestamp TEXT NOT NULL,
              is_live INTEGER NOT NULL DEFAULT 0,
              snapshot TEXT
            );

            CREATE TABLE IF NOT EXISTS victims (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              detection_id INTEGER NOT NULL
                REFERENCES detections(id) ON DELETE CASCADE,
              person_id TEXT NOT NULL UNIQUE,
              confidence REAL NOT NULL,
              x1 REAL NOT NULL,
              y1 REAL NOT NULL,
              x2 REAL NOT NULL,
              y2 REAL NOT NULL,
              movement_category TEXT NOT NULL DEFAULT 'unknown',
              risk_category TEXT NOT NULL DEFAULT 'unknown',
              is_found INTEGER NOT NULL DEFAULT 0,
              estimated_latitude REAL NOT NULL DEFAULT 0.0,
              estimated_longitude REAL NOT NULL DEFAULT 0.0
            );

            CREATE TABLE IF NOT EXISTS posture_classifications (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              victim_id INTEGER NOT NULL
                REFERENCES victims(id) ON DELETE CASCADE,
              posture_class TEXT NOT NULL DEFAULT 'unknown',
              confidence REAL NOT NULL DEFAULT 0.0
            );

            CREATE INDEX IF NOT EXISTS idx_detections_mission ON detections(mission_id);
            CREATE INDEX IF NOT EXISTS idx_victims_detection ON victims(detection_id);
            "#,
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO model_registry(id, selected_model_id, confidence) VALUES (1, NULL, ?1)",
            params![f64::from(initial_confidence)],
        )?;
        Ok(())
    }

    // -------------------- Missions --------------------

    pub fn create_mission(&self, started_at: DateTime<Utc>) -> PipelineResult<Mission> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO missions(started_at, ended_at) VALUES (?1, NULL)",
            params![started_at],
        )?;
        Ok(Mission {
            id: conn.last_insert_rowid(),
            started_at,
            ended_at: None,
        })
    }

    pub fn get_mission(&self, id: i64) -> PipelineResult<Mission> {
        let conn = self.lock();
        mission_by_id(&conn, id)
    }

    pub fn list_missions(&self) -> PipelineResult<Vec<Mission>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, started_at, ended_at FROM missions ORDER BY id ASC")?;
        let rows = stmt.query_map([], mission_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Close a mission. Closing is one-way.
    pub fn close_mission(&self, id: i64, ended_at: DateTime<Utc>) -> PipelineResult<Mission> {
        let conn = self.lock();
        let mission = mission_by_id(&conn, id)?;
        if !mission.is_open() {
            return Err(PipelineError::MissionClosed(id));
        }
        conn.execute(
            "UPDATE missions SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
            params![ended_at, id],
        )?;
        Ok(Mission {
            ended_at: Some(ended_at),
            ..mission
        })
    }

    /// Delete a mission with its detections and victims. Returns the snapshot
    /// names that belonged to the removed detections.
    pub fn delete_mission(&self, id: i64) -> PipelineResult<Vec<String>> {
        let conn = self.lock();
        mission_by_id(&conn, id)?;
        let snapshots = {
            let mut stmt = conn.prepare(
                "SELECT snapshot FROM detections WHERE mission_id = ?1 AND snapshot IS NOT NULL",
            )?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        conn.execute("DELETE FROM missions WHERE id = ?1", params![id])?;
        Ok(snapshots)
    }

    // -------------------- Model catalog --------------------

    /// Insert catalog labels that are not present yet.
    pub fn seed_models<'a>(
        &self,
        labels: impl IntoIterator<Item = &'a str>,
    ) -> PipelineResult<Vec<PersonDetectionModel>> {
        {
            let conn = self.lock();
            for label in labels {
                conn.execute(
                    "INSERT OR IGNORE INTO person_detection_models(model_type) VALUES (?1)",
                    params![label],
                )?;
            }
        }
        self.list_models()
    }

    pub fn upsert_model(&self, model_type: &str) -> PipelineResult<PersonDetectionModel> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO person_detection_models(model_type) VALUES (?1)",
            params![model_type],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM person_detection_models WHERE model_type = ?1",
            params![model_type],
            |row| row.get(0),
        )?;
        model_by_id(&conn, id)
    }

    pub fn list_models(&self) -> PipelineResult<Vec<PersonDetectionModel>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY m.id ASC", MODEL_SELECT))?;
        let rows = stmt.query_map([], model_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_model(&self, id: i64) -> PipelineResult<PersonDetectionModel> {
        let conn = self.lock();
        model_by_id(&conn, id)
    }

    pub fn find_model_by_type(
        &self,
        model_type: &str,
    ) -> PipelineResult<Option<PersonDetectionModel>> {
        let conn = self.lock();
        let model = conn
            .query_row(
                &format!("{} WHERE m.model_type = ?1", MODEL_SELECT),
                params![model_type],
                model_from_row,
            )
            .optional()?;
        Ok(model)
    }

    pub fn registry_state(&self) -> PipelineResult<RegistryState> {
        let conn = self.lock();
        registry_state(&conn)
    }

    pub fn select_model(&self, id: i64) -> PipelineResult<PersonDetectionModel> {
        let conn = self.lock();
        model_by_id(&conn, id)?;
        conn.execute(
            "UPDATE model_registry SET selected_model_id = ?1 WHERE id = 1",
            params![id],
        )?;
        model_by_id(&conn, id)
    }

    pub fn set_confidence(&self, confidence: f32) -> PipelineResult<()> {
        check_confidence(confidence)?;
        let conn = self.lock();
        conn.execute(
            "UPDATE model_registry SET confidence = ?1 WHERE id = 1",
            params![f64::from(confidence)],
        )?;
        Ok(())
    }

    /// Select a model and set the shared threshold in one transaction.
    pub fn select_model_with_confidence(
        &self,
        id: i64,
        confidence: f32,
    ) -> PipelineResult<PersonDetectionModel> {
        check_confidence(confidence)?;
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        model_by_id(&tx, id)?;
        tx.execute(
            "UPDATE model_registry SET selected_model_id = ?1, confidence = ?2 WHERE id = 1",
            params![id, f64::from(confidence)],
        )?;
        let model = model_by_id(&tx, id)?;
        tx.commit()?;
        Ok(model)
    }

    // -------------------- Detections --------------------

    /// Write a detection, its snapshot reference and one victim per box as a
    /// single transaction.
    ///
    /// `write_snapshot` receives the new detection id and returns the stored
    /// snapshot name. Any failure rolls back every row written here; undoing the
    /// snapshot file itself is the caller's job.
    pub fn persist_capture<F>(
        &self,
        new: &NewDetection,
        boxes: &[PersonBox],
        write_snapshot: F,
    ) -> PipelineResult<(Detection, Vec<Victim>)>
    where
        F: FnOnce(i64) -> PipelineResult<String>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mission = mission_by_id(&tx, new.mission_id)?;
        if !mission.is_open() {
            return Err(PipelineError::MissionClosed(mission.id));
        }
        model_by_id(&tx, new.model_id)?;

        tx.execute(
            r#"
            INSERT INTO detections(mission_id, person_detection_model_id, latitude, longitude, timestamp, is_live, snapshot)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)
            "#,
            params![
                new.mission_id,
                new.model_id,
                new.latitude,
                new.longitude,
                new.timestamp,
                new.is_live
            ],
        )?;
        let detection_id = tx.last_insert_rowid();

        let snapshot = write_snapshot(detection_id)?;
        tx.execute(
            "UPDATE detections SET snapshot = ?1 WHERE id = ?2",
            params![snapshot, detection_id],
        )?;

        let victims = insert_victims(&tx, detection_id, boxes, new.latitude, new.longitude)?;
        tx.commit()?;

        Ok((
            Detection {
                id: detection_id,
                mission_id: new.mission_id,
                person_detection_model_id: new.model_id,
                latitude: new.latitude,
                longitude: new.longitude,
                timestamp: new.timestamp,
                is_live: new.is_live,
                snapshot: Some(snapshot),
            },
            victims,
        ))
    }

    pub fn get_detection(&self, id: i64) -> PipelineResult<Detection> {
        let conn = self.lock();
        conn.query_row(
            &format!("{} WHERE id = ?1", DETECTION_SELECT),
            params![id],
            detection_from_row,
        )
        .optional()?
        .ok_or_else(|| PipelineError::not_found("detection", id))
    }

    /// Detections of a mission, newest first.
    pub fn list_detections_for_mission(&self, mission_id: i64) -> PipelineResult<Vec<Detection>> {
        let conn = self.lock();
        mission_by_id(&conn, mission_id)?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE mission_id = ?1 ORDER BY timestamp DESC, id DESC",
            DETECTION_SELECT
        ))?;
        let rows = stmt.query_map(params![mission_id], detection_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Delete a detection and its victims. Returns its snapshot name, if any.
    pub fn delete_detection(&self, id: i64) -> PipelineResult<Option<String>> {
        let conn = self.lock();
        let snapshot: Option<Option<String>> = conn
            .query_row(
                "SELECT snapshot FROM detections WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(snapshot) = snapshot else {
            return Err(PipelineError::not_found("detection", id));
        };
        conn.execute("DELETE FROM detections WHERE id = ?1", params![id])?;
        Ok(snapshot)
    }

    pub fn count_detections(&self) -> PipelineResult<i64> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))?)
    }

    // -------------------- Victims --------------------

    pub fn list_victims_for_detection(&self, detection_id: i64) -> PipelineResult<Vec<Victim>> {
        let conn = self.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT id FROM detections WHERE id = ?1",
                params![detection_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(PipelineError::not_found("detection", detection_id));
        }
        let mut stmt = conn.prepare(&format!(
            "{} WHERE detection_id = ?1 ORDER BY id ASC",
            VICTIM_SELECT
        ))?;
        let rows = stmt.query_map(params![detection_id], victim_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_victim(&self, id: i64) -> PipelineResult<Victim> {
        let conn = self.lock();
        victim_by_id(&conn, id)
    }

    pub fn count_victims(&self) -> PipelineResult<i64> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM victims", [], |row| row.get(0))?)
    }

    /// Apply triage changes. Unset fields keep their current value.
    pub fn triage_victim(&self, id: i64, triage: &VictimTriage) -> PipelineResult<Victim> {
        let conn = self.lock();
        let current = victim_by_id(&conn, id)?;
        let movement = triage
            .movement_category
            .clone()
            .unwrap_or(current.movement_category);
        let condition = triage.condition.clone().unwrap_or(current.condition);
        let is_found = triage.is_found.unwrap_or(current.is_found);
        let latitude = triage
            .estimated_latitude
            .unwrap_or(current.estimated_latitude);
        let longitude = triage
            .estimated_longitude
            .unwrap_or(current.estimated_longitude);
        conn.execute(
            r#"
            UPDATE victims
            SET movement_category = ?1, risk_category = ?2, is_found = ?3,
                estimated_latitude = ?4, estimated_longitude = ?5
            WHERE id = ?6
            "#,
            params![movement, condition, is_found, latitude, longitude, id],
        )?;
        victim_by_id(&conn, id)
    }

    // -------------------- Posture classifications --------------------

    pub fn add_posture_classification(
        &self,
        victim_id: i64,
        posture_class: &str,
        confidence: f32,
    ) -> PipelineResult<PostureClassification> {
        check_confidence(confidence)?;
        let conn = self.lock();
        victim_by_id(&conn, victim_id)?;
        conn.execute(
            "INSERT INTO posture_classifications(victim_id, posture_class, confidence) VALUES (?1, ?2, ?3)",
            params![victim_id, posture_class, f64::from(confidence)],
        )?;
        Ok(PostureClassification {
            id: conn.last_insert_rowid(),
            victim_id,
            posture_class: posture_class.to_string(),
            confidence,
        })
    }

    pub fn list_posture_classifications(
        &self,
        victim_id: i64,
    ) -> PipelineResult<Vec<PostureClassification>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, victim_id, posture_class, confidence FROM posture_classifications WHERE victim_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![victim_id], |row| {
            Ok(PostureClassification {
                id: row.get(0)?,
                victim_id: row.get(1)?,
                posture_class: row.get(2)?,
                confidence: row.get::<_, f64>(3)? as f32,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

// -------------------- Helpers --------------------

pub fn shared_memory_uri() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:ahon_pipeline_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

fn open_db_connection(db_path: &str) -> PipelineResult<Connection> {
    if db_path == ":memory:" {
        return Ok(Connection::open_in_memory()?);
    }
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

fn check_confidence(confidence: f32) -> PipelineResult<()> {
    if !(0.0..=1.0).contains(&confidence) {
        return Err(PipelineError::InvalidRequest(format!(
            "confidence {} outside [0, 1]",
            confidence
        )));
    }
    Ok(())
}

fn insert_victims(
    tx: &Transaction<'_>,
    detection_id: i64,
    boxes: &[PersonBox],
    latitude: f64,
    longitude: f64,
) -> PipelineResult<Vec<Victim>> {
    let mut stmt = tx.prepare(
        r#"
        INSERT INTO victims(detection_id, person_id, confidence, x1, y1, x2, y2,
                            movement_category, risk_category, is_found,
                            estimated_latitude, estimated_longitude)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 0, ?9, ?10)
        "#,
    )?;
    let mut victims = Vec::with_capacity(boxes.len());
    for (index, person) in boxes.iter().enumerate() {
        let person_id = person_id(detection_id, index + 1);
        let bbox = person.bbox;
        stmt.execute(params![
            detection_id,
            person_id,
            f64::from(person.confidence),
            f64::from(bbox.x1),
            f64::from(bbox.y1),
            f64::from(bbox.x2),
            f64::from(bbox.y2),
            UNKNOWN_CATEGORY,
            latitude,
            longitude
        ])?;
        victims.push(Victim {
            id: tx.last_insert_rowid(),
            detection_id,
            person_id,
            confidence: person.confidence,
            bounding_box: bbox,
            movement_category: UNKNOWN_CATEGORY.to_string(),
            condition: UNKNOWN_CATEGORY.to_string(),
            is_found: false,
            estimated_latitude: latitude,
            estimated_longitude: longitude,
        });
    }
    Ok(victims)
}

fn mission_from_row(row: &Row<'_>) -> rusqlite::Result<Mission> {
    Ok(Mission {
        id: row.get(0)?,
        started_at: row.get(1)?,
        ended_at: row.get(2)?,
    })
}

fn mission_by_id(conn: &Connection, id: i64) -> PipelineResult<Mission> {
    conn.query_row(
        "SELECT id, started_at, ended_at FROM missions WHERE id = ?1",
        params![id],
        mission_from_row,
    )
    .optional()?
    .ok_or_else(|| PipelineError::not_found("mission", id))
}

const MODEL_SELECT: &str = r#"
    SELECT m.id, m.model_type,
           COALESCE(r.selected_model_id = m.id, 0),
           r.confidence
    FROM person_detection_models m
    JOIN model_registry r ON r.id = 1
"#;

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<PersonDetectionModel> {
    Ok(PersonDetectionModel {
        id: row.get(0)?,
        model_type: row.get(1)?,
        is_selected: row.get(2)?,
        confidence: row.get::<_, f64>(3)? as f32,
    })
}

fn model_by_id(conn: &Connection, id: i64) -> PipelineResult<PersonDetectionModel> {
    conn.query_row(
        &format!("{} WHERE m.id = ?1", MODEL_SELECT),
        params![id],
        model_from_row,
    )
    .optional()?
    .ok_or_else(|| PipelineError::not_found("person_detection_model", id))
}

fn registry_state(conn: &Connection) -> PipelineResult<RegistryState> {
    Ok(conn.query_row(
        "SELECT selected_model_id, confidence FROM model_registry WHERE id = 1",
        [],
        |row| {
            Ok(RegistryState {
                selected_model_id: row.get(0)?,
                confidence: row.get::<_, f64>(1)? as f32,
            })
        },
    )?)
}

const DETECTION_SELECT: &str = r#"
    SELECT id, mission_id, person_detection_model_id, latitude, longitude,
           timestamp, is_live, snapshot
    FROM detections
"#;

fn detection_from_row(row: &Row<'_>) -> rusqlite::Result<Detection> {
    Ok(Detection {
        id: row.get(0)?,
        mission_id: row.get(1)?,
        person_detection_model_id: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        timestamp: row.get(5)?,
        is_live: row.get(6)?,
        snapshot: row.get(7)?,
    })
}

const VICTIM_SELECT: &str = r#"
    SELECT id, detection_id, person_id, confidence, x1, y1, x2, y2,
           movement_category, risk_category, is_found,
           estimated_latitude, estimated_longitude
    FROM victims
"#;

fn victim_from_row(row: &Row<'_>) -> rusqlite::Result<Victim> {
    Ok(Victim {
        id: row.get(0)?,
        detection_id: row.get(1)?,
        person_id: row.get(2)?,
        confidence: row.get::<_, f64>(3)? as f32,
        bounding_box: BoundingBox {
            x1: row.get::<_, f64>(4)? as f32,
            y1: row.get::<_, f64>(5)? as f32,
            x2: row.get::<_, f64>(6)? as f32,
            y2: row.get::<_, f64>(7)? as f32,
        },
        movement_category: row.get(8)?,
        condition: row.get(9)?,
        is_found: row.get(10)?,
        estimated_latitude: row.get(11)?,
        estimated_longitude: row.get(12)?,
    })
}

fn victim_by_id(conn: &Connection, id: i64) -> PipelineResult<Victim> {
    conn.query_row(
        &format!("{} WHERE id = ?1", VICTIM_SELECT),
        params![id],
        victim_from_row,
    )
    .optional()?
    .ok_or_else(|| PipelineError::not_found("victim", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> Store {
        Store::open(":memory:", 0.5).expect("open store")
    }

    fn sample_boxes(n: usize) -> Vec<PersonBox> {
        (0..n)
            .map(|i| PersonBox {
                bbox: BoundingBox {
                    x1: i as f32,
                    y1: 0.0,
                    x2: i as f32 + 10.0,
                    y2: 20.0,
                },
                confidence: 0.9 - i as f32 * 0.1,
            })
            .collect()
    }

    fn capture(store: &Store, mission_id: i64, model_id: i64, n: usize) -> (Detection, Vec<Victim>) {
        let new = NewDetection {
            mission_id,
            model_id,
            latitude: 14.6,
            longitude: 121.0,
            timestamp: Utc::now(),
            is_live: true,
        };
        store
            .persist_capture(&new, &sample_boxes(n), |id| Ok(format!("snap_{}.jpg", id)))
            .expect("persist capture")
    }

    #[test]
    fn shared_memory_stores_see_each_other() -> PipelineResult<()> {
        let uri = shared_memory_uri();
        let first = Store::open(&uri, 0.5)?;
        let second = Store::open(&uri, 0.9)?;
        first.create_mission(Utc::now())?;
        assert_eq!(second.list_missions()?.len(), 1);
        assert!((second.registry_state()?.confidence - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn selection_is_exclusive_after_every_call() -> PipelineResult<()> {
        let store = open_store();
        let models = store.seed_models(["a", "b", "c"])?;
        assert!(models.iter().all(|m| !m.is_selected));
        for model in models.iter().chain(models.iter().rev()) {
            store.select_model(model.id)?;
            let selected: Vec<_> = store
                .list_models()?
                .into_iter()
                .filter(|m| m.is_selected)
                .collect();
            assert_eq!(selected.len(), 1);
            assert_eq!(selected[0].id, model.id);
        }
        Ok(())
    }

    #[test]
    fn select_unknown_model_is_not_found() {
        let store = open_store();
        let err = store.select_model(99).unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { id: 99, .. }));
    }

    #[test]
    fn confidence_applies_to_whole_catalog() -> PipelineResult<()> {
        let store = open_store();
        store.seed_models(["a", "b"])?;
        store.set_confidence(0.7)?;
        for model in store.list_models()? {
            assert!((model.confidence - 0.7).abs() < 1e-6);
        }
        assert!(store.set_confidence(1.5).is_err());
        Ok(())
    }

    #[test]
    fn failed_select_with_confidence_leaves_state_untouched() -> PipelineResult<()> {
        let store = open_store();
        let models = store.seed_models(["a", "b"])?;
        store.select_model_with_confidence(models[0].id, 0.4)?;
        assert!(store.select_model_with_confidence(404, 0.9).is_err());
        let state = store.registry_state()?;
        assert_eq!(state.selected_model_id, Some(models[0].id));
        assert!((state.confidence - 0.4).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn capture_creates_victims_with_ordinal_person_ids() -> PipelineResult<()> {
        let store = open_store();
        let model = store.upsert_model("best")?;
        let mission = store.create_mission(Utc::now())?;
        let (detection, victims) = capture(&store, mission.id, model.id, 3);
        let ids: Vec<_> = victims.iter().map(|v| v.person_id.clone()).collect();
        assert_eq!(
            ids,
            (1..=3)
                .map(|i| format!("person_{}_{}", detection.id, i))
                .collect::<Vec<_>>()
        );
        let stored = store.list_victims_for_detection(detection.id)?;
        assert_eq!(stored, victims);
        assert!(stored.iter().all(|v| v.movement_category == "unknown" && !v.is_found));
        Ok(())
    }

    #[test]
    fn snapshot_failure_rolls_back_everything() -> PipelineResult<()> {
        let store = open_store();
        let model = store.upsert_model("best")?;
        let mission = store.create_mission(Utc::now())?;
        let new = NewDetection {
            mission_id: mission.id,
            model_id: model.id,
            latitude: 0.0,
            longitude: 0.0,
            timestamp: Utc::now(),
            is_live: false,
        };
        let result = store.persist_capture(&new, &sample_boxes(2), |_| {
            Err(PipelineError::Persistence("disk full".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.count_detections()?, 0);
        assert_eq!(store.count_victims()?, 0);
        Ok(())
    }

    #[test]
    fn deleting_mission_cascades() -> PipelineResult<()> {
        let store = open_store();
        let model = store.upsert_model("best")?;
        let mission = store.create_mission(Utc::now())?;
        let (detection, victims) = capture(&store, mission.id, model.id, 2);
        store.add_posture_classification(victims[0].id, "lying", 0.8)?;

        let snapshots = store.delete_mission(mission.id)?;
        assert_eq!(snapshots, vec![format!("snap_{}.jpg", detection.id)]);
        assert_eq!(store.count_detections()?, 0);
        assert_eq!(store.count_victims()?, 0);
        assert!(store.list_posture_classifications(victims[0].id)?.is_empty());
        Ok(())
    }

    #[test]
    fn deleting_detection_keeps_mission() -> PipelineResult<()> {
        let store = open_store();
        let model = store.upsert_model("best")?;
        let mission = store.create_mission(Utc::now())?;
        let (detection, _) = capture(&store, mission.id, model.id, 2);
        let (other, _) = capture(&store, mission.id, model.id, 1);

        store.delete_detection(detection.id)?;
        assert!(store.get_mission(mission.id)?.is_open());
        assert_eq!(store.count_victims()?, 1);
        assert_eq!(store.list_detections_for_mission(mission.id)?.len(), 1);
        assert_eq!(store.list_victims_for_detection(other.id)?.len(), 1);
        Ok(())
    }

    #[test]
    fn closing_is_one_way_and_blocks_capture() -> PipelineResult<()> {
        let store = open_store();
        let model = store.upsert_model("best")?;
        let mission = store.create_mission(Utc::now())?;
        let closed = store.close_mission(mission.id, Utc::now())?;
        assert!(!closed.is_open());
        assert!(matches!(
            store.close_mission(mission.id, Utc::now()),
            Err(PipelineError::MissionClosed(_))
        ));
        let new = NewDetection {
            mission_id: mission.id,
            model_id: model.id,
            latitude: 0.0,
            longitude: 0.0,
            timestamp: Utc::now(),
            is_live: false,
        };
        let result = store.persist_capture(&new, &[], |id| Ok(format!("{}.jpg", id)));
        assert!(matches!(result, Err(PipelineError::MissionClosed(_))));
        Ok(())
    }

    #[test]
    fn triage_changes_only_triage_fields() -> PipelineResult<()> {
        let store = open_store();
        let model = store.upsert_model("best")?;
        let mission = store.create_mission(Utc::now())?;
        let (_, victims) = capture(&store, mission.id, model.id, 1);
        let before = &victims[0];

        let triage: VictimTriage = serde_json::from_str(
            r#"{ "movement_category": "immobile", "risk_category": "critical", "is_found": true }"#,
        )
        .expect("triage json");
        let after = store.triage_victim(before.id, &triage)?;
        assert_eq!(after.movement_category, "immobile");
        assert_eq!(after.condition, "critical");
        assert!(after.is_found);
        assert_eq!(after.bounding_box, before.bounding_box);
        assert_eq!(after.confidence, before.confidence);
        assert_eq!(after.estimated_latitude, before.estimated_latitude);
        Ok(())
    }
}
