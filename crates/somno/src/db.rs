use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::ClinicError;
use crate::id::{EntityKind, next_id};
use crate::types::{
    CreateDoctorParams, CreatePatientParams, CreateSleepRecordParams, Doctor, DoctorDetail,
    DoctorListEntry, FileAttachment, FileCategory, NewAttachment, Patient, PatientDetail,
    PatientRef, PatientSummary, SleepMetrics, SleepRecord, SleepRecordDetail, StatusCounts,
    UpdateDoctorFields, UpdatePatientFields, UpdateSleepRecordFields,
};

pub const DB_FILE: &str = "somno.sqlite";
pub const DEFAULT_PASSWORD_COST: u32 = 10;

pub struct Db {
    pub conn: Connection,
    pub data_dir: PathBuf,
    /// bcrypt cost used when hashing patient passwords.
    pub password_cost: u32,
}

fn conversion_err<E>(col: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(err))
}

fn parse_dt(row: &rusqlite::Row, col: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(col)?;
    let idx = row.as_ref().column_index(col)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_dt(row: &rusqlite::Row, col: &str) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = row.get(col)?;
    let idx = row.as_ref().column_index(col)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn parse_date(row: &rusqlite::Row, col: &str) -> Result<Option<NaiveDate>, rusqlite::Error> {
    let raw: Option<String> = row.get(col)?;
    let idx = row.as_ref().column_index(col)?;
    raw.map(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn parse_enum<T: std::str::FromStr<Err = String>>(
    row: &rusqlite::Row,
    col: &str,
) -> Result<T, rusqlite::Error> {
    let raw: String = row.get(col)?;
    let idx = row.as_ref().column_index(col)?;
    raw.parse::<T>()
        .map_err(|e| conversion_err(idx, std::io::Error::other(e)))
}

pub(crate) fn patient_from_row(row: &rusqlite::Row) -> Result<Patient, rusqlite::Error> {
    Ok(Patient {
        id: row.get("id")?,
        name: row.get("name")?,
        gender: parse_enum(row, "gender")?,
        birth_date: parse_date(row, "birth_date")?,
        phone: row.get("phone")?,
        email: row.get("email")?,
        address: row.get("address")?,
        notes: row.get("notes")?,
        created_at: parse_dt(row, "created_at")?,
        updated_at: parse_dt(row, "updated_at")?,
    })
}

pub(crate) fn doctor_from_row(row: &rusqlite::Row) -> Result<Doctor, rusqlite::Error> {
    Ok(Doctor {
        id: row.get("id")?,
        name: row.get("name")?,
        department: row.get("department")?,
        phone: row.get("phone")?,
        email: row.get("email")?,
        created_at: parse_dt(row, "created_at")?,
        updated_at: parse_dt(row, "updated_at")?,
    })
}

pub(crate) fn sleep_record_from_row(row: &rusqlite::Row) -> Result<SleepRecord, rusqlite::Error> {
    Ok(SleepRecord {
        id: row.get("id")?,
        patient_id: row.get("patient_id")?,
        record_start: parse_dt(row, "record_start")?,
        record_end: parse_dt(row, "record_end")?,
        ahi: row.get("ahi")?,
        odi: row.get("odi")?,
        min_spo2: row.get("min_spo2")?,
        mean_spo2: row.get("mean_spo2")?,
        sleep_efficiency: row.get("sleep_efficiency")?,
        total_sleep_minutes: row.get("total_sleep_minutes")?,
        notes: row.get("notes")?,
        created_at: parse_dt(row, "created_at")?,
        updated_at: parse_dt(row, "updated_at")?,
    })
}

pub(crate) fn attachment_from_row(row: &rusqlite::Row) -> Result<FileAttachment, rusqlite::Error> {
    Ok(FileAttachment {
        id: row.get("id")?,
        sleep_record_id: row.get("sleep_record_id")?,
        filename: row.get("filename")?,
        stored_name: row.get("stored_name")?,
        content_type: row.get("content_type")?,
        category: parse_enum(row, "category")?,
        size_bytes: row.get("size_bytes")?,
        sha256: row.get("sha256")?,
        created_at: parse_dt(row, "created_at")?,
    })
}

fn is_constraint(err: &rusqlite::Error, extended: i32) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation && e.extended_code == extended
    )
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    is_constraint(err, rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        || is_constraint(err, rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
}

fn internal(context: &'static str) -> impl Fn(rusqlite::Error) -> ClinicError {
    move |e| ClinicError::Internal(format!("{context}: {e}"))
}

fn required_text(field: &str, value: &str) -> Result<(), ClinicError> {
    if value.trim().is_empty() {
        return Err(ClinicError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

/// A new password must be non-blank and typed the same way twice.
fn check_password(password: &str, confirm: Option<&str>) -> Result<(), ClinicError> {
    if password.trim().is_empty() {
        return Err(ClinicError::Validation("password must not be empty".to_string()));
    }
    if confirm != Some(password) {
        return Err(ClinicError::Validation(
            "password and confirm_password do not match".to_string(),
        ));
    }
    Ok(())
}

fn check_interval(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), ClinicError> {
    if end < start {
        return Err(ClinicError::Validation(
            "record_end must not precede record_start".to_string(),
        ));
    }
    Ok(())
}

/// Accumulates the SET clause of a partial UPDATE.
#[derive(Default)]
struct Changes {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl Changes {
    fn set(&mut self, column: &str, value: Value) {
        self.clauses.push(format!("{column} = ?"));
        self.values.push(value);
    }

    /// Empty strings clear the column.
    fn set_text(&mut self, column: &str, value: &Option<String>) {
        if let Some(v) = value {
            if v.is_empty() {
                self.set(column, Value::Null);
            } else {
                self.set(column, Value::Text(v.clone()));
            }
        }
    }

    fn set_real(&mut self, column: &str, value: Option<f64>) {
        if let Some(v) = value {
            self.set(column, Value::Real(v));
        }
    }

    fn set_metrics(&mut self, metrics: &SleepMetrics) {
        self.set_real("ahi", metrics.ahi);
        self.set_real("odi", metrics.odi);
        self.set_real("min_spo2", metrics.min_spo2);
        self.set_real("mean_spo2", metrics.mean_spo2);
        self.set_real("sleep_efficiency", metrics.sleep_efficiency);
        if let Some(v) = metrics.total_sleep_minutes {
            self.set("total_sleep_minutes", Value::Integer(v));
        }
    }

    fn execute(
        mut self,
        conn: &Connection,
        table: &str,
        key: Value,
    ) -> Result<(), rusqlite::Error> {
        self.set("updated_at", Value::Text(now()));
        self.values.push(key);
        let sql = format!(
            "UPDATE {table} SET {} WHERE id = ?",
            self.clauses.join(", ")
        );
        conn.execute(&sql, rusqlite::params_from_iter(self.values))?;
        Ok(())
    }
}

impl Db {
    pub fn open(data_dir: &Path) -> Result<Db, ClinicError> {
        fs::create_dir_all(data_dir)
            .map_err(|e| ClinicError::Internal(format!("failed to create data dir: {e}")))?;

        let conn = Connection::open(data_dir.join(DB_FILE))
            .map_err(internal("failed to open database"))?;

        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(internal("failed to set busy_timeout"))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(internal("failed to enable foreign_keys"))?;

        Self::run_migrations(&conn)?;

        Ok(Db {
            conn,
            data_dir: data_dir.to_path_buf(),
            password_cost: DEFAULT_PASSWORD_COST,
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), ClinicError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS patients (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                gender      TEXT NOT NULL CHECK (gender IN ('male', 'female', 'other')),
                birth_date  TEXT,
                phone       TEXT,
                email       TEXT,
                address     TEXT,
                notes       TEXT,
                password_hash TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS doctors (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                department  TEXT,
                phone       TEXT,
                email       TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS patient_doctors (
                doctor_id   TEXT NOT NULL REFERENCES doctors(id) ON DELETE CASCADE,
                patient_id  TEXT NOT NULL REFERENCES patients(id) ON DELETE CASCADE,
                created_at  TEXT NOT NULL,
                PRIMARY KEY (doctor_id, patient_id)
            );

            CREATE TABLE IF NOT EXISTS sleep_records (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                patient_id          TEXT NOT NULL REFERENCES patients(id) ON DELETE CASCADE,
                record_start        TEXT NOT NULL,
                record_end          TEXT NOT NULL,
                ahi                 REAL,
                odi                 REAL,
                min_spo2            REAL,
                mean_spo2           REAL,
                sleep_efficiency    REAL,
                total_sleep_minutes INTEGER,
                notes               TEXT,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL,
                UNIQUE (patient_id, record_start)
            );

            CREATE TABLE IF NOT EXISTS files (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                sleep_record_id  INTEGER NOT NULL REFERENCES sleep_records(id) ON DELETE CASCADE,
                filename         TEXT NOT NULL,
                stored_name      TEXT NOT NULL,
                content_type     TEXT NOT NULL,
                category         TEXT NOT NULL CHECK (category IN ('pdf', 'ct')),
                size_bytes       INTEGER NOT NULL,
                sha256           TEXT NOT NULL,
                created_at       TEXT NOT NULL
            );",
        )
        .map_err(internal("migration failed"))?;

        Ok(())
    }

    // --- Identifier collaborators ---

    /// The id with the greatest numeric suffix for `kind`, if any rows exist.
    pub fn max_existing_id(&self, kind: EntityKind) -> Result<Option<String>, ClinicError> {
        let sql = format!(
            "SELECT id FROM {} ORDER BY CAST(SUBSTR(id, 2) AS INTEGER) DESC, LENGTH(id) DESC LIMIT 1",
            kind.table()
        );
        self.conn
            .query_row(&sql, [], |row| row.get(0))
            .optional()
            .map_err(internal("failed to read max id"))
    }

    /// Inserts a patient under an already allocated id.
    ///
    /// A taken id is reported as `Conflict`; the caller decides whether to
    /// allocate again.
    pub fn insert_patient(
        &self,
        id: &str,
        params: &CreatePatientParams,
        password_hash: &str,
    ) -> Result<(), ClinicError> {
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO patients (id, name, gender, birth_date, phone, email, address, notes,
                    password_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    id,
                    params.name.trim(),
                    params.gender.as_str(),
                    params.birth_date.map(fmt_date),
                    params.phone,
                    params.email,
                    params.address,
                    params.notes,
                    password_hash,
                    ts,
                    ts,
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ClinicError::Conflict(format!("patient id {id} already exists"))
                } else {
                    ClinicError::Internal(format!("failed to insert patient: {e}"))
                }
            })?;
        Ok(())
    }

    pub fn insert_doctor(&self, id: &str, params: &CreateDoctorParams) -> Result<(), ClinicError> {
        let ts = now();
        self.conn
            .execute(
                "INSERT INTO doctors (id, name, department, phone, email, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id,
                    params.name.trim(),
                    params.department,
                    params.phone,
                    params.email,
                    ts,
                    ts,
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ClinicError::Conflict(format!("doctor id {id} already exists"))
                } else {
                    ClinicError::Internal(format!("failed to insert doctor: {e}"))
                }
            })?;
        Ok(())
    }

    /// Reads the current maximum, allocates the next id and inserts with it.
    ///
    /// The read and the insert share an immediate transaction, so writers on
    /// other connections queue behind the reserved lock instead of
    /// computing the same id.
    fn allocate_and_insert<F>(&self, kind: EntityKind, insert: F) -> Result<String, ClinicError>
    where
        F: FnOnce(&str) -> Result<(), ClinicError>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(internal("failed to begin transaction"))?;
        let last = self.max_existing_id(kind)?;
        let id = next_id(kind.prefix(), last.as_deref())?;
        insert(&id)?;
        tx.commit().map_err(internal("failed to commit"))?;
        Ok(id)
    }

    // --- Patients ---

    fn hash_password(&self, password: &str) -> Result<String, ClinicError> {
        bcrypt::hash(password, self.password_cost)
            .map_err(|e| ClinicError::Internal(format!("failed to hash password: {e}")))
    }

    pub fn create_patient(&self, params: &CreatePatientParams) -> Result<Patient, ClinicError> {
        required_text("name", &params.name)?;
        check_password(&params.password, Some(params.confirm_password.as_str()))?;
        let password_hash = self.hash_password(&params.password)?;
        let id = self.allocate_and_insert(EntityKind::Patient, |id| {
            self.insert_patient(id, params, &password_hash)
        })?;
        tracing::info!(%id, "patient created");
        self.get_patient_only(&id)
    }

    pub(crate) fn get_patient_only(&self, id: &str) -> Result<Patient, ClinicError> {
        self.conn
            .query_row(
                "SELECT * FROM patients WHERE id = ?1",
                rusqlite::params![id],
                patient_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    ClinicError::NotFound(format!("patient {id}"))
                }
                other => ClinicError::Internal(format!("failed to get patient: {other}")),
            })
    }

    pub fn get_patient(&self, id: &str) -> Result<PatientDetail, ClinicError> {
        let patient = self.get_patient_only(id)?;
        let sleep_records = self.list_sleep_records(Some(id))?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT d.* FROM doctors d
                 JOIN patient_doctors pd ON pd.doctor_id = d.id
                 WHERE pd.patient_id = ?1
                 ORDER BY d.id",
            )
            .map_err(internal("failed to prepare doctors query"))?;
        let doctors = stmt
            .query_map(rusqlite::params![id], doctor_from_row)
            .map_err(internal("failed to query doctors"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal("failed to read doctors"))?;

        Ok(PatientDetail {
            patient,
            sleep_records,
            doctors,
        })
    }

    pub fn list_patients(&self) -> Result<Vec<PatientSummary>, ClinicError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT p.id, p.name, p.gender, p.birth_date,
                    (SELECT COUNT(*) FROM sleep_records s WHERE s.patient_id = p.id)
                        AS total_record_count,
                    (SELECT s.record_start FROM sleep_records s WHERE s.patient_id = p.id
                        ORDER BY s.record_start DESC LIMIT 1) AS latest_record_start,
                    (SELECT s.ahi FROM sleep_records s WHERE s.patient_id = p.id
                        ORDER BY s.record_start DESC LIMIT 1) AS latest_ahi
                 FROM patients p
                 ORDER BY CAST(SUBSTR(p.id, 2) AS INTEGER)",
            )
            .map_err(internal("failed to prepare patient list"))?;
        stmt.query_map([], |row| {
            Ok(PatientSummary {
                id: row.get("id")?,
                name: row.get("name")?,
                gender: parse_enum(row, "gender")?,
                birth_date: parse_date(row, "birth_date")?,
                total_record_count: row.get("total_record_count")?,
                latest_record_start: parse_opt_dt(row, "latest_record_start")?,
                latest_ahi: row.get("latest_ahi")?,
            })
        })
        .map_err(internal("failed to list patients"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(internal("failed to read patients"))
    }

    pub fn update_patient(
        &self,
        id: &str,
        fields: &UpdatePatientFields,
    ) -> Result<Patient, ClinicError> {
        self.get_patient_only(id)?;

        let mut changes = Changes::default();
        if let Some(name) = &fields.name {
            required_text("name", name)?;
            changes.set("name", Value::Text(name.trim().to_string()));
        }
        if let Some(gender) = fields.gender {
            changes.set("gender", Value::Text(gender.as_str().to_string()));
        }
        if let Some(birth_date) = fields.birth_date {
            changes.set("birth_date", Value::Text(fmt_date(birth_date)));
        }
        changes.set_text("phone", &fields.phone);
        changes.set_text("email", &fields.email);
        changes.set_text("address", &fields.address);
        changes.set_text("notes", &fields.notes);
        if let Some(password) = fields.password.as_deref().filter(|p| !p.is_empty()) {
            check_password(password, fields.confirm_password.as_deref())?;
            changes.set("password_hash", Value::Text(self.hash_password(password)?));
        }

        changes
            .execute(&self.conn, "patients", Value::Text(id.to_string()))
            .map_err(internal("failed to update patient"))?;

        self.get_patient_only(id)
    }

    /// Checks `password` against the stored hash. A wrong password is
    /// `Ok(false)`; only a missing patient is an error.
    pub fn verify_patient_password(&self, id: &str, password: &str) -> Result<bool, ClinicError> {
        let hash: String = self
            .conn
            .query_row(
                "SELECT password_hash FROM patients WHERE id = ?1",
                rusqlite::params![id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    ClinicError::NotFound(format!("patient {id}"))
                }
                other => ClinicError::Internal(format!("failed to read password: {other}")),
            })?;
        match bcrypt::verify(password, &hash) {
            Ok(valid) => Ok(valid),
            Err(e) => {
                tracing::warn!(%id, "unreadable password hash: {e}");
                Ok(false)
            }
        }
    }

    /// Deletes the patient along with links, sleep records and attachment rows.
    pub fn delete_patient(&self, id: &str) -> Result<(), ClinicError> {
        let deleted = self
            .conn
            .execute("DELETE FROM patients WHERE id = ?1", rusqlite::params![id])
            .map_err(internal("failed to delete patient"))?;
        if deleted == 0 {
            return Err(ClinicError::NotFound(format!("patient {id}")));
        }
        tracing::info!(%id, "patient deleted");
        Ok(())
    }

    // --- Doctors ---

    pub fn create_doctor(&self, params: &CreateDoctorParams) -> Result<Doctor, ClinicError> {
        required_text("name", &params.name)?;
        let id = self.allocate_and_insert(EntityKind::Doctor, |id| self.insert_doctor(id, params))?;
        tracing::info!(%id, "doctor created");
        self.get_doctor_only(&id)
    }

    pub(crate) fn get_doctor_only(&self, id: &str) -> Result<Doctor, ClinicError> {
        self.conn
            .query_row(
                "SELECT * FROM doctors WHERE id = ?1",
                rusqlite::params![id],
                doctor_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    ClinicError::NotFound(format!("doctor {id}"))
                }
                other => ClinicError::Internal(format!("failed to get doctor: {other}")),
            })
    }

    fn linked_patients(&self, doctor_id: &str) -> Result<Vec<Patient>, ClinicError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT p.* FROM patients p
                 JOIN patient_doctors pd ON pd.patient_id = p.id
                 WHERE pd.doctor_id = ?1
                 ORDER BY CAST(SUBSTR(p.id, 2) AS INTEGER)",
            )
            .map_err(internal("failed to prepare linked patients query"))?;
        stmt.query_map(rusqlite::params![doctor_id], patient_from_row)
            .map_err(internal("failed to query linked patients"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal("failed to read linked patients"))
    }

    pub fn get_doctor(&self, id: &str) -> Result<DoctorDetail, ClinicError> {
        let doctor = self.get_doctor_only(id)?;
        let patients = self.linked_patients(id)?;
        Ok(DoctorDetail { doctor, patients })
    }

    pub fn list_doctors(&self) -> Result<Vec<DoctorListEntry>, ClinicError> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM doctors ORDER BY CAST(SUBSTR(id, 2) AS INTEGER)")
            .map_err(internal("failed to prepare doctor list"))?;
        let doctors = stmt
            .query_map([], doctor_from_row)
            .map_err(internal("failed to list doctors"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal("failed to read doctors"))?;

        doctors
            .into_iter()
            .map(|doctor| {
                let patients = self
                    .linked_patients(&doctor.id)?
                    .into_iter()
                    .map(|p| PatientRef {
                        id: p.id,
                        name: p.name,
                    })
                    .collect();
                Ok(DoctorListEntry { doctor, patients })
            })
            .collect()
    }

    pub fn update_doctor(&self, id: &str, fields: &UpdateDoctorFields) -> Result<Doctor, ClinicError> {
        self.get_doctor_only(id)?;

        let mut changes = Changes::default();
        if let Some(name) = &fields.name {
            required_text("name", name)?;
            changes.set("name", Value::Text(name.trim().to_string()));
        }
        changes.set_text("department", &fields.department);
        changes.set_text("phone", &fields.phone);
        changes.set_text("email", &fields.email);

        changes
            .execute(&self.conn, "doctors", Value::Text(id.to_string()))
            .map_err(internal("failed to update doctor"))?;

        self.get_doctor_only(id)
    }

    pub fn delete_doctor(&self, id: &str) -> Result<(), ClinicError> {
        let deleted = self
            .conn
            .execute("DELETE FROM doctors WHERE id = ?1", rusqlite::params![id])
            .map_err(internal("failed to delete doctor"))?;
        if deleted == 0 {
            return Err(ClinicError::NotFound(format!("doctor {id}")));
        }
        tracing::info!(%id, "doctor deleted");
        Ok(())
    }

    /// Links every patient in `patient_ids` to the doctor.
    ///
    /// Nothing is written when any pair is already linked; the error lists the
    /// offending patient ids.
    pub fn link_patients(
        &self,
        doctor_id: &str,
        patient_ids: &[String],
    ) -> Result<DoctorDetail, ClinicError> {
        self.get_doctor_only(doctor_id)?;
        let wanted: BTreeSet<&str> = patient_ids.iter().map(String::as_str).collect();
        if wanted.is_empty() {
            return Err(ClinicError::Validation(
                "patient_ids must not be empty".to_string(),
            ));
        }
        for patient_id in &wanted {
            self.get_patient_only(patient_id)?;
        }

        let mut stmt = self
            .conn
            .prepare("SELECT patient_id FROM patient_doctors WHERE doctor_id = ?1")
            .map_err(internal("failed to prepare link query"))?;
        let existing: BTreeSet<String> = stmt
            .query_map(rusqlite::params![doctor_id], |row| row.get(0))
            .map_err(internal("failed to query links"))?
            .collect::<Result<_, _>>()
            .map_err(internal("failed to read links"))?;
        let duplicates: Vec<String> = wanted
            .iter()
            .filter(|id| existing.contains(**id))
            .map(|id| id.to_string())
            .collect();
        if !duplicates.is_empty() {
            return Err(ClinicError::AlreadyLinked {
                doctor_id: doctor_id.to_string(),
                patient_ids: duplicates,
            });
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(internal("failed to begin transaction"))?;
        let ts = now();
        for patient_id in &wanted {
            tx.execute(
                "INSERT INTO patient_doctors (doctor_id, patient_id, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![doctor_id, patient_id, ts],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ClinicError::AlreadyLinked {
                        doctor_id: doctor_id.to_string(),
                        patient_ids: vec![patient_id.to_string()],
                    }
                } else {
                    ClinicError::Internal(format!("failed to link patient: {e}"))
                }
            })?;
        }
        tx.commit().map_err(internal("failed to commit links"))?;

        self.get_doctor(doctor_id)
    }

    pub fn unlink_patient(&self, doctor_id: &str, patient_id: &str) -> Result<(), ClinicError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM patient_doctors WHERE doctor_id = ?1 AND patient_id = ?2",
                rusqlite::params![doctor_id, patient_id],
            )
            .map_err(internal("failed to unlink patient"))?;
        if deleted == 0 {
            return Err(ClinicError::NotFound(format!(
                "link {doctor_id} -> {patient_id}"
            )));
        }
        Ok(())
    }

    // --- Sleep records ---

    pub fn create_sleep_record(
        &self,
        params: &CreateSleepRecordParams,
    ) -> Result<SleepRecord, ClinicError> {
        self.get_patient_only(&params.patient_id)?;
        check_interval(params.record_start, params.record_end)?;

        let ts = now();
        let m = &params.metrics;
        self.conn
            .execute(
                "INSERT INTO sleep_records (patient_id, record_start, record_end, ahi, odi, min_spo2,
                    mean_spo2, sleep_efficiency, total_sleep_minutes, notes, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    params.patient_id,
                    fmt_ts(params.record_start),
                    fmt_ts(params.record_end),
                    m.ahi,
                    m.odi,
                    m.min_spo2,
                    m.mean_spo2,
                    m.sleep_efficiency,
                    m.total_sleep_minutes,
                    params.notes,
                    ts,
                    ts,
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ClinicError::Conflict(format!(
                        "patient {} already has a sleep record starting at {}",
                        params.patient_id,
                        fmt_dt(params.record_start)
                    ))
                } else {
                    ClinicError::Internal(format!("failed to create sleep record: {e}"))
                }
            })?;

        let id = self.conn.last_insert_rowid();
        tracing::info!(id, patient_id = %params.patient_id, "sleep record created");
        self.get_sleep_record_only(id)
    }

    pub(crate) fn get_sleep_record_only(&self, id: i64) -> Result<SleepRecord, ClinicError> {
        self.conn
            .query_row(
                "SELECT * FROM sleep_records WHERE id = ?1",
                rusqlite::params![id],
                sleep_record_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    ClinicError::NotFound(format!("sleep record {id}"))
                }
                other => ClinicError::Internal(format!("failed to get sleep record: {other}")),
            })
    }

    pub fn get_sleep_record(&self, id: i64) -> Result<SleepRecordDetail, ClinicError> {
        let record = self.get_sleep_record_only(id)?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT * FROM files WHERE sleep_record_id = ?1 ORDER BY created_at DESC, id DESC",
            )
            .map_err(internal("failed to prepare files query"))?;
        let files = stmt
            .query_map(rusqlite::params![id], attachment_from_row)
            .map_err(internal("failed to query files"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal("failed to read files"))?;
        Ok(SleepRecordDetail { record, files })
    }

    /// Records newest first, optionally restricted to one patient.
    pub fn list_sleep_records(
        &self,
        patient_id: Option<&str>,
    ) -> Result<Vec<SleepRecord>, ClinicError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT * FROM sleep_records
                 WHERE ?1 IS NULL OR patient_id = ?1
                 ORDER BY record_start DESC, id DESC",
            )
            .map_err(internal("failed to prepare sleep record list"))?;
        stmt.query_map(rusqlite::params![patient_id], sleep_record_from_row)
            .map_err(internal("failed to list sleep records"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(internal("failed to read sleep records"))
    }

    pub fn update_sleep_record(
        &self,
        id: i64,
        fields: &UpdateSleepRecordFields,
    ) -> Result<SleepRecord, ClinicError> {
        let current = self.get_sleep_record_only(id)?;
        check_interval(
            fields.record_start.unwrap_or(current.record_start),
            fields.record_end.unwrap_or(current.record_end),
        )?;

        let mut changes = Changes::default();
        if let Some(start) = fields.record_start {
            changes.set("record_start", Value::Text(fmt_ts(start)));
        }
        if let Some(end) = fields.record_end {
            changes.set("record_end", Value::Text(fmt_ts(end)));
        }
        changes.set_metrics(&fields.metrics);
        changes.set_text("notes", &fields.notes);

        changes
            .execute(&self.conn, "sleep_records", Value::Integer(id))
            .map_err(|e| {
                if is_unique_violation(&e) {
                    ClinicError::Conflict(format!(
                        "patient {} already has a sleep record at that start time",
                        current.patient_id
                    ))
                } else {
                    ClinicError::Internal(format!("failed to update sleep record: {e}"))
                }
            })?;

        self.get_sleep_record_only(id)
    }

    /// Removes the record and its attachment rows, returning the removed record.
    pub fn delete_sleep_record(&self, id: i64) -> Result<SleepRecord, ClinicError> {
        let record = self.get_sleep_record_only(id)?;
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(internal("failed to begin transaction"))?;
        tx.execute(
            "DELETE FROM files WHERE sleep_record_id = ?1",
            rusqlite::params![id],
        )
        .map_err(internal("failed to delete files"))?;
        tx.execute(
            "DELETE FROM sleep_records WHERE id = ?1",
            rusqlite::params![id],
        )
        .map_err(internal("failed to delete sleep record"))?;
        tx.commit().map_err(internal("failed to commit delete"))?;
        tracing::info!(id, "sleep record deleted");
        Ok(record)
    }

    // --- Attachments ---

    pub fn add_attachment(&self, new: &NewAttachment) -> Result<FileAttachment, ClinicError> {
        self.conn
            .execute(
                "INSERT INTO files (sleep_record_id, filename, stored_name, content_type, category,
                    size_bytes, sha256, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    new.sleep_record_id,
                    new.filename,
                    new.stored_name,
                    new.content_type,
                    new.category.as_str(),
                    new.size_bytes,
                    new.sha256,
                    now(),
                ],
            )
            .map_err(|e| {
                if is_constraint(&e, rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY) {
                    ClinicError::NotFound(format!("sleep record {}", new.sleep_record_id))
                } else {
                    ClinicError::Internal(format!("failed to add attachment: {e}"))
                }
            })?;
        self.get_attachment(self.conn.last_insert_rowid())
    }

    /// Adds a batch of attachment rows in one transaction: either every row
    /// is stored or none is.
    pub fn add_attachments(
        &self,
        batch: &[NewAttachment],
    ) -> Result<Vec<FileAttachment>, ClinicError> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_err(internal("failed to begin transaction"))?;
        let added = batch
            .iter()
            .map(|new| self.add_attachment(new))
            .collect::<Result<Vec<_>, _>>()?;
        tx.commit().map_err(internal("failed to commit"))?;
        Ok(added)
    }

    pub fn get_attachment(&self, id: i64) -> Result<FileAttachment, ClinicError> {
        self.conn
            .query_row(
                "SELECT * FROM files WHERE id = ?1",
                rusqlite::params![id],
                attachment_from_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => ClinicError::NotFound(format!("file {id}")),
                other => ClinicError::Internal(format!("failed to get file: {other}")),
            })
    }

    /// Attachments of a record, oldest first.
    pub fn list_attachments(
        &self,
        sleep_record_id: i64,
        category: Option<FileCategory>,
    ) -> Result<Vec<FileAttachment>, ClinicError> {
        self.get_sleep_record_only(sleep_record_id)?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT * FROM files
                 WHERE sleep_record_id = ?1 AND (?2 IS NULL OR category = ?2)
                 ORDER BY created_at, id",
            )
            .map_err(internal("failed to prepare files query"))?;
        stmt.query_map(
            rusqlite::params![sleep_record_id, category.map(FileCategory::as_str)],
            attachment_from_row,
        )
        .map_err(internal("failed to list files"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(internal("failed to read files"))
    }

    pub fn status(&self) -> Result<StatusCounts, ClinicError> {
        self.conn
            .query_row(
                "SELECT
                    (SELECT COUNT(*) FROM patients),
                    (SELECT COUNT(*) FROM doctors),
                    (SELECT COUNT(*) FROM sleep_records),
                    (SELECT COUNT(*) FROM files)",
                [],
                |row| {
                    Ok(StatusCounts {
                        patients: row.get(0)?,
                        doctors: row.get(1)?,
                        sleep_records: row.get(2)?,
                        files: row.get(3)?,
                    })
                },
            )
            .map_err(internal("failed to count rows"))
    }
}

pub fn now() -> String {
    fmt_ts(Utc::now())
}

/// Stored form of a timestamp. Fixed nanosecond width keeps the text
/// lossless and sortable.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Display form: fractional seconds only when present.
pub fn fmt_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn fmt_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Gender;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn open_temp_db() -> (Db, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut db = Db::open(dir.path()).unwrap();
        db.password_cost = 4;
        (db, dir)
    }

    fn patient(name: &str) -> CreatePatientParams {
        CreatePatientParams {
            name: name.into(),
            gender: Gender::Female,
            birth_date: NaiveDate::from_ymd_opt(1971, 4, 2),
            phone: None,
            email: None,
            address: None,
            notes: None,
            password: "night-owl".into(),
            confirm_password: "night-owl".into(),
        }
    }

    fn doctor(name: &str) -> CreateDoctorParams {
        CreateDoctorParams {
            name: name.into(),
            department: Some("pulmonology".into()),
            phone: None,
            email: None,
        }
    }

    fn night(patient_id: &str, day: u32, ahi: f64) -> CreateSleepRecordParams {
        CreateSleepRecordParams {
            patient_id: patient_id.into(),
            record_start: Utc.with_ymd_and_hms(2024, 3, day, 22, 0, 0).unwrap(),
            record_end: Utc.with_ymd_and_hms(2024, 3, day + 1, 6, 0, 0).unwrap(),
            metrics: SleepMetrics {
                ahi: Some(ahi),
                ..Default::default()
            },
            notes: None,
        }
    }

    #[test]
    fn open_creates_tables() {
        let (db, _dir) = open_temp_db();

        let tables: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        for table in ["patients", "doctors", "patient_doctors", "sleep_records", "files"] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn open_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let _db1 = Db::open(dir.path()).unwrap();
        let _db2 = Db::open(dir.path()).unwrap();
    }

    #[test]
    fn sequential_patient_ids() {
        let (db, _dir) = open_temp_db();
        let ids: Vec<String> = (0..3)
            .map(|i| db.create_patient(&patient(&format!("p{i}"))).unwrap().id)
            .collect();
        assert_eq!(ids, vec!["P001", "P002", "P003"]);

        let d = db.create_doctor(&doctor("Dr. Lin")).unwrap();
        assert_eq!(d.id, "D001");
    }

    #[test]
    fn allocation_continues_past_width() {
        let (db, _dir) = open_temp_db();
        db.insert_patient("P999", &patient("seed"), "-").unwrap();
        let next = db.create_patient(&patient("overflow")).unwrap();
        assert_eq!(next.id, "P1000");
        let after = db.create_patient(&patient("after")).unwrap();
        assert_eq!(after.id, "P1001");
    }

    #[test]
    fn max_is_numeric_not_lexicographic() {
        let (db, _dir) = open_temp_db();
        db.insert_patient("P999", &patient("a"), "-").unwrap();
        db.insert_patient("P1000", &patient("b"), "-").unwrap();
        // "P999" sorts after "P1000" as text.
        assert_eq!(
            db.max_existing_id(EntityKind::Patient).unwrap().as_deref(),
            Some("P1000")
        );
        assert_eq!(db.max_existing_id(EntityKind::Doctor).unwrap(), None);
    }

    #[test]
    fn deleting_the_max_frees_its_id() {
        let (db, _dir) = open_temp_db();
        db.create_patient(&patient("a")).unwrap();
        let b = db.create_patient(&patient("b")).unwrap();
        db.delete_patient(&b.id).unwrap();
        let c = db.create_patient(&patient("c")).unwrap();
        assert_eq!(c.id, "P002");
    }

    #[test]
    fn duplicate_insert_is_conflict() {
        let (db, _dir) = open_temp_db();
        db.insert_doctor("D001", &doctor("first")).unwrap();
        let err = db.insert_doctor("D001", &doctor("second")).unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)), "got {err:?}");
    }

    #[test]
    fn malformed_max_surfaces_invalid_id() {
        let (db, _dir) = open_temp_db();
        db.insert_patient("Pabc", &patient("legacy"), "-").unwrap();
        let err = db.create_patient(&patient("new")).unwrap_err();
        assert!(matches!(err, ClinicError::InvalidId(_)), "got {err:?}");
        assert_eq!(db.status().unwrap().patients, 1);
    }

    #[test]
    fn create_rejects_blank_name() {
        let (db, _dir) = open_temp_db();
        let err = db.create_patient(&patient("   ")).unwrap_err();
        assert!(matches!(err, ClinicError::Validation(_)));
        assert_eq!(db.max_existing_id(EntityKind::Patient).unwrap(), None);
    }

    #[test]
    fn update_patient_fields() {
        let (db, _dir) = open_temp_db();
        let mut params = patient("Chen");
        params.phone = Some("0912".into());
        let p = db.create_patient(&params).unwrap();

        let updated = db
            .update_patient(
                &p.id,
                &UpdatePatientFields {
                    name: Some("Chen Mei".into()),
                    phone: Some(String::new()),
                    notes: Some("snores".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.id, p.id);
        assert_eq!(updated.name, "Chen Mei");
        assert!(updated.phone.is_none());
        assert_eq!(updated.notes.as_deref(), Some("snores"));
        assert_eq!(updated.birth_date, p.birth_date);
        assert!(updated.updated_at >= p.updated_at);
    }

    #[test]
    fn patient_password_is_hashed_and_verifiable() {
        let (db, _dir) = open_temp_db();
        let p = db.create_patient(&patient("Kuo")).unwrap();

        let stored: String = db
            .conn
            .query_row(
                "SELECT password_hash FROM patients WHERE id = ?1",
                [&p.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_ne!(stored, "night-owl");
        assert!(stored.starts_with("$2"));

        assert!(db.verify_patient_password(&p.id, "night-owl").unwrap());
        assert!(!db.verify_patient_password(&p.id, "night-owl ").unwrap());
        assert!(matches!(
            db.verify_patient_password("P404", "x"),
            Err(ClinicError::NotFound(_))
        ));

        let json = serde_json::to_value(&p).unwrap();
        assert!(json.get("password").is_none());
        assert!(json.get("password_hash").is_none());
    }

    #[test]
    fn create_requires_matching_passwords() {
        let (db, _dir) = open_temp_db();
        let mut blank = patient("a");
        blank.password = "  ".into();
        blank.confirm_password = "  ".into();
        assert!(matches!(
            db.create_patient(&blank),
            Err(ClinicError::Validation(_))
        ));

        let mut mismatch = patient("a");
        mismatch.confirm_password = "night-owl2".into();
        assert!(matches!(
            db.create_patient(&mismatch),
            Err(ClinicError::Validation(_))
        ));
        assert_eq!(db.status().unwrap().patients, 0);
    }

    #[test]
    fn update_changes_password_only_when_given() {
        let (db, _dir) = open_temp_db();
        let p = db.create_patient(&patient("Hsu")).unwrap();

        // Empty password leaves the hash alone.
        db.update_patient(
            &p.id,
            &UpdatePatientFields {
                password: Some(String::new()),
                notes: Some("follow-up".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(db.verify_patient_password(&p.id, "night-owl").unwrap());

        let err = db
            .update_patient(
                &p.id,
                &UpdatePatientFields {
                    password: Some("sleepwell".into()),
                    confirm_password: Some("sleepwel".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ClinicError::Validation(_)));

        let err = db
            .update_patient(
                &p.id,
                &UpdatePatientFields {
                    password: Some("   ".into()),
                    confirm_password: Some("   ".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ClinicError::Validation(_)));

        db.update_patient(
            &p.id,
            &UpdatePatientFields {
                password: Some("sleepwell".into()),
                confirm_password: Some("sleepwell".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(db.verify_patient_password(&p.id, "sleepwell").unwrap());
        assert!(!db.verify_patient_password(&p.id, "night-owl").unwrap());
    }

    #[test]
    fn record_times_keep_subsecond_precision() {
        let (db, _dir) = open_temp_db();
        let p = db.create_patient(&patient("a")).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 22, 10, 0).unwrap();

        let mut first = night(&p.id, 1, 1.0);
        first.record_start = base + chrono::Duration::milliseconds(300);
        first.record_end = base + chrono::Duration::hours(7);
        let mut second = night(&p.id, 1, 2.0);
        second.record_start = base + chrono::Duration::milliseconds(700);
        second.record_end = base + chrono::Duration::hours(7);

        let a = db.create_sleep_record(&first).unwrap();
        let b = db.create_sleep_record(&second).unwrap();
        assert_eq!(a.record_start, first.record_start);
        assert_eq!(b.record_start, second.record_start);

        let newest = db.list_sleep_records(Some(&p.id)).unwrap();
        assert_eq!(newest[0].id, b.id);

        let moved = base + chrono::Duration::microseconds(123_456);
        let updated = db
            .update_sleep_record(
                a.id,
                &UpdateSleepRecordFields {
                    record_start: Some(moved),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.record_start, moved);
        assert_eq!(fmt_dt(moved), "2024-05-01T22:10:00.123456Z");
    }

    #[test]
    fn get_nonexistent() {
        let (db, _dir) = open_temp_db();
        assert!(matches!(
            db.get_patient("P404"),
            Err(ClinicError::NotFound(_))
        ));
        assert!(matches!(db.get_doctor("D404"), Err(ClinicError::NotFound(_))));
        assert!(matches!(
            db.get_sleep_record(404),
            Err(ClinicError::NotFound(_))
        ));
        assert!(matches!(
            db.delete_patient("P404"),
            Err(ClinicError::NotFound(_))
        ));
    }

    #[test]
    fn patient_summary_reports_latest_record() {
        let (db, _dir) = open_temp_db();
        let p = db.create_patient(&patient("Wang")).unwrap();
        let q = db.create_patient(&patient("Lee")).unwrap();
        db.create_sleep_record(&night(&p.id, 1, 30.0)).unwrap();
        db.create_sleep_record(&night(&p.id, 8, 12.5)).unwrap();

        let list = db.list_patients().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, p.id);
        assert_eq!(list[0].total_record_count, 2);
        assert_eq!(list[0].latest_ahi, Some(12.5));
        assert_eq!(
            list[0].latest_record_start,
            Some(Utc.with_ymd_and_hms(2024, 3, 8, 22, 0, 0).unwrap())
        );
        assert_eq!(list[1].id, q.id);
        assert_eq!(list[1].total_record_count, 0);
        assert!(list[1].latest_record_start.is_none());
    }

    #[test]
    fn link_and_unlink() {
        let (db, _dir) = open_temp_db();
        let d = db.create_doctor(&doctor("Dr. Huang")).unwrap();
        let p1 = db.create_patient(&patient("a")).unwrap();
        let p2 = db.create_patient(&patient("b")).unwrap();

        let detail = db
            .link_patients(&d.id, &[p1.id.clone(), p2.id.clone(), p1.id.clone()])
            .unwrap();
        let linked: Vec<&str> = detail.patients.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(linked, vec!["P001", "P002"]);

        let err = db.link_patients(&d.id, &[p2.id.clone()]).unwrap_err();
        match err {
            ClinicError::AlreadyLinked { patient_ids, .. } => assert_eq!(patient_ids, vec!["P002"]),
            other => panic!("expected AlreadyLinked, got {other:?}"),
        }

        let list = db.list_doctors().unwrap();
        assert_eq!(list[0].patients.len(), 2);
        assert_eq!(
            list[0].patients[0],
            PatientRef {
                id: "P001".into(),
                name: "a".into()
            }
        );

        let pd = db.get_patient(&p1.id).unwrap();
        assert_eq!(pd.doctors.len(), 1);

        db.unlink_patient(&d.id, &p1.id).unwrap();
        assert!(matches!(
            db.unlink_patient(&d.id, &p1.id),
            Err(ClinicError::NotFound(_))
        ));
        assert_eq!(db.get_doctor(&d.id).unwrap().patients.len(), 1);
    }

    #[test]
    fn link_requires_existing_patients() {
        let (db, _dir) = open_temp_db();
        let d = db.create_doctor(&doctor("Dr. Wu")).unwrap();
        let p = db.create_patient(&patient("a")).unwrap();
        let err = db
            .link_patients(&d.id, &[p.id.clone(), "P404".into()])
            .unwrap_err();
        assert!(matches!(err, ClinicError::NotFound(_)));
        assert!(db.get_doctor(&d.id).unwrap().patients.is_empty());
        assert!(matches!(
            db.link_patients(&d.id, &[]),
            Err(ClinicError::Validation(_))
        ));
    }

    #[test]
    fn delete_patient_cascades() {
        let (db, _dir) = open_temp_db();
        let d = db.create_doctor(&doctor("Dr. Tsai")).unwrap();
        let p = db.create_patient(&patient("a")).unwrap();
        db.link_patients(&d.id, &[p.id.clone()]).unwrap();
        let r = db.create_sleep_record(&night(&p.id, 3, 5.0)).unwrap();
        db.add_attachment(&NewAttachment {
            sleep_record_id: r.id,
            filename: "report.pdf".into(),
            stored_name: "1-report.pdf".into(),
            content_type: "application/pdf".into(),
            category: FileCategory::Pdf,
            size_bytes: 4,
            sha256: "00".into(),
        })
        .unwrap();

        db.delete_patient(&p.id).unwrap();
        let counts = db.status().unwrap();
        assert_eq!(
            counts,
            StatusCounts {
                patients: 0,
                doctors: 1,
                sleep_records: 0,
                files: 0
            }
        );
        assert!(db.get_doctor(&d.id).unwrap().patients.is_empty());
    }

    #[test]
    fn sleep_record_rules() {
        let (db, _dir) = open_temp_db();
        let p = db.create_patient(&patient("a")).unwrap();

        let err = db.create_sleep_record(&night("P404", 1, 1.0)).unwrap_err();
        assert!(matches!(err, ClinicError::NotFound(_)));

        let mut backwards = night(&p.id, 2, 1.0);
        std::mem::swap(&mut backwards.record_start, &mut backwards.record_end);
        assert!(matches!(
            db.create_sleep_record(&backwards),
            Err(ClinicError::Validation(_))
        ));

        db.create_sleep_record(&night(&p.id, 1, 1.0)).unwrap();
        let err = db.create_sleep_record(&night(&p.id, 1, 2.0)).unwrap_err();
        assert!(matches!(err, ClinicError::Conflict(_)), "got {err:?}");
    }

    #[test]
    fn sleep_records_newest_first() {
        let (db, _dir) = open_temp_db();
        let p = db.create_patient(&patient("a")).unwrap();
        let q = db.create_patient(&patient("b")).unwrap();
        db.create_sleep_record(&night(&p.id, 1, 1.0)).unwrap();
        db.create_sleep_record(&night(&p.id, 5, 2.0)).unwrap();
        db.create_sleep_record(&night(&q.id, 3, 3.0)).unwrap();

        let mine = db.list_sleep_records(Some(&p.id)).unwrap();
        let ahis: Vec<f64> = mine.iter().filter_map(|r| r.ahi).collect();
        assert_eq!(ahis, vec![2.0, 1.0]);

        let all = db.list_sleep_records(None).unwrap();
        let ahis: Vec<f64> = all.iter().filter_map(|r| r.ahi).collect();
        assert_eq!(ahis, vec![2.0, 3.0, 1.0]);
    }

    #[test]
    fn update_sleep_record_checks_interval() {
        let (db, _dir) = open_temp_db();
        let p = db.create_patient(&patient("a")).unwrap();
        let r = db.create_sleep_record(&night(&p.id, 1, 1.0)).unwrap();

        let err = db
            .update_sleep_record(
                r.id,
                &UpdateSleepRecordFields {
                    record_end: Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ClinicError::Validation(_)));

        let updated = db
            .update_sleep_record(
                r.id,
                &UpdateSleepRecordFields {
                    metrics: SleepMetrics {
                        odi: Some(9.0),
                        total_sleep_minutes: Some(410),
                        ..Default::default()
                    },
                    notes: Some("CPAP titration".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.ahi, Some(1.0));
        assert_eq!(updated.odi, Some(9.0));
        assert_eq!(updated.total_sleep_minutes, Some(410));
        assert_eq!(updated.notes.as_deref(), Some("CPAP titration"));
    }

    #[test]
    fn attachments_by_category() {
        let (db, _dir) = open_temp_db();
        let p = db.create_patient(&patient("a")).unwrap();
        let r = db.create_sleep_record(&night(&p.id, 1, 1.0)).unwrap();
        for (name, category) in [
            ("a.pdf", FileCategory::Pdf),
            ("1.dcm", FileCategory::Ct),
            ("2.dcm", FileCategory::Ct),
        ] {
            db.add_attachment(&NewAttachment {
                sleep_record_id: r.id,
                filename: name.into(),
                stored_name: name.into(),
                content_type: "application/dicom".into(),
                category,
                size_bytes: 1,
                sha256: "ab".into(),
            })
            .unwrap();
        }

        let ct = db.list_attachments(r.id, Some(FileCategory::Ct)).unwrap();
        let names: Vec<&str> = ct.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["1.dcm", "2.dcm"]);
        assert_eq!(db.list_attachments(r.id, None).unwrap().len(), 3);

        let detail = db.get_sleep_record(r.id).unwrap();
        assert_eq!(detail.files.len(), 3);
        assert_eq!(detail.files[0].filename, "2.dcm");

        let removed = db.delete_sleep_record(r.id).unwrap();
        assert_eq!(removed.id, r.id);
        assert_eq!(db.status().unwrap().files, 0);
    }

    #[test]
    fn attachment_for_missing_record() {
        let (db, _dir) = open_temp_db();
        let err = db
            .add_attachment(&NewAttachment {
                sleep_record_id: 99,
                filename: "x.pdf".into(),
                stored_name: "x.pdf".into(),
                content_type: "application/pdf".into(),
                category: FileCategory::Pdf,
                size_bytes: 1,
                sha256: "ab".into(),
            })
            .unwrap_err();
        assert!(matches!(err, ClinicError::NotFound(_)), "got {err:?}");
    }

    #[test]
    fn attachment_batch_is_all_or_nothing() {
        let (db, _dir) = open_temp_db();
        let p = db.create_patient(&patient("a")).unwrap();
        let r = db.create_sleep_record(&night(&p.id, 1, 1.0)).unwrap();
        let slice = |record: i64, n: usize| NewAttachment {
            sleep_record_id: record,
            filename: format!("slice_{n:03}.dcm"),
            stored_name: format!("slice_{n:03}.dcm"),
            content_type: "application/dicom".into(),
            category: FileCategory::Ct,
            size_bytes: 1,
            sha256: "ab".into(),
        };

        let batch: Vec<_> = (1..=3).map(|n| slice(r.id, n)).collect();
        let added = db.add_attachments(&batch).unwrap();
        assert_eq!(added.len(), 3);
        assert_eq!(added[2].filename, "slice_003.dcm");

        let mut broken: Vec<_> = (4..=5).map(|n| slice(r.id, n)).collect();
        broken.push(slice(99, 6));
        assert!(matches!(
            db.add_attachments(&broken),
            Err(ClinicError::NotFound(_))
        ));
        assert_eq!(db.status().unwrap().files, 3);
    }
}
