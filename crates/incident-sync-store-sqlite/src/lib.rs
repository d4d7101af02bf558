use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use incident_sync_core::{
    CodedKey, CorrectionRequest, DescriptionAddendum, Event, EventId, HistoricalQuestion,
    HistoricalResponse, History, InformationSource, Keyed, PrisonerInvolvement, PrisonerOutcome,
    PrisonerRole, Question, Report, ReportBasic, ReportId, ReportStatus, ReportType, Response,
    StaffInvolvement, StaffRole, StatusHistory,
};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS events (
  event_id TEXT PRIMARY KEY,
  event_reference TEXT NOT NULL UNIQUE,
  event_date_and_time TEXT NOT NULL,
  location TEXT NOT NULL,
  title TEXT NOT NULL,
  description TEXT NOT NULL,
  created_at TEXT NOT NULL,
  modified_at TEXT NOT NULL,
  modified_by TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS reports (
  report_id TEXT PRIMARY KEY,
  report_reference TEXT NOT NULL UNIQUE,
  event_id TEXT NOT NULL,
  report_type TEXT NOT NULL,
  status TEXT NOT NULL,
  location TEXT NOT NULL,
  title TEXT NOT NULL,
  description TEXT NOT NULL,
  incident_date_and_time TEXT NOT NULL,
  reported_by TEXT NOT NULL,
  reported_at TEXT NOT NULL,
  created_at TEXT NOT NULL,
  modified_at TEXT NOT NULL,
  modified_by TEXT NOT NULL,
  source TEXT NOT NULL CHECK (source IN ('LEGACY','PRIMARY')),
  modified_in TEXT NOT NULL CHECK (modified_in IN ('LEGACY','PRIMARY')),
  FOREIGN KEY (event_id) REFERENCES events(event_id)
);

CREATE TABLE IF NOT EXISTS status_history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  report_id TEXT NOT NULL,
  status TEXT NOT NULL,
  changed_at TEXT NOT NULL,
  changed_by TEXT NOT NULL,
  FOREIGN KEY (report_id) REFERENCES reports(report_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS staff_involvements (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  report_id TEXT NOT NULL,
  sequence INTEGER NOT NULL CHECK (sequence >= 0),
  staff_username TEXT NOT NULL,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  staff_role TEXT NOT NULL,
  comment TEXT,
  UNIQUE(report_id, sequence),
  FOREIGN KEY (report_id) REFERENCES reports(report_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS prisoner_involvements (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  report_id TEXT NOT NULL,
  sequence INTEGER NOT NULL CHECK (sequence >= 0),
  prisoner_number TEXT NOT NULL,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  prisoner_role TEXT NOT NULL,
  outcome TEXT,
  comment TEXT,
  UNIQUE(report_id, sequence),
  FOREIGN KEY (report_id) REFERENCES reports(report_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS correction_requests (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  report_id TEXT NOT NULL,
  sequence INTEGER NOT NULL CHECK (sequence >= 0),
  description_of_change TEXT NOT NULL,
  correction_requested_by TEXT NOT NULL,
  correction_requested_at TEXT NOT NULL,
  location TEXT,
  UNIQUE(report_id, sequence),
  FOREIGN KEY (report_id) REFERENCES reports(report_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS description_addenda (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  report_id TEXT NOT NULL,
  sequence INTEGER NOT NULL CHECK (sequence >= 0),
  created_by TEXT NOT NULL,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  created_at TEXT NOT NULL,
  text TEXT NOT NULL,
  UNIQUE(report_id, sequence),
  FOREIGN KEY (report_id) REFERENCES reports(report_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS questions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  report_id TEXT NOT NULL,
  code TEXT NOT NULL,
  sequence INTEGER NOT NULL CHECK (sequence >= 0),
  question TEXT NOT NULL,
  additional_information TEXT,
  UNIQUE(report_id, code, sequence),
  FOREIGN KEY (report_id) REFERENCES reports(report_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS responses (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  question_id INTEGER NOT NULL,
  code TEXT NOT NULL,
  sequence INTEGER NOT NULL CHECK (sequence >= 0),
  response TEXT NOT NULL,
  response_date TEXT,
  additional_information TEXT,
  recorded_by TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  UNIQUE(question_id, code, sequence),
  FOREIGN KEY (question_id) REFERENCES questions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS history (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  report_id TEXT NOT NULL,
  report_type TEXT NOT NULL,
  changed_at TEXT NOT NULL,
  changed_by TEXT NOT NULL,
  UNIQUE(report_id, changed_at, report_type),
  FOREIGN KEY (report_id) REFERENCES reports(report_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS historical_questions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  history_id INTEGER NOT NULL,
  code TEXT NOT NULL,
  sequence INTEGER NOT NULL CHECK (sequence >= 0),
  question TEXT NOT NULL,
  additional_information TEXT,
  UNIQUE(history_id, code, sequence),
  FOREIGN KEY (history_id) REFERENCES history(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS historical_responses (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  historical_question_id INTEGER NOT NULL,
  code TEXT NOT NULL,
  sequence INTEGER NOT NULL CHECK (sequence >= 0),
  response TEXT NOT NULL,
  response_date TEXT,
  additional_information TEXT,
  recorded_by TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  UNIQUE(historical_question_id, code, sequence),
  FOREIGN KEY (historical_question_id) REFERENCES historical_questions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS report_reference_sequence (
  value INTEGER PRIMARY KEY AUTOINCREMENT,
  allocated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reports_event_id ON reports(event_id);
CREATE INDEX IF NOT EXISTS idx_reports_status ON reports(status);
CREATE INDEX IF NOT EXISTS idx_status_history_report ON status_history(report_id);
CREATE INDEX IF NOT EXISTS idx_responses_question ON responses(question_id);
CREATE INDEX IF NOT EXISTS idx_historical_questions_history ON historical_questions(history_id);
";

const REPORT_COLUMNS: &str = "report_id, report_reference, event_id, report_type, status,
    location, title, description, incident_date_and_time, reported_by, reported_at,
    created_at, modified_at, modified_by, source, modified_in";

const EVENT_COLUMNS: &str = "event_id, event_reference, event_date_and_time, location, title,
    description, created_at, modified_at, modified_by";

pub struct SqliteStore {
    conn: Connection,
}

/// One `IMMEDIATE` write transaction. Dropping it without [`ReportTransaction::commit`]
/// rolls everything back.
pub struct ReportTransaction<'conn> {
    tx: Transaction<'conn>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Optional equality filters for [`SqliteStore::list_reports`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportFilter {
    #[serde(default)]
    pub status: Option<ReportStatus>,
    #[serde(default, rename = "type")]
    pub report_type: Option<ReportType>,
    #[serde(default)]
    pub location: Option<String>,
}

impl SqliteStore {
    /// Open a SQLite-backed incident store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version == 0 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::info!(version = 1, "applied schema migration");
        } else if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Start an `IMMEDIATE` transaction, taking the database write lock up front.
    ///
    /// # Errors
    /// Returns an error when the write lock cannot be acquired within the busy timeout.
    pub fn begin(&mut self) -> Result<ReportTransaction<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start write transaction")?;
        Ok(ReportTransaction { tx })
    }

    /// Load a report with every owned collection.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_report(&self, id: ReportId) -> Result<Option<Report>> {
        read_report(&self.conn, id)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find_report_id(&self, reference: &str) -> Result<Option<ReportId>> {
        read_report_id(&self.conn, reference)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_event(&self, id: EventId) -> Result<Option<Event>> {
        read_event(&self.conn, id)
    }

    /// List scalar views of every report matching `filter`, ordered by reference.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_reports(&self, filter: &ReportFilter) -> Result<Vec<ReportBasic>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REPORT_COLUMNS} FROM reports
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR report_type = ?2)
               AND (?3 IS NULL OR location = ?3)
             ORDER BY report_reference ASC"
        ))?;
        let mut rows = stmt.query(params![
            filter.status.map(ReportStatus::as_str),
            filter.report_type.map(ReportType::as_str),
            filter.location,
        ])?;

        let mut reports = Vec::new();
        while let Some(row) = rows.next()? {
            reports.push(report_from_row(row)?.to_basic());
        }
        Ok(reports)
    }
}

impl ReportTransaction<'_> {
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_report(&self, id: ReportId) -> Result<Option<Report>> {
        read_report(&self.tx, id)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find_report_id(&self, reference: &str) -> Result<Option<ReportId>> {
        read_report_id(&self.tx, reference)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn load_event(&self, id: EventId) -> Result<Option<Event>> {
        read_event(&self.tx, id)
    }

    /// # Errors
    /// Returns an error when the insert fails, including a duplicate event reference.
    pub fn insert_event(&self, event: &Event) -> Result<()> {
        self.tx
            .execute(
                &format!(
                    "INSERT INTO events({EVENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    event.id.to_string(),
                    event.event_reference,
                    rfc3339(event.event_date_and_time)?,
                    event.location,
                    event.title,
                    event.description,
                    rfc3339(event.created_at)?,
                    rfc3339(event.modified_at)?,
                    event.modified_by,
                ],
            )
            .context("failed to insert event")?;
        Ok(())
    }

    /// Overwrite the mutable fields of an event. The reference never changes.
    ///
    /// # Errors
    /// Returns an error when the update fails or the event does not exist.
    pub fn save_event(&self, event: &Event) -> Result<()> {
        let updated = self
            .tx
            .execute(
                "UPDATE events SET event_date_and_time = ?2, location = ?3, title = ?4,
                    description = ?5, modified_at = ?6, modified_by = ?7
                 WHERE event_id = ?1",
                params![
                    event.id.to_string(),
                    rfc3339(event.event_date_and_time)?,
                    event.location,
                    event.title,
                    event.description,
                    rfc3339(event.modified_at)?,
                    event.modified_by,
                ],
            )
            .context("failed to update event")?;
        if updated == 0 {
            return Err(anyhow!("event {} does not exist", event.id));
        }
        Ok(())
    }

    /// Delete an event that no report links to any more. Returns whether it was deleted.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_event_if_orphaned(&self, id: EventId) -> Result<bool> {
        let deleted = self
            .tx
            .execute(
                "DELETE FROM events
                 WHERE event_id = ?1
                   AND NOT EXISTS (SELECT 1 FROM reports WHERE event_id = ?1)",
                params![id.to_string()],
            )
            .context("failed to delete orphaned event")?;
        Ok(deleted > 0)
    }

    /// Insert a new report and all of its collections.
    ///
    /// # Errors
    /// Returns an error when any write fails; a duplicate reference surfaces as a unique
    /// constraint violation (see [`is_unique_violation`]).
    pub fn insert_report(&self, report: &Report) -> Result<()> {
        self.tx
            .execute(
                &format!(
                    "INSERT INTO reports({REPORT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    report.id.to_string(),
                    report.reference,
                    report.event_id.to_string(),
                    report.report_type.as_str(),
                    report.status.as_str(),
                    report.location,
                    report.title,
                    report.description,
                    rfc3339(report.incident_date_and_time)?,
                    report.reported_by,
                    rfc3339(report.reported_at)?,
                    rfc3339(report.created_at)?,
                    rfc3339(report.modified_at)?,
                    report.modified_by,
                    report.source.as_str(),
                    report.modified_in.as_str(),
                ],
            )
            .context("failed to insert report")?;
        self.write_collections(report)
    }

    /// Persist the current state of an existing report.
    ///
    /// Child rows are matched by natural key: surviving rows are updated in place, missing
    /// ones deleted, new ones inserted. Status and type history are append-only.
    ///
    /// # Errors
    /// Returns an error when the report does not exist or any write fails.
    pub fn save_report(&self, report: &Report) -> Result<()> {
        let updated = self
            .tx
            .execute(
                "UPDATE reports SET event_id = ?2, report_type = ?3, status = ?4, location = ?5,
                    title = ?6, description = ?7, incident_date_and_time = ?8, reported_by = ?9,
                    reported_at = ?10, modified_at = ?11, modified_by = ?12, modified_in = ?13
                 WHERE report_id = ?1",
                params![
                    report.id.to_string(),
                    report.event_id.to_string(),
                    report.report_type.as_str(),
                    report.status.as_str(),
                    report.location,
                    report.title,
                    report.description,
                    rfc3339(report.incident_date_and_time)?,
                    report.reported_by,
                    rfc3339(report.reported_at)?,
                    rfc3339(report.modified_at)?,
                    report.modified_by,
                    report.modified_in.as_str(),
                ],
            )
            .context("failed to update report")?;
        if updated == 0 {
            return Err(anyhow!("report {} does not exist", report.id));
        }
        self.write_collections(report)
    }

    /// Delete a report and, through cascades, everything it owns.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_report(&self, id: ReportId) -> Result<bool> {
        let deleted = self
            .tx
            .execute("DELETE FROM reports WHERE report_id = ?1", params![id.to_string()])
            .context("failed to delete report")?;
        Ok(deleted > 0)
    }

    /// Draw the next value from the report reference sequence.
    ///
    /// # Errors
    /// Returns an error when the sequence row cannot be inserted.
    pub fn next_reference_number(&self) -> Result<i64> {
        self.tx
            .execute(
                "INSERT INTO report_reference_sequence(allocated_at) VALUES (?1)",
                params![now_rfc3339()?],
            )
            .context("failed to allocate report reference")?;
        Ok(self.tx.last_insert_rowid())
    }

    /// # Errors
    /// Returns an error when the commit fails.
    pub fn commit(self) -> Result<()> {
        self.tx.commit().context("failed to commit write transaction")
    }

    fn write_collections(&self, report: &Report) -> Result<()> {
        let report_id = report.id.to_string();
        self.append_status_history(&report_id, &report.status_history)?;
        self.write_staff(&report_id, &report.staff_involved)?;
        self.write_prisoners(&report_id, &report.prisoners_involved)?;
        self.write_corrections(&report_id, &report.correction_requests)?;
        self.write_addenda(&report_id, &report.description_addenda)?;
        self.write_questions(&report_id, &report.questions)?;
        self.append_history(&report_id, &report.history)
    }

    fn append_status_history(&self, report_id: &str, entries: &[StatusHistory]) -> Result<()> {
        let stored: i64 = self
            .tx
            .query_row(
                "SELECT COUNT(*) FROM status_history WHERE report_id = ?1",
                params![report_id],
                |row| row.get(0),
            )
            .context("failed to count status history")?;
        let stored = usize::try_from(stored).context("negative status history count")?;

        for entry in entries.iter().skip(stored) {
            self.tx
                .execute(
                    "INSERT INTO status_history(report_id, status, changed_at, changed_by)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        report_id,
                        entry.status.as_str(),
                        rfc3339(entry.changed_at)?,
                        entry.changed_by
                    ],
                )
                .context("failed to append status history")?;
        }
        Ok(())
    }

    fn write_staff(&self, report_id: &str, staff: &[StaffInvolvement]) -> Result<()> {
        for member in staff {
            self.tx
                .execute(
                    "INSERT INTO staff_involvements(
                        report_id, sequence, staff_username, first_name, last_name, staff_role, comment
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(report_id, sequence) DO UPDATE SET
                        staff_username = excluded.staff_username,
                        first_name = excluded.first_name,
                        last_name = excluded.last_name,
                        staff_role = excluded.staff_role,
                        comment = excluded.comment",
                    params![
                        report_id,
                        member.sequence,
                        member.staff_username,
                        member.first_name,
                        member.last_name,
                        member.staff_role.as_str(),
                        member.comment,
                    ],
                )
                .context("failed to write staff involvement")?;
        }
        self.delete_missing_sequences(
            "staff_involvements",
            report_id,
            staff.iter().map(|member| member.sequence),
        )
    }

    fn write_prisoners(&self, report_id: &str, prisoners: &[PrisonerInvolvement]) -> Result<()> {
        for prisoner in prisoners {
            self.tx
                .execute(
                    "INSERT INTO prisoner_involvements(
                        report_id, sequence, prisoner_number, first_name, last_name,
                        prisoner_role, outcome, comment
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(report_id, sequence) DO UPDATE SET
                        prisoner_number = excluded.prisoner_number,
                        first_name = excluded.first_name,
                        last_name = excluded.last_name,
                        prisoner_role = excluded.prisoner_role,
                        outcome = excluded.outcome,
                        comment = excluded.comment",
                    params![
                        report_id,
                        prisoner.sequence,
                        prisoner.prisoner_number,
                        prisoner.first_name,
                        prisoner.last_name,
                        prisoner.prisoner_role.as_str(),
                        prisoner.outcome.map(PrisonerOutcome::as_str),
                        prisoner.comment,
                    ],
                )
                .context("failed to write prisoner involvement")?;
        }
        self.delete_missing_sequences(
            "prisoner_involvements",
            report_id,
            prisoners.iter().map(|prisoner| prisoner.sequence),
        )
    }

    fn write_corrections(&self, report_id: &str, corrections: &[CorrectionRequest]) -> Result<()> {
        for correction in corrections {
            self.tx
                .execute(
                    "INSERT INTO correction_requests(
                        report_id, sequence, description_of_change, correction_requested_by,
                        correction_requested_at, location
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(report_id, sequence) DO UPDATE SET
                        description_of_change = excluded.description_of_change,
                        correction_requested_by = excluded.correction_requested_by,
                        correction_requested_at = excluded.correction_requested_at,
                        location = excluded.location",
                    params![
                        report_id,
                        correction.sequence,
                        correction.description_of_change,
                        correction.correction_requested_by,
                        rfc3339(correction.correction_requested_at)?,
                        correction.location,
                    ],
                )
                .context("failed to write correction request")?;
        }
        self.delete_missing_sequences(
            "correction_requests",
            report_id,
            corrections.iter().map(|correction| correction.sequence),
        )
    }

    fn write_addenda(&self, report_id: &str, addenda: &[DescriptionAddendum]) -> Result<()> {
        for addendum in addenda {
            self.tx
                .execute(
                    "INSERT INTO description_addenda(
                        report_id, sequence, created_by, first_name, last_name, created_at, text
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(report_id, sequence) DO UPDATE SET
                        created_by = excluded.created_by,
                        first_name = excluded.first_name,
                        last_name = excluded.last_name,
                        created_at = excluded.created_at,
                        text = excluded.text",
                    params![
                        report_id,
                        addendum.sequence,
                        addendum.created_by,
                        addendum.first_name,
                        addendum.last_name,
                        rfc3339(addendum.created_at)?,
                        addendum.text,
                    ],
                )
                .context("failed to write description addendum")?;
        }
        self.delete_missing_sequences(
            "description_addenda",
            report_id,
            addenda.iter().map(|addendum| addendum.sequence),
        )
    }

    fn delete_missing_sequences(
        &self,
        table: &'static str,
        report_id: &str,
        keep: impl Iterator<Item = u32>,
    ) -> Result<()> {
        let keep = keep.collect::<BTreeSet<_>>();
        let stored = {
            let mut stmt =
                self.tx.prepare(&format!("SELECT sequence FROM {table} WHERE report_id = ?1"))?;
            let rows = stmt.query_map(params![report_id], |row| row.get::<_, u32>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        for sequence in stored.into_iter().filter(|sequence| !keep.contains(sequence)) {
            self.tx
                .execute(
                    &format!("DELETE FROM {table} WHERE report_id = ?1 AND sequence = ?2"),
                    params![report_id, sequence],
                )
                .with_context(|| format!("failed to delete stale row from {table}"))?;
        }
        Ok(())
    }

    fn write_questions(&self, report_id: &str, questions: &[Question]) -> Result<()> {
        for question in questions {
            let question_id: i64 = self
                .tx
                .query_row(
                    "INSERT INTO questions(report_id, code, sequence, question, additional_information)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(report_id, code, sequence) DO UPDATE SET
                        question = excluded.question,
                        additional_information = excluded.additional_information
                     RETURNING id",
                    params![
                        report_id,
                        question.code,
                        question.sequence,
                        question.question,
                        question.additional_information,
                    ],
                    |row| row.get(0),
                )
                .context("failed to write question")?;
            self.write_responses(question_id, &question.responses)?;
        }

        let keep = questions.iter().map(Keyed::key).collect::<BTreeSet<_>>();
        let stored = {
            let mut stmt =
                self.tx.prepare("SELECT id, code, sequence FROM questions WHERE report_id = ?1")?;
            let rows = stmt.query_map(params![report_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, u32>(2)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for (id, code, sequence) in stored {
            if !keep.contains(&CodedKey { sequence, code }) {
                self.tx
                    .execute("DELETE FROM questions WHERE id = ?1", params![id])
                    .context("failed to delete stale question")?;
            }
        }
        Ok(())
    }

    fn write_responses(&self, question_id: i64, responses: &[Response]) -> Result<()> {
        for response in responses {
            self.tx
                .execute(
                    "INSERT INTO responses(
                        question_id, code, sequence, response, response_date,
                        additional_information, recorded_by, recorded_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(question_id, code, sequence) DO UPDATE SET
                        response = excluded.response,
                        response_date = excluded.response_date,
                        additional_information = excluded.additional_information,
                        recorded_by = excluded.recorded_by,
                        recorded_at = excluded.recorded_at",
                    params![
                        question_id,
                        response.code,
                        response.sequence,
                        response.response,
                        response.response_date.map(rfc3339).transpose()?,
                        response.additional_information,
                        response.recorded_by,
                        rfc3339(response.recorded_at)?,
                    ],
                )
                .context("failed to write response")?;
        }

        let keep = responses.iter().map(Keyed::key).collect::<BTreeSet<_>>();
        let stored = {
            let mut stmt =
                self.tx.prepare("SELECT id, code, sequence FROM responses WHERE question_id = ?1")?;
            let rows = stmt.query_map(params![question_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, u32>(2)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for (id, code, sequence) in stored {
            if !keep.contains(&CodedKey { sequence, code }) {
                self.tx
                    .execute("DELETE FROM responses WHERE id = ?1", params![id])
                    .context("failed to delete stale response")?;
            }
        }
        Ok(())
    }

    fn append_history(&self, report_id: &str, history: &[History]) -> Result<()> {
        for entry in history {
            let changed_at = rfc3339(entry.changed_at)?;
            self.tx
                .execute(
                    "INSERT INTO history(report_id, report_type, changed_at, changed_by)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(report_id, changed_at, report_type) DO NOTHING",
                    params![report_id, entry.report_type.as_str(), changed_at, entry.changed_by],
                )
                .context("failed to write history entry")?;
            let history_id: i64 = self
                .tx
                .query_row(
                    "SELECT id FROM history
                     WHERE report_id = ?1 AND changed_at = ?2 AND report_type = ?3",
                    params![report_id, changed_at, entry.report_type.as_str()],
                    |row| row.get(0),
                )
                .context("failed to locate history entry")?;

            for question in &entry.questions {
                self.append_historical_question(history_id, question)?;
            }
        }
        Ok(())
    }

    fn append_historical_question(
        &self,
        history_id: i64,
        question: &HistoricalQuestion,
    ) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO historical_questions(
                    history_id, code, sequence, question, additional_information
                 ) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(history_id, code, sequence) DO NOTHING",
                params![
                    history_id,
                    question.code,
                    question.sequence,
                    question.question,
                    question.additional_information,
                ],
            )
            .context("failed to write historical question")?;
        let question_id: i64 = self
            .tx
            .query_row(
                "SELECT id FROM historical_questions
                 WHERE history_id = ?1 AND code = ?2 AND sequence = ?3",
                params![history_id, question.code, question.sequence],
                |row| row.get(0),
            )
            .context("failed to locate historical question")?;

        for response in &question.responses {
            self.tx
                .execute(
                    "INSERT INTO historical_responses(
                        historical_question_id, code, sequence, response, response_date,
                        additional_information, recorded_by, recorded_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(historical_question_id, code, sequence) DO NOTHING",
                    params![
                        question_id,
                        response.code,
                        response.sequence,
                        response.response,
                        response.response_date.map(rfc3339).transpose()?,
                        response.additional_information,
                        response.recorded_by,
                        rfc3339(response.recorded_at)?,
                    ],
                )
                .context("failed to write historical response")?;
        }
        Ok(())
    }
}

/// Whether `err` was caused by a `UNIQUE` or `PRIMARY KEY` constraint violation.
#[must_use]
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        )
    })
}

fn read_report_id(conn: &Connection, reference: &str) -> Result<Option<ReportId>> {
    let raw = conn
        .query_row(
            "SELECT report_id FROM reports WHERE report_reference = ?1",
            params![reference],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("failed to look up report by reference")?;
    raw.map(|raw| parse_ulid(&raw).map(ReportId)).transpose()
}

fn read_report(conn: &Connection, id: ReportId) -> Result<Option<Report>> {
    let report_id = id.to_string();
    let mut stmt =
        conn.prepare(&format!("SELECT {REPORT_COLUMNS} FROM reports WHERE report_id = ?1"))?;
    let mut rows = stmt.query(params![report_id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let mut report = report_from_row(row)?;

    report.status_history = read_status_history(conn, &report_id)?;
    report.staff_involved = read_staff(conn, &report_id)?;
    report.prisoners_involved = read_prisoners(conn, &report_id)?;
    report.correction_requests = read_corrections(conn, &report_id)?;
    report.description_addenda = read_addenda(conn, &report_id)?;
    report.questions = read_questions(conn, &report_id)?;
    report.history = read_history(conn, &report_id)?;
    Ok(Some(report))
}

fn report_from_row(row: &Row<'_>) -> Result<Report> {
    Ok(Report {
        id: ReportId(parse_ulid(&row.get::<_, String>(0)?)?),
        reference: row.get(1)?,
        event_id: EventId(parse_ulid(&row.get::<_, String>(2)?)?),
        report_type: decode(&row.get::<_, String>(3)?, ReportType::parse, "report_type")?,
        status: decode(&row.get::<_, String>(4)?, ReportStatus::parse, "status")?,
        location: row.get(5)?,
        title: row.get(6)?,
        description: row.get(7)?,
        incident_date_and_time: parse_rfc3339(&row.get::<_, String>(8)?)?,
        reported_by: row.get(9)?,
        reported_at: parse_rfc3339(&row.get::<_, String>(10)?)?,
        created_at: parse_rfc3339(&row.get::<_, String>(11)?)?,
        modified_at: parse_rfc3339(&row.get::<_, String>(12)?)?,
        modified_by: row.get(13)?,
        source: decode(&row.get::<_, String>(14)?, InformationSource::parse, "source")?,
        modified_in: decode(&row.get::<_, String>(15)?, InformationSource::parse, "modified_in")?,
        status_history: Vec::new(),
        staff_involved: Vec::new(),
        prisoners_involved: Vec::new(),
        correction_requests: Vec::new(),
        description_addenda: Vec::new(),
        questions: Vec::new(),
        history: Vec::new(),
    })
}

fn read_event(conn: &Connection, id: EventId) -> Result<Option<Event>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1"))?;
    let mut rows = stmt.query(params![id.to_string()])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    Ok(Some(Event {
        id: EventId(parse_ulid(&row.get::<_, String>(0)?)?),
        event_reference: row.get(1)?,
        event_date_and_time: parse_rfc3339(&row.get::<_, String>(2)?)?,
        location: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        created_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        modified_at: parse_rfc3339(&row.get::<_, String>(7)?)?,
        modified_by: row.get(8)?,
    }))
}

fn read_status_history(conn: &Connection, report_id: &str) -> Result<Vec<StatusHistory>> {
    let mut stmt = conn.prepare(
        "SELECT status, changed_at, changed_by FROM status_history
         WHERE report_id = ?1 ORDER BY id ASC",
    )?;
    let mut rows = stmt.query(params![report_id])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(StatusHistory {
            status: decode(&row.get::<_, String>(0)?, ReportStatus::parse, "status")?,
            changed_at: parse_rfc3339(&row.get::<_, String>(1)?)?,
            changed_by: row.get(2)?,
        });
    }
    Ok(entries)
}

fn read_staff(conn: &Connection, report_id: &str) -> Result<Vec<StaffInvolvement>> {
    let mut stmt = conn.prepare(
        "SELECT sequence, staff_username, first_name, last_name, staff_role, comment
         FROM staff_involvements WHERE report_id = ?1 ORDER BY sequence ASC",
    )?;
    let mut rows = stmt.query(params![report_id])?;
    let mut staff = Vec::new();
    while let Some(row) = rows.next()? {
        staff.push(StaffInvolvement {
            sequence: row.get(0)?,
            staff_username: row.get(1)?,
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            staff_role: decode(&row.get::<_, String>(4)?, StaffRole::parse, "staff_role")?,
            comment: row.get(5)?,
        });
    }
    Ok(staff)
}

fn read_prisoners(conn: &Connection, report_id: &str) -> Result<Vec<PrisonerInvolvement>> {
    let mut stmt = conn.prepare(
        "SELECT sequence, prisoner_number, first_name, last_name, prisoner_role, outcome, comment
         FROM prisoner_involvements WHERE report_id = ?1 ORDER BY sequence ASC",
    )?;
    let mut rows = stmt.query(params![report_id])?;
    let mut prisoners = Vec::new();
    while let Some(row) = rows.next()? {
        let outcome = row
            .get::<_, Option<String>>(5)?
            .map(|raw| decode(&raw, PrisonerOutcome::parse, "outcome"))
            .transpose()?;
        prisoners.push(PrisonerInvolvement {
            sequence: row.get(0)?,
            prisoner_number: row.get(1)?,
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            prisoner_role: decode(&row.get::<_, String>(4)?, PrisonerRole::parse, "prisoner_role")?,
            outcome,
            comment: row.get(6)?,
        });
    }
    Ok(prisoners)
}

fn read_corrections(conn: &Connection, report_id: &str) -> Result<Vec<CorrectionRequest>> {
    let mut stmt = conn.prepare(
        "SELECT sequence, description_of_change, correction_requested_by,
                correction_requested_at, location
         FROM correction_requests WHERE report_id = ?1 ORDER BY sequence ASC",
    )?;
    let mut rows = stmt.query(params![report_id])?;
    let mut corrections = Vec::new();
    while let Some(row) = rows.next()? {
        corrections.push(CorrectionRequest {
            sequence: row.get(0)?,
            description_of_change: row.get(1)?,
            correction_requested_by: row.get(2)?,
            correction_requested_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
            location: row.get(4)?,
        });
    }
    Ok(corrections)
}

fn read_addenda(conn: &Connection, report_id: &str) -> Result<Vec<DescriptionAddendum>> {
    let mut stmt = conn.prepare(
        "SELECT sequence, created_by, first_name, last_name, created_at, text
         FROM description_addenda WHERE report_id = ?1 ORDER BY sequence ASC",
    )?;
    let mut rows = stmt.query(params![report_id])?;
    let mut addenda = Vec::new();
    while let Some(row) = rows.next()? {
        addenda.push(DescriptionAddendum {
            sequence: row.get(0)?,
            created_by: row.get(1)?,
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            created_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
            text: row.get(5)?,
        });
    }
    Ok(addenda)
}

fn read_questions(conn: &Connection, report_id: &str) -> Result<Vec<Question>> {
    let mut stmt = conn.prepare(
        "SELECT id, code, sequence, question, additional_information
         FROM questions WHERE report_id = ?1 ORDER BY sequence ASC, code ASC",
    )?;
    let mut rows = stmt.query(params![report_id])?;
    let mut questions = Vec::new();
    while let Some(row) = rows.next()? {
        let question_id: i64 = row.get(0)?;
        questions.push(Question {
            code: row.get(1)?,
            sequence: row.get(2)?,
            question: row.get(3)?,
            additional_information: row.get(4)?,
            responses: read_responses(conn, "responses", "question_id", question_id)?,
        });
    }
    Ok(questions)
}

fn read_responses(
    conn: &Connection,
    table: &'static str,
    parent_column: &'static str,
    parent_id: i64,
) -> Result<Vec<Response>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT code, sequence, response, response_date, additional_information,
                recorded_by, recorded_at
         FROM {table} WHERE {parent_column} = ?1 ORDER BY sequence ASC, code ASC"
    ))?;
    let mut rows = stmt.query(params![parent_id])?;
    let mut responses = Vec::new();
    while let Some(row) = rows.next()? {
        responses.push(Response {
            code: row.get(0)?,
            sequence: row.get(1)?,
            response: row.get(2)?,
            response_date: row
                .get::<_, Option<String>>(3)?
                .map(|raw| parse_rfc3339(&raw))
                .transpose()?,
            additional_information: row.get(4)?,
            recorded_by: row.get(5)?,
            recorded_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        });
    }
    Ok(responses)
}

fn read_history(conn: &Connection, report_id: &str) -> Result<Vec<History>> {
    let mut stmt = conn.prepare(
        "SELECT id, report_type, changed_at, changed_by FROM history WHERE report_id = ?1",
    )?;
    let mut rows = stmt.query(params![report_id])?;
    let mut history = Vec::new();
    while let Some(row) = rows.next()? {
        let history_id: i64 = row.get(0)?;
        history.push(History {
            report_type: decode(&row.get::<_, String>(1)?, ReportType::parse, "report_type")?,
            changed_at: parse_rfc3339(&row.get::<_, String>(2)?)?,
            changed_by: row.get(3)?,
            questions: read_historical_questions(conn, history_id)?,
        });
    }
    // Text timestamps do not sort chronologically once fractional seconds vary.
    history.sort_by_cached_key(Keyed::key);
    Ok(history)
}

fn read_historical_questions(conn: &Connection, history_id: i64) -> Result<Vec<HistoricalQuestion>> {
    let mut stmt = conn.prepare(
        "SELECT id, code, sequence, question, additional_information
         FROM historical_questions WHERE history_id = ?1 ORDER BY sequence ASC, code ASC",
    )?;
    let mut rows = stmt.query(params![history_id])?;
    let mut questions = Vec::new();
    while let Some(row) = rows.next()? {
        let question_id: i64 = row.get(0)?;
        let responses =
            read_responses(conn, "historical_responses", "historical_question_id", question_id)?;
        questions.push(HistoricalQuestion {
            code: row.get(1)?,
            sequence: row.get(2)?,
            question: row.get(3)?,
            additional_information: row.get(4)?,
            responses: responses.iter().map(HistoricalResponse::from).collect(),
        });
    }
    Ok(questions)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn decode<T>(raw: &str, parse: impl Fn(&str) -> Option<T>, column: &str) -> Result<T> {
    parse(raw).ok_or_else(|| anyhow!("unknown {column}: {raw}"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

/// Timestamps are stored in UTC so equal instants always produce equal key text.
fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value.to_offset(UtcOffset::UTC).format(&Rfc3339).context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}
