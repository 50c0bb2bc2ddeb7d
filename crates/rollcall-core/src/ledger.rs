//! Append-only attendance sessions and the dashboard aggregates derived from them.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::persist;
use crate::types::{IdentitySummary, ScanSummary};

/// Course labels used when a session is recorded without them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseDefaults {
    pub name: String,
    pub code: String,
}

impl Default for CourseDefaults {
    fn default() -> Self {
        Self {
            name: "General attendance".into(),
            code: "GEN-000".into(),
        }
    }
}

/// A scan outcome submitted for recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    #[serde(flatten)]
    pub scan: ScanSummary,
    #[serde(default, alias = "course_name")]
    pub course_name: Option<String>,
    #[serde(default, alias = "course_code")]
    pub course_code: Option<String>,
}

impl NewSession {
    pub fn from_scan(scan: ScanSummary) -> Self {
        Self {
            scan,
            course_name: None,
            course_code: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    /// Local calendar date, `YYYY-MM-DD`.
    pub date: String,
    /// Local wall-clock time, `HH:MM`.
    pub time: String,
    #[serde(alias = "course_name")]
    pub course_name: String,
    #[serde(alias = "course_code")]
    pub course_code: String,
    #[serde(default, alias = "total_detected")]
    pub total_detected: usize,
    #[serde(default, alias = "recognized_count")]
    pub recognized_count: usize,
    #[serde(default, alias = "unknown_count")]
    pub unknown_count: usize,
    #[serde(default)]
    pub students: Vec<IdentitySummary>,
    #[serde(alias = "created_at")]
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_students: usize,
    pub total_sessions_today: usize,
    /// Recognized faces over possible attendances, as a percentage with one decimal.
    pub attendance_rate: f64,
    pub latest_session: Option<SessionRecord>,
}

pub struct SessionLedger {
    path: PathBuf,
    defaults: CourseDefaults,
    writer: Mutex<()>,
}

impl SessionLedger {
    pub fn open(path: impl Into<PathBuf>, defaults: CourseDefaults) -> Result<Self> {
        let path = path.into();
        let sessions: Vec<SessionRecord> = persist::read_json(&path)?;
        tracing::info!(path = %path.display(), sessions = sessions.len(), "session ledger opened");
        Ok(Self {
            path,
            defaults,
            writer: Mutex::new(()),
        })
    }

    pub fn append(&self, session: NewSession) -> Result<SessionRecord> {
        self.append_at(session, Local::now())
    }

    pub fn append_at(&self, session: NewSession, now: DateTime<Local>) -> Result<SessionRecord> {
        let course_name = non_blank(session.course_name).unwrap_or_else(|| self.defaults.name.clone());
        let course_code = non_blank(session.course_code).unwrap_or_else(|| self.defaults.code.clone());
        let scan = session.scan;
        if scan.recognized.len() + scan.unknowns > scan.total_detected {
            return Err(Error::Validation(format!(
                "session counts {} recognized + {} unknown exceed {} detected",
                scan.recognized.len(),
                scan.unknowns,
                scan.total_detected
            )));
        }

        let record = SessionRecord {
            id: session_id(now),
            date: now.format("%Y-%m-%d").to_string(),
            time: now.format("%H:%M").to_string(),
            course_name,
            course_code,
            total_detected: scan.total_detected,
            recognized_count: scan.recognized.len(),
            unknown_count: scan.unknowns,
            students: scan.recognized,
            created_at: now.to_rfc3339(),
        };

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut sessions: Vec<SessionRecord> = persist::read_json(&self.path)?;
        sessions.push(record.clone());
        persist::write_json_atomic(&self.path, &sessions)?;

        tracing::info!(
            id = %record.id,
            course = %record.course_code,
            recognized = record.recognized_count,
            "session recorded"
        );
        Ok(record)
    }

    /// Every recorded session, oldest first.
    pub fn list(&self) -> Result<Vec<SessionRecord>> {
        persist::read_json(&self.path)
    }

    pub fn stats(&self, total_students: usize) -> Result<Stats> {
        self.stats_on(total_students, Local::now().date_naive())
    }

    pub fn stats_on(&self, total_students: usize, today: NaiveDate) -> Result<Stats> {
        let sessions = self.list()?;
        let today = today.format("%Y-%m-%d").to_string();

        let recognized: usize = sessions.iter().map(|s| s.recognized_count).sum();
        let possible = sessions.len() * total_students;
        let attendance_rate = if possible == 0 {
            0.0
        } else {
            (recognized as f64 / possible as f64 * 1000.0).round() / 10.0
        };

        Ok(Stats {
            total_students,
            total_sessions_today: sessions.iter().filter(|s| s.date == today).count(),
            attendance_rate,
            latest_session: sessions.last().cloned(),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `session_<YYYYMMDD_HHMMSS>_<8 hex>`; the random suffix keeps ids unique
/// within one second.
fn session_id(now: DateTime<Local>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("session_{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, 5).single().unwrap()
    }

    fn student(id: &str) -> IdentitySummary {
        IdentitySummary {
            id: id.into(),
            name: format!("Student {id}"),
            photo: None,
        }
    }

    fn scan(recognized: &[&str], unknowns: usize) -> NewSession {
        NewSession::from_scan(ScanSummary {
            total_detected: recognized.len() + unknowns,
            recognized: recognized.iter().map(|id| student(id)).collect(),
            unknowns,
        })
    }

    fn ledger(tmp: &TempDir) -> SessionLedger {
        SessionLedger::open(tmp.path().join("sessions.json"), CourseDefaults::default()).unwrap()
    }

    #[test]
    fn append_fills_record_and_defaults() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp);
        let record = ledger.append_at(scan(&["S001", "S002"], 1), at(2026, 3, 9, 14, 30)).unwrap();

        assert!(record.id.starts_with("session_20260309_143005_"));
        assert_eq!(record.id.len(), "session_20260309_143005_".len() + 8);
        assert_eq!(record.date, "2026-03-09");
        assert_eq!(record.time, "14:30");
        assert_eq!(record.course_name, "General attendance");
        assert_eq!(record.course_code, "GEN-000");
        assert_eq!(record.total_detected, 3);
        assert_eq!(record.recognized_count, 2);
        assert_eq!(record.unknown_count, 1);
        assert_eq!(ledger.list().unwrap(), vec![record]);
    }

    #[test]
    fn explicit_course_overrides_defaults() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp);
        let mut session = scan(&[], 0);
        session.course_name = Some("Interface Homme Machine".into());
        session.course_code = Some("  ".into());

        let record = ledger.append(session).unwrap();
        assert_eq!(record.course_name, "Interface Homme Machine");
        assert_eq!(record.course_code, "GEN-000");
    }

    #[test]
    fn ids_are_unique_within_one_second() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp);
        let now = at(2026, 3, 9, 9, 0);
        let ids: HashSet<_> = (0..20)
            .map(|_| ledger.append_at(scan(&[], 0), now).unwrap().id)
            .collect();
        assert_eq!(ids.len(), 20);
        assert_eq!(ledger.list().unwrap().len(), 20);
    }

    #[test]
    fn inconsistent_counts_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp);
        let mut session = scan(&["S001"], 1);
        session.scan.total_detected = 1;
        assert!(matches!(ledger.append(session), Err(Error::Validation(_))));
        assert!(ledger.list().unwrap().is_empty());
    }

    #[test]
    fn stats_rate_and_today_count() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp);
        ledger.append_at(scan(&["A", "B"], 0), at(2026, 3, 8, 10, 0)).unwrap();
        ledger.append_at(scan(&["A"], 2), at(2026, 3, 9, 10, 0)).unwrap();
        let latest = ledger.append_at(scan(&["A", "B", "C"], 0), at(2026, 3, 9, 11, 0)).unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        let stats = ledger.stats_on(4, today).unwrap();
        // 6 recognized out of 3 sessions × 4 students.
        assert_eq!(stats.attendance_rate, 50.0);
        assert_eq!(stats.total_sessions_today, 2);
        assert_eq!(stats.total_students, 4);
        assert_eq!(stats.latest_session, Some(latest));

        let stats = ledger.stats_on(7, today).unwrap();
        // 6 / 21 = 28.571...
        assert_eq!(stats.attendance_rate, 28.6);
    }

    #[test]
    fn stats_guard_against_zero_denominators() {
        let tmp = TempDir::new().unwrap();
        let ledger = ledger(&tmp);
        let stats = ledger.stats(10).unwrap();
        assert_eq!(stats.attendance_rate, 0.0);
        assert!(stats.latest_session.is_none());

        ledger.append(scan(&[], 2)).unwrap();
        assert_eq!(ledger.stats(0).unwrap().attendance_rate, 0.0);
    }

    #[test]
    fn payload_accepts_camel_and_legacy_keys() {
        let camel: NewSession = serde_json::from_str(
            r#"{"totalDetected":2,"recognized":[{"id":"S001","name":"Ada","photo":null}],
                "unknowns":1,"courseName":"Algebra","courseCode":"MAT-101"}"#,
        )
        .unwrap();
        assert_eq!(camel.scan.total_detected, 2);
        assert_eq!(camel.course_code.as_deref(), Some("MAT-101"));

        let legacy: NewSession = serde_json::from_str(
            r#"{"total_presents":2,"recognized":[{"name":"Ada","matricule":"S001",
                "photo":"images/S001/photo1.jpg"}],"unknowns":1,"course_name":"Algebra"}"#,
        )
        .unwrap();
        assert_eq!(legacy.scan.total_detected, 2);
        assert_eq!(legacy.scan.recognized[0].id, "S001");
        assert_eq!(legacy.course_name.as_deref(), Some("Algebra"));
        assert!(legacy.course_code.is_none());
    }

    #[test]
    fn legacy_session_documents_are_readable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sessions.json");
        std::fs::write(
            &path,
            r#"[{"id":"session_20250110_080000","date":"2025-01-10","time":"08:00",
                 "course_name":"IHM","course_code":"ANI-IA 4057","total_detected":1,
                 "recognized_count":1,"unknown_count":0,
                 "students":[{"name":"Ada","matricule":"S001","photo":"images/S001/photo1.jpg"}],
                 "created_at":"2025-01-10T08:00:00"}]"#,
        )
        .unwrap();

        let ledger = SessionLedger::open(&path, CourseDefaults::default()).unwrap();
        let sessions = ledger.list().unwrap();
        assert_eq!(sessions[0].course_code, "ANI-IA 4057");
        assert_eq!(sessions[0].recognized_count, 1);
        assert_eq!(sessions[0].students[0].id, "S001");

        let json = serde_json::to_value(&sessions[0]).unwrap();
        assert_eq!(json["recognizedCount"], 1);
        assert_eq!(json["courseName"], "IHM");
    }
}
