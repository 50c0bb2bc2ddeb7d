use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rollcall_core::{
    Deadline, EnrollmentRequest, IdentityStore, NewSession, SessionLedger, Upload,
};
use serde_json::{json, Value};
use thiserror::Error;
use zbus::interface;

use crate::engine::{EngineError, EngineHandle};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// Reports whether the face models are loaded, without forcing a load.
pub type ModelProbe = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] rollcall_core::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid session payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<ServiceError> for zbus::fdo::Error {
    fn from(err: ServiceError) -> Self {
        use rollcall_core::Error as Core;
        use zbus::fdo::Error as Fdo;

        let message = err.to_string();
        let core = match err {
            ServiceError::Core(core) | ServiceError::Engine(EngineError::Core(core)) => core,
            ServiceError::Read { source, .. } => {
                return match source.kind() {
                    std::io::ErrorKind::NotFound => Fdo::FileNotFound(message),
                    std::io::ErrorKind::PermissionDenied => Fdo::AccessDenied(message),
                    _ => Fdo::Failed(message),
                };
            }
            ServiceError::Payload(_) => return Fdo::InvalidArgs(message),
            ServiceError::Engine(_) | ServiceError::Join(_) => return Fdo::Failed(message),
        };

        match core {
            Core::NotFound(_) => Fdo::FileNotFound(message),
            Core::DeadlineExceeded => Fdo::TimedOut(message),
            err if err.is_client_error() => Fdo::InvalidArgs(message),
            _ => Fdo::Failed(message),
        }
    }
}

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Every method answers with a JSON document.
pub struct AttendanceService {
    engine: EngineHandle,
    store: Arc<IdentityStore>,
    ledger: Arc<SessionLedger>,
    models_loaded: ModelProbe,
    request_timeout: Duration,
    max_upload_bytes: usize,
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll a student from photos already on disk.
    async fn register(
        &self,
        name: &str,
        id: &str,
        photo_paths: Vec<String>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(id, photos = photo_paths.len(), "register requested");
        Ok(self.do_register(name, id, &photo_paths).await?.to_string())
    }

    /// Match every face of a classroom photo against the registry.
    async fn scan(&self, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, "scan requested");
        Ok(self.do_scan(image_path).await?.to_string())
    }

    async fn list_students(&self) -> zbus::fdo::Result<String> {
        Ok(self.students().to_string())
    }

    async fn remove_student(&self, id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(id, "remove requested");
        Ok(self.do_remove(id).await?.to_string())
    }

    async fn list_sessions(&self) -> zbus::fdo::Result<String> {
        Ok(self.sessions().await?.to_string())
    }

    /// Record a scan outcome, optionally labelled with a course.
    async fn create_session(&self, payload_json: &str) -> zbus::fdo::Result<String> {
        Ok(self.do_create_session(payload_json).await?.to_string())
    }

    async fn stats(&self) -> zbus::fdo::Result<String> {
        Ok(self.do_stats().await?.to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.status_report().to_string())
    }
}

impl AttendanceService {
    pub fn new(
        engine: EngineHandle,
        store: Arc<IdentityStore>,
        ledger: Arc<SessionLedger>,
        models_loaded: ModelProbe,
        request_timeout: Duration,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            engine,
            store,
            ledger,
            models_loaded,
            request_timeout,
            max_upload_bytes,
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.request_timeout)
    }

    async fn do_register(
        &self,
        name: &str,
        id: &str,
        photo_paths: &[String],
    ) -> Result<Value, ServiceError> {
        let deadline = self.deadline();
        let photos = self.read_uploads(photo_paths).await?;
        let identity = self
            .engine
            .enroll(
                EnrollmentRequest {
                    id: id.to_string(),
                    name: name.to_string(),
                    photos,
                },
                deadline,
            )
            .await?;
        Ok(json!({ "success": true, "id": identity.id }))
    }

    async fn do_scan(&self, image_path: &str) -> Result<Value, ServiceError> {
        let deadline = self.deadline();
        let mut uploads = self.read_uploads(&[image_path.to_string()]).await?;
        let image = uploads.remove(0);
        let report = self.engine.scan(image, deadline).await?;
        Ok(serde_json::to_value(report.summary())?)
    }

    fn students(&self) -> Value {
        let snapshot = self.store.list();
        let students: Vec<Value> = snapshot
            .iter()
            .map(|identity| {
                json!({
                    "name": identity.name,
                    "id": identity.id,
                    "photo": identity.representative_photo(),
                    "registeredAt": identity.registered_at,
                })
            })
            .collect();
        json!({ "total": students.len(), "students": students })
    }

    async fn do_remove(&self, id: &str) -> Result<Value, ServiceError> {
        let store = self.store.clone();
        let target = id.to_string();
        let removed = tokio::task::spawn_blocking(move || store.remove(&target)).await??;
        match removed {
            Some(identity) => Ok(json!({ "success": true, "id": identity.id })),
            None => Err(rollcall_core::Error::NotFound(id.to_string()).into()),
        }
    }

    async fn sessions(&self) -> Result<Value, ServiceError> {
        let ledger = self.ledger.clone();
        let sessions = tokio::task::spawn_blocking(move || ledger.list()).await??;
        Ok(json!({ "total": sessions.len(), "sessions": sessions }))
    }

    async fn do_create_session(&self, payload_json: &str) -> Result<Value, ServiceError> {
        let session: NewSession = serde_json::from_str(payload_json)?;
        let ledger = self.ledger.clone();
        let record = tokio::task::spawn_blocking(move || ledger.append(session)).await??;
        Ok(json!({ "success": true, "session": record }))
    }

    async fn do_stats(&self) -> Result<Value, ServiceError> {
        let ledger = self.ledger.clone();
        let total_students = self.store.len();
        let stats = tokio::task::spawn_blocking(move || ledger.stats(total_students)).await??;
        Ok(serde_json::to_value(stats)?)
    }

    fn status_report(&self) -> Value {
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "modelsLoaded": (self.models_loaded)(),
            "students": self.store.len(),
            "workers": self.engine.workers(),
            "queued": self.engine.queued(),
        })
    }

    /// Read photo files named by the caller, enforcing the request size
    /// bound before loading any bytes.
    async fn read_uploads(&self, paths: &[String]) -> Result<Vec<Upload>, ServiceError> {
        let mut total: u64 = 0;
        for path in paths {
            let path = Path::new(path);
            let meta = tokio::fs::metadata(path)
                .await
                .map_err(|source| ServiceError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
            total = total.saturating_add(meta.len());
        }
        if total > self.max_upload_bytes as u64 {
            return Err(rollcall_core::Error::Validation(format!(
                "request body of {total} bytes exceeds the {} byte limit",
                self.max_upload_bytes
            ))
            .into());
        }

        let mut uploads = Vec::with_capacity(paths.len());
        for path in paths {
            let path = Path::new(path);
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|source| ServiceError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
            uploads.push(Upload::from_path(path, bytes));
        }
        Ok(uploads)
    }
}
