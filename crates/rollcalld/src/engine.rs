use std::sync::Arc;

use rollcall_core::{
    Deadline, EnrollmentRequest, EnrollmentService, Identity, MatchingEngine, ScanReport, Upload,
};
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] rollcall_core::Error),
    #[error("engine workers exited")]
    ChannelClosed,
    #[error("failed to spawn engine worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Messages sent from D-Bus handlers to the worker pool.
enum EngineRequest {
    Enroll {
        request: EnrollmentRequest,
        deadline: Deadline,
        reply: oneshot::Sender<rollcall_core::Result<Identity>>,
    },
    Scan {
        image: Upload,
        deadline: Deadline,
        reply: oneshot::Sender<rollcall_core::Result<ScanReport>>,
    },
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: async_channel::Sender<EngineRequest>,
    workers: usize,
}

impl EngineHandle {
    /// Enroll one identity: encode every photo, commit the centroid.
    pub async fn enroll(
        &self,
        request: EnrollmentRequest,
        deadline: Deadline,
    ) -> Result<Identity, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            EngineRequest::Enroll {
                request,
                deadline,
                reply,
            },
            deadline,
        )
        .await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Classify every face in one scan image.
    pub async fn scan(&self, image: Upload, deadline: Deadline) -> Result<ScanReport, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            EngineRequest::Scan {
                image,
                deadline,
                reply,
            },
            deadline,
        )
        .await?;
        Ok(rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Requests waiting for a free worker.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// Enqueue, waiting for queue space no longer than the deadline allows.
    async fn submit(&self, request: EngineRequest, deadline: Deadline) -> Result<(), EngineError> {
        let send = self.tx.send(request);
        let sent = match deadline.remaining() {
            Some(remaining) => tokio::time::timeout(remaining, send)
                .await
                .map_err(|_| rollcall_core::Error::DeadlineExceeded)?,
            None => send.await,
        };
        sent.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn `workers` named OS threads sharing one bounded request queue.
///
/// Encoder inference is CPU-bound and blocking, so it never runs on the
/// async runtime. A full queue makes callers wait instead of piling up work.
pub fn spawn_engine(
    enrollment: Arc<EnrollmentService>,
    matching: Arc<MatchingEngine>,
    workers: usize,
    queue_depth: usize,
) -> Result<EngineHandle, EngineError> {
    let workers = workers.max(1);
    let (tx, rx) = async_channel::bounded::<EngineRequest>(queue_depth.max(1));

    for n in 0..workers {
        let rx = rx.clone();
        let enrollment = enrollment.clone();
        let matching = matching.clone();
        std::thread::Builder::new()
            .name(format!("rollcall-worker-{n}"))
            .spawn(move || {
                tracing::debug!(worker = n, "engine worker started");
                while let Ok(request) = rx.recv_blocking() {
                    handle(&enrollment, &matching, request);
                }
                tracing::debug!(worker = n, "engine worker exiting");
            })
            .map_err(EngineError::Spawn)?;
    }

    tracing::info!(workers, queue_depth, "engine workers started");
    Ok(EngineHandle { tx, workers })
}

fn handle(enrollment: &EnrollmentService, matching: &MatchingEngine, request: EngineRequest) {
    match request {
        EngineRequest::Enroll {
            request,
            deadline,
            reply,
        } => {
            if reply.is_closed() {
                tracing::debug!(id = %request.id, "caller gone, dropping enrollment");
                return;
            }
            let result = deadline.check().and_then(|()| enrollment.enroll(request, deadline));
            if let Err(err) = &result {
                tracing::warn!(error = %err, "enrollment failed");
            }
            let _ = reply.send(result);
        }
        EngineRequest::Scan {
            image,
            deadline,
            reply,
        } => {
            if reply.is_closed() {
                tracing::debug!(file = %image.filename, "caller gone, dropping scan");
                return;
            }
            let result = deadline.check().and_then(|()| matching.scan(&image, deadline));
            if let Err(err) = &result {
                tracing::warn!(error = %err, "scan failed");
            }
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, photo};
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn enroll_then_scan_through_the_pool() {
        let f = fixture();
        let engine = spawn_engine(f.enrollment.clone(), f.matching.clone(), 2, 4).unwrap();
        assert_eq!(engine.workers(), 2);

        let identity = engine
            .enroll(
                EnrollmentRequest {
                    id: "S001".into(),
                    name: "Ada".into(),
                    photos: vec![photo(1), photo(2), photo(3)],
                },
                Deadline::none(),
            )
            .await
            .unwrap();
        assert_eq!(identity.photos.len(), 3);

        let report = engine.scan(photo(10), Deadline::none()).await.unwrap();
        assert_eq!(report.recognized_count(), 1);
        assert_eq!(report.summary().recognized[0].id, "S001");
    }

    #[tokio::test]
    async fn core_errors_pass_through() {
        let f = fixture();
        let engine = spawn_engine(f.enrollment.clone(), f.matching.clone(), 1, 1).unwrap();

        let err = engine
            .enroll(
                EnrollmentRequest {
                    id: "S001".into(),
                    name: "Ada".into(),
                    photos: vec![photo(1)],
                },
                Deadline::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Core(rollcall_core::Error::Validation(_))));
    }

    #[tokio::test]
    async fn expired_request_is_not_executed() {
        let f = fixture();
        let engine = spawn_engine(f.enrollment.clone(), f.matching.clone(), 1, 1).unwrap();

        let err = engine
            .enroll(
                EnrollmentRequest {
                    id: "S001".into(),
                    name: "Ada".into(),
                    photos: vec![photo(1), photo(2), photo(3)],
                },
                Deadline::at(Instant::now()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Core(rollcall_core::Error::DeadlineExceeded)));
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn concurrent_requests_all_complete() {
        let f = fixture();
        let engine = spawn_engine(f.enrollment.clone(), f.matching.clone(), 3, 2).unwrap();

        let mut tasks = Vec::new();
        for n in 0..10 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                engine
                    .enroll(
                        EnrollmentRequest {
                            id: format!("S{n:03}"),
                            name: format!("Student {n}"),
                            photos: vec![photo(1), photo(2), photo(3)],
                        },
                        Deadline::after(Duration::from_secs(30)),
                    )
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(f.store.len(), 10);
    }
}
