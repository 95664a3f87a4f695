//! Dedicated inference thread with an async, cloneable front.
//!
//! Face encoding is blocking and holds model sessions that are not shared,
//! so one OS thread owns the [`RegistryService`] and serves requests in order.

use crate::service::{
    ListedEntry, RegisterOutcome, RegistryError, RegistryService, RegistryStatus, SearchOutcome,
};
use reunite_core::{FaceEmbedder, RecordId};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<Result<T, RegistryError>>;

enum EngineRequest {
    Register {
        record_id: RecordId,
        image: Vec<u8>,
        reply: Reply<RegisterOutcome>,
    },
    Search {
        full_name: Option<String>,
        image: Option<Vec<u8>>,
        reply: Reply<SearchOutcome>,
    },
    Remove {
        record_id: RecordId,
        reply: Reply<bool>,
    },
    PruneOrphans {
        reply: Reply<usize>,
    },
    List {
        reply: Reply<Vec<ListedEntry>>,
    },
    Status {
        reply: Reply<RegistryStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    deadline: Duration,
}

impl EngineHandle {
    /// Register a photo for a record, bounded by the request deadline.
    ///
    /// The engine finishes a request even after its caller gave up, so a
    /// registration that returned `DeadlineExceeded` may still have been stored.
    pub async fn register(
        &self,
        record_id: RecordId,
        image: Vec<u8>,
    ) -> Result<RegisterOutcome, RegistryError> {
        self.call_with_deadline(|reply| EngineRequest::Register {
            record_id,
            image,
            reply,
        })
        .await
    }

    pub async fn search(&self, image: Vec<u8>) -> Result<SearchOutcome, RegistryError> {
        self.search_combined(None, Some(image)).await
    }

    pub async fn search_combined(
        &self,
        full_name: Option<String>,
        image: Option<Vec<u8>>,
    ) -> Result<SearchOutcome, RegistryError> {
        self.call_with_deadline(|reply| EngineRequest::Search {
            full_name,
            image,
            reply,
        })
        .await
    }

    pub async fn remove(&self, record_id: RecordId) -> Result<bool, RegistryError> {
        self.call(|reply| EngineRequest::Remove { record_id, reply })
            .await
    }

    pub async fn prune_orphans(&self) -> Result<usize, RegistryError> {
        self.call(|reply| EngineRequest::PruneOrphans { reply }).await
    }

    pub async fn list(&self) -> Result<Vec<ListedEntry>, RegistryError> {
        self.call(|reply| EngineRequest::List { reply }).await
    }

    pub async fn status(&self) -> Result<RegistryStatus, RegistryError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, RegistryError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(request(reply_tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        reply_rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    async fn call_with_deadline<T>(
        &self,
        request: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, RegistryError> {
        tokio::time::timeout(self.deadline, self.call(request))
            .await
            .map_err(|_| {
                tracing::warn!(deadline = ?self.deadline, "request deadline exceeded");
                RegistryError::DeadlineExceeded(self.deadline)
            })?
    }
}

/// Move the service onto a dedicated OS thread and return a handle to it.
///
/// `register` and `search` through the handle fail with
/// [`RegistryError::DeadlineExceeded`] when they take longer than `deadline`,
/// counted from the moment the request is queued.
pub fn spawn_engine<E>(
    mut service: RegistryService<E>,
    deadline: Duration,
) -> Result<EngineHandle, RegistryError>
where
    E: FaceEmbedder + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("reunite-engine".into())
        .spawn(move || {
            tracing::info!(model = service.model_version(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Register {
                        record_id,
                        image,
                        reply,
                    } => {
                        let _ = reply.send(service.register(&record_id, &image));
                    }
                    EngineRequest::Search {
                        full_name,
                        image,
                        reply,
                    } => {
                        let result =
                            service.search_combined(full_name.as_deref(), image.as_deref());
                        let _ = reply.send(result);
                    }
                    EngineRequest::Remove { record_id, reply } => {
                        let _ = reply.send(service.remove(&record_id));
                    }
                    EngineRequest::PruneOrphans { reply } => {
                        let _ = reply.send(service.prune_orphans());
                    }
                    EngineRequest::List { reply } => {
                        let _ = reply.send(service.list());
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(service.status());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(RegistryError::EngineSpawn)?;

    Ok(EngineHandle { tx, deadline })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{photo, test_config, ScriptedEmbedder};
    use reunite_core::MissingChildRecord;
    use reunite_store::{MemoryDirectory, MemoryStore};
    use std::sync::Arc;

    fn spawn(embedder: ScriptedEmbedder, deadline: Duration) -> (EngineHandle, Arc<MemoryDirectory>) {
        let directory = Arc::new(MemoryDirectory::new());
        let service = RegistryService::new(
            &test_config(),
            embedder,
            Arc::new(MemoryStore::new()),
            directory.clone(),
        )
        .unwrap();
        (spawn_engine(service, deadline).unwrap(), directory)
    }

    #[tokio::test]
    async fn test_register_then_search_through_handle() {
        let (engine, directory) = spawn(ScriptedEmbedder::new(), Duration::from_secs(5));
        directory
            .upsert(&MissingChildRecord {
                id: RecordId::new("child-1"),
                full_name: "Asha Rao".into(),
                guardian_contact: Some("+91 98450 00000".into()),
            })
            .unwrap();

        let outcome = engine
            .register(RecordId::new("child-1"), photo(1, 30, 40, 0))
            .await
            .unwrap();
        assert!(matches!(outcome, RegisterOutcome::Registered(_)));

        let SearchOutcome::Matched(children) = engine.search(photo(1, 30, 40, 7)).await.unwrap()
        else {
            panic!("search was rejected");
        };
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].record.full_name, "Asha Rao");

        assert_eq!(engine.status().await.unwrap().entries, 1);
        assert!(engine.remove(RecordId::new("child-1")).await.unwrap());
        assert!(engine.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_served() {
        let (engine, _) = spawn(ScriptedEmbedder::new(), Duration::from_secs(5));
        let tasks: Vec<_> = (0..8u8)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .register(RecordId::new(format!("c{i}")), photo(1, i * 20, 0, 0))
                        .await
                })
            })
            .collect();
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert!(matches!(outcome, RegisterOutcome::Registered(_)));
        }
        assert_eq!(engine.prune_orphans().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_slow_request_hits_deadline() {
        let (engine, _) = spawn(
            ScriptedEmbedder::slow(Duration::from_millis(300)),
            Duration::from_millis(50),
        );
        let err = engine.search(photo(1, 1, 1, 0)).await.unwrap_err();
        assert!(matches!(err, RegistryError::DeadlineExceeded(d) if d == Duration::from_millis(50)));

        // Maintenance calls are not bounded and the engine keeps serving.
        assert_eq!(engine.status().await.unwrap().entries, 0);
    }
}
