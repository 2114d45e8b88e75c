//! Async front end for an offloading manager.
//!
//! The manager's operations are short and synchronous, guarded by its own
//! mutex. Async callers should not take that lock on a runtime thread, so
//! the manager is owned by one dedicated worker thread that executes jobs
//! sent over a bounded channel; each job answers on a oneshot channel.
//!
//! A job that panics (a violated load/store precondition) drops its reply
//! sender, which the caller sees as [`ServiceError::WorkerPanicked`]. The
//! worker itself survives and keeps serving.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::cache::block::{BlockHash, LoadStoreSpec, OffloadingEvent, PrepareStoreOutput};
use crate::cache::manager::{OffloadingManager, OffloadingStats};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Offloading service is closed")]
    Closed,

    #[error("Offloading job panicked")]
    WorkerPanicked,

    #[error("Failed to spawn offloading worker: {0}")]
    Spawn(#[from] std::io::Error),
}

type Job = Box<dyn FnOnce(&dyn OffloadingManager) + Send>;

enum Command {
    Run(Job),
    Shutdown,
}

/// Async counterpart of [`OffloadingManager`].
#[async_trait]
pub trait AsyncOffloadingManager: Send + Sync {
    async fn lookup(&self, hashes: Vec<BlockHash>) -> Result<usize, ServiceError>;
    async fn prepare_load(&self, hashes: Vec<BlockHash>) -> Result<LoadStoreSpec, ServiceError>;
    async fn touch(&self, hashes: Vec<BlockHash>) -> Result<(), ServiceError>;
    async fn complete_load(&self, hashes: Vec<BlockHash>) -> Result<(), ServiceError>;
    async fn prepare_store(
        &self,
        hashes: Vec<BlockHash>,
    ) -> Result<Option<PrepareStoreOutput>, ServiceError>;
    async fn complete_store(&self, hashes: Vec<BlockHash>) -> Result<(), ServiceError>;
    async fn take_events(&self) -> Result<Vec<OffloadingEvent>, ServiceError>;
    async fn stats(&self) -> Result<OffloadingStats, ServiceError>;
}

/// Cloneable sender side of the service.
#[derive(Clone)]
pub struct OffloadingHandle {
    sender: mpsc::Sender<Command>,
    stopped: Arc<AtomicBool>,
}

impl OffloadingHandle {
    /// Run `f` against the manager on the worker thread.
    pub async fn call<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn OffloadingManager) -> T + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: Job = Box::new(move |manager: &dyn OffloadingManager| {
            let _ = reply.send(f(manager));
        });
        self.sender
            .send(Command::Run(job))
            .await
            .map_err(|_| ServiceError::Closed)?;

        response.await.map_err(|_| {
            if self.stopped.load(Ordering::Acquire) {
                ServiceError::Closed
            } else {
                ServiceError::WorkerPanicked
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[async_trait]
impl AsyncOffloadingManager for OffloadingHandle {
    async fn lookup(&self, hashes: Vec<BlockHash>) -> Result<usize, ServiceError> {
        self.call(move |m| m.lookup(&hashes)).await
    }

    async fn prepare_load(&self, hashes: Vec<BlockHash>) -> Result<LoadStoreSpec, ServiceError> {
        self.call(move |m| m.prepare_load(&hashes)).await
    }

    async fn touch(&self, hashes: Vec<BlockHash>) -> Result<(), ServiceError> {
        self.call(move |m| m.touch(&hashes)).await
    }

    async fn complete_load(&self, hashes: Vec<BlockHash>) -> Result<(), ServiceError> {
        self.call(move |m| m.complete_load(&hashes)).await
    }

    async fn prepare_store(
        &self,
        hashes: Vec<BlockHash>,
    ) -> Result<Option<PrepareStoreOutput>, ServiceError> {
        self.call(move |m| m.prepare_store(&hashes)).await
    }

    async fn complete_store(&self, hashes: Vec<BlockHash>) -> Result<(), ServiceError> {
        self.call(move |m| m.complete_store(&hashes)).await
    }

    async fn take_events(&self) -> Result<Vec<OffloadingEvent>, ServiceError> {
        self.call(|m| m.take_events()).await
    }

    async fn stats(&self) -> Result<OffloadingStats, ServiceError> {
        self.call(|m| m.stats()).await
    }
}

/// Worker thread owning an offloading manager.
pub struct OffloadingService {
    handle: OffloadingHandle,
    worker: Option<JoinHandle<()>>,
}

impl OffloadingService {
    pub fn spawn(
        manager: Arc<dyn OffloadingManager>,
        queue_depth: usize,
    ) -> Result<Self, ServiceError> {
        let (sender, mut receiver) = mpsc::channel::<Command>(queue_depth.max(1));
        let stopped = Arc::new(AtomicBool::new(false));
        let worker_stopped = stopped.clone();

        let worker = std::thread::Builder::new()
            .name("kv-offload-worker".to_string())
            .spawn(move || {
                let mut jobs = 0u64;
                while let Some(command) = receiver.blocking_recv() {
                    match command {
                        Command::Run(job) => {
                            jobs += 1;
                            let ran = panic::catch_unwind(AssertUnwindSafe(|| job(&*manager)));
                            if ran.is_err() {
                                error!(job = jobs, "Offloading job panicked");
                            }
                        }
                        Command::Shutdown => break,
                    }
                }
                worker_stopped.store(true, Ordering::Release);
                receiver.close();
                debug!(jobs, "Offloading worker stopped");
            })?;

        info!(queue_depth, "Offloading service started");
        Ok(Self {
            handle: OffloadingHandle { sender, stopped },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> OffloadingHandle {
        self.handle.clone()
    }

    /// Stop the worker after the jobs already queued and wait for it.
    pub async fn shutdown(mut self) -> Result<(), ServiceError> {
        let _ = self.handle.sender.send(Command::Shutdown).await;
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || worker.join())
            .await
            .map_err(|_| ServiceError::WorkerPanicked)?
            .map_err(|_| ServiceError::WorkerPanicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::arc::ArcOffloadingManager;
    use crate::cache::backend::SimulatedBackend;
    use crate::cache::block::Medium;

    fn service() -> OffloadingService {
        let manager = ArcOffloadingManager::new(SimulatedBackend::new(Medium::Cpu, 4, 64));
        OffloadingService::spawn(Arc::new(manager), 8).unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_through_worker() {
        let service = service();
        let handle = service.handle();
        let h = BlockHash::from_raw(1);

        let out = handle.prepare_store(vec![h]).await.unwrap().unwrap();
        assert_eq!(out.to_store, vec![h]);
        handle.complete_store(vec![h]).await.unwrap();
        assert_eq!(handle.lookup(vec![h]).await.unwrap(), 1);

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_after_shutdown() {
        let service = service();
        let handle = service.handle();
        service.shutdown().await.unwrap();

        assert!(matches!(handle.stats().await, Err(ServiceError::Closed)));
    }

    #[tokio::test]
    async fn test_panicking_job_keeps_worker_alive() {
        let service = service();
        let handle = service.handle();

        let err = handle.complete_load(vec![BlockHash::from_raw(9)]).await;
        assert!(matches!(err, Err(ServiceError::WorkerPanicked)));
        assert_eq!(handle.stats().await.unwrap().policy, "arc");

        service.shutdown().await.unwrap();
    }
}
