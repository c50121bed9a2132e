//! # Engine
//!
//! Wires the queues together and runs the supervisor and settings loops on
//! their own threads. The front end only sees the inbound and outbound queues
//! and a [`Shutdown`] handle.
//!
//! Shutdown is cooperative: each loop checks the flag once per iteration, and
//! requesting shutdown wakes every thread parked on a registered queue so it
//! notices right away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Context, Result};
use log::{debug, info};

use crate::api::{Request, Response};
use crate::config::{EngineConfig, StateStore, Workdir};
use crate::daemon::Connector;
use crate::job_queue::{JobQueue, Wake};
use crate::session::Session;
use crate::settings::SettingsLoop;
use crate::supervisor::ConnectionSupervisor;

struct ShutdownInner {
    requested: AtomicBool,
    wakers: Mutex<Vec<Arc<dyn Wake>>>,
}

/// Process-wide stop flag shared by all loops
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                requested: AtomicBool::new(false),
                wakers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Wake `waker` when shutdown is requested
    pub fn watch(&self, waker: Arc<dyn Wake>) {
        self.inner
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(waker);
    }

    pub fn request(&self) {
        if self.inner.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutdown requested");
        for waker in self
            .inner
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            waker.wake_all();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }
}

pub struct Engine {
    inbound: Arc<JobQueue<Request>>,
    outbound: Arc<JobQueue<Response>>,
    shutdown: Shutdown,
    threads: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Start the supervisor and settings loops
    ///
    /// # Errors
    ///
    /// Fails if a thread can not be spawned.
    pub fn start(
        config: EngineConfig,
        store: StateStore,
        workdir: &Workdir,
        connector: Box<dyn Connector>,
    ) -> Result<Self> {
        let inbound = Arc::new(JobQueue::new("inbound"));
        let outbound = Arc::new(JobQueue::new("outbound"));
        let internal = Arc::new(JobQueue::new("internal"));
        let shutdown = Shutdown::new();
        shutdown.watch(inbound.clone());
        shutdown.watch(outbound.clone());
        shutdown.watch(internal.clone());

        let session = Session::new(
            config,
            store.clone(),
            workdir,
            Arc::clone(&outbound),
            Arc::clone(&internal),
        );
        let mut supervisor = ConnectionSupervisor::new(connector, session, Arc::clone(&inbound));
        let settings = SettingsLoop::new(store, internal);

        let mut threads = Vec::new();
        let stop = shutdown.clone();
        threads.push(
            thread::Builder::new()
                .name("supervisor".to_string())
                .spawn(move || supervisor.run(|| stop.is_requested()))
                .context("Failed to spawn supervisor thread")?,
        );
        let stop = shutdown.clone();
        threads.push(
            thread::Builder::new()
                .name("settings".to_string())
                .spawn(move || settings.run(|| stop.is_requested()))
                .context("Failed to spawn settings thread")?,
        );
        debug!("Engine threads started");

        Ok(Self {
            inbound,
            outbound,
            shutdown,
            threads,
        })
    }

    pub fn inbound(&self) -> Arc<JobQueue<Request>> {
        Arc::clone(&self.inbound)
    }

    pub fn outbound(&self) -> Arc<JobQueue<Response>> {
        Arc::clone(&self.outbound)
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Request shutdown and wait for every loop to finish
    ///
    /// # Errors
    ///
    /// Fails if a loop panicked.
    pub fn stop(self) -> Result<()> {
        self.shutdown.request();
        for handle in self.threads {
            let name = handle.thread().name().unwrap_or("engine").to_string();
            handle
                .join()
                .map_err(|_| anyhow!("{name} thread panicked"))?;
        }
        info!("Engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CommandId;
    use crate::daemon::memory::{MemoryConnector, MemoryDaemon};
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_shutdown_wakes_waiting_consumer() {
        let shutdown = Shutdown::new();
        let queue: Arc<JobQueue<u32>> = Arc::new(JobQueue::new("test"));
        shutdown.watch(queue.clone());

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.shift(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(50));
        shutdown.request();
        assert_eq!(consumer.join().unwrap(), None);
        assert!(shutdown.is_requested());
    }

    #[test]
    fn test_engine_serves_requests_and_stops() {
        let dir = TempDir::new().unwrap();
        let workdir = Workdir::prepare(dir.path()).unwrap();
        let store = StateStore::new(workdir.state_dir());
        let daemon = MemoryDaemon::with_library(2);
        let engine = Engine::start(
            EngineConfig::default(),
            store,
            &workdir,
            Box::new(MemoryConnector::new(daemon)),
        )
        .unwrap();

        engine
            .inbound()
            .push(Request::new(4, 1, CommandId::SettingsGet, Value::Null));
        let outbound = engine.outbound();
        let mut reply = None;
        for _ in 0..100 {
            match outbound.shift(Duration::from_millis(50)) {
                Some(response) if response.connection_id == 4 => {
                    reply = Some(response);
                    break;
                }
                _ => {}
            }
        }
        let reply = reply.unwrap().json().unwrap();
        assert_eq!(reply["result"]["mpdPort"], 6600);

        engine.stop().unwrap();
    }
}
