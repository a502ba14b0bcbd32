// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Worker thread pool
//!
//! Runs expensive, stateless work (translation) on dedicated OS threads.
//! Every outstanding call occupies a numbered slot in a correlation table;
//! a worker replies with the slot number and the slot is recycled once the
//! reply has been handed back to the caller.

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{LoaderError, Result};

/// Work sent to the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRequest {
    /// Translate `source` of the given format
    Translate {
        /// Record address, for diagnostics
        address: String,
        /// Format plugin name
        format: String,
        /// Source text
        source: String,
    },
}

/// Reply from the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerResponse {
    /// Translated source and the format it now has
    Translated {
        /// New source text
        source: String,
        /// New format tag
        format: String,
    },
    /// The task failed
    Failed {
        /// Failure message
        message: String,
    },
}

/// Handler running on the worker threads
pub trait WorkerTask: Send + Sync + 'static {
    /// Handle one request
    fn handle(&self, request: WorkerRequest) -> WorkerResponse;
}

/// Correlation table of outstanding calls
#[derive(Default)]
struct Slots {
    pending: Vec<Option<oneshot::Sender<WorkerResponse>>>,
    free: Vec<usize>,
}

impl Slots {
    fn acquire(&mut self, reply: oneshot::Sender<WorkerResponse>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.pending[slot] = Some(reply);
                slot
            }
            None => {
                self.pending.push(Some(reply));
                self.pending.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) -> Option<oneshot::Sender<WorkerResponse>> {
        let reply = self.pending.get_mut(slot)?.take();
        if reply.is_some() {
            self.free.push(slot);
        }
        reply
    }

    fn outstanding(&self) -> usize {
        self.pending.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Fixed-size pool of worker threads
pub struct WorkerPool {
    queue: Option<Sender<(usize, WorkerRequest)>>,
    slots: Arc<Mutex<Slots>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `threads` workers running `task`
    pub fn new(threads: usize, task: Arc<dyn WorkerTask>) -> Result<Self> {
        let (queue, jobs) = channel::unbounded::<(usize, WorkerRequest)>();
        let slots = Arc::new(Mutex::new(Slots::default()));
        let mut handles = Vec::with_capacity(threads);

        for index in 0..threads.max(1) {
            let jobs = jobs.clone();
            let slots = Arc::clone(&slots);
            let task = Arc::clone(&task);

            let handle = std::thread::Builder::new()
                .name(format!("spacey-worker-{}", index))
                .spawn(move || {
                    while let Ok((slot, request)) = jobs.recv() {
                        trace!("worker {} handling slot {}", index, slot);
                        let response = panic::catch_unwind(AssertUnwindSafe(|| task.handle(request)))
                            .unwrap_or_else(|_| WorkerResponse::Failed {
                                message: "worker task panicked".to_string(),
                            });

                        match slots.lock().release(slot) {
                            Some(reply) => {
                                // The caller may have given up waiting
                                let _ = reply.send(response);
                            }
                            None => warn!("reply for unknown slot {}", slot),
                        }
                    }
                })
                .map_err(|e| LoaderError::Worker(format!("failed to spawn worker: {}", e)))?;
            handles.push(handle);
        }

        debug!("Started {} worker threads", handles.len());
        Ok(Self {
            queue: Some(queue),
            slots,
            threads: handles,
        })
    }

    /// Send a request and wait for its reply
    pub async fn call(&self, request: WorkerRequest) -> Result<WorkerResponse> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| LoaderError::Worker("pool is shut down".to_string()))?;

        let (reply, response) = oneshot::channel();
        let slot = self.slots.lock().acquire(reply);

        if queue.send((slot, request)).is_err() {
            self.slots.lock().release(slot);
            return Err(LoaderError::Worker("pool is shut down".to_string()));
        }

        response
            .await
            .map_err(|_| LoaderError::Worker(format!("no reply for slot {}", slot)))
    }

    /// Number of worker threads
    pub fn threads(&self) -> usize {
        self.threads.len()
    }

    /// Calls currently waiting for a reply
    pub fn outstanding(&self) -> usize {
        self.slots.lock().outstanding()
    }

    /// Size of the correlation table
    pub fn capacity(&self) -> usize {
        self.slots.lock().pending.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the queue ends every worker loop
        self.queue.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl WorkerTask for Upper {
        fn handle(&self, request: WorkerRequest) -> WorkerResponse {
            match request {
                WorkerRequest::Translate { source, format, .. } => {
                    if source == "panic" {
                        panic!("bad input");
                    }
                    WorkerResponse::Translated {
                        source: source.to_uppercase(),
                        format,
                    }
                }
            }
        }
    }

    fn translate(source: &str) -> WorkerRequest {
        WorkerRequest::Translate {
            address: "file:///a.ts".to_string(),
            format: "ts".to_string(),
            source: source.to_string(),
        }
    }

    #[tokio::test]
    async fn test_sequential_calls_reuse_slot() {
        let pool = WorkerPool::new(2, Arc::new(Upper)).unwrap();

        for _ in 0..5 {
            let response = pool.call(translate("abc")).await.unwrap();
            assert_eq!(
                response,
                WorkerResponse::Translated {
                    source: "ABC".to_string(),
                    format: "ts".to_string()
                }
            );
        }

        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls() {
        let pool = WorkerPool::new(3, Arc::new(Upper)).unwrap();

        let calls = (0..8).map(|i| pool.call(translate(&format!("m{}", i))));
        let responses = futures::future::join_all(calls).await;

        for (i, response) in responses.into_iter().enumerate() {
            assert_eq!(
                response.unwrap(),
                WorkerResponse::Translated {
                    source: format!("M{}", i),
                    format: "ts".to_string()
                }
            );
        }
        assert!(pool.capacity() <= 8);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_fails_call() {
        let pool = WorkerPool::new(1, Arc::new(Upper)).unwrap();

        let response = pool.call(translate("panic")).await.unwrap();
        assert!(matches!(response, WorkerResponse::Failed { .. }));

        // The worker survives
        assert!(matches!(
            pool.call(translate("ok")).await.unwrap(),
            WorkerResponse::Translated { .. }
        ));
    }
}
