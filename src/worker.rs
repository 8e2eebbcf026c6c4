//! Fetch worker threads
//!
//! Each worker owns a job channel and performs the blocking fetch plus the
//! response transformation. Replies travel back through oneshot channels
//! registered under a per-job id, so concurrent captures fetching the same
//! URL never collide.

use crate::embed::Resolved;
use crate::platform::{BlockingFetch, FetchRequest};
use crate::{Error, Result};
use log::debug;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tokio::sync::oneshot;

type ReplyTable = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Resolved>>>>>;

// Job sent to a fetch worker
struct FetchJob {
    id: u64,
    request: FetchRequest,
}

pub(crate) struct WorkerPool {
    senders: RefCell<Vec<mpsc::Sender<FetchJob>>>,
    handles: RefCell<Vec<JoinHandle<()>>>,
    replies: ReplyTable,
    next_id: Cell<u64>,
}

fn spawn_fetch_worker(
    index: usize,
    fetcher: Arc<dyn BlockingFetch>,
    replies: ReplyTable,
) -> std::io::Result<(mpsc::Sender<FetchJob>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel::<FetchJob>();
    let handle = std::thread::Builder::new()
        .name(format!("domsnap-fetch-{}", index))
        .spawn(move || {
            while let Ok(job) = rx.recv() {
                if !awaiting_reply(&replies, job.id) {
                    debug!("fetch worker {} skipping abandoned {}", index, job.request.url);
                    continue;
                }
                let result = fetcher
                    .fetch_blocking(&job.request)
                    .and_then(|response| Resolved::from_response(response, job.request.kind));
                let reply = replies.lock().ok().and_then(|mut table| table.remove(&job.id));
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        })?;
    Ok((tx, handle))
}

/// Whether someone still waits on job `id`. Closed receivers are evicted.
fn awaiting_reply(replies: &ReplyTable, id: u64) -> bool {
    let Ok(mut table) = replies.lock() else {
        return false;
    };
    match table.get(&id) {
        Some(reply) if reply.is_closed() => {
            table.remove(&id);
            false
        }
        Some(_) => true,
        None => false,
    }
}

impl WorkerPool {
    pub(crate) fn spawn(count: usize, fetcher: Arc<dyn BlockingFetch>) -> Result<Self> {
        let replies: ReplyTable = Arc::new(Mutex::new(HashMap::new()));
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, handle) = spawn_fetch_worker(index, fetcher.clone(), replies.clone())
                .map_err(|e| Error::Worker(format!("failed to spawn fetch worker: {}", e)))?;
            senders.push(tx);
            handles.push(handle);
        }
        Ok(Self {
            senders: RefCell::new(senders),
            handles: RefCell::new(handles),
            replies,
            next_id: Cell::new(0),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.senders.borrow().len()
    }

    /// Queue `request` on worker `slot % len`.
    pub(crate) fn dispatch(
        &self,
        slot: usize,
        request: FetchRequest,
    ) -> Result<oneshot::Receiver<Result<Resolved>>> {
        let senders = self.senders.borrow();
        if senders.is_empty() {
            return Err(Error::Worker("worker pool is shut down".to_string()));
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let (tx, rx) = oneshot::channel();
        self.replies
            .lock()
            .map_err(|_| Error::Worker("reply table poisoned".to_string()))?
            .insert(id, tx);

        if senders[slot % senders.len()].send(FetchJob { id, request }).is_err() {
            if let Ok(mut table) = self.replies.lock() {
                table.remove(&id);
            }
            return Err(Error::Worker(format!("worker {} is gone", slot % senders.len())));
        }
        Ok(rx)
    }

    /// Close the job channels and drop pending replies. Threads are detached;
    /// a worker finishes its current fetch and then skips every queued job.
    pub(crate) fn shutdown(&self) {
        self.senders.borrow_mut().clear();
        if let Ok(mut table) = self.replies.lock() {
            table.clear();
        }
        let detached = self.handles.borrow_mut().drain(..).count();
        if detached > 0 {
            debug!("detached {} fetch workers", detached);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{FetchResponse, ResponseKind};

    struct EchoFetch;

    impl BlockingFetch for EchoFetch {
        fn fetch_blocking(&self, request: &FetchRequest) -> Result<FetchResponse> {
            if request.url.contains("missing") {
                return Err(Error::fetch(&request.url, "404"));
            }
            Ok(FetchResponse {
                content_type: Some("text/plain".to_string()),
                body: request.url.as_bytes().to_vec(),
            })
        }
    }

    #[tokio::test]
    async fn jobs_are_answered_by_id() {
        let pool = WorkerPool::spawn(2, Arc::new(EchoFetch)).unwrap();
        let a = pool
            .dispatch(0, FetchRequest::new("http://a/", ResponseKind::Text))
            .unwrap();
        let b = pool
            .dispatch(1, FetchRequest::new("http://a/missing", ResponseKind::Text))
            .unwrap();
        assert_eq!(a.await.unwrap().unwrap(), Resolved::Text("http://a/".to_string()));
        assert!(matches!(b.await.unwrap(), Err(Error::Fetch { .. })));
    }

    struct SlowFetch {
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl BlockingFetch for SlowFetch {
        fn fetch_blocking(&self, request: &FetchRequest) -> Result<FetchResponse> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(200));
            EchoFetch.fetch_blocking(request)
        }
    }

    #[test]
    fn shutdown_does_not_wait_for_queued_jobs() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let pool = WorkerPool::spawn(1, Arc::new(SlowFetch { calls: calls.clone() })).unwrap();
        let receivers: Vec<_> = (0..4)
            .map(|i| {
                pool.dispatch(0, FetchRequest::new(format!("http://a/{}", i), ResponseKind::Text))
                    .unwrap()
            })
            .collect();

        let started = std::time::Instant::now();
        pool.shutdown();
        assert!(started.elapsed() < std::time::Duration::from_millis(100));

        std::thread::sleep(std::time::Duration::from_millis(700));
        assert!(calls.load(std::sync::atomic::Ordering::SeqCst) <= 1);
        drop(receivers);
    }

    #[test]
    fn abandoned_jobs_are_skipped() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let pool = WorkerPool::spawn(1, Arc::new(SlowFetch { calls: calls.clone() })).unwrap();
        let first = pool
            .dispatch(0, FetchRequest::new("http://a/first", ResponseKind::Text))
            .unwrap();
        for i in 0..3 {
            drop(pool.dispatch(0, FetchRequest::new(format!("http://a/{}", i), ResponseKind::Text)));
        }
        let answer = first.blocking_recv().unwrap().unwrap();
        assert_eq!(answer, Resolved::Text("http://a/first".to_string()));

        std::thread::sleep(std::time::Duration::from_millis(300));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_fails() {
        let pool = WorkerPool::spawn(1, Arc::new(EchoFetch)).unwrap();
        pool.shutdown();
        assert_eq!(pool.len(), 0);
        assert!(pool
            .dispatch(0, FetchRequest::new("http://a/", ResponseKind::Text))
            .is_err());
    }
}
