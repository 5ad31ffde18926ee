//! FIFO dispatch queue for local topic handlers.
//!
//! Local delivery is decoupled from the connection task that received the
//! triggering message: deliveries are posted to a single worker task and
//! run in submission order. A handler that panics is caught and counted;
//! the worker survives and later deliveries still run. There is no
//! cancellation for an already-posted delivery.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use vigil_types::Request;

use crate::endpoint::{Endpoint, TopicHandler};

/// One queued delivery: the request plus the handler snapshot taken at
/// routing time.
struct Job {
    receiver: Arc<Endpoint>,
    sender: Arc<Endpoint>,
    request: Request,
    handlers: Vec<TopicHandler>,
}

/// Handle to the dispatch queue and its worker task.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Job>,
    completed: Arc<AtomicU64>,
    panicked: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Create the dispatcher and spawn its worker. Must be called inside a
    /// tokio runtime. The worker stops once every handle is dropped.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let completed = Arc::new(AtomicU64::new(0));
        let panicked = Arc::new(AtomicU64::new(0));

        let worker_completed = completed.clone();
        let worker_panicked = panicked.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                for handler in &job.handlers {
                    let outcome = catch_unwind(AssertUnwindSafe(|| {
                        handler(&job.receiver, &job.sender, &job.request)
                    }));
                    if outcome.is_err() {
                        worker_panicked.fetch_add(1, Ordering::SeqCst);
                        warn!(
                            endpoint = %job.receiver.name(),
                            topic = %job.request.method,
                            "Topic handler panicked"
                        );
                    }
                }
                worker_completed.fetch_add(1, Ordering::SeqCst);
            }
            debug!("Dispatch worker stopped");
        });

        Self {
            tx,
            completed,
            panicked,
        }
    }

    /// Queue one delivery. Handlers run on the worker, in list order, after
    /// every previously posted delivery.
    pub(crate) fn post(
        &self,
        receiver: Arc<Endpoint>,
        sender: Arc<Endpoint>,
        request: Request,
        handlers: Vec<TopicHandler>,
    ) {
        let _ = self.tx.send(Job {
            receiver,
            sender,
            request,
            handlers,
        });
    }

    /// Deliveries fully processed so far.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Handler panics caught so far.
    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::SeqCst)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::mesh::Mesh;
    use std::sync::Mutex;
    use std::time::Duration;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_deliveries_run_in_submission_order() {
        let mesh = Mesh::bootstrap(MeshConfig::default()).unwrap();
        let dispatcher = mesh.dispatcher().clone();
        let endpoint = mesh.local_endpoint().clone();

        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();

        dispatcher.post(
            endpoint.clone(),
            endpoint.clone(),
            Request::new("t.one"),
            vec![Arc::new(move |_, _, _| first.lock().unwrap().push(1))],
        );
        dispatcher.post(
            endpoint.clone(),
            endpoint.clone(),
            Request::new("t.two"),
            vec![Arc::new(move |_, _, _| second.lock().unwrap().push(2))],
        );

        wait_until(|| dispatcher.completed() >= 2).await;
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_handlers_of_one_delivery_run_in_order() {
        let mesh = Mesh::bootstrap(MeshConfig::default()).unwrap();
        let dispatcher = mesh.dispatcher().clone();
        let endpoint = mesh.local_endpoint().clone();

        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();

        dispatcher.post(
            endpoint.clone(),
            endpoint.clone(),
            Request::new("t.multi"),
            vec![
                Arc::new(move |_, _, _| first.lock().unwrap().push(1)),
                Arc::new(move |_, _, _| second.lock().unwrap().push(2)),
            ],
        );

        wait_until(|| dispatcher.completed() >= 1).await;
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let mesh = Mesh::bootstrap(MeshConfig::default()).unwrap();
        let dispatcher = mesh.dispatcher().clone();
        let endpoint = mesh.local_endpoint().clone();

        let survived: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let marker = survived.clone();

        dispatcher.post(
            endpoint.clone(),
            endpoint.clone(),
            Request::new("t.bad"),
            vec![Arc::new(|_, _, _| panic!("handler blew up"))],
        );
        dispatcher.post(
            endpoint.clone(),
            endpoint.clone(),
            Request::new("t.good"),
            vec![Arc::new(move |_, _, _| {
                marker.lock().unwrap().push("ran")
            })],
        );

        wait_until(|| dispatcher.completed() >= 2).await;
        assert_eq!(dispatcher.panicked(), 1);
        assert_eq!(*survived.lock().unwrap(), vec!["ran"]);
    }
}
