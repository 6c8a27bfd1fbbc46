//! The worker pool. Each worker owns the connections assigned to it and
//! ticks them on its own timer; new connections arrive through a short
//! locked hand-off list and are promoted at the start of a tick, which is
//! the only point where another thread's work meets the worker's own list.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::now_msec;
use crate::config::SERVER_TICK_MSEC;
use crate::server::connection::Connection;

pub(crate) struct Worker {
    index: usize,
    connection_count: AtomicUsize,
    new_connections: Mutex<Vec<Arc<Connection>>>,
}

pub(crate) struct Workers {
    workers: Vec<Arc<Worker>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Workers {
    pub(crate) fn start(count: usize) -> Workers {
        info!("starting {} workers", count);
        let workers: Vec<Arc<Worker>> = (0..count)
            .map(|index| {
                Arc::new(Worker {
                    index,
                    connection_count: AtomicUsize::new(0),
                    new_connections: Mutex::new(Vec::new()),
                })
            })
            .collect();
        let tasks = workers
            .iter()
            .map(|worker| tokio::spawn(Worker::run(worker.clone())))
            .collect();
        Workers {
            workers,
            tasks: Mutex::new(tasks),
        }
    }

    /// The worker with the fewest connections; ties go to the lowest index.
    pub(crate) fn laziest(&self) -> &Arc<Worker> {
        self.workers
            .iter()
            .min_by_key(|worker| worker.connection_count())
            .expect("the pool has at least one worker")
    }

    pub(crate) async fn stop(&self) {
        info!("stopping {} workers", self.workers.len());
        let start = now_msec();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("worker ended abnormally: {}", e);
                }
            }
        }
        info!("stopped workers in {} msec", now_msec() - start);
    }
}

impl Worker {
    pub(crate) fn add_new_connection(&self, conn: Arc<Connection>) {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        self.new_connections.lock().unwrap().push(conn);
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Worker>) {
        debug!("worker {}: entering loop", self.index);
        let mut ticker = tokio::time::interval(Duration::from_millis(SERVER_TICK_MSEC));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut connections: Vec<Arc<Connection>> = Vec::new();
        loop {
            ticker.tick().await;
            let now = now_msec();

            let promoted: Vec<Arc<Connection>> =
                std::mem::take(&mut *self.new_connections.lock().unwrap());
            for conn in &promoted {
                conn.on_worker_start();
            }
            connections.extend(promoted);

            connections.retain(|conn| {
                let remove = Connection::on_tick(conn, now);
                if remove {
                    self.connection_count.fetch_sub(1, Ordering::SeqCst);
                }
                !remove
            });
        }
    }
}
