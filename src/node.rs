use crate::metrics::Metrics;
use crate::mix::pool::{MixPool, PoolSnapshot};
use crate::network::local::LocalLink;
use crate::network::{Envelope, Message};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{self, Instant};

/// Wall-clock milliseconds that advance with the tokio clock, so paused
/// test runtimes control pool time too.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    base_ms: u64,
    start: Instant,
}

impl Clock {
    pub fn new(base_ms: u64) -> Self {
        Self { base_ms, start: Instant::now() }
    }

    pub fn now(&self) -> u64 {
        self.base_ms + self.start.elapsed().as_millis() as u64
    }
}

/// One mixing pool driven by its inbox and a periodic tick.
pub struct MixNode {
    pool: Arc<Mutex<MixPool>>,
    link: LocalLink,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    metrics: Metrics,
    clock: Clock,
    status_tx: watch::Sender<PoolSnapshot>,
    shutdown_rx: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct MixHandle {
    pool: Arc<Mutex<MixPool>>,
    status_rx: watch::Receiver<PoolSnapshot>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    metrics: Metrics,
}

impl MixHandle {
    /// Latest published snapshot.
    pub fn status(&self) -> PoolSnapshot {
        self.status_rx.borrow().clone()
    }

    /// Wait until a published snapshot satisfies `done`.
    pub async fn wait_for(&self, done: impl Fn(&PoolSnapshot) -> bool) -> Result<PoolSnapshot> {
        let mut rx = self.status_rx.clone();
        let snapshot = rx.wait_for(|s| done(s)).await?;
        Ok(snapshot.clone())
    }

    /// Run `f` against the pool while holding its lock.
    pub async fn with_pool<R>(&self, f: impl FnOnce(&mut MixPool) -> R) -> R {
        let mut pool = self.pool.lock().await;
        f(&mut pool)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl MixNode {
    pub fn new(pool: MixPool, link: LocalLink, inbox: mpsc::UnboundedReceiver<Envelope>, clock: Clock) -> (Self, MixHandle) {
        let metrics = pool.metrics().clone();
        let (status_tx, status_rx) = watch::channel(pool.snapshot());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = Arc::new(Mutex::new(pool));
        let handle = MixHandle {
            pool: Arc::clone(&pool),
            status_rx,
            shutdown_tx: Arc::new(shutdown_tx),
            metrics: metrics.clone(),
        };
        let node = Self { pool, link, inbox, metrics, clock, status_tx, shutdown_rx };
        (node, handle)
    }

    pub async fn run(mut self) -> Result<()> {
        let tick_ms = self.pool.lock().await.config().tick_interval_ms;
        let mut tick_interval = time::interval(Duration::from_millis(tick_ms));
        let mut metrics_interval = time::interval(Duration::from_secs(30));
        tracing::info!("{} running, tick every {}ms", self.link.peer().id, tick_ms);

        loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    let now = self.clock.now();
                    let mut pool = self.pool.lock().await;
                    pool.tick(now);
                    self.publish(&pool);
                }
                _ = metrics_interval.tick() => {
                    self.metrics.report();
                }
                maybe = self.inbox.recv() => {
                    match maybe {
                        Some(envelope) => self.handle_message(envelope).await,
                        None => {
                            tracing::info!("{} inbox closed", self.link.peer().id);
                            break;
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    tracing::info!("{} shutting down", self.link.peer().id);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, envelope: Envelope) {
        let Envelope { from, message } = envelope;
        match message {
            Message::Version { version, .. } => {
                tracing::debug!("{} speaks protocol {}", from.id, version);
                self.link.send(from.id, &Message::Verack);
            }
            Message::Verack => {}
            Message::Ping { nonce } => self.link.send(from.id, &Message::Pong { nonce }),
            Message::Pong { .. } => {}
            Message::Inventory(txid) => {
                tracing::debug!("{} announced {}", from.id, hex::encode(txid));
            }
            Message::Mix(msg) => {
                let now = self.clock.now();
                let mut pool = self.pool.lock().await;
                pool.process_message(&from, msg, now);
                self.publish(&pool);
            }
        }
    }

    fn publish(&self, pool: &MixPool) {
        let snapshot = pool.snapshot();
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }
}
