//! Per-peer dial coordination.
//!
//! One worker task exists per peer being dialed. Callers send a
//! [`DialRequest`] and await a one-shot reply; concurrent callers coalesce
//! onto the same attempt and all observe the first success or one
//! aggregated failure.
//!
//! ## Worker loop
//!
//! ```text
//! request ──► reuse open connection, or rank addresses into a schedule
//! schedule ──► launch transport dials as their delay elapses
//! outcome ──► success: register, reply to every waiter, clear schedule
//!             failure: reschedule with quadratic backoff, or give the
//!                      address up after max_retries
//! all addresses exhausted ──► one DialError to every waiter
//! swarm shutdown ──► Closed to every waiter, in-flight dials aborted
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use multiaddr::Multiaddr;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{DialError, Error, Result};
use crate::identity::PeerId;
use crate::swarm::connection::Connection;
use crate::swarm::rank::rank_addresses;
use crate::swarm::SwarmInner;

/// One caller waiting on a dial
pub(crate) struct DialRequest {
    pub(crate) reply: oneshot::Sender<Result<Arc<Connection>>>,
}

/// Depth of a worker's request queue
const REQUEST_QUEUE: usize = 16;

/// Dialer-internal state of one candidate address
struct AddressDial {
    retries: u32,
    #[allow(dead_code)]
    created_at: Instant,
    scheduled_at: Instant,
    inflight: bool,
}

/// Start a worker for `peer` and hand back its request queue
pub(crate) fn spawn_worker(
    inner: Arc<SwarmInner>,
    peer: PeerId,
    generation: u64,
) -> mpsc::Sender<DialRequest> {
    let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
    tokio::spawn(async move {
        DialWorker {
            peer,
            inner: inner.clone(),
            tracked: HashMap::new(),
            inflight: FuturesUnordered::new(),
            waiters: Vec::new(),
            errors: DialError::default(),
        }
        .run(rx)
        .await;
        inner.remove_dialer(&peer, generation);
    });
    tx
}

struct DialWorker {
    peer: PeerId,
    inner: Arc<SwarmInner>,
    tracked: HashMap<Multiaddr, AddressDial>,
    inflight: FuturesUnordered<BoxFuture<'static, (Multiaddr, Result<Connection>)>>,
    waiters: Vec<oneshot::Sender<Result<Arc<Connection>>>>,
    errors: DialError,
}

impl DialWorker {
    async fn run(&mut self, mut rx: mpsc::Receiver<DialRequest>) {
        tracing::debug!(peer = %self.peer, "dial worker started");
        let shutdown = self.inner.shutdown.clone();
        let idle_timeout = self.inner.config.worker_idle_timeout;
        let mut rx_open = true;

        loop {
            let idle =
                self.waiters.is_empty() && self.inflight.is_empty() && self.tracked.is_empty();
            if idle && !rx_open {
                break;
            }
            let next_deadline = self
                .tracked
                .values()
                .filter(|dial| !dial.inflight)
                .map(|dial| dial.scheduled_at)
                .min();

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.reply_all(|| Err(Error::Closed));
                    break;
                }
                _ = tokio::time::sleep(idle_timeout), if idle && rx_open => {
                    break;
                }
                request = rx.recv(), if rx_open => match request {
                    None => rx_open = false,
                    Some(request) => self.handle_request(request).await,
                },
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(far_future)),
                    if next_deadline.is_some() =>
                {
                    self.launch_due_dials();
                }
                Some((addr, outcome)) = self.inflight.next() => {
                    self.handle_outcome(addr, outcome).await;
                }
            }
        }
        tracing::debug!(peer = %self.peer, "dial worker stopped");
    }

    /// Serve one caller: reuse an open connection or fold the caller into
    /// the current attempt, scheduling any addresses not yet tracked.
    async fn handle_request(&mut self, request: DialRequest) {
        if let Some(conn) = self.inner.connection_to(&self.peer) {
            let _ = request.reply.send(Ok(conn));
            return;
        }

        let addrs = match self.inner.peerstore.addresses(&self.peer).await {
            Ok(addrs) => addrs,
            Err(e) => {
                let _ = request.reply.send(Err(e));
                return;
            }
        };
        if addrs.is_empty() && self.tracked.is_empty() && self.inflight.is_empty() {
            let _ = request.reply.send(Err(Error::NoAddresses(self.peer)));
            return;
        }

        self.waiters.push(request.reply);

        let now = Instant::now();
        for candidate in rank_addresses(&addrs) {
            if self.tracked.contains_key(&candidate.address) {
                continue;
            }
            if self.inner.transport_for(&candidate.address).is_none() {
                self.errors
                    .push(candidate.address, "no transport for address".into());
                continue;
            }
            if !self
                .inner
                .gater
                .allow_dial(&self.peer, &candidate.address)
            {
                self.errors.push(candidate.address, "denied by gater".into());
                continue;
            }
            self.tracked.insert(
                candidate.address,
                AddressDial {
                    retries: 0,
                    created_at: now,
                    scheduled_at: now + candidate.delay,
                    inflight: false,
                },
            );
        }
        self.maybe_finish_failed();
    }

    /// Launch transport dials for every address whose delay elapsed
    fn launch_due_dials(&mut self) {
        let now = Instant::now();
        let due: Vec<Multiaddr> = self
            .tracked
            .iter()
            .filter(|(_, dial)| !dial.inflight && dial.scheduled_at <= now)
            .map(|(addr, _)| addr.clone())
            .collect();

        for addr in due {
            let Some(transport) = self.inner.transport_for(&addr) else {
                continue;
            };
            if let Some(dial) = self.tracked.get_mut(&addr) {
                dial.inflight = true;
            }
            let peer = self.peer;
            let timeout = self.inner.config.dial_timeout;
            tracing::debug!(peer = %peer, addr = %addr, "dialing");
            self.inflight.push(
                async move {
                    let outcome =
                        match tokio::time::timeout(timeout, transport.dial(peer, addr.clone()))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(Error::Timeout(format!("dial of {addr}"))),
                        };
                    (addr, outcome)
                }
                .boxed(),
            );
        }
    }

    async fn handle_outcome(&mut self, addr: Multiaddr, outcome: Result<Connection>) {
        match outcome {
            Ok(conn) => match self.inner.register_connection(conn).await {
                Ok(conn) => {
                    tracing::debug!(peer = %self.peer, addr = %addr, "dial succeeded");
                    self.tracked.clear();
                    self.errors = DialError::default();
                    let conn_for = conn.clone();
                    self.reply_all(move || Ok(conn_for.clone()));
                }
                Err(e) => {
                    // Gater/shutdown rejections are final for the address.
                    self.errors.push(addr.clone(), e.to_string());
                    self.tracked.remove(&addr);
                    self.maybe_finish_failed();
                }
            },
            Err(e) => {
                tracing::debug!(peer = %self.peer, addr = %addr, error = %e, "dial failed");
                self.handle_failure(addr, e);
            }
        }
    }

    /// Apply the retry policy to one failed address
    fn handle_failure(&mut self, addr: Multiaddr, error: Error) {
        let config = &self.inner.config;
        if let Some(dial) = self.tracked.get_mut(&addr) {
            dial.inflight = false;
            dial.retries += 1;
            if dial.retries >= config.max_retries {
                self.errors.push(addr.clone(), error.to_string());
                self.tracked.remove(&addr);
            } else {
                let backoff =
                    config.backoff_base + config.backoff_coeff * (dial.retries * dial.retries);
                dial.scheduled_at += backoff;
            }
        } else {
            self.errors.push(addr, error.to_string());
        }
        self.maybe_finish_failed();
    }

    /// Once nothing is scheduled or in flight anymore, fail all waiters
    /// with the aggregated error.
    fn maybe_finish_failed(&mut self) {
        if !self.tracked.is_empty() || !self.inflight.is_empty() || self.waiters.is_empty() {
            return;
        }
        let errors = std::mem::take(&mut self.errors);
        tracing::debug!(peer = %self.peer, %errors, "dial exhausted all addresses");
        self.reply_all(move || Err(Error::Dial(errors.clone())));
    }

    fn reply_all<F>(&mut self, mut outcome: F)
    where
        F: FnMut() -> Result<Arc<Connection>>,
    {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome());
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}
