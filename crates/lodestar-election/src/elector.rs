//! The election state machine.
//!
//! ```text
//!            +-----------+   leader    +---------+
//!  start --> | detecting | ----------> | leading |
//!            +-----------+             +---------+
//!               ^    |  follower            |
//!               |    v                      |
//!               | +-----------+             |
//!               +-| following |             |
//!     reelection  +-----------+  <----------+ reelection
//! ```
//!
//! The loop runs in one spawned task and never ends on its own except for
//! a fatal error during detection. Recoverable errors are retried after
//! the backoff delay; they show up in the logs, never as events.
//!
//! A [`Strategy`] decides how membership is observed and how the loss of
//! a leader is noticed. The elector only sequences the calls: exactly one
//! strategy call is in flight at any time, and every role's resources are
//! released through [`Strategy::stand_down`] before the next detection
//! starts.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::event::{ElectionEvent, Role};
use crate::ElectionError;

/// Default capacity of the event channel.
const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Pluggable membership and failure detection.
#[async_trait]
pub trait Strategy: Send + 'static {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// One-time setup before the first detection. An error here halts the
    /// loop regardless of its class.
    async fn prepare(&mut self) -> Result<(), ElectionError> {
        Ok(())
    }

    /// Looks at the current membership and decides whether this instance
    /// should lead.
    async fn detect(&mut self) -> Result<bool, ElectionError>;

    /// Takes up leader duties. An error means this instance cannot serve
    /// as leader and a re-election follows immediately.
    async fn lead(&mut self) -> Result<(), ElectionError>;

    /// Resolves once this instance should stop being leader.
    async fn hold(&mut self) -> Result<(), ElectionError>;

    /// Resolves once the current leader is gone, or its liveness can no
    /// longer be established.
    async fn follow(&mut self) -> Result<(), ElectionError>;

    /// Releases everything acquired for the previous role.
    async fn stand_down(&mut self);

    /// Retry delays for a strategy that runs on its own cadence. `None`
    /// uses the elector's configured policy.
    fn retry_policy(&self) -> Option<BackoffPolicy> {
        None
    }
}

/// Settings shared by every strategy.
#[derive(Debug, Clone)]
pub struct ElectorConfig {
    /// Delays applied after recoverable errors.
    pub backoff: BackoffPolicy,
    /// Capacity of the event channel. The loop waits for the consumer
    /// when it is full.
    pub event_capacity: usize,
}

impl Default for ElectorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Runs one strategy through the detect/lead/follow cycle.
///
/// Events are delivered through the receiver returned by
/// [`Elector::new`]. The channel closes when the loop halts.
pub struct Elector<S: Strategy> {
    cycle: Option<Cycle<S>>,
    task: Option<JoinHandle<()>>,
    role_rx: watch::Receiver<Role>,
}

impl<S: Strategy> std::fmt::Debug for Elector<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Elector")
            .field("started", &self.task.is_some())
            .field("role", &*self.role_rx.borrow())
            .finish_non_exhaustive()
    }
}

impl<S: Strategy> Elector<S> {
    /// Creates an elector. Nothing happens until [`Elector::start`].
    pub fn new(strategy: S, config: ElectorConfig) -> (Self, mpsc::Receiver<ElectionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (role_tx, role_rx) = watch::channel(Role::Undetermined);

        let cycle = Cycle {
            strategy,
            backoff: config.backoff,
            events: event_tx,
            role: role_tx,
        };

        let elector = Self {
            cycle: Some(cycle),
            task: None,
            role_rx,
        };
        (elector, event_rx)
    }

    /// Starts the election loop on the current tokio runtime.
    ///
    /// Returns `false` if the loop was already started; a second call
    /// never creates a second cycle.
    pub fn start(&mut self) -> bool {
        let Some(cycle) = self.cycle.take() else {
            debug!("elector already started");
            return false;
        };
        info!(strategy = cycle.strategy.name(), "starting election");
        self.task = Some(tokio::spawn(cycle.run()));
        true
    }

    /// Returns the role currently held.
    pub fn role(&self) -> Role {
        *self.role_rx.borrow()
    }

    /// Returns a watcher that observes role changes.
    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.role_rx.clone()
    }

    /// Returns true if the loop has been started and has since halted.
    pub fn is_halted(&self) -> bool {
        self.task.as_ref().is_some_and(|t| t.is_finished())
    }

    /// Stops the loop and releases everything the current role holds.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // a cancelled task is the expected outcome here
            let _ = task.await;
        }
    }
}

impl<S: Strategy> Drop for Elector<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// State owned by the running loop.
struct Cycle<S> {
    strategy: S,
    backoff: BackoffPolicy,
    events: mpsc::Sender<ElectionEvent>,
    role: watch::Sender<Role>,
}

impl<S: Strategy> Cycle<S> {
    async fn run(mut self) {
        if let Err(e) = self.strategy.prepare().await {
            error!("election setup failed: {e}");
            self.emit(ElectionEvent::Error(Arc::new(e))).await;
            return;
        }

        loop {
            let leader = match self.detect().await {
                Ok(leader) => leader,
                Err(e) => {
                    error!("election halted: {e}");
                    self.emit(ElectionEvent::Error(Arc::new(e))).await;
                    return;
                }
            };

            if leader {
                self.lead().await;
            } else {
                self.follow().await;
            }

            // the previous role's timers and sockets go away before the
            // next detection can start new ones
            self.strategy.stand_down().await;
            self.role.send_replace(Role::Undetermined);
            self.emit(ElectionEvent::Reelection).await;
        }
    }

    /// Detects until a verdict is reached, backing off on recoverable
    /// errors. Only a fatal error comes back as `Err`.
    async fn detect(&mut self) -> Result<bool, ElectionError> {
        let mut attempt = 0u32;
        loop {
            match self.strategy.detect().await {
                Ok(leader) => return Ok(leader),
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let Some(delay) = self.policy().delay_for(&e, attempt) else {
                        return Err(e);
                    };
                    warn!(
                        attempt,
                        class = %e.class(),
                        delay = ?delay,
                        "detection failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn lead(&mut self) {
        if let Err(e) = self.strategy.lead().await {
            warn!("cannot serve as leader, restarting election: {e}");
            self.emit(ElectionEvent::Error(Arc::new(e))).await;
            return;
        }

        info!("elected leader");
        self.role.send_replace(Role::Leader);
        self.emit(ElectionEvent::Leader).await;

        match self.strategy.hold().await {
            Ok(()) => info!("stepping down as leader"),
            Err(e) if e.is_fatal() => {
                warn!("leadership ended: {e}");
                self.emit(ElectionEvent::Error(Arc::new(e))).await;
            }
            Err(e) => warn!("leadership ended: {e}"),
        }
    }

    async fn follow(&mut self) {
        info!("following");
        self.role.send_replace(Role::Follower);
        self.emit(ElectionEvent::Follower).await;

        match self.strategy.follow().await {
            Ok(()) => info!("leader is gone"),
            Err(e) => match self.policy().delay_for(&e, 1) {
                // not knowing whether the leader lives is resolved by
                // detecting again, after the usual wait
                Some(delay) => {
                    warn!(delay = ?delay, "lost track of leader: {e}");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!("lost track of leader: {e}");
                    self.emit(ElectionEvent::Error(Arc::new(e))).await;
                }
            },
        }
    }

    fn policy(&self) -> BackoffPolicy {
        self.strategy.retry_policy().unwrap_or(self.backoff)
    }

    async fn emit(&mut self, event: ElectionEvent) {
        let name = event.name();
        if self.events.send(event).await.is_err() {
            debug!(event = name, "event receiver dropped");
        }
    }
}
