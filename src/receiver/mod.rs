//! The asynchronous receiver facade.
//!
//! [`Receiver`] translates the event-driven callbacks of an AMQP reactor
//! into a pull-based async receive API. All link state lives on a dedicated
//! reactor task (see [`engine`]); the facade validates arguments, keeps a
//! small cross-thread snapshot current and forwards everything else as work
//! orders to that task. Every future handed to a caller completes exactly
//! once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fe2o3_amqp_types::definitions;
use tokio::sync::{mpsc, oneshot, watch};

use crate::endpoint::ReceivedMessage;
use crate::error::Error;
use crate::factory::MessagingFactory;
use crate::reactor::{ReactorHandle, WorkOrder};
use crate::settings::ReceiverSettingsProvider;
use crate::timer::TimeoutTracker;

pub(crate) mod engine;
pub(crate) mod pending;

mod credit;
mod prefetch;
mod state;

use engine::ReceiverEngine;
use pending::PendingReceive;

/// Hook invoked on the reactor task right before a scheduled open retry.
pub type OpenRetryHook = Arc<dyn Fn() + Send + Sync>;

/// Immutable construction parameters of a [`Receiver`].
#[derive(Clone)]
pub struct ReceiverConfig {
    /// Link name used on every attach
    pub name: String,
    /// Entity path the link reads from
    pub path: String,
    /// Initial prefetch count; must be positive
    pub prefetch: u32,
    /// Attach-time settings (filter, properties, capabilities)
    pub settings: Arc<dyn ReceiverSettingsProvider>,
    /// Invoked before every scheduled open retry
    pub on_open_retry: Option<OpenRetryHook>,
}

impl fmt::Debug for ReceiverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverConfig")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("prefetch", &self.prefetch)
            .finish()
    }
}

/// Diagnostic snapshot of the receiver, safe to capture from any thread.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Namespace host name
    pub host: String,
    /// Entity path
    pub path: String,
    /// Tracking id reported by the peer, falling back to the link name
    pub reference_id: Option<String>,
    /// Prefetch count, present once the link has opened
    pub prefetch: Option<u32>,
    /// Link credit currently extended to the peer, present once the link
    /// has opened
    pub credit: Option<u32>,
    /// Number of buffered messages, present once the link has opened
    pub buffered: Option<usize>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RCV[host: {}, path: {}", self.host, self.path)?;
        if let Some(reference_id) = &self.reference_id {
            write!(f, ", id: {}", reference_id)?;
        }
        if let Some(prefetch) = self.prefetch {
            write!(f, ", prefetch: {}", prefetch)?;
        }
        if let Some(credit) = self.credit {
            write!(f, ", credit: {}", credit)?;
        }
        if let Some(buffered) = self.buffered {
            write!(f, ", buffered: {}", buffered)?;
        }
        write!(f, "]")
    }
}

/// Link details mirrored out of the reactor task for cross-thread queries.
#[derive(Debug, Clone)]
pub(crate) struct LinkSnapshot {
    pub name: String,
    pub tracking_id: Option<String>,
    pub credit: u32,
    pub buffered: usize,
}

#[derive(Debug, Default)]
struct ErrorConditionState {
    last_error: Option<definitions::Error>,
    link: Option<LinkSnapshot>,
    opened: bool,
}

/// State shared between caller threads and the reactor task.
pub(crate) struct Shared {
    prefetch_count: Mutex<u32>,
    receive_timeout: Mutex<Duration>,
    error_condition: Mutex<ErrorConditionState>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Shared {
    fn new(prefetch: u32, receive_timeout: Duration) -> Self {
        Self {
            prefetch_count: Mutex::new(prefetch),
            receive_timeout: Mutex::new(receive_timeout),
            error_condition: Mutex::new(ErrorConditionState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn prefetch(&self) -> u32 {
        *lock(&self.prefetch_count)
    }

    /// Store the new prefetch count and return the signed delta against the
    /// previous value.
    fn swap_prefetch(&self, prefetch: u32) -> i32 {
        let mut guard = lock(&self.prefetch_count);
        let delta = i64::from(prefetch) - i64::from(*guard);
        *guard = prefetch;
        delta as i32
    }

    fn receive_timeout(&self) -> Duration {
        *lock(&self.receive_timeout)
    }

    fn set_receive_timeout(&self, timeout: Duration) {
        *lock(&self.receive_timeout) = timeout;
    }

    pub fn is_closing_or_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closing_or_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Flip into the closing state; true only for the first caller.
    fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn record_last_error(&self, error: definitions::Error) {
        lock(&self.error_condition).last_error = Some(error);
    }

    pub fn clear_last_error(&self) {
        lock(&self.error_condition).last_error = None;
    }

    pub fn last_error(&self) -> Option<definitions::Error> {
        lock(&self.error_condition).last_error.clone()
    }

    pub fn mark_opened(&self) {
        lock(&self.error_condition).opened = true;
    }

    pub fn set_link_snapshot(&self, snapshot: Option<LinkSnapshot>) {
        lock(&self.error_condition).link = snapshot;
    }

    fn link_context(&self) -> (bool, Option<LinkSnapshot>) {
        let guard = lock(&self.error_condition);
        (guard.opened, guard.link.clone())
    }
}

/// A single-link AMQP 1.0 message receiver.
///
/// Created with [`Receiver::create`], which resolves once the peer has
/// acknowledged the link attach. Safe to share across threads behind an
/// `Arc`; every method takes `&self`.
///
/// Dropping the receiver without calling [`close`](Self::close) starts a
/// best-effort graceful close in the background.
pub struct Receiver {
    name: String,
    path: String,
    host: String,
    shared: Arc<Shared>,
    reactor: ReactorHandle,
    close_rx: watch::Receiver<Option<Result<(), Error>>>,
}

impl Receiver {
    /// Create a receiver and open its link.
    ///
    /// The future resolves when the peer accepts the attach, and fails on a
    /// non-transient open error or when the factory's operation timeout
    /// elapses first.
    pub async fn create(
        factory: Arc<dyn MessagingFactory>,
        config: ReceiverConfig,
    ) -> Result<Self, Error> {
        if config.prefetch == 0 {
            return Err(Error::InvalidPrefetch);
        }

        let name = config.name.clone();
        let path = config.path.clone();
        let host = factory.host_name().to_string();
        let operation_timeout = factory.operation_timeout();
        let shared = Arc::new(Shared::new(config.prefetch, operation_timeout));

        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (open_work, opened) = oneshot::channel();
        let (close_work, close_rx) = watch::channel(None);
        let reactor = ReactorHandle::new(work_tx);

        let mut engine = ReceiverEngine::new(
            factory,
            config,
            Arc::clone(&shared),
            reactor.clone(),
            open_work,
            close_work,
            work_rx,
            event_tx,
            event_rx,
        );
        engine.schedule_open_timeout();
        let _ = reactor.dispatch(WorkOrder::CreateLink);
        let _ = engine.spawn();

        match opened.await {
            Ok(Ok(())) => Ok(Self {
                name,
                path,
                host,
                shared,
                reactor,
                close_rx,
            }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Error::Rejected),
        }
    }

    /// Link name used on every attach.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entity path the link reads from.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Receive up to `max_batch` messages.
    ///
    /// Completes with a non-empty batch in arrival order, with `Ok(None)`
    /// when the receive timeout elapses first, or with an error when the
    /// link has failed terminally. Requests are served strictly in call
    /// order.
    pub async fn receive(&self, max_batch: u32) -> Result<Option<Vec<ReceivedMessage>>, Error> {
        if self.shared.is_closing_or_closed() {
            return Err(Error::ReceiverClosed);
        }
        let prefetch = self.shared.prefetch();
        if max_batch == 0 || max_batch > prefetch {
            return Err(Error::InvalidMaxBatch { prefetch });
        }

        let (work, on_receive) = oneshot::channel();
        let tracker = TimeoutTracker::new(self.shared.receive_timeout());
        let item = PendingReceive::new(work, tracker, max_batch);
        if self.reactor.dispatch(WorkOrder::Receive(item)).is_err() {
            return Err(Error::Rejected);
        }

        match on_receive.await {
            Ok(result) => result,
            Err(_) => Err(Error::ReceiverClosed),
        }
    }

    /// Current prefetch count.
    pub fn prefetch(&self) -> u32 {
        self.shared.prefetch()
    }

    /// Update the prefetch count.
    ///
    /// The credit adjustment takes effect on the reactor task no later than
    /// the next credit flush; it is not synchronous from the caller's point
    /// of view. A decrease never retracts credit already granted.
    pub fn set_prefetch(&self, prefetch: u32) -> Result<(), Error> {
        if prefetch == 0 {
            return Err(Error::InvalidPrefetch);
        }
        let delta = self.shared.swap_prefetch(prefetch);
        self.reactor
            .dispatch(WorkOrder::FlowDelta(delta))
            .map_err(|_| Error::Rejected)
    }

    /// Timeout applied to each [`receive`](Self::receive) call.
    pub fn receive_timeout(&self) -> Duration {
        self.shared.receive_timeout()
    }

    /// Set the timeout applied to subsequent [`receive`](Self::receive)
    /// calls. Zero durations are rejected.
    pub fn set_receive_timeout(&self, timeout: Duration) -> Result<(), Error> {
        if timeout.is_zero() {
            return Err(Error::InvalidReceiveTimeout);
        }
        self.shared.set_receive_timeout(timeout);
        Ok(())
    }

    /// Close the receiver.
    ///
    /// Idempotent: the first call starts a graceful detach; every call
    /// resolves with the same outcome once the peer confirms the detach,
    /// the operation timeout elapses, or an error intervenes.
    pub async fn close(&self) -> Result<(), Error> {
        if self.shared.begin_close() && self.reactor.dispatch(WorkOrder::Close).is_err() {
            return Err(Error::Rejected);
        }

        let mut close_rx = self.close_rx.clone();
        let outcome = close_rx.wait_for(|outcome| outcome.is_some()).await;
        match outcome {
            Ok(outcome) => match &*outcome {
                Some(result) => result.clone(),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }

    /// Diagnostic snapshot for error reporting.
    pub fn error_context(&self) -> ErrorContext {
        let prefetch = self.shared.prefetch();
        let (opened, link) = self.shared.link_context();
        ErrorContext {
            host: self.host.clone(),
            path: self.path.clone(),
            reference_id: link
                .as_ref()
                .map(|link| link.tracking_id.clone().unwrap_or_else(|| link.name.clone())),
            prefetch: opened.then_some(prefetch),
            credit: if opened {
                link.as_ref().map(|link| link.credit)
            } else {
                None
            },
            buffered: if opened {
                link.as_ref().map(|link| link.buffered)
            } else {
                None
            },
        }
    }
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("host", &self.host)
            .finish()
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        if self.shared.begin_close() {
            let _ = self.reactor.dispatch(WorkOrder::Close);
        }
    }
}
