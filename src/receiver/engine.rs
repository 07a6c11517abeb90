//! The reactor-side engine of a receiver.
//!
//! One engine task owns the link handle, the prefetch buffer, the pending
//! queue and the credit accumulator. Everything reaches it through two
//! channels: [`WorkOrder`]s from callers and timers, and [`LinkEvent`]s
//! from the AMQP engine. The task runs until the link reaches its terminal
//! state.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use fe2o3_amqp_types::definitions::{self, AmqpError, ReceiverSettleMode, SenderSettleMode};
use fe2o3_amqp_types::primitives::{Symbol, Value};
use serde_amqp::from_reader;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::constants::{
    MIN_TIMEOUT_DURATION, TOKEN_REFRESH_INTERVAL, TOKEN_VALIDITY, TRACKING_ID_PROPERTY,
};
use crate::endpoint::{
    AmqpDelivery, AmqpReceiverLink, AmqpSession, EndpointState, ReceivedMessage, ReceiverAttach,
};
use crate::error::{is_transient, unknown_transient_error, Error};
use crate::factory::MessagingFactory;
use crate::reactor::{LinkEndpointHandler, LinkEvent, ReactorHandle, Running, WorkOrder};
use crate::settings::ReceiverSettingsProvider;
use crate::timer::{TimeoutTracker, TimerHandle};
use crate::token::TokenManager;

use super::credit::CreditController;
use super::pending::{PendingQueue, PendingReceive, ReceiveResult};
use super::prefetch::PrefetchBuffer;
use super::state::LinkState;
use super::{LinkSnapshot, OpenRetryHook, ReceiverConfig, Shared};

pub(crate) struct ReceiverEngine {
    factory: Arc<dyn MessagingFactory>,
    settings: Arc<dyn ReceiverSettingsProvider>,
    shared: Arc<Shared>,
    reactor: ReactorHandle,

    name: String,
    path: String,
    token_audience: String,
    operation_timeout: Duration,
    on_open_retry: Option<OpenRetryHook>,

    link_state: LinkState,
    session: Option<Box<dyn AmqpSession>>,
    link: Option<Box<dyn AmqpReceiverLink>>,
    prefetched: PrefetchBuffer,
    pending: PendingQueue,
    credit: CreditController,
    last_received: Option<ReceivedMessage>,
    token_manager: TokenManager,

    open_work: Option<oneshot::Sender<Result<(), Error>>>,
    open_tracker: TimeoutTracker,
    open_timer: Option<TimerHandle>,
    open_retry_timer: Option<TimerHandle>,
    recreate_timer: Option<TimerHandle>,
    close_work: watch::Sender<Option<Result<(), Error>>>,
    close_timer: Option<TimerHandle>,
    operation_timer: Option<TimerHandle>,

    work_rx: UnboundedReceiver<WorkOrder>,
    event_tx: UnboundedSender<LinkEvent>,
    event_rx: UnboundedReceiver<LinkEvent>,
}

impl ReceiverEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        factory: Arc<dyn MessagingFactory>,
        config: ReceiverConfig,
        shared: Arc<Shared>,
        reactor: ReactorHandle,
        open_work: oneshot::Sender<Result<(), Error>>,
        close_work: watch::Sender<Option<Result<(), Error>>>,
        work_rx: UnboundedReceiver<WorkOrder>,
        event_tx: UnboundedSender<LinkEvent>,
        event_rx: UnboundedReceiver<LinkEvent>,
    ) -> Self {
        let operation_timeout = factory.operation_timeout();
        let token_audience = format!("amqp://{}/{}", factory.host_name(), config.path);

        Self {
            factory,
            settings: config.settings,
            shared,
            reactor,
            name: config.name,
            path: config.path,
            token_audience,
            operation_timeout,
            on_open_retry: config.on_open_retry,
            link_state: LinkState::Uninitialized,
            session: None,
            link: None,
            prefetched: PrefetchBuffer::default(),
            pending: PendingQueue::default(),
            credit: CreditController::default(),
            last_received: None,
            token_manager: TokenManager::new(TOKEN_REFRESH_INTERVAL),
            open_work: Some(open_work),
            open_tracker: TimeoutTracker::new(operation_timeout),
            open_timer: None,
            open_retry_timer: None,
            recreate_timer: None,
            close_work,
            close_timer: None,
            operation_timer: None,
            work_rx,
            event_tx,
            event_rx,
        }
    }

    /// Arm the open timer against the operation timeout.
    pub fn schedule_open_timeout(&mut self) {
        let remaining = self.open_tracker.remaining();
        self.open_timer = Some(self.reactor.dispatch_after(remaining, WorkOrder::OpenTimedOut));
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.event_loop())
    }

    async fn event_loop(mut self) {
        loop {
            let running = tokio::select! {
                order = self.work_rx.recv() => {
                    match order {
                        Some(order) => self.on_work_order(order),
                        None => Running::Stop,
                    }
                }
                event = self.event_rx.recv() => {
                    match event {
                        Some(event) => self.on_link_event(event),
                        None => Running::Stop,
                    }
                }
                _ = self.token_manager.tick() => self.on_token_refresh(),
            };

            if let Running::Stop = running {
                break;
            }
        }
    }

    fn on_work_order(&mut self, order: WorkOrder) -> Running {
        match order {
            WorkOrder::Receive(item) => self.on_receive_order(item),
            WorkOrder::CreateLink => self.create_receive_link(),
            WorkOrder::FlowDelta(delta) => self.send_flow(delta),
            WorkOrder::Close => self.on_close_order(),
            WorkOrder::Recreate => self.on_recreate(),
            WorkOrder::OperationTimedOut => self.on_operation_timed_out(),
            WorkOrder::OpenTimedOut => self.on_open_timed_out(),
            WorkOrder::CloseTimedOut => self.on_close_timed_out(),
            WorkOrder::SessionOpened(session) => self.on_session_open(session),
        }
        self.running_state()
    }

    fn on_link_event(&mut self, event: LinkEvent) -> Running {
        match event {
            LinkEvent::OpenComplete(error) => self.on_open_complete(error),
            LinkEvent::ReceiveComplete(delivery) => self.on_receive_complete(delivery),
            LinkEvent::Error(error) => self.on_link_error(error),
            LinkEvent::Close(condition) => self.on_link_error(condition),
        }
        self.running_state()
    }

    fn running_state(&self) -> Running {
        match self.link_state {
            LinkState::Closed => Running::Stop,
            _ => Running::Continue,
        }
    }

    // Pending receives and matching

    fn on_receive_order(&mut self, item: PendingReceive) {
        if self.pending.is_empty() {
            self.operation_timer = Some(
                self.reactor
                    .dispatch_after(item.remaining(), WorkOrder::OperationTimedOut),
            );
        }
        self.pending.push_back(item);
        self.create_and_receive();
    }

    fn create_and_receive(&mut self) {
        self.receive_work();
        if self.shared.is_closing_or_closed() {
            return;
        }
        if self.link_endpoint_closed() {
            self.create_receive_link();
        }
        self.publish_link_snapshot();
    }

    /// Match buffered messages against queued requests, strictly in enqueue
    /// order. A request that finds the buffer empty stays at the head of
    /// the queue until a delivery or its deadline arrives.
    fn receive_work(&mut self) {
        while !self.prefetched.is_empty() {
            let item = match self.pending.pop_live() {
                Some(item) => item,
                None => break,
            };
            let batch = self.receive_core(item.max_batch());
            item.complete(Ok(Some(batch)));
        }
    }

    fn receive_core(&mut self, max_batch: u32) -> Vec<ReceivedMessage> {
        let mut batch = Vec::new();
        while (batch.len() as u32) < max_batch {
            match self.poll_prefetch_queue() {
                Some(message) => batch.push(message),
                None => break,
            }
        }
        batch
    }

    // Messages leave the receiver only through this poll so that the
    // resume point and the credit owed stay consistent with what callers
    // actually saw.
    fn poll_prefetch_queue(&mut self) -> Option<ReceivedMessage> {
        let message = self.prefetched.pop()?;
        self.last_received = Some(message.clone());
        self.send_flow(1);
        Some(message)
    }

    fn on_operation_timed_out(&mut self) {
        self.operation_timer = None;
        loop {
            let remaining = match self.pending.head_remaining() {
                Some(remaining) => remaining,
                None => break,
            };
            if remaining <= MIN_TIMEOUT_DURATION {
                if let Some(item) = self.pending.pop_front() {
                    item.complete(Ok(None));
                }
            } else {
                self.operation_timer = Some(
                    self.reactor
                        .dispatch_after(remaining, WorkOrder::OperationTimedOut),
                );
                break;
            }
        }
    }

    fn drain_pending_receives(&mut self, error: Option<definitions::Error>) {
        let result: ReceiveResult = match &error {
            Some(error) if !is_transient(error) => Err(Error::Link(error.clone())),
            _ => Ok(None),
        };
        for item in self.pending.drain() {
            item.complete(result.clone());
        }
    }

    // Credit flow

    fn send_flow(&mut self, credits: i32) {
        self.credit.accrue(credits);
        if self.link_state != LinkState::Open {
            return;
        }
        let prefetch = self.shared.prefetch();
        if let Some(credits) = self.credit.take_flush(prefetch) {
            if let Some(link) = self.link.as_mut() {
                link.flow(credits);
                tracing::debug!(
                    path = %self.path,
                    link = %link.name(),
                    credit = link.credit(),
                    sent = credits,
                    "updated link credit",
                );
            }
        }
    }

    // Link lifecycle

    fn create_receive_link(&mut self) {
        if self.link_state == LinkState::Creating {
            return;
        }
        self.link_state = LinkState::Creating;

        let factory = Arc::clone(&self.factory);
        let shared = Arc::clone(&self.shared);
        let reactor = self.reactor.clone();
        let handler = LinkEndpointHandler::new(self.event_tx.clone());
        let audience = self.token_audience.clone();
        let path = self.path.clone();

        // Token send and session acquisition run off the reactor task; the
        // link itself is built back on it once the session is up.
        tokio::spawn(async move {
            let token = match factory.token_provider().get_token(&audience, TOKEN_VALIDITY) {
                Ok(token) => token,
                Err(error) => {
                    handler.on_error(Some(error));
                    return;
                }
            };
            if let Err(error) = factory.cbs_channel().send_token(token, &audience).await {
                handler.on_error(Some(error));
                return;
            }
            if shared.is_closing_or_closed() {
                return;
            }
            match factory.get_session(&path).await {
                Ok(session) => {
                    let _ = reactor.dispatch(WorkOrder::SessionOpened(session));
                }
                Err(error) => handler.on_error(Some(error)),
            }
        });
    }

    fn on_session_open(&mut self, mut session: Box<dyn AmqpSession>) {
        if self.shared.is_closing_or_closed() {
            session.close();
            return;
        }

        let attach = ReceiverAttach {
            name: self.name.clone(),
            address: self.path.clone(),
            filter: self.settings.filter(self.last_received.as_ref()),
            properties: self.settings.properties(),
            desired_capabilities: self.settings.desired_capabilities(),
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: ReceiverSettleMode::Second,
        };
        let handler = LinkEndpointHandler::new(self.event_tx.clone());

        match session.open_receiver(attach, handler) {
            Ok(link) => {
                self.factory.register_for_connection_error(link.name());
                self.link = Some(link);
                self.session = Some(session);
                self.publish_link_snapshot();
            }
            Err(error) => {
                self.session = Some(session);
                self.on_link_error(Some(error));
            }
        }
    }

    fn on_open_complete(&mut self, error: Option<definitions::Error>) {
        match error {
            None => {
                if self.shared.is_closing_or_closed() {
                    if let Some(link) = self.link.as_mut() {
                        link.close();
                    }
                    return;
                }

                self.link_state = LinkState::Open;
                if let Some(work) = self.open_work.take() {
                    let _ = work.send(Ok(()));
                    if let Some(timer) = self.open_timer.take() {
                        timer.cancel();
                    }
                }
                self.shared.clear_last_error();
                self.shared.mark_opened();
                self.factory
                    .retry_policy()
                    .reset_retry_count(self.factory.client_id());

                self.credit.reset();
                let initial = self.shared.prefetch() as i32 - self.prefetched.len() as i32;
                self.send_flow(initial);
                self.publish_link_snapshot();

                if let Some(link) = self.link.as_ref() {
                    tracing::info!(
                        path = %self.path,
                        link = %link.name(),
                        credit = link.credit(),
                        "receive link opened",
                    );
                }
            }
            Some(error) => {
                self.shared.record_last_error(error.clone());
                self.link_state = LinkState::Errored;

                if self.open_work.is_some() {
                    let remaining = self.open_tracker.remaining();
                    let retry = self.factory.retry_policy().next_retry_interval(
                        self.factory.client_id(),
                        &error,
                        remaining,
                    );
                    match retry {
                        Some(delay) => {
                            if let Some(hook) = self.on_open_retry.as_ref() {
                                hook();
                            }
                            self.open_retry_timer = Some(
                                self.reactor.dispatch_after(delay, WorkOrder::Recreate),
                            );
                        }
                        None if !is_transient(&error) => {
                            self.cancel_open(Error::Link(error));
                        }
                        None => {}
                    }
                }
            }
        }
    }

    fn on_receive_complete(&mut self, mut delivery: Box<dyn AmqpDelivery>) {
        let pending = delivery.pending();
        let mut buffer = BytesMut::zeroed(pending);
        let read = match self.link.as_mut() {
            Some(link) => link.recv(&mut buffer),
            None => return,
        };
        buffer.truncate(read);

        let message: ReceivedMessage = match from_reader::<
            fe2o3_amqp_types::messaging::message::__private::Deserializable<ReceivedMessage>,
        >(buffer.freeze().reader())
        {
            Ok(message) => message.0,
            Err(error) => {
                tracing::warn!(path = %self.path, error = %error, "failed to decode delivery");
                self.on_link_error(Some(definitions::Error::from(AmqpError::DecodeError)));
                return;
            }
        };
        delivery.settle();

        self.prefetched.push(message);
        self.factory
            .retry_policy()
            .reset_retry_count(self.factory.client_id());

        self.receive_work();
        self.publish_link_snapshot();
    }

    /// Single fan-out point for link failures. Updates the state machine,
    /// then either completes the close handshake, schedules a recreate or
    /// drains the queued receives.
    fn on_link_error(&mut self, error: Option<definitions::Error>) {
        self.prefetched.clear();
        if let Some(link) = self.link.as_ref() {
            self.factory.deregister_for_connection_error(link.name());
        }

        if self.shared.is_closing_or_closed() {
            if let Some(timer) = self.close_timer.take() {
                timer.cancel();
            }
            self.drain_pending_receives(error);
            self.set_closed_terminal();
            return;
        }

        if let Some(error) = &error {
            self.shared.record_last_error(error.clone());
        }
        let completion_error = error.unwrap_or_else(unknown_transient_error);

        self.on_open_complete(Some(completion_error.clone()));

        let retry = self.pending.head_remaining().and_then(|remaining| {
            self.factory.retry_policy().next_retry_interval(
                self.factory.client_id(),
                &completion_error,
                remaining,
            )
        });
        match retry {
            Some(delay) => {
                self.recreate_timer =
                    Some(self.reactor.dispatch_after(delay, WorkOrder::Recreate));
            }
            None => {
                self.drain_pending_receives(Some(completion_error.clone()));
                if !is_transient(&completion_error) {
                    self.cancel_open(Error::Link(completion_error));
                }
            }
        }
    }

    fn on_recreate(&mut self) {
        if self.shared.is_closing_or_closed() || !self.link_endpoint_closed() {
            return;
        }
        self.create_receive_link();
        self.factory
            .retry_policy()
            .increment_retry_count(self.factory.client_id());
    }

    fn link_endpoint_closed(&self) -> bool {
        match self.link.as_ref() {
            Some(link) => {
                link.local_state() == EndpointState::Closed
                    || link.remote_state() == EndpointState::Closed
            }
            None => true,
        }
    }

    // Open and close bookkeeping

    fn on_open_timed_out(&mut self) {
        if self.open_work.is_none() {
            return;
        }
        let cause = self.shared.last_error();
        tracing::warn!(path = %self.path, "open call timed out");
        let error = Error::OpenTimeout {
            path: self.path.clone(),
            cause,
        };
        if let Some(work) = self.open_work.take() {
            let _ = work.send(Err(error));
        }
        self.set_closed_terminal();
    }

    fn cancel_open(&mut self, error: Error) {
        if let Some(work) = self.open_work.take() {
            let _ = work.send(Err(error));
        }
        if let Some(timer) = self.open_timer.take() {
            timer.cancel();
        }
        self.set_closed_terminal();
    }

    fn on_close_order(&mut self) {
        self.token_manager.cancel();
        self.close_timer = Some(
            self.reactor
                .dispatch_after(self.operation_timeout, WorkOrder::CloseTimedOut),
        );

        let locally_open = self
            .link
            .as_ref()
            .map(|link| link.local_state() != EndpointState::Closed)
            .unwrap_or(false);
        if locally_open {
            self.link_state = LinkState::Closing;
            if let Some(link) = self.link.as_mut() {
                link.close();
            }
            return;
        }

        let remotely_closed = self
            .link
            .as_ref()
            .map(|link| link.remote_state() == EndpointState::Closed)
            .unwrap_or(true);
        if remotely_closed {
            if let Some(timer) = self.close_timer.take() {
                timer.cancel();
            }
            self.set_closed_terminal();
        }
    }

    fn on_close_timed_out(&mut self) {
        if self.close_work.borrow().is_some() {
            return;
        }
        let link = self
            .link
            .as_ref()
            .map(|link| link.name().to_string())
            .unwrap_or_else(|| self.name.clone());
        tracing::info!(path = %self.path, link = %link, "close call timed out");
        self.complete_close(Err(Error::CloseTimeout { link }));
        self.on_link_error(None);
    }

    fn set_closed_terminal(&mut self) {
        self.shared.mark_closing_or_closed();
        self.link_state = LinkState::Closed;
        self.token_manager.cancel();
        // A terminal link has no use for scheduled work; dropping the
        // handles aborts the timers.
        self.operation_timer.take();
        self.open_retry_timer.take();
        self.recreate_timer.take();
        // Anything still queued at this point was not drained by an error
        // path; it completes as if it had timed out.
        self.drain_pending_receives(None);
        drop(self.session.take());
        self.complete_close(Ok(()));
    }

    fn complete_close(&self, result: Result<(), Error>) {
        self.close_work.send_if_modified(|outcome| {
            if outcome.is_none() {
                *outcome = Some(result);
                true
            } else {
                false
            }
        });
    }

    // Token refresh

    fn on_token_refresh(&mut self) -> Running {
        let audience = self.token_audience.clone();
        let path = self.path.clone();
        let link = self
            .link
            .as_ref()
            .map(|link| link.name().to_string())
            .unwrap_or_default();
        let factory = Arc::clone(&self.factory);

        match factory.token_provider().get_token(&audience, TOKEN_VALIDITY) {
            Ok(token) => {
                tokio::spawn(async move {
                    match factory.cbs_channel().send_token(token, &audience).await {
                        Ok(()) => {
                            tracing::debug!(path = %path, link = %link, "token renewed");
                        }
                        Err(error) => {
                            tracing::info!(
                                path = %path,
                                link = %link,
                                error = ?error,
                                "token renewal failure",
                            );
                        }
                    }
                });
            }
            Err(error) => {
                tracing::info!(
                    path = %path,
                    link = %link,
                    error = ?error,
                    "token renewal schedule failure",
                );
            }
        }
        self.running_state()
    }

    // Cross-thread snapshot

    fn publish_link_snapshot(&self) {
        let snapshot = self.link.as_ref().map(|link| {
            let tracking_id = link.remote_properties().and_then(|properties| {
                properties
                    .get(&Symbol::from(TRACKING_ID_PROPERTY))
                    .map(|value| match value {
                        Value::String(id) => id.clone(),
                        other => format!("{:?}", other),
                    })
            });
            LinkSnapshot {
                name: link.name().to_string(),
                tracking_id,
                credit: link.credit(),
                buffered: self.prefetched.len(),
            }
        });
        self.shared.set_link_snapshot(snapshot);
    }
}
