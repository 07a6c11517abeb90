//! End-to-end receiver scenarios over a scripted AMQP engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fe2o3_amqp_types::definitions::{self, AmqpError, Fields, LinkError};
use fe2o3_amqp_types::messaging::{AmqpValue, Body, FilterSet, Message};
use fe2o3_amqp_types::primitives::{Symbol, Value};

use hublink::endpoint::{
    AmqpDelivery, AmqpReceiverLink, AmqpSession, EndpointState, ReceivedMessage, ReceiverAttach,
};
use hublink::factory::MessagingFactory;
use hublink::retry::RetryPolicy;
use hublink::settings::ReceiverSettingsProvider;
use hublink::token::{CbsChannel, CbsToken, TokenProvider};
use hublink::{Error, LinkEndpointHandler, Receiver, ReceiverConfig};

fn message(text: &str) -> ReceivedMessage {
    Message {
        header: None,
        delivery_annotations: None,
        message_annotations: None,
        properties: None,
        application_properties: None,
        body: Body::Value(AmqpValue(Value::String(text.to_string()))),
        footer: None,
    }
}

fn text(message: &ReceivedMessage) -> &str {
    match &message.body {
        Body::Value(AmqpValue(Value::String(text))) => text,
        other => panic!("unexpected body {:?}", other),
    }
}

fn encode(text: &str) -> Vec<u8> {
    serde_amqp::to_vec(&fe2o3_amqp_types::messaging::message::__private::Serializable(
        message(text),
    ))
    .expect("message encoding")
}

/// Give the reactor task a chance to drain its channels.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

struct LinkRig {
    handler: Mutex<Option<LinkEndpointHandler>>,
    payloads: Mutex<VecDeque<Vec<u8>>>,
    flows: Mutex<Vec<u32>>,
    credit: AtomicU32,
    local: Mutex<EndpointState>,
    remote: Mutex<EndpointState>,
    settled: AtomicUsize,
    attaches: AtomicUsize,
    ack_attach: AtomicBool,
    ack_close: AtomicBool,
    fail_first_attach: Mutex<Option<definitions::Error>>,
}

impl LinkRig {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(None),
            payloads: Mutex::new(VecDeque::new()),
            flows: Mutex::new(Vec::new()),
            credit: AtomicU32::new(0),
            local: Mutex::new(EndpointState::Uninitialized),
            remote: Mutex::new(EndpointState::Uninitialized),
            settled: AtomicUsize::new(0),
            attaches: AtomicUsize::new(0),
            ack_attach: AtomicBool::new(true),
            ack_close: AtomicBool::new(true),
            fail_first_attach: Mutex::new(None),
        })
    }

    fn handler(&self) -> LinkEndpointHandler {
        self.handler
            .lock()
            .unwrap()
            .clone()
            .expect("link not attached yet")
    }

    fn deliver(self: &Arc<Self>, text: &str) {
        let payload = encode(text);
        let pending = payload.len();
        self.payloads.lock().unwrap().push_back(payload);
        self.handler().on_receive_complete(Box::new(RigDelivery {
            pending,
            rig: Arc::clone(self),
        }));
    }

    fn fail(&self, error: definitions::Error) {
        *self.local.lock().unwrap() = EndpointState::Closed;
        *self.remote.lock().unwrap() = EndpointState::Closed;
        self.handler().on_error(Some(error));
    }

    fn flows(&self) -> Vec<u32> {
        self.flows.lock().unwrap().clone()
    }
}

struct RigDelivery {
    pending: usize,
    rig: Arc<LinkRig>,
}

impl AmqpDelivery for RigDelivery {
    fn pending(&self) -> usize {
        self.pending
    }

    fn settle(&mut self) {
        self.rig.settled.fetch_add(1, Ordering::SeqCst);
    }
}

struct RigLink {
    rig: Arc<LinkRig>,
    name: String,
}

impl AmqpReceiverLink for RigLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn flow(&mut self, credits: u32) {
        self.rig.flows.lock().unwrap().push(credits);
        self.rig.credit.fetch_add(credits, Ordering::SeqCst);
    }

    fn credit(&self) -> u32 {
        self.rig.credit.load(Ordering::SeqCst)
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        let payload = self
            .rig
            .payloads
            .lock()
            .unwrap()
            .pop_front()
            .expect("no payload pending");
        buf[..payload.len()].copy_from_slice(&payload);
        payload.len()
    }

    fn local_state(&self) -> EndpointState {
        *self.rig.local.lock().unwrap()
    }

    fn remote_state(&self) -> EndpointState {
        *self.rig.remote.lock().unwrap()
    }

    fn remote_properties(&self) -> Option<Fields> {
        None
    }

    fn close(&mut self) {
        *self.rig.local.lock().unwrap() = EndpointState::Closed;
        if self.rig.ack_close.load(Ordering::SeqCst) {
            *self.rig.remote.lock().unwrap() = EndpointState::Closed;
            self.rig.handler().on_close(None);
        }
    }
}

struct RigSession {
    rig: Arc<LinkRig>,
}

impl AmqpSession for RigSession {
    fn open_receiver(
        &mut self,
        attach: ReceiverAttach,
        handler: LinkEndpointHandler,
    ) -> Result<Box<dyn AmqpReceiverLink>, definitions::Error> {
        self.rig.attaches.fetch_add(1, Ordering::SeqCst);
        *self.rig.handler.lock().unwrap() = Some(handler.clone());
        *self.rig.local.lock().unwrap() = EndpointState::Active;
        *self.rig.remote.lock().unwrap() = EndpointState::Uninitialized;
        self.rig.credit.store(0, Ordering::SeqCst);

        if let Some(error) = self.rig.fail_first_attach.lock().unwrap().take() {
            *self.rig.local.lock().unwrap() = EndpointState::Closed;
            *self.rig.remote.lock().unwrap() = EndpointState::Closed;
            handler.on_open_complete(Some(error));
        } else if self.rig.ack_attach.load(Ordering::SeqCst) {
            *self.rig.remote.lock().unwrap() = EndpointState::Active;
            handler.on_open_complete(None);
        }

        Ok(Box::new(RigLink {
            rig: Arc::clone(&self.rig),
            name: attach.name,
        }))
    }

    fn close(&mut self) {}
}

#[derive(Default)]
struct RigRetryPolicy {
    delay: Mutex<Option<Duration>>,
    increments: AtomicUsize,
    resets: AtomicUsize,
}

impl RetryPolicy for RigRetryPolicy {
    fn next_retry_interval(
        &self,
        _client_id: &str,
        _error: &definitions::Error,
        _remaining_time: Duration,
    ) -> Option<Duration> {
        *self.delay.lock().unwrap()
    }

    fn increment_retry_count(&self, _client_id: &str) {
        self.increments.fetch_add(1, Ordering::SeqCst);
    }

    fn reset_retry_count(&self, _client_id: &str) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RigTokenProvider {
    issued: AtomicUsize,
}

impl TokenProvider for RigTokenProvider {
    fn get_token(
        &self,
        audience: &str,
        _validity: Duration,
    ) -> Result<CbsToken, definitions::Error> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        Ok(CbsToken::new(
            audience,
            "unit-token",
            "servicebus.windows.net:sastoken",
            None,
        ))
    }
}

#[derive(Default)]
struct RigCbsChannel {
    sent: AtomicUsize,
}

#[async_trait]
impl CbsChannel for RigCbsChannel {
    async fn send_token(
        &self,
        _token: CbsToken,
        _audience: &str,
    ) -> Result<(), definitions::Error> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct RigSettings {
    filter_calls: AtomicUsize,
    saw_last_received: AtomicBool,
}

impl ReceiverSettingsProvider for RigSettings {
    fn filter(&self, last_received: Option<&ReceivedMessage>) -> Option<FilterSet> {
        self.filter_calls.fetch_add(1, Ordering::SeqCst);
        if last_received.is_some() {
            self.saw_last_received.store(true, Ordering::SeqCst);
        }
        None
    }

    fn properties(&self) -> Option<Fields> {
        None
    }

    fn desired_capabilities(&self) -> Option<Vec<Symbol>> {
        None
    }
}

struct RigFactory {
    rig: Arc<LinkRig>,
    retry: RigRetryPolicy,
    tokens: RigTokenProvider,
    cbs: RigCbsChannel,
    operation_timeout: Duration,
    registered: Mutex<Vec<String>>,
    deregistered: Mutex<Vec<String>>,
}

impl RigFactory {
    fn new(rig: Arc<LinkRig>, operation_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            rig,
            retry: RigRetryPolicy::default(),
            tokens: RigTokenProvider::default(),
            cbs: RigCbsChannel::default(),
            operation_timeout,
            registered: Mutex::new(Vec::new()),
            deregistered: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MessagingFactory for RigFactory {
    fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    fn host_name(&self) -> &str {
        "unit.servicebus.example"
    }

    fn client_id(&self) -> &str {
        "unit-client"
    }

    fn retry_policy(&self) -> &dyn RetryPolicy {
        &self.retry
    }

    fn token_provider(&self) -> &dyn TokenProvider {
        &self.tokens
    }

    fn cbs_channel(&self) -> &dyn CbsChannel {
        &self.cbs
    }

    async fn get_session(
        &self,
        _path: &str,
    ) -> Result<Box<dyn AmqpSession>, definitions::Error> {
        Ok(Box::new(RigSession {
            rig: Arc::clone(&self.rig),
        }))
    }

    fn register_for_connection_error(&self, link_name: &str) {
        self.registered.lock().unwrap().push(link_name.to_string());
    }

    fn deregister_for_connection_error(&self, link_name: &str) {
        self.deregistered.lock().unwrap().push(link_name.to_string());
    }
}

struct TestRig {
    link: Arc<LinkRig>,
    factory: Arc<RigFactory>,
    settings: Arc<RigSettings>,
}

fn rig() -> TestRig {
    rig_with_timeout(Duration::from_secs(60))
}

fn rig_with_timeout(operation_timeout: Duration) -> TestRig {
    let link = LinkRig::new();
    TestRig {
        factory: RigFactory::new(Arc::clone(&link), operation_timeout),
        link,
        settings: Arc::new(RigSettings::default()),
    }
}

fn config(rig: &TestRig, prefetch: u32) -> ReceiverConfig {
    let settings: Arc<dyn ReceiverSettingsProvider> = Arc::clone(&rig.settings) as Arc<_>;
    ReceiverConfig {
        name: "unit-receiver".to_string(),
        path: "unit-hub/ConsumerGroups/$default/Partitions/0".to_string(),
        prefetch,
        settings,
        on_open_retry: None,
    }
}

fn factory(rig: &TestRig) -> Arc<dyn MessagingFactory> {
    Arc::clone(&rig.factory) as Arc<_>
}

async fn open_receiver(rig: &TestRig, prefetch: u32) -> Receiver {
    Receiver::create(factory(rig), config(rig, prefetch))
        .await
        .expect("receiver open")
}

#[tokio::test]
async fn create_opens_link_and_issues_initial_credit() {
    let rig = rig();
    let receiver = open_receiver(&rig, 10).await;

    assert_eq!(rig.link.attaches.load(Ordering::SeqCst), 1);
    assert_eq!(rig.link.flows(), vec![10]);
    assert_eq!(
        rig.factory.registered.lock().unwrap().as_slice(),
        ["unit-receiver"]
    );
    assert!(rig.factory.tokens.issued.load(Ordering::SeqCst) >= 1);
    assert!(rig.factory.cbs.sent.load(Ordering::SeqCst) >= 1);
    assert!(rig.factory.retry.resets.load(Ordering::SeqCst) >= 1);
    assert_eq!(rig.settings.filter_calls.load(Ordering::SeqCst), 1);

    receiver.close().await.expect("close");
}

#[tokio::test]
async fn receive_drains_buffered_messages_in_order() {
    let rig = rig();
    let receiver = open_receiver(&rig, 10).await;

    rig.link.deliver("m1");
    rig.link.deliver("m2");
    rig.link.deliver("m3");
    settle().await;

    let batch = receiver.receive(5).await.expect("receive").expect("batch");
    let texts: Vec<&str> = batch.iter().map(text).collect();
    assert_eq!(texts, ["m1", "m2", "m3"]);
    assert_eq!(rig.link.settled.load(Ordering::SeqCst), 3);

    receiver.close().await.expect("close");
}

#[tokio::test]
async fn receive_completes_on_first_arrival() {
    let rig = rig();
    let receiver = Arc::new(open_receiver(&rig, 10).await);

    let pending = {
        let receiver = Arc::clone(&receiver);
        tokio::spawn(async move { receiver.receive(5).await })
    };
    settle().await;

    rig.link.deliver("only");
    let batch = pending
        .await
        .expect("join")
        .expect("receive")
        .expect("batch");
    assert_eq!(batch.len(), 1);
    assert_eq!(text(&batch[0]), "only");

    receiver.close().await.expect("close");
}

#[tokio::test(start_paused = true)]
async fn receive_times_out_with_null_batch() {
    let rig = rig();
    let receiver = Arc::new(open_receiver(&rig, 10).await);
    receiver
        .set_receive_timeout(Duration::from_secs(1))
        .expect("set timeout");

    let first = {
        let receiver = Arc::clone(&receiver);
        tokio::spawn(async move { receiver.receive(1).await })
    };
    let second = {
        let receiver = Arc::clone(&receiver);
        tokio::spawn(async move { receiver.receive(1).await })
    };

    assert!(matches!(first.await.expect("join"), Ok(None)));
    assert!(matches!(second.await.expect("join"), Ok(None)));

    receiver.close().await.expect("close");
}

#[tokio::test]
async fn receive_rejects_out_of_range_batch_sizes() {
    let rig = rig();
    let receiver = open_receiver(&rig, 10).await;

    assert!(matches!(
        receiver.receive(0).await,
        Err(Error::InvalidMaxBatch { prefetch: 10 })
    ));
    assert!(matches!(
        receiver.receive(11).await,
        Err(Error::InvalidMaxBatch { prefetch: 10 })
    ));

    receiver.close().await.expect("close");
}

#[tokio::test]
async fn accessors_round_trip_and_validate() {
    let rig = rig();
    let receiver = open_receiver(&rig, 10).await;

    assert_eq!(receiver.prefetch(), 10);
    assert_eq!(receiver.receive_timeout(), Duration::from_secs(60));

    receiver
        .set_receive_timeout(Duration::from_secs(5))
        .expect("set timeout");
    assert_eq!(receiver.receive_timeout(), Duration::from_secs(5));
    assert!(matches!(
        receiver.set_receive_timeout(Duration::ZERO),
        Err(Error::InvalidReceiveTimeout)
    ));

    assert!(matches!(
        receiver.set_prefetch(0),
        Err(Error::InvalidPrefetch)
    ));
    receiver.set_prefetch(20).expect("set prefetch");
    assert_eq!(receiver.prefetch(), 20);

    receiver.close().await.expect("close");
}

#[tokio::test]
async fn polling_replenishes_credit_in_batches() {
    let rig = rig();
    let receiver = open_receiver(&rig, 4).await;
    assert_eq!(rig.link.flows(), vec![4]);

    for name in ["m1", "m2", "m3", "m4"] {
        rig.link.deliver(name);
    }
    settle().await;

    for _ in 0..4 {
        let batch = receiver.receive(1).await.expect("receive").expect("batch");
        assert_eq!(batch.len(), 1);
    }
    settle().await;

    assert_eq!(rig.link.flows(), vec![4, 4]);

    receiver.close().await.expect("close");
}

#[tokio::test]
async fn raising_the_prefetch_flushes_the_delta() {
    let rig = rig();
    let receiver = open_receiver(&rig, 10).await;
    assert_eq!(rig.link.flows(), vec![10]);

    receiver.set_prefetch(110).expect("set prefetch");
    settle().await;

    assert_eq!(receiver.prefetch(), 110);
    assert_eq!(rig.link.flows(), vec![10, 100]);

    receiver.close().await.expect("close");
}

#[tokio::test(start_paused = true)]
async fn transient_error_recreates_the_link_and_resumes() {
    let rig = rig();
    *rig.factory.retry.delay.lock().unwrap() = Some(Duration::from_millis(200));
    let receiver = Arc::new(open_receiver(&rig, 10).await);
    receiver
        .set_receive_timeout(Duration::from_secs(30))
        .expect("set timeout");

    // Consume one message so the replacement link has a resume point.
    rig.link.deliver("seed");
    settle().await;
    let seed = receiver.receive(1).await.expect("receive").expect("batch");
    assert_eq!(text(&seed[0]), "seed");

    let pending = {
        let receiver = Arc::clone(&receiver);
        tokio::spawn(async move { receiver.receive(1).await })
    };
    settle().await;

    rig.link
        .fail(definitions::Error::from(LinkError::DetachForced));
    settle().await;
    assert_eq!(rig.link.attaches.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    settle().await;
    assert_eq!(rig.link.attaches.load(Ordering::SeqCst), 2);
    assert_eq!(rig.factory.retry.increments.load(Ordering::SeqCst), 1);
    assert!(rig.settings.saw_last_received.load(Ordering::SeqCst));

    rig.link.deliver("recovered");
    let batch = pending
        .await
        .expect("join")
        .expect("receive")
        .expect("batch");
    assert_eq!(text(&batch[0]), "recovered");

    receiver.close().await.expect("close");
}

#[tokio::test]
async fn non_transient_error_fails_pending_receives_and_closes() {
    let rig = rig();
    let receiver = Arc::new(open_receiver(&rig, 10).await);
    receiver
        .set_receive_timeout(Duration::from_secs(30))
        .expect("set timeout");

    let mut pending = Vec::new();
    for _ in 0..3 {
        let receiver = Arc::clone(&receiver);
        pending.push(tokio::spawn(async move { receiver.receive(1).await }));
    }
    settle().await;

    rig.link
        .fail(definitions::Error::from(AmqpError::UnauthorizedAccess));

    for handle in pending {
        assert!(matches!(handle.await.expect("join"), Err(Error::Link(_))));
    }
    assert!(matches!(
        receiver.receive(1).await,
        Err(Error::ReceiverClosed)
    ));
    assert_eq!(
        rig.factory.deregistered.lock().unwrap().as_slice(),
        ["unit-receiver"]
    );
    assert!(matches!(receiver.close().await, Ok(())));
}

#[tokio::test(start_paused = true)]
async fn open_times_out_when_attach_is_never_acknowledged() {
    let rig = rig_with_timeout(Duration::from_secs(2));
    rig.link.ack_attach.store(false, Ordering::SeqCst);

    let result = Receiver::create(factory(&rig), config(&rig, 10)).await;

    assert!(matches!(result, Err(Error::OpenTimeout { .. })));
}

#[tokio::test(start_paused = true)]
async fn open_retries_after_a_transient_attach_failure() {
    let rig = rig();
    *rig.factory.retry.delay.lock().unwrap() = Some(Duration::from_millis(50));
    *rig.link.fail_first_attach.lock().unwrap() =
        Some(definitions::Error::from(LinkError::DetachForced));

    let retried = Arc::new(AtomicBool::new(false));
    let mut config = config(&rig, 10);
    let flag = Arc::clone(&retried);
    config.on_open_retry = Some(Arc::new(move || {
        flag.store(true, Ordering::SeqCst);
    }));

    let receiver = Receiver::create(factory(&rig), config)
        .await
        .expect("receiver open after retry");

    assert!(retried.load(Ordering::SeqCst));
    assert_eq!(rig.link.attaches.load(Ordering::SeqCst), 2);
    assert_eq!(rig.factory.retry.increments.load(Ordering::SeqCst), 1);

    receiver.close().await.expect("close");
}

#[tokio::test]
async fn close_drains_pending_receives_with_null() {
    let rig = rig();
    let receiver = Arc::new(open_receiver(&rig, 10).await);
    receiver
        .set_receive_timeout(Duration::from_secs(30))
        .expect("set timeout");

    let mut pending = Vec::new();
    for _ in 0..2 {
        let receiver = Arc::clone(&receiver);
        pending.push(tokio::spawn(async move { receiver.receive(1).await }));
    }
    settle().await;

    receiver.close().await.expect("close");
    for handle in pending {
        assert!(matches!(handle.await.expect("join"), Ok(None)));
    }

    // Idempotent: a second close resolves with the same outcome.
    receiver.close().await.expect("second close");
}

#[tokio::test]
async fn close_discards_buffered_messages() {
    let rig = rig();
    let receiver = open_receiver(&rig, 10).await;

    rig.link.deliver("buffered");
    settle().await;

    receiver.close().await.expect("close");
    assert_eq!(rig.link.settled.load(Ordering::SeqCst), 1);
    assert!(matches!(
        receiver.receive(1).await,
        Err(Error::ReceiverClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn close_times_out_without_a_peer_detach() {
    let rig = rig_with_timeout(Duration::from_secs(2));
    rig.link.ack_close.store(false, Ordering::SeqCst);
    let receiver = open_receiver(&rig, 10).await;

    assert!(matches!(
        receiver.close().await,
        Err(Error::CloseTimeout { .. })
    ));
}

#[tokio::test]
async fn error_context_reports_link_details() {
    let rig = rig();
    let receiver = open_receiver(&rig, 10).await;
    settle().await;

    let context = receiver.error_context();
    assert_eq!(context.host, "unit.servicebus.example");
    assert_eq!(context.path, "unit-hub/ConsumerGroups/$default/Partitions/0");
    assert_eq!(context.reference_id.as_deref(), Some("unit-receiver"));
    assert_eq!(context.prefetch, Some(10));
    assert_eq!(context.credit, Some(10));
    assert_eq!(context.buffered, Some(0));

    receiver.close().await.expect("close");
}
