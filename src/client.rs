//! The protocol engine: batch calls against `/features`, fire-and-forget delivery to `/signal`
//! and `/external`, and the shutdown/drain path.
use std::{
    panic::AssertUnwindSafe,
    sync::{Arc, Condvar, Mutex},
};

use url::Url;

use crate::delivery::DeliveryPool;
use crate::registry::RequestRegistry;
use crate::request::{JsonObject, Requestable, SessionRequestable};
use crate::transport::{HttpTransport, Transport};
use crate::{wire, ClientConfig, Error, RequestOptions, Result};

const FEATURES_ENDPOINT: &str = "/features";
const SIGNAL_ENDPOINT: &str = "/signal";
const EXTERNAL_ENDPOINT: &str = "/external";

/// A session shared with a detached batch call.
pub type SharedSession = Arc<Mutex<dyn SessionRequestable>>;
/// A request shared with a detached batch call.
pub type SharedRequest = Arc<Mutex<dyn Requestable>>;

/// A client for an impression server.
///
/// Construct one per process with [`ClientConfig`] and pass it by reference; the client owns the
/// background delivery pool, so its lifetime bounds the fire-and-forget guarantee. Call
/// [`ImpressionClient::shutdown`] on your exit path to let in-flight deliveries land.
///
/// # Examples
/// ```no_run
/// # use impression_client::{ClientConfig, ImpressionClient};
/// let client = ClientConfig::from_base_url("http://localhost:3004/iserver")
///     .to_client()
///     .expect("failed to start delivery workers");
/// // ... issue requests ...
/// client.shutdown();
/// ```
pub struct ImpressionClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    pool: DeliveryPool,
}

impl ImpressionClient {
    /// Create a client using the default HTTP transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the delivery worker threads fail to start.
    pub fn new(config: ClientConfig) -> Result<ImpressionClient> {
        ImpressionClient::with_transport(config, Arc::new(HttpTransport::new()))
    }

    /// Create a client over a caller-supplied transport.
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<ImpressionClient> {
        let pool = DeliveryPool::start(config.delivery_workers)?;
        Ok(ImpressionClient {
            config,
            transport,
            pool,
        })
    }

    /// Request a batch of feature decisions, blocking until the server replies.
    ///
    /// An impression ID is generated for the call. Outcomes are applied to the requests in batch
    /// order before this returns: active requests hold their payloads, gated ("OFF") and unknown
    /// features stay inactive without error, and per-feature failures are attached to the
    /// affected request only — check [`Requestable::error`] per request.
    ///
    /// # Errors
    ///
    /// Batch-wide failures are returned *and* attached to every request in the batch:
    ///
    /// - [`Error::Network`] / [`Error::Cancelled`] — the transport call failed. The session is
    ///   left unmodified; callers may retry at a higher level, the client never retries itself.
    /// - [`Error::Status`] — the server replied non-200. Always an error for a batch call.
    /// - [`Error::Malformed`] / [`Error::ResponseTooShort`] — the reply could not be decoded.
    pub fn request(
        &self,
        session: &mut dyn SessionRequestable,
        requests: &mut [&mut dyn Requestable],
    ) -> Result<()> {
        self.request_with_impression_id(session, &new_impression_id(), requests)
    }

    /// Like [`ImpressionClient::request`] with a caller-supplied impression ID.
    ///
    /// The ID must be unique per call; the server uses it for idempotent correlation and replay
    /// protection.
    pub fn request_with_impression_id(
        &self,
        session: &mut dyn SessionRequestable,
        impression_id: &str,
        requests: &mut [&mut dyn Requestable],
    ) -> Result<()> {
        execute_batch(
            &*self.transport,
            &self.config.base_url,
            session,
            impression_id,
            None,
            requests,
            None,
        )
    }

    /// Like [`ImpressionClient::request`] with explicit options serialized into the envelope.
    pub fn request_with_options(
        &self,
        session: &mut dyn SessionRequestable,
        impression_id: &str,
        options: &RequestOptions,
        requests: &mut [&mut dyn Requestable],
    ) -> Result<()> {
        execute_batch(
            &*self.transport,
            &self.config.base_url,
            session,
            impression_id,
            Some(options),
            requests,
            None,
        )
    }

    /// Request a batch, satisfying repeated identical requests from `registry` instead of the
    /// wire.
    ///
    /// Replayed requests come out active without a network round trip; the remaining requests go
    /// out as one batch (in their original relative order) and fresh active payloads are recorded
    /// back into the registry. A batch that replays entirely issues no call at all.
    pub fn request_memoized(
        &self,
        registry: &mut RequestRegistry,
        session: &mut dyn SessionRequestable,
        requests: &mut [&mut dyn Requestable],
    ) -> Result<()> {
        let impression_id = new_impression_id();
        let mut misses: Vec<&mut dyn Requestable> = Vec::new();
        for slot in requests.iter_mut() {
            if !registry.replay(&mut **slot, &impression_id) {
                misses.push(&mut **slot);
            }
        }
        if misses.is_empty() {
            log::debug!(target: "impressions", "batch fully memoized, skipping wire call");
            return Ok(());
        }
        execute_batch(
            &*self.transport,
            &self.config.base_url,
            session,
            &impression_id,
            None,
            &mut misses,
            Some(registry),
        )
    }

    /// Request a batch without blocking the caller.
    ///
    /// The wire call and outcome application run on a dedicated thread; the requests' states are
    /// updated whether or not the caller ever looks at the returned handle, so results are never
    /// silently dropped. Dropping the handle does not cancel the call.
    pub fn request_detached(
        &self,
        session: SharedSession,
        requests: Vec<SharedRequest>,
    ) -> BatchHandle {
        self.request_detached_with_impression_id(session, new_impression_id(), requests)
    }

    /// Like [`ImpressionClient::request_detached`] with a caller-supplied impression ID.
    pub fn request_detached_with_impression_id(
        &self,
        session: SharedSession,
        impression_id: String,
        requests: Vec<SharedRequest>,
    ) -> BatchHandle {
        let transport = Arc::clone(&self.transport);
        let base_url = self.config.base_url.clone();
        let result: BatchResult = Arc::new((Mutex::new(None), Condvar::new()));

        let spawned = {
            let result = Arc::clone(&result);
            std::thread::Builder::new()
                .name("impression-batch".to_owned())
                .spawn(move || {
                    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        let mut session = session
                            .lock()
                            .expect("thread holding session lock should not panic");
                        let mut guards: Vec<_> = requests
                            .iter()
                            .map(|request| {
                                request
                                    .lock()
                                    .expect("thread holding request lock should not panic")
                            })
                            .collect();
                        let mut refs: Vec<&mut dyn Requestable> =
                            guards.iter_mut().map(|guard| &mut **guard).collect();
                        execute_batch(
                            &*transport,
                            &base_url,
                            &mut *session,
                            &impression_id,
                            None,
                            &mut refs,
                            None,
                        )
                    }));
                    let value = outcome.unwrap_or(Err(Error::BatchPanicked));
                    *result
                        .0
                        .lock()
                        .expect("thread holding batch result lock should not panic") = Some(value);
                    result.1.notify_all();
                })
        };

        if let Err(err) = spawned {
            // Couldn't start the thread; publish the failure so wait() doesn't hang.
            *result
                .0
                .lock()
                .expect("thread holding batch result lock should not panic") =
                Some(Err(err.into()));
        }

        BatchHandle { result }
    }

    /// Report an event to the impression server, fire-and-forget.
    ///
    /// The payload fields are sent alongside the session ids. Delivery happens on the background
    /// pool; failures are logged, never raised — the caller has already moved on. With
    /// `ignore_missing_impression` set in `options`, a 404/410 reply is treated as success.
    pub fn signal(
        &self,
        session: &dyn SessionRequestable,
        payload: JsonObject,
        options: Option<&RequestOptions>,
    ) {
        let body = wire::encode_signal(session, payload, options);
        self.send_fire_and_forget(
            "signalling event",
            SIGNAL_ENDPOINT,
            session,
            body,
            options.cloned().unwrap_or_default(),
        );
    }

    /// Tell the server the session is still alive. Fire-and-forget, ids only.
    pub fn keep_alive(&self, session: &dyn SessionRequestable) {
        let body = wire::encode_signal(session, JsonObject::new(), None);
        self.send_fire_and_forget(
            "keep-alive",
            SIGNAL_ENDPOINT,
            session,
            body,
            RequestOptions::default(),
        );
    }

    /// Write an out-of-band ("external") value for a feature field. Fire-and-forget.
    ///
    /// External values arrive after the impression itself, keyed by field name; the first
    /// impression ID is sent along for correlation when one is known.
    pub fn write_external(
        &self,
        session: &dyn SessionRequestable,
        impression_ids: &[String],
        feature_name: &str,
        field_name: &str,
        value: serde_json::Value,
        options: Option<&RequestOptions>,
    ) {
        let body = wire::encode_external(session, impression_ids, feature_name, field_name, value);
        self.send_fire_and_forget(
            &format!("writing external {field_name}"),
            EXTERNAL_ENDPOINT,
            session,
            body,
            options.cloned().unwrap_or_default(),
        );
    }

    /// Stop accepting fire-and-forget work and wait for in-flight deliveries.
    ///
    /// Blocks up to the configured drain grace period. Returns `false` if undelivered calls had
    /// to be abandoned.
    pub fn shutdown(self) -> bool {
        self.pool.drain(self.config.drain_grace)
    }

    fn send_fire_and_forget(
        &self,
        what: &str,
        path: &str,
        session: &dyn SessionRequestable,
        body: String,
        options: RequestOptions,
    ) {
        let url = match endpoint(&self.config.base_url, path) {
            Ok(url) => url,
            Err(err) => {
                log::error!(target: "impressions", "{what}: {err}");
                return;
            }
        };
        // Captured up front so the log line can attribute the session even if it's gone by the
        // time the call completes.
        let ids = serde_json::Value::Object(wire::session_ids(session)).to_string();
        let headers = session.headers();
        let transport = Arc::clone(&self.transport);
        let what = what.to_owned();

        self.pool.submit(move || {
            match transport.post(&url, body, &headers) {
                Ok(response) if response.is_ok() => {
                    log::debug!(target: "impressions", "{what} delivered");
                }
                Ok(response) if response.status == 404 || response.status == 410 => {
                    // The impression is gone from the server, which is expected after a schema
                    // migration when the caller opted in.
                    if options.ignore_missing_impression() {
                        log::debug!(
                            target: "impressions",
                            "{ids} {} {what}: {}", response.status, response.body,
                        );
                    } else {
                        log::warn!(
                            target: "impressions",
                            "{ids} {} {what}: {}", response.status, response.body,
                        );
                    }
                }
                Ok(response) => {
                    log::error!(
                        target: "impressions",
                        "{ids} {} {what}: {}", response.status, response.body,
                    );
                }
                Err(err) => {
                    log::error!(target: "impressions", "{ids} error {what}: {err}");
                }
            }
        });
    }
}

/// The result of a detached batch call.
///
/// The batch's outcome side effects are applied by the background thread regardless of whether
/// anyone waits on the handle; dropping it does not cancel anything.
pub struct BatchHandle {
    result: BatchResult,
}

type BatchResult = Arc<(Mutex<Option<Result<()>>>, Condvar)>;

impl BatchHandle {
    /// Block until the batch resolves, returning its batch-level result.
    ///
    /// Per-feature outcomes are read off the request objects themselves.
    pub fn wait(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .expect("thread holding batch result lock should not panic");
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .expect("thread holding batch result lock should not panic");
                }
            }
        }
    }

    /// The batch-level result, if the batch has resolved yet.
    pub fn try_result(&self) -> Option<Result<()>> {
        self.result
            .0
            .lock()
            .expect("thread holding batch result lock should not panic")
            .clone()
    }
}

fn new_impression_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn endpoint(base_url: &str, path: &str) -> Result<Url> {
    Url::parse(&format!("{base_url}{path}")).map_err(Error::InvalidBaseUrl)
}

/// One full batch cycle: encode, one wire call, decode, outcome application.
///
/// Shared by the blocking and detached calling conventions. Any batch-wide failure is attached
/// to every request before it propagates, so no request is ever left neither active nor errored.
fn execute_batch(
    transport: &dyn Transport,
    base_url: &str,
    session: &mut dyn SessionRequestable,
    impression_id: &str,
    options: Option<&RequestOptions>,
    requests: &mut [&mut (dyn Requestable + '_)],
    memo: Option<&mut RequestRegistry>,
) -> Result<()> {
    match try_execute_batch(
        transport,
        base_url,
        session,
        impression_id,
        options,
        requests,
        memo,
    ) {
        Ok(()) => Ok(()),
        Err(err) => {
            log::warn!(target: "impressions", "{err}");
            for request in requests.iter_mut() {
                request.set_error(Some(err.clone()));
            }
            Err(err)
        }
    }
}

fn try_execute_batch(
    transport: &dyn Transport,
    base_url: &str,
    session: &mut dyn SessionRequestable,
    impression_id: &str,
    options: Option<&RequestOptions>,
    requests: &mut [&mut (dyn Requestable + '_)],
    mut memo: Option<&mut RequestRegistry>,
) -> Result<()> {
    let url = endpoint(base_url, FEATURES_ENDPOINT)?;
    let body = wire::encode_batch(&*session, requests, impression_id, options);
    let headers = session.headers();

    let response = transport.post(&url, body, &headers)?;
    if !response.is_ok() {
        return Err(Error::Status {
            code: response.status,
            body: response.body,
        });
    }

    let reply = wire::decode_reply(&response.body, requests.len())?;

    if let Some(raw) = reply.session {
        // A broken session blob poisons the whole batch; the stream can't be trusted past it.
        session.deserialize_response(raw)?;
    }

    for (request, outcome) in requests.iter_mut().zip(reply.outcomes) {
        match outcome {
            wire::Outcome::Active(raw) => match request.deserialize_response(raw) {
                Ok(()) => {
                    request.set_active(true);
                    if let Some(memo) = memo.as_deref_mut() {
                        memo.record(&**request, raw, impression_id);
                    }
                }
                Err(err) => {
                    let err = Error::FeatureDecode {
                        feature: request.feature_name().to_owned(),
                        source: Box::new(err),
                    };
                    log::warn!(target: "impressions", "{err}");
                    request.set_error(Some(err));
                }
            },
            wire::Outcome::Inactive => {
                request.set_active(false);
            }
            wire::Outcome::Unknown => {
                // The server doesn't know the feature yet; expected during schema migration.
                // The request stays inactive and no error is recorded.
            }
            wire::Outcome::Malformed => {
                let err = Error::FeatureDecode {
                    feature: request.feature_name().to_owned(),
                    source: Box::new(Error::Malformed(
                        "unexpected value in impression slot".to_owned(),
                    )),
                };
                log::warn!(target: "impressions", "{err}");
                request.set_error(Some(err));
            }
        }
    }

    for (index, message) in reply.errors.into_iter().enumerate() {
        let Some(message) = message else {
            continue;
        };
        if let Some(request) = requests.get_mut(index) {
            request.set_error(Some(Error::ServerReported(message)));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use serde::Deserialize;
    use serde_json::value::RawValue;

    use super::*;
    use crate::transport::HttpResponse;
    use crate::FeatureState;

    /// Transport double that replays canned responses and records every call.
    struct FakeTransport {
        responses: Mutex<VecDeque<Result<HttpResponse>>>,
        calls: Mutex<Vec<(String, String)>>,
        call_count: AtomicUsize,
        delay: Duration,
    }

    impl FakeTransport {
        fn replying(responses: Vec<Result<HttpResponse>>) -> Arc<FakeTransport> {
            Arc::new(FakeTransport {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
                call_count: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn ok(body: &str) -> Arc<FakeTransport> {
            FakeTransport::replying(vec![Ok(HttpResponse {
                status: 200,
                body: body.to_owned(),
            })])
        }

        fn slow(body: &str, delay: Duration) -> Arc<FakeTransport> {
            Arc::new(FakeTransport {
                responses: Mutex::new(
                    vec![Ok(HttpResponse {
                        status: 200,
                        body: body.to_owned(),
                    })]
                    .into(),
                ),
                calls: Mutex::new(Vec::new()),
                call_count: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Transport for FakeTransport {
        fn post(
            &self,
            url: &Url,
            body: String,
            _headers: &[(String, String)],
        ) -> Result<HttpResponse> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.call_count.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push((url.path().to_owned(), body));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(HttpResponse {
                    status: 200,
                    body: r#"{"impressions": []}"#.to_owned(),
                }))
        }
    }

    fn client_over(transport: Arc<FakeTransport>) -> ImpressionClient {
        ImpressionClient::with_transport(
            ClientConfig::from_base_url("http://iserver.test/iserver")
                .delivery_workers(2)
                .drain_grace(Duration::from_secs(5)),
            transport,
        )
        .unwrap()
    }

    #[derive(Debug)]
    struct ProductInfo {
        user: String,
        product_name: Option<String>,
        state: FeatureState,
    }

    impl ProductInfo {
        fn for_user(user: &str) -> ProductInfo {
            ProductInfo {
                user: user.to_owned(),
                product_name: None,
                state: FeatureState::new(),
            }
        }
    }

    impl Requestable for ProductInfo {
        fn feature_name(&self) -> &str {
            "ProductInfo"
        }

        fn serialize_args(&self, args: &mut JsonObject) {
            args.insert("user".to_owned(), self.user.as_str().into());
        }

        fn deserialize_response(&mut self, payload: &RawValue) -> Result<()> {
            #[derive(Deserialize)]
            struct Payload {
                #[serde(rename = "productName")]
                product_name: String,
            }
            let payload: Payload = serde_json::from_str(payload.get())?;
            self.product_name = Some(payload.product_name);
            Ok(())
        }

        fn set_active(&mut self, active: bool) {
            self.state.set_active(active);
        }

        fn is_active(&self) -> bool {
            self.state.is_active()
        }

        fn set_error(&mut self, error: Option<Error>) {
            self.state.set_error(error);
        }

        fn error(&self) -> Option<&Error> {
            self.state.error()
        }
    }

    #[derive(Debug, Default)]
    struct UserSession {
        visits: i64,
    }

    impl SessionRequestable for UserSession {
        fn serialize_args(&self, args: &mut JsonObject) {
            args.insert("deviceId".to_owned(), "device-1".into());
        }

        fn serialize_ids(&self, ids: &mut JsonObject) {
            ids.insert("deviceId".to_owned(), "device-1".into());
        }

        fn deserialize_response(&mut self, payload: &RawValue) -> Result<()> {
            #[derive(Deserialize)]
            struct Payload {
                visits: i64,
            }
            let payload: Payload = serde_json::from_str(payload.get())?;
            self.visits = payload.visits;
            Ok(())
        }
    }

    #[test]
    fn successful_batch_activates_every_request_in_order() {
        let transport = FakeTransport::ok(
            r#"{"impressions": [{"productName": "radio"}, {"productName": "tv"}]}"#,
        );
        let client = client_over(Arc::clone(&transport));
        let mut session = UserSession::default();
        let mut first = ProductInfo::for_user("alice");
        let mut second = ProductInfo::for_user("bob");

        let mut requests: Vec<&mut dyn Requestable> = vec![&mut first, &mut second];
        client.request(&mut session, &mut requests).unwrap();

        assert!(first.is_active());
        assert_eq!(first.product_name.as_deref(), Some("radio"));
        assert!(first.error().is_none());
        assert!(second.is_active());
        assert_eq!(second.product_name.as_deref(), Some("tv"));

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "/iserver/features");
        let sent: serde_json::Value = serde_json::from_str(&calls[0].1).unwrap();
        assert_eq!(sent["reqs"][0]["args"]["user"], "alice");
        assert_eq!(sent["reqs"][1]["args"]["user"], "bob");
    }

    #[test]
    fn options_reach_the_features_envelope() {
        let transport = FakeTransport::ok(r#"{"impressions": [{"productName": "radio"}]}"#);
        let client = client_over(Arc::clone(&transport));
        let mut session = UserSession::default();
        let mut request = ProductInfo::for_user("alice");
        let options = RequestOptions::builder().ignore_missing_impression(true).build();

        let mut requests: Vec<&mut dyn Requestable> = vec![&mut request];
        client
            .request_with_options(&mut session, "imp-1", &options, &mut requests)
            .unwrap();

        assert!(request.is_active());
        let calls = transport.calls();
        assert_eq!(calls[0].0, "/iserver/features");
        let sent: serde_json::Value = serde_json::from_str(&calls[0].1).unwrap();
        assert_eq!(sent["impressionId"], "imp-1");
        assert_eq!(sent["options"]["ignore_missing_imp"], true);
    }

    #[test]
    fn swapping_requests_swaps_outcomes() {
        let transport = FakeTransport::ok(
            r#"{"impressions": [{"productName": "radio"}, "OFF"]}"#,
        );
        let client = client_over(transport);
        let mut session = UserSession::default();
        let mut first = ProductInfo::for_user("bob");
        let mut second = ProductInfo::for_user("alice");

        // bob is now the first request, so the first slot (the payload) is his
        let mut requests: Vec<&mut dyn Requestable> = vec![&mut first, &mut second];
        client.request(&mut session, &mut requests).unwrap();

        assert!(first.is_active());
        assert!(!second.is_active());
    }

    #[test]
    fn non_200_status_errors_the_whole_batch() {
        let transport = FakeTransport::replying(vec![Ok(HttpResponse {
            status: 500,
            body: "internal catastrophe".to_owned(),
        })]);
        let client = client_over(transport);
        let mut session = UserSession::default();
        let mut request = ProductInfo::for_user("alice");

        let mut requests: Vec<&mut dyn Requestable> = vec![&mut request];
        let err = client.request(&mut session, &mut requests).unwrap_err();

        let message = err.to_string();
        assert!(message.contains("500"), "missing status in: {message}");
        assert!(
            message.contains("internal catastrophe"),
            "missing body in: {message}"
        );
        assert!(request.error().is_some());
        assert!(!request.is_active());
    }

    #[test]
    fn transport_failure_errors_every_request_and_leaves_session_untouched() {
        let transport = FakeTransport::replying(vec![Err(Error::Cancelled)]);
        let client = client_over(transport);
        let mut session = UserSession::default();
        let mut first = ProductInfo::for_user("alice");
        let mut second = ProductInfo::for_user("bob");

        let mut requests: Vec<&mut dyn Requestable> = vec![&mut first, &mut second];
        let err = client.request(&mut session, &mut requests).unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert!(matches!(first.error(), Some(Error::Cancelled)));
        assert!(matches!(second.error(), Some(Error::Cancelled)));
        assert_eq!(session.visits, 0);
    }

    #[test]
    fn off_gates_one_request_without_touching_its_siblings() {
        let transport =
            FakeTransport::ok(r#"{"impressions": ["OFF", {"productName": "radio"}]}"#);
        let client = client_over(transport);
        let mut session = UserSession::default();
        let mut gated = ProductInfo::for_user("alice");
        let mut live = ProductInfo::for_user("bob");

        let mut requests: Vec<&mut dyn Requestable> = vec![&mut gated, &mut live];
        client.request(&mut session, &mut requests).unwrap();

        assert!(!gated.is_active());
        assert!(gated.error().is_none());
        assert!(live.is_active());
    }

    #[test]
    fn unknown_feature_is_not_a_batch_failure() {
        let transport = FakeTransport::ok(r#"{"impressions": ["UNKNOWN"]}"#);
        let client = client_over(transport);
        let mut session = UserSession::default();
        let mut request = ProductInfo::for_user("alice");

        let mut requests: Vec<&mut dyn Requestable> = vec![&mut request];
        client.request(&mut session, &mut requests).unwrap();

        assert!(!request.is_active());
        assert!(request.error().is_none());
    }

    #[test]
    fn short_reply_errors_all_remaining_requests() {
        let transport = FakeTransport::ok(r#"{"impressions": [{"productName": "radio"}]}"#);
        let client = client_over(transport);
        let mut session = UserSession::default();
        let mut first = ProductInfo::for_user("alice");
        let mut second = ProductInfo::for_user("bob");

        let mut requests: Vec<&mut dyn Requestable> = vec![&mut first, &mut second];
        let err = client.request(&mut session, &mut requests).unwrap_err();

        assert!(matches!(err, Error::ResponseTooShort));
        assert!(matches!(first.error(), Some(Error::ResponseTooShort)));
        assert!(matches!(second.error(), Some(Error::ResponseTooShort)));
    }

    #[test]
    fn malformed_slot_is_scoped_to_its_request() {
        let transport =
            FakeTransport::ok(r#"{"impressions": [17, {"productName": "radio"}]}"#);
        let client = client_over(transport);
        let mut session = UserSession::default();
        let mut broken = ProductInfo::for_user("alice");
        let mut fine = ProductInfo::for_user("bob");

        let mut requests: Vec<&mut dyn Requestable> = vec![&mut broken, &mut fine];
        // per-feature errors are attached, not raised
        client.request(&mut session, &mut requests).unwrap();

        assert!(matches!(broken.error(), Some(Error::FeatureDecode { .. })));
        assert!(!broken.is_active());
        assert!(fine.is_active());
        assert!(fine.error().is_none());
    }

    #[test]
    fn bad_payload_is_scoped_to_its_request() {
        let transport = FakeTransport::ok(
            r#"{"impressions": [{"productName": 42}, {"productName": "radio"}]}"#,
        );
        let client = client_over(transport);
        let mut session = UserSession::default();
        let mut broken = ProductInfo::for_user("alice");
        let mut fine = ProductInfo::for_user("bob");

        let mut requests: Vec<&mut dyn Requestable> = vec![&mut broken, &mut fine];
        client.request(&mut session, &mut requests).unwrap();

        assert!(matches!(broken.error(), Some(Error::FeatureDecode { .. })));
        assert!(fine.is_active());
    }

    #[test]
    fn server_reported_errors_attach_by_index() {
        let transport = FakeTransport::ok(
            r#"{"impressions": [{"productName": "radio"}, {"productName": "tv"}],
                "errors": [null, "metric overflow"]}"#,
        );
        let client = client_over(transport);
        let mut session = UserSession::default();
        let mut first = ProductInfo::for_user("alice");
        let mut second = ProductInfo::for_user("bob");

        let mut requests: Vec<&mut dyn Requestable> = vec![&mut first, &mut second];
        client.request(&mut session, &mut requests).unwrap();

        assert!(first.error().is_none());
        match second.error() {
            Some(Error::ServerReported(message)) => assert_eq!(message, "metric overflow"),
            other => panic!("expected server-reported error, got {other:?}"),
        }
    }

    #[test]
    fn server_reported_error_overrides_a_payload_decode_error() {
        let transport = FakeTransport::ok(
            r#"{"impressions": [{"productName": "radio"}, {"productName": 42}],
                "errors": [null, "wrong column type"]}"#,
        );
        let client = client_over(transport);
        let mut session = UserSession::default();
        let mut fine = ProductInfo::for_user("alice");
        let mut broken = ProductInfo::for_user("bob");

        let mut requests: Vec<&mut dyn Requestable> = vec![&mut fine, &mut broken];
        client.request(&mut session, &mut requests).unwrap();

        assert!(fine.error().is_none());
        // the server's error string wins over the decode error recorded for the same slot
        match broken.error() {
            Some(Error::ServerReported(message)) => assert_eq!(message, "wrong column type"),
            other => panic!("expected server-reported error, got {other:?}"),
        }
        assert!(!broken.is_active());
    }

    #[test]
    fn session_mutations_are_applied_from_the_reply() {
        let transport = FakeTransport::ok(
            r#"{"session": {"visits": 4}, "impressions": [{"productName": "radio"}]}"#,
        );
        let client = client_over(transport);
        let mut session = UserSession::default();
        let mut request = ProductInfo::for_user("alice");

        let mut requests: Vec<&mut dyn Requestable> = vec![&mut request];
        client.request(&mut session, &mut requests).unwrap();

        assert_eq!(session.visits, 4);
    }

    #[test]
    fn detached_batch_applies_outcomes_even_if_nobody_waits() {
        let transport = FakeTransport::ok(r#"{"impressions": [{"productName": "radio"}]}"#);
        let client = client_over(transport);
        let session: SharedSession = Arc::new(Mutex::new(UserSession::default()));
        let request: Arc<Mutex<ProductInfo>> =
            Arc::new(Mutex::new(ProductInfo::for_user("alice")));

        let handle = client.request_detached(
            Arc::clone(&session) as SharedSession,
            vec![Arc::clone(&request) as SharedRequest],
        );
        handle.wait().unwrap();

        let request = request.lock().unwrap();
        assert!(request.is_active());
        assert_eq!(request.product_name.as_deref(), Some("radio"));
    }

    #[test]
    fn detached_batch_carries_failures_in_the_handle() {
        let transport = FakeTransport::replying(vec![Ok(HttpResponse {
            status: 503,
            body: "unavailable".to_owned(),
        })]);
        let client = client_over(transport);
        let session: SharedSession = Arc::new(Mutex::new(UserSession::default()));
        let request: Arc<Mutex<ProductInfo>> =
            Arc::new(Mutex::new(ProductInfo::for_user("alice")));

        let handle = client.request_detached(session, vec![Arc::clone(&request) as SharedRequest]);
        let err = handle.wait().unwrap_err();

        assert!(matches!(err, Error::Status { code: 503, .. }));
        assert!(request.lock().unwrap().error().is_some());
    }

    #[test]
    fn memoized_batch_skips_the_wire_after_the_first_call() {
        let transport = FakeTransport::ok(r#"{"impressions": [{"productName": "radio"}]}"#);
        let client = client_over(Arc::clone(&transport));
        let mut registry = RequestRegistry::new();
        let mut session = UserSession::default();

        let mut first = ProductInfo::for_user("alice");
        let mut requests: Vec<&mut dyn Requestable> = vec![&mut first];
        client
            .request_memoized(&mut registry, &mut session, &mut requests)
            .unwrap();
        assert!(first.is_active());

        let mut repeat = ProductInfo::for_user("alice");
        let mut requests: Vec<&mut dyn Requestable> = vec![&mut repeat];
        client
            .request_memoized(&mut registry, &mut session, &mut requests)
            .unwrap();

        assert!(repeat.is_active());
        assert_eq!(repeat.product_name.as_deref(), Some("radio"));
        assert_eq!(transport.call_count.load(Ordering::SeqCst), 1);
        assert_eq!(registry.count("ProductInfo"), 2);
    }

    #[test]
    fn signal_is_delivered_before_shutdown_completes() {
        let _ = env_logger::builder().is_test(true).try_init();

        let transport = FakeTransport::slow("", Duration::from_millis(100));
        let client = client_over(Arc::clone(&transport));
        let session = UserSession::default();

        let mut payload = JsonObject::new();
        payload.insert("event".to_owned(), "AddToCart".into());
        client.signal(&session, payload, None);

        assert!(client.shutdown());
        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "/iserver/signal");
        let sent: serde_json::Value = serde_json::from_str(&calls[0].1).unwrap();
        assert_eq!(sent["id"]["deviceId"], "device-1");
        assert_eq!(sent["event"], "AddToCart");
    }

    #[test]
    fn keep_alive_sends_ids_only() {
        let transport = FakeTransport::ok("");
        let client = client_over(Arc::clone(&transport));
        let session = UserSession::default();

        client.keep_alive(&session);
        assert!(client.shutdown());

        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        let sent: serde_json::Value = serde_json::from_str(&calls[0].1).unwrap();
        assert_eq!(sent, serde_json::json!({"id": {"deviceId": "device-1"}}));
    }

    #[test]
    fn external_write_targets_the_external_endpoint() {
        let transport = FakeTransport::ok("");
        let client = client_over(Arc::clone(&transport));
        let session = UserSession::default();

        client.write_external(
            &session,
            &["imp-1".to_owned()],
            "Checkout",
            "total",
            serde_json::json!(99),
            None,
        );
        assert!(client.shutdown());

        let calls = transport.calls();
        assert_eq!(calls[0].0, "/iserver/external");
        let sent: serde_json::Value = serde_json::from_str(&calls[0].1).unwrap();
        assert_eq!(sent["feature"], "Checkout");
        assert_eq!(sent["impressionId"], "imp-1");
        assert_eq!(sent["total"], 99);
    }

    #[test]
    fn missing_impression_is_stifled_when_opted_in() {
        let _ = env_logger::builder().is_test(true).try_init();

        let transport = FakeTransport::replying(vec![Ok(HttpResponse {
            status: 404,
            body: "no such impression".to_owned(),
        })]);
        let client = client_over(Arc::clone(&transport));
        let session = UserSession::default();
        let options = RequestOptions::builder().ignore_missing_impression(true).build();

        client.signal(&session, JsonObject::new(), Some(&options));

        // logged at debug only; the call still goes out and shutdown still drains
        assert!(client.shutdown());
        assert_eq!(transport.calls().len(), 1);
    }
}
