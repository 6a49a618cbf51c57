use super::{MockReply, MockRequest, MockUpstream};
use crate::models::{Account, AppConfig, Credential};
use crate::modules::persistence::accounts::CredentialStore;
use crate::proxy::dispatch::{DispatchError, DispatchOutput, Dispatcher};
use crate::proxy::mappers::models::ClaudeRequest;
use crate::proxy::pool::AccountPool;
use crate::proxy::upstream::UpstreamClient;
use futures::StreamExt;
use std::sync::Arc;

fn test_request(model: &str, stream: bool) -> ClaudeRequest {
    serde_json::from_value(serde_json::json!({
        "model": model,
        "stream": stream,
        "messages": [
            { "role": "user", "content": "a long enough user prompt for the fingerprint" }
        ]
    }))
    .unwrap()
}

// Accounts carry api-key credentials so token resolution never leaves the
// process; the bearer seen by the mock identifies the serving account.
async fn build_dispatcher(
    mock: &MockUpstream,
    emails: &[&str],
    tune: impl FnOnce(&mut AppConfig),
) -> (Dispatcher, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        CredentialStore::open_at(dir.path().join("accounts.json"), 20).unwrap(),
    );
    for email in emails {
        store
            .upsert(Account::new(
                email.to_string(),
                Credential::ApiKey {
                    value: format!("key-{}", email),
                },
            ))
            .await
            .unwrap();
    }

    let mut config = AppConfig::default();
    config.pool.strategy = "round_robin".to_string();
    config.dispatch.switch_account_delay_ms = 10;
    tune(&mut config);

    let pool = Arc::new(AccountPool::new(store, config.clone()).await);
    for email in emails {
        pool.cache_project(email, "test-project".to_string());
    }
    let upstream = Arc::new(UpstreamClient::with_base_urls(
        None,
        vec![mock.base_url.clone()],
    ));
    (
        Dispatcher {
            pool,
            upstream,
            config: config.dispatch.clone(),
        },
        dir,
    )
}

// Scenario: a 429 with Retry-After: 0 is absorbed on the same endpoint and
// account; the client only ever sees success.
#[tokio::test(flavor = "multi_thread")]
async fn short_delay_rate_limit_is_absorbed() {
    let mock = MockUpstream::start(Arc::new(|req: &MockRequest| {
        if req.index == 0 {
            MockReply::status_body(429, "slow down").with_header("retry-after", "0")
        } else {
            MockReply::ok_text("recovered")
        }
    }))
    .await;

    let (dispatcher, _dir) = build_dispatcher(&mock, &["s1a@test"], |_| {}).await;
    let start = std::time::Instant::now();
    let success = dispatcher
        .dispatch(test_request("gemini-3-flash", false), "t1")
        .await
        .expect("dispatch succeeds");

    assert_eq!(success.email, "s1a@test");
    let requests = mock.requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].bearer, requests[1].bearer);
    // ~500ms normalized reset plus the retry slack.
    assert!(start.elapsed().as_millis() >= 500);
    match success.output {
        DispatchOutput::Json(message) => {
            assert_eq!(message["content"][0]["text"], "recovered");
        }
        _ => panic!("expected json output"),
    }
}

// Scenario: a quota-style 429 with a 120s reset marks the account and the
// dispatcher finishes on the other one.
#[tokio::test(flavor = "multi_thread")]
async fn long_delay_rate_limit_switches_accounts() {
    let mock = MockUpstream::start(Arc::new(|req: &MockRequest| {
        if req.bearer == "key-s2a@test" {
            MockReply::status_body(
                429,
                r#"{"error":{"message":"quota exceeded","details":[{"metadata":{"quotaResetDelay":"120s"}}]}}"#,
            )
        } else {
            MockReply::ok_text("served by b")
        }
    }))
    .await;

    let (dispatcher, _dir) = build_dispatcher(&mock, &["s2a@test", "s2b@test"], |_| {}).await;
    let success = dispatcher
        .dispatch(test_request("gemini-3-flash", false), "t2")
        .await
        .expect("dispatch succeeds");

    assert_eq!(success.email, "s2b@test");
    let account = dispatcher.pool.get("s2a@test").await.unwrap();
    let entry = account.rate_limits.get("gemini-3-flash").expect("marked");
    let remaining = entry.reset_at_ms - chrono::Utc::now().timestamp_millis();
    assert!(remaining > 100_000, "remaining was {}", remaining);

    // Subsequent immediate calls skip the marked account entirely.
    let success = dispatcher
        .dispatch(test_request("gemini-3-flash", false), "t2b")
        .await
        .expect("second dispatch succeeds");
    assert_eq!(success.email, "s2b@test");
}

// Scenario: every account exhausted beyond the wait threshold for a thinking
// Claude model; the dispatcher restarts itself once with the mapped Gemini
// model and returns that model id.
#[tokio::test(flavor = "multi_thread")]
async fn exhausted_accounts_engage_cross_model_fallback() {
    let mock = MockUpstream::start(Arc::new(|req: &MockRequest| {
        if req.model.contains("claude") {
            MockReply::status_body(
                429,
                r#"{"error":{"message":"quota exceeded","details":[{"metadata":{"quotaResetDelay":"180s"}}]}}"#,
            )
        } else {
            MockReply::ok_sse_text("gemini answer")
        }
    }))
    .await;

    let (dispatcher, _dir) = build_dispatcher(&mock, &["s3a@test", "s3b@test"], |config| {
        config.dispatch.fallback_enabled = true;
        config.dispatch.max_wait_before_error_ms = 2_000;
    })
    .await;

    let success = dispatcher
        .dispatch(test_request("claude-opus-4-5-thinking", false), "t3")
        .await
        .expect("fallback dispatch succeeds");

    assert_eq!(success.model, "gemini-3-pro-high");
    match success.output {
        DispatchOutput::Json(message) => {
            assert_eq!(message["model"], "gemini-3-pro-high");
            assert_eq!(message["content"][0]["text"], "gemini answer");
        }
        _ => panic!("expected json output"),
    }
}

// Scenario: same exhaustion without fallback surfaces a resource-exhausted
// error naming the model and carrying the reset.
#[tokio::test(flavor = "multi_thread")]
async fn exhausted_accounts_without_fallback_error_out() {
    let mock = MockUpstream::start(Arc::new(|_req: &MockRequest| {
        MockReply::status_body(
            429,
            r#"{"error":{"message":"quota exceeded","details":[{"metadata":{"quotaResetDelay":"180s"}}]}}"#,
        )
    }))
    .await;

    let (dispatcher, _dir) = build_dispatcher(&mock, &["s4a@test"], |config| {
        config.dispatch.fallback_enabled = false;
        config.dispatch.max_wait_before_error_ms = 2_000;
    })
    .await;

    match dispatcher
        .dispatch(test_request("gemini-3-flash", false), "t4")
        .await
    {
        Err(DispatchError::ResourceExhausted { model, reset_ms }) => {
            assert_eq!(model, "gemini-3-flash");
            assert!(reset_ms > 2_000);
        }
        other => panic!("expected resource exhausted, got {:?}", other.err()),
    }
}

// Scenario: a wait below the threshold is slept through on the same account,
// without consuming the attempt budget.
#[tokio::test(flavor = "multi_thread")]
async fn wait_under_threshold_retries_same_account() {
    let mock = MockUpstream::start(Arc::new(|req: &MockRequest| {
        if req.index == 0 {
            // Floors to the 2s server-delay minimum.
            MockReply::status_body(429, "throttled").with_header("retry-after", "1")
        } else {
            MockReply::ok_text("eventually served")
        }
    }))
    .await;

    let (dispatcher, _dir) = build_dispatcher(&mock, &["s5a@test"], |config| {
        // Force the switch-account path on the first 429 so the wait branch
        // is exercised by the retry that follows.
        config.dispatch.quick_retry_cooldown_ms = 1;
        config.dispatch.max_retries = 1;
        config.dispatch.max_wait_before_error_ms = 120_000;
    })
    .await;

    let start = std::time::Instant::now();
    let success = dispatcher
        .dispatch(test_request("gemini-3-flash", false), "t5")
        .await
        .expect("dispatch succeeds after waiting");

    assert_eq!(success.email, "s5a@test");
    assert!(start.elapsed().as_millis() >= 2_000);
    assert_eq!(mock.requests().await.len(), 2);
}

// Scenario: upstream 400 aborts immediately, with no retry and no switch.
#[tokio::test(flavor = "multi_thread")]
async fn invalid_request_surfaces_immediately() {
    let mock = MockUpstream::start(Arc::new(|_req: &MockRequest| {
        MockReply::status_body(400, "prompt exceeds the model token limit")
    }))
    .await;

    let (dispatcher, _dir) = build_dispatcher(&mock, &["s6a@test", "s6b@test"], |_| {}).await;
    match dispatcher
        .dispatch(test_request("gemini-3-flash", false), "t6")
        .await
    {
        Err(DispatchError::InvalidRequest { message }) => {
            assert!(message.contains("token limit"));
        }
        other => panic!("expected invalid request, got {:?}", other.err()),
    }
    assert_eq!(mock.requests().await.len(), 1);
}

// Scenario: a 200 whose stream carries zero events is refetched with backoff,
// then replaced by a well-formed synthetic terminal stream.
#[tokio::test(flavor = "multi_thread")]
async fn empty_stream_recovers_with_synthetic_response() {
    let mock = MockUpstream::start(Arc::new(|_req: &MockRequest| MockReply {
        status: 200,
        headers: vec![("content-type".to_string(), "text/event-stream".to_string())],
        body: String::new(),
    }))
    .await;

    let (dispatcher, _dir) = build_dispatcher(&mock, &["s7a@test"], |config| {
        config.dispatch.empty_stream_retries = 2;
    })
    .await;

    let success = dispatcher
        .dispatch(test_request("gemini-3-flash", true), "t7")
        .await
        .expect("synthetic stream returned");

    // Initial fetch plus two refetches.
    assert_eq!(mock.requests().await.len(), 3);

    let DispatchOutput::Stream(stream) = success.output else {
        panic!("expected stream output");
    };
    let chunks: Vec<_> = stream.collect().await;
    let text = chunks
        .into_iter()
        .filter_map(|c| c.ok())
        .map(|b| String::from_utf8_lossy(&b).to_string())
        .collect::<String>();
    assert!(text.contains("[No response after retries - please try again]"));
    assert!(text.contains("message_stop"));
}

// Permanent auth failures invalidate the account and move on.
#[tokio::test(flavor = "multi_thread")]
async fn permanent_auth_invalidates_and_switches() {
    let mock = MockUpstream::start(Arc::new(|req: &MockRequest| {
        if req.bearer == "key-s8a@test" {
            MockReply::status_body(401, r#"{"error":"invalid_grant"}"#)
        } else {
            MockReply::ok_text("served by b")
        }
    }))
    .await;

    let (dispatcher, _dir) = build_dispatcher(&mock, &["s8a@test", "s8b@test"], |_| {}).await;
    let success = dispatcher
        .dispatch(test_request("gemini-3-flash", false), "t8")
        .await
        .expect("dispatch succeeds on b");

    assert_eq!(success.email, "s8b@test");
    let account = dispatcher.pool.get("s8a@test").await.unwrap();
    assert!(account.invalid);
}

// Streaming success path: the client sees Anthropic-format events.
#[tokio::test(flavor = "multi_thread")]
async fn streaming_success_emits_anthropic_events() {
    let mock = MockUpstream::start(Arc::new(|_req: &MockRequest| {
        MockReply::ok_sse_text("streamed text")
    }))
    .await;

    let (dispatcher, _dir) = build_dispatcher(&mock, &["s9a@test"], |_| {}).await;
    let success = dispatcher
        .dispatch(test_request("gemini-3-flash", true), "t9")
        .await
        .expect("stream dispatch succeeds");

    let requests = mock.requests().await;
    assert_eq!(requests[0].method, "streamGenerateContent");

    let DispatchOutput::Stream(stream) = success.output else {
        panic!("expected stream output");
    };
    let chunks: Vec<_> = stream.collect().await;
    let text = chunks
        .into_iter()
        .filter_map(|c| c.ok())
        .map(|b| String::from_utf8_lossy(&b).to_string())
        .collect::<String>();
    assert!(text.contains("message_start"));
    assert!(text.contains("streamed text"));
    assert!(text.contains("message_stop"));

    // Account success cleared transient state.
    let account = dispatcher.pool.get("s9a@test").await.unwrap();
    assert_eq!(account.consecutive_failures, 0);
}

// Non-streaming requests to thinking models transparently use the SSE
// endpoint and come back aggregated.
#[tokio::test(flavor = "multi_thread")]
async fn thinking_model_unary_request_uses_sse_endpoint() {
    let mock = MockUpstream::start(Arc::new(|_req: &MockRequest| {
        MockReply::ok_sse_text("aggregated answer")
    }))
    .await;

    let (dispatcher, _dir) = build_dispatcher(&mock, &["s10a@test"], |_| {}).await;
    let success = dispatcher
        .dispatch(test_request("claude-opus-4-5-thinking", false), "t10")
        .await
        .expect("dispatch succeeds");

    let requests = mock.requests().await;
    assert_eq!(requests[0].method, "streamGenerateContent");
    match success.output {
        DispatchOutput::Json(message) => {
            assert_eq!(message["content"][0]["text"], "aggregated answer");
        }
        _ => panic!("expected aggregated json output"),
    }
}
