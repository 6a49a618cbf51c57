pub mod fallback;

use crate::models::{Account, DispatchConfig};
use crate::proxy::mappers::{self, models::ClaudeRequest, streaming::SseStream};
use crate::proxy::pool::AccountPool;
use crate::proxy::ratelimit::{self, ErrorKind, RateLimitDedup};
use crate::proxy::upstream::UpstreamClient;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

// Progressive same-endpoint tiers for capacity exhaustion.
const CAPACITY_BACKOFF_TIERS_MS: [u64; 5] = [5_000, 10_000, 20_000, 30_000, 60_000];
const EMPTY_STREAM_BACKOFF_MS: [u64; 3] = [500, 1_000, 2_000];
const SERVER_ERROR_PAUSE_MS: u64 = 1_000;
const WAIT_SLACK_MS: u64 = 500;
const NETWORK_RETRY_SLACK_MS: u64 = 200;

pub struct Dispatcher {
    pub pool: Arc<AccountPool>,
    pub upstream: Arc<UpstreamClient>,
    pub config: DispatchConfig,
}

pub enum DispatchOutput {
    Json(Value),
    Stream(SseStream),
}

pub struct DispatchSuccess {
    pub output: DispatchOutput,
    pub email: String,
    pub model: String,
}

#[derive(Debug)]
pub enum DispatchError {
    // 400 from upstream: no retry, no account switch.
    InvalidRequest { message: String },
    // Every account exhausted beyond the wait threshold, no fallback left.
    ResourceExhausted { model: String, reset_ms: u64 },
    Fatal { message: String },
}

enum RunOutcome {
    Success(DispatchSuccess),
    // All accounts blocked past the threshold, or the attempt budget is gone;
    // the caller may restart with the fallback model.
    FallbackCandidate { reset_ms: u64 },
    Error(DispatchError),
}

enum EndpointOutcome {
    Done(DispatchOutput),
    SwitchAccount { reason: String, count_attempt: bool },
    Fatal(DispatchError),
}

struct AttemptContext<'a> {
    account: &'a Account,
    access_token: &'a str,
    body: &'a Value,
    model: &'a str,
    client_streaming: bool,
    trace_id: &'a str,
}

impl Dispatcher {
    pub async fn dispatch(
        &self,
        mut request: ClaudeRequest,
        trace_id: &str,
    ) -> Result<DispatchSuccess, DispatchError> {
        let mut allow_fallback = self.config.fallback_enabled;

        loop {
            match self.run_once(&request, trace_id).await {
                RunOutcome::Success(success) => return Ok(success),
                RunOutcome::FallbackCandidate { reset_ms } => {
                    if allow_fallback {
                        if let Some(fb) = fallback::fallback_model(&request.model) {
                            tracing::warn!(
                                "[{}] Cross-model fallback engaged: {} -> {}",
                                trace_id,
                                request.model,
                                fb
                            );
                            request.model = fb.to_string();
                            // One step only.
                            allow_fallback = false;
                            continue;
                        }
                    }
                    return Err(DispatchError::ResourceExhausted {
                        model: request.model.clone(),
                        reset_ms,
                    });
                }
                RunOutcome::Error(error) => return Err(error),
            }
        }
    }

    async fn run_once(&self, request: &ClaudeRequest, trace_id: &str) -> RunOutcome {
        let model = request.model.clone();
        let account_count = self.pool.len().await;
        let max_attempts = self.config.max_retries.max(account_count + 1);

        // Optimistic retry: a reset may have elapsed while the process idled.
        if self.pool.is_all_rate_limited(&model).await {
            self.pool.reset_all_rate_limits().await;
        }

        let mut last_error = String::from("no attempt made");
        let mut attempt = 0usize;

        while attempt < max_attempts {
            attempt += 1;

            if self.pool.available_accounts(&model).await.is_empty() {
                if !self.pool.is_all_rate_limited(&model).await {
                    return RunOutcome::Error(DispatchError::Fatal {
                        message: "no enabled accounts in the pool".to_string(),
                    });
                }
                let wait = self.pool.min_wait_ms(&model).await;
                if wait > self.config.max_wait_before_error_ms {
                    return RunOutcome::FallbackCandidate { reset_ms: wait };
                }
                tracing::info!(
                    "[{}] All accounts limited for {}; waiting {}ms",
                    trace_id,
                    model,
                    wait
                );
                sleep(Duration::from_millis(wait + WAIT_SLACK_MS)).await;
                // Waiting does not consume the retry budget.
                attempt -= 1;
                continue;
            }

            let selection = self.pool.select_account(&model).await;
            let account = match selection.account {
                None if selection.wait_ms.is_none() => {
                    return RunOutcome::Error(DispatchError::Fatal {
                        message: format!("no selectable account for model '{}'", model),
                    });
                }
                None => {
                    let wait = selection.wait_ms.unwrap_or(WAIT_SLACK_MS);
                    tracing::debug!(
                        "[{}] Strategy suggests waiting {}ms for {}",
                        trace_id,
                        wait,
                        model
                    );
                    sleep(Duration::from_millis(wait)).await;
                    attempt -= 1;
                    continue;
                }
                Some(account) => {
                    if let Some(throttle) = selection.wait_ms.filter(|w| *w > 0) {
                        sleep(Duration::from_millis(throttle)).await;
                    }
                    account
                }
            };

            tracing::info!(
                "[{}] Attempt {}/{} using {} for {}",
                trace_id,
                attempt,
                max_attempts,
                account.email,
                model
            );

            let access_token =
                match crate::proxy::resolver::token_for_account(&self.pool, &account).await {
                    Ok(token) => token,
                    Err(crate::proxy::resolver::ResolveError::Transient(message)) => {
                        last_error = message.clone();
                        tracing::warn!(
                            "[{}] Transient token failure for {}: {}",
                            trace_id,
                            account.email,
                            message
                        );
                        self.pool.record_failure(&account.email, &model).await;
                        sleep(Duration::from_millis(SERVER_ERROR_PAUSE_MS)).await;
                        continue;
                    }
                    Err(crate::proxy::resolver::ResolveError::Permanent(message)) => {
                        // The resolver already invalidated the account.
                        last_error = message;
                        continue;
                    }
                };

            let project_id = crate::proxy::resolver::project_for_account(
                &self.pool,
                &self.upstream,
                &account,
                &access_token,
            )
            .await;

            let session_id = crate::proxy::session::extract_session_id(request);
            let body = match mappers::build_upstream_request(request, &project_id, &session_id) {
                Ok(body) => body,
                Err(message) => {
                    return RunOutcome::Error(DispatchError::InvalidRequest { message });
                }
            };

            let ctx = AttemptContext {
                account: &account,
                access_token: &access_token,
                body: &body,
                model: &model,
                client_streaming: request.stream,
                trace_id,
            };
            match self.try_account_endpoints(&ctx).await {
                EndpointOutcome::Done(output) => {
                    self.pool.notify_success(&account.email, &model).await;
                    RateLimitDedup::global().clear(&account.email, &model);
                    crate::modules::stats::usage::UsageRecorder::global().record(&model);
                    return RunOutcome::Success(DispatchSuccess {
                        output,
                        email: account.email.clone(),
                        model: model.clone(),
                    });
                }
                EndpointOutcome::SwitchAccount {
                    reason,
                    count_attempt,
                } => {
                    tracing::info!(
                        "[{}] Switching account after {}: {}",
                        trace_id,
                        account.email,
                        reason
                    );
                    last_error = reason;
                    if !count_attempt {
                        attempt -= 1;
                    }
                    continue;
                }
                EndpointOutcome::Fatal(error) => return RunOutcome::Error(error),
            }
        }

        tracing::warn!(
            "[{}] Attempt budget exhausted for {}: {}",
            trace_id,
            model,
            last_error
        );
        RunOutcome::FallbackCandidate {
            reset_ms: self.pool.min_wait_ms(&model).await,
        }
    }

    // Try every upstream endpoint in fallback order for one account. Tagged
    // outcomes replace the nested-throw control flow this logic is usually
    // written with.
    async fn try_account_endpoints(&self, ctx: &AttemptContext<'_>) -> EndpointOutcome {
        let email = &ctx.account.email;
        let use_sse = ctx.client_streaming
            || crate::proxy::mappers::thinking::is_thinking_model(ctx.model);
        let method = if use_sse {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let query = if use_sse { Some("alt=sse") } else { None };

        let mut capacity_retries: u32 = 0;
        let base_urls: Vec<String> = self.upstream.base_urls().to_vec();

        'endpoints: for (endpoint_idx, base_url) in base_urls.iter().enumerate() {
            let mut empty_retries: u32 = 0;

            // Same-endpoint retry loop: short rate limits, capacity tiers and
            // empty streams burn retries here without rotating.
            loop {
                let response = match self
                    .upstream
                    .post_endpoint(base_url, method, query, ctx.access_token, ctx.body)
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        let count = self.pool.record_failure(email, ctx.model).await;
                        if count >= self.config.consecutive_failure_ceiling {
                            self.pool
                                .mark_rate_limited(
                                    email,
                                    self.config.extended_cooldown_ms,
                                    ctx.model,
                                )
                                .await;
                        }
                        sleep(Duration::from_millis(SERVER_ERROR_PAUSE_MS)).await;
                        return EndpointOutcome::SwitchAccount {
                            reason: format!("network error at {}: {}", base_url, e),
                            count_attempt: true,
                        };
                    }
                };

                let status = response.status().as_u16();
                if (200..300).contains(&status) {
                    match self.consume_success(ctx, response, use_sse).await {
                        Ok(output) => return EndpointOutcome::Done(output),
                        Err(ConsumeError::Empty) => {
                            if empty_retries < self.config.empty_stream_retries {
                                let backoff = EMPTY_STREAM_BACKOFF_MS[(empty_retries as usize)
                                    .min(EMPTY_STREAM_BACKOFF_MS.len() - 1)];
                                empty_retries += 1;
                                tracing::warn!(
                                    "[{}] Empty response #{}; refetching in {}ms",
                                    ctx.trace_id,
                                    empty_retries,
                                    backoff
                                );
                                sleep(Duration::from_millis(backoff)).await;
                                continue;
                            }
                            tracing::error!(
                                "[{}] Still empty after {} refetches; emitting synthetic stream",
                                ctx.trace_id,
                                empty_retries
                            );
                            return EndpointOutcome::Done(self.synthetic_output(ctx));
                        }
                        Err(ConsumeError::Other(message)) => {
                            tracing::warn!(
                                "[{}] Failed to consume upstream body: {}",
                                ctx.trace_id,
                                message
                            );
                            continue 'endpoints;
                        }
                    }
                }

                let headers = response.headers().clone();
                let body_text = response.text().await.unwrap_or_default();

                match status {
                    400 => {
                        return EndpointOutcome::Fatal(DispatchError::InvalidRequest {
                            message: body_text,
                        });
                    }
                    401 => {
                        if ratelimit::classify(status, &body_text) == ErrorKind::PermanentAuth {
                            self.pool.mark_invalid(email, &body_text).await;
                            return EndpointOutcome::SwitchAccount {
                                reason: "permanent auth failure".to_string(),
                                count_attempt: true,
                            };
                        }
                        self.pool.clear_token_cache(Some(email));
                        self.pool.clear_project_cache(Some(email));
                        continue 'endpoints;
                    }
                    403 | 404 => continue 'endpoints,
                    429 | 503 | 529 => {
                        let kind = ratelimit::classify(status, &body_text);

                        if kind == ErrorKind::ModelCapacityExhausted {
                            if capacity_retries < self.config.max_capacity_retries {
                                let tier = CAPACITY_BACKOFF_TIERS_MS[(capacity_retries as usize)
                                    .min(CAPACITY_BACKOFF_TIERS_MS.len() - 1)];
                                capacity_retries += 1;
                                self.pool.record_failure(email, ctx.model).await;
                                tracing::warn!(
                                    "[{}] Capacity exhausted; tier sleep {}ms ({}/{})",
                                    ctx.trace_id,
                                    tier,
                                    capacity_retries,
                                    self.config.max_capacity_retries
                                );
                                sleep(Duration::from_millis(tier)).await;
                                continue;
                            }
                            return EndpointOutcome::SwitchAccount {
                                reason: "capacity retries exhausted".to_string(),
                                count_attempt: true,
                            };
                        }
                        if status != 429 {
                            // 503 without capacity wording behaves like a
                            // plain server error.
                            let count = self.pool.record_failure(email, ctx.model).await;
                            if count >= self.config.consecutive_failure_ceiling {
                                self.pool
                                    .mark_rate_limited(
                                        email,
                                        self.config.extended_cooldown_ms,
                                        ctx.model,
                                    )
                                    .await;
                            }
                            sleep(Duration::from_millis(SERVER_ERROR_PAUSE_MS)).await;
                            continue 'endpoints;
                        }

                        let reset_ms = ratelimit::parse_reset_delay_ms(
                            headers.get("retry-after").and_then(|v| v.to_str().ok()),
                            headers
                                .get("x-ratelimit-reset")
                                .and_then(|v| v.to_str().ok()),
                            headers
                                .get("x-ratelimit-reset-after")
                                .and_then(|v| v.to_str().ok()),
                            &body_text,
                        );
                        let failures = ctx.account.consecutive_failures + 1;
                        let smart_backoff = ratelimit::smart_backoff_ms(kind, reset_ms, failures);

                        // Sub-second resets are absorbed on the same endpoint.
                        if let Some(reset) = reset_ms {
                            if reset < 1_000 {
                                tracing::info!(
                                    "[{}] Short rate limit ({}ms); absorbing on same endpoint",
                                    ctx.trace_id,
                                    reset
                                );
                                sleep(Duration::from_millis(reset + NETWORK_RETRY_SLACK_MS)).await;
                                continue;
                            }
                        }

                        let verdict =
                            RateLimitDedup::global().register(email, ctx.model, smart_backoff);
                        if verdict.is_duplicate {
                            self.pool
                                .mark_rate_limited(email, smart_backoff, ctx.model)
                                .await;
                            return EndpointOutcome::SwitchAccount {
                                reason: "duplicate rate limit within dedup window".to_string(),
                                count_attempt: false,
                            };
                        }
                        if verdict.attempt == 1
                            && smart_backoff <= self.config.quick_retry_cooldown_ms
                        {
                            self.pool
                                .mark_rate_limited(email, smart_backoff, ctx.model)
                                .await;
                            tracing::info!(
                                "[{}] First rate limit (backoff {}ms); retrying same endpoint",
                                ctx.trace_id,
                                smart_backoff
                            );
                            sleep(Duration::from_millis(smart_backoff)).await;
                            continue;
                        }

                        // Long-term quota exhaustion: brief switch delay, mark
                        // and hand the request to another account.
                        sleep(Duration::from_millis(self.config.switch_account_delay_ms)).await;
                        self.pool
                            .mark_rate_limited(email, verdict.delay_ms.max(smart_backoff), ctx.model)
                            .await;
                        return EndpointOutcome::SwitchAccount {
                            reason: format!("rate limited ({:?}, backoff {}ms)", kind, smart_backoff),
                            count_attempt: true,
                        };
                    }
                    500..=599 => {
                        let count = self.pool.record_failure(email, ctx.model).await;
                        if count >= self.config.consecutive_failure_ceiling {
                            self.pool
                                .mark_rate_limited(email, self.config.extended_cooldown_ms, ctx.model)
                                .await;
                        }
                        tracing::warn!(
                            "[{}] Upstream {} at {} (endpoint {}/{})",
                            ctx.trace_id,
                            status,
                            base_url,
                            endpoint_idx + 1,
                            base_urls.len()
                        );
                        sleep(Duration::from_millis(SERVER_ERROR_PAUSE_MS)).await;
                        continue 'endpoints;
                    }
                    _ => {
                        tracing::warn!(
                            "[{}] Unexpected status {} at {}: {}",
                            ctx.trace_id,
                            status,
                            base_url,
                            body_text.chars().take(200).collect::<String>()
                        );
                        continue 'endpoints;
                    }
                }
            }
        }

        EndpointOutcome::SwitchAccount {
            reason: "all endpoints failed".to_string(),
            count_attempt: true,
        }
    }

    fn synthetic_output(&self, ctx: &AttemptContext<'_>) -> DispatchOutput {
        if ctx.client_streaming {
            let chunks = mappers::synthetic_no_response_stream(ctx.model);
            let stream: SseStream =
                Box::pin(futures::stream::iter(chunks.into_iter().map(Ok::<_, String>)));
            DispatchOutput::Stream(stream)
        } else {
            DispatchOutput::Json(serde_json::json!({
                "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                "type": "message",
                "role": "assistant",
                "model": ctx.model,
                "content": [{
                    "type": "text",
                    "text": "[No response after retries - please try again]"
                }],
                "stop_reason": "end_turn",
                "stop_sequence": null,
                "usage": { "input_tokens": 0, "output_tokens": 0 },
            }))
        }
    }

    async fn consume_success(
        &self,
        ctx: &AttemptContext<'_>,
        response: reqwest::Response,
        used_sse: bool,
    ) -> Result<DispatchOutput, ConsumeError> {
        if ctx.client_streaming {
            let upstream_stream = Box::pin(response.bytes_stream());
            let mut claude_stream = mappers::create_claude_sse_stream(
                upstream_stream,
                ctx.model.to_string(),
                ctx.trace_id.to_string(),
            );

            // Peek the first real event so an empty stream is caught while a
            // refetch is still possible.
            let first = loop {
                match tokio::time::timeout(Duration::from_secs(60), claude_stream.next()).await {
                    Ok(Some(Ok(bytes))) => {
                        if bytes.is_empty() || bytes.starts_with(b":") {
                            continue;
                        }
                        break bytes;
                    }
                    Ok(Some(Err(message))) => {
                        return Err(ConsumeError::Other(message));
                    }
                    Ok(None) => return Err(ConsumeError::Empty),
                    Err(_) => return Err(ConsumeError::Empty),
                }
            };

            let combined: SseStream = Box::pin(
                futures::stream::once(async move { Ok(first) }).chain(claude_stream),
            );
            return Ok(DispatchOutput::Stream(combined));
        }

        let body_text = response
            .text()
            .await
            .map_err(|e| ConsumeError::Other(format!("failed_to_read_body: {}", e)))?;
        if body_text.trim().is_empty() {
            return Err(ConsumeError::Empty);
        }

        let upstream_response = if used_sse {
            mappers::aggregate_sse_body(&body_text).map_err(|_| ConsumeError::Empty)?
        } else {
            serde_json::from_str::<mappers::models::UpstreamEnvelope>(&body_text)
                .map(|envelope| envelope.into_response())
                .map_err(|e| ConsumeError::Other(format!("failed_to_parse_body: {}", e)))?
        };
        if upstream_response.candidates.is_empty() {
            return Err(ConsumeError::Empty);
        }

        Ok(DispatchOutput::Json(mappers::transform_response(
            &upstream_response,
            ctx.model,
        )))
    }
}

enum ConsumeError {
    Empty,
    Other(String),
}
