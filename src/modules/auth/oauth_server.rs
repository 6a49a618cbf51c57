use crate::modules::auth::oauth;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use url::Url;

const DEFAULT_CALLBACK_PORT: u16 = 51121;
const CALLBACK_PORT_FALLBACKS: u16 = 5;
// The listener closes itself if the user never completes the consent screen.
const CALLBACK_TIMEOUT_SECS: u64 = 120;

pub struct OAuthFlow {
    pub auth_url: String,
    pub redirect_uri: String,
    code_verifier: String,
    state: String,
    cancel_tx: watch::Sender<bool>,
    code_rx: mpsc::Receiver<Result<String, String>>,
}

fn success_html() -> &'static str {
    "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\r\n\
    <html>\
    <body style='font-family: sans-serif; text-align: center; padding: 50px;'>\
    <h1 style='color: green;'>Authorization Successful</h1>\
    <p>You can close this window and return to the terminal.</p>\
    </body>\
    </html>"
}

fn fail_html() -> &'static str {
    "HTTP/1.1 400 Bad Request\r\nContent-Type: text/html; charset=utf-8\r\n\r\n\
    <html>\
    <body style='font-family: sans-serif; text-align: center; padding: 50px;'>\
    <h1 style='color: red;'>Authorization Failed</h1>\
    <p>No authorization code was received. Please try again.</p>\
    </body>\
    </html>"
}

fn parse_callback_query(request: &str) -> (Option<String>, Option<String>) {
    let parsed = request
        .lines()
        .next()
        .and_then(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 {
                Some(parts[1])
            } else {
                None
            }
        })
        .and_then(|path| Url::parse(&format!("http://localhost{}", path)).ok());

    let Some(url) = parsed else {
        return (None, None);
    };
    let mut code = None;
    let mut state = None;
    for (k, v) in url.query_pairs() {
        if k == "code" {
            code = Some(v.to_string());
        } else if k == "state" {
            state = Some(v.to_string());
        }
    }
    (code, state)
}

async fn bind_callback_listener() -> Result<(TcpListener, u16), String> {
    let base_port = std::env::var("OAUTH_CALLBACK_PORT")
        .ok()
        .and_then(|p| p.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_CALLBACK_PORT);

    for offset in 0..=CALLBACK_PORT_FALLBACKS {
        let port = base_port.saturating_add(offset);
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                let bound = listener
                    .local_addr()
                    .map_err(|e| format!("failed_to_get_callback_port: {}", e))?
                    .port();
                return Ok((listener, bound));
            }
            Err(e) => {
                tracing::debug!("OAuth callback port {} unavailable: {}", port, e);
            }
        }
    }
    Err(format!(
        "no_free_oauth_callback_port in {}..={}",
        base_port,
        base_port + CALLBACK_PORT_FALLBACKS
    ))
}

impl OAuthFlow {
    // Bind the loopback listener, build the consent URL, and start waiting
    // for the redirect in the background.
    pub async fn start() -> Result<Self, String> {
        let (listener, port) = bind_callback_listener().await?;
        let redirect_uri = format!("http://localhost:{}/oauth-callback", port);
        let state = uuid::Uuid::new_v4().to_string();
        let code_verifier = oauth::generate_pkce_verifier();
        let code_challenge = oauth::pkce_challenge_s256(&code_verifier);
        let auth_url = oauth::get_auth_url(&redirect_uri, &state, &code_challenge)?;

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let (code_tx, code_rx) = mpsc::channel::<Result<String, String>>(1);

        let expected_state = state.clone();
        tokio::spawn(async move {
            let accept = tokio::select! {
                res = listener.accept() => res,
                _ = cancel_rx.changed() => {
                    tracing::info!("OAuth callback listener cancelled");
                    return;
                }
                _ = tokio::time::sleep(std::time::Duration::from_secs(CALLBACK_TIMEOUT_SECS)) => {
                    let _ = code_tx
                        .send(Err("oauth_callback_timed_out_after_2_minutes".to_string()))
                        .await;
                    return;
                }
            };

            let Ok((mut stream, _)) = accept else {
                let _ = code_tx
                    .send(Err("failed_to_accept_oauth_callback".to_string()))
                    .await;
                return;
            };

            let mut buffer = [0u8; 4096];
            let bytes_read = stream.read(&mut buffer).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buffer[..bytes_read]);
            let (code, received_state) = parse_callback_query(&request);

            // The state parameter is required and verified (CSRF protection).
            let (result, response_html) = match (code, received_state) {
                (Some(code), Some(s)) if s == expected_state => (Ok(code), success_html()),
                (Some(_), _) => (
                    Err("OAuth state mismatch".to_string()),
                    fail_html(),
                ),
                (None, _) => (
                    Err("Failed to get authorization code in callback".to_string()),
                    fail_html(),
                ),
            };

            let _ = stream.write_all(response_html.as_bytes()).await;
            let _ = stream.flush().await;
            let _ = code_tx.send(result).await;
        });

        Ok(Self {
            auth_url,
            redirect_uri,
            code_verifier,
            state,
            cancel_tx,
            code_rx,
        })
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn abort(&self) {
        let _ = self.cancel_tx.send(true);
    }

    // Block until the browser redirect arrives, then exchange the code.
    pub async fn wait_for_tokens(mut self) -> Result<oauth::TokenResponse, String> {
        let code = match self.code_rx.recv().await {
            Some(Ok(code)) => code,
            Some(Err(e)) => return Err(e),
            None => return Err("OAuth flow channel closed unexpectedly".to_string()),
        };
        oauth::exchange_code(&code, &self.redirect_uri, &self.code_verifier).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_query_parsing() {
        let request = "GET /oauth-callback?code=4%2Fabc&state=xyz HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (code, state) = parse_callback_query(request);
        assert_eq!(code.as_deref(), Some("4/abc"));
        assert_eq!(state.as_deref(), Some("xyz"));
    }

    #[test]
    fn callback_without_code_yields_none() {
        let request = "GET /oauth-callback?error=access_denied HTTP/1.1\r\n\r\n";
        let (code, state) = parse_callback_query(request);
        assert!(code.is_none());
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn flow_rejects_state_mismatch() {
        std::env::set_var(
            "VIADUCT_GOOGLE_OAUTH_CLIENT_ID",
            "test-client.apps.googleusercontent.com",
        );
        // Pick a random high port so parallel tests do not collide.
        std::env::set_var("OAUTH_CALLBACK_PORT", "0");
        let flow = OAuthFlow::start().await.expect("flow");
        let redirect = flow.redirect_uri.clone();

        let url = format!("{}?code=abc&state=wrong-state", redirect);
        tokio::spawn(async move {
            let _ = reqwest::get(url).await;
        });

        let result = flow.wait_for_tokens().await;
        assert!(result.unwrap_err().contains("state mismatch"));
        std::env::remove_var("OAUTH_CALLBACK_PORT");
    }
}
