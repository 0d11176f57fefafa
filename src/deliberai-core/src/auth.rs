//! OAuth/PKCE session collaborator.
//!
//! The deliberation core only ever asks [`SessionGate::is_session_valid`].
//! Everything else here drives the browser login: PKCE pair generation,
//! a loopback listener that receives the authorization code, the token
//! exchange and transparent refresh.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::error::DeliberationError;

pub const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
pub const AUTHORIZE_URL: &str = "https://auth.openai.com/oauth/authorize";
pub const TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
pub const REDIRECT_URI: &str = "http://localhost:1455/auth/callback";
pub const CALLBACK_PORT: u16 = 1455;
const SCOPE: &str = "openid profile email offline_access";

const PENDING_LOGIN_TTL: Duration = Duration::from_secs(10 * 60);
const PENDING_LOGIN_CAPACITY: usize = 16;
const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_EXPIRES_IN: u64 = 3600;

/// The only question the core asks about authentication.
#[async_trait]
pub trait SessionGate: Send + Sync {
    fn is_session_valid(&self) -> bool;

    /// Renew an expired session if possible. Returns whether it is valid afterwards.
    async fn ensure_valid(&self) -> bool {
        self.is_session_valid()
    }
}

/// Gate for setups that need no login.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysValid;

impl SessionGate for AlwaysValid {
    fn is_session_valid(&self) -> bool {
        true
    }
}

/// PKCE code verifier and its S256 challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let bytes: [u8; 32] = rand::random();
        Self::from_verifier(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

/// Random hex value for the OAuth `state` parameter.
pub fn new_state() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Authorization URL the user opens in a browser.
pub fn authorize_url(challenge: &str, state: &str) -> Result<String, DeliberationError> {
    let url = reqwest::Url::parse_with_params(
        AUTHORIZE_URL,
        &[
            ("response_type", "code"),
            ("client_id", CLIENT_ID),
            ("redirect_uri", REDIRECT_URI),
            ("scope", SCOPE),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
            ("state", state),
            ("id_token_add_organizations", "true"),
            ("codex_cli_simplified_flow", "true"),
        ],
    )
    .map_err(|e| DeliberationError::AuthFlow(e.to_string()))?;
    Ok(url.to_string())
}

struct PendingLogin {
    verifier: String,
    created_at: Instant,
}

/// Logins waiting for their callback, keyed by `state`.
///
/// Bounded: expired entries are evicted on every insert, and the oldest
/// entry goes when the map is full.
pub struct PendingLogins {
    entries: HashMap<String, PendingLogin>,
    ttl: Duration,
    capacity: usize,
}

impl Default for PendingLogins {
    fn default() -> Self {
        Self::new(PENDING_LOGIN_TTL, PENDING_LOGIN_CAPACITY)
    }
}

impl PendingLogins {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, state: String, verifier: String) {
        self.insert_at(state, verifier, Instant::now());
    }

    fn insert_at(&mut self, state: String, verifier: String, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, p| now.saturating_duration_since(p.created_at) <= ttl);

        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, p)| p.created_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }

        self.entries.insert(
            state,
            PendingLogin {
                verifier,
                created_at: now,
            },
        );
    }

    /// Remove and return the verifier for `state` if it has not expired.
    pub fn take(&mut self, state: &str) -> Option<String> {
        self.take_at(state, Instant::now())
    }

    fn take_at(&mut self, state: &str, now: Instant) -> Option<String> {
        let pending = self.entries.remove(state)?;
        (now.saturating_duration_since(pending.created_at) <= self.ttl).then_some(pending.verifier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Access/refresh tokens held in memory for the running process.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: SystemTime,
}

impl TokenSet {
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

/// A login in progress: open `url`, then wait for the callback.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub url: String,
    pub state: String,
}

/// Authorization code delivered to the loopback listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

/// OAuth session for the hosted identity provider.
pub struct OAuthSession {
    http_client: reqwest::Client,
    token_url: String,
    tokens: RwLock<Option<TokenSet>>,
    pending: Mutex<PendingLogins>,
}

impl OAuthSession {
    pub fn new() -> Result<Self, DeliberationError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                DeliberationError::ConfigError(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self {
            http_client,
            token_url: TOKEN_URL.to_string(),
            tokens: RwLock::new(None),
            pending: Mutex::new(PendingLogins::default()),
        })
    }

    /// Exchange and refresh tokens against `token_url` instead of the hosted endpoint.
    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// Start a login: generates the PKCE pair and remembers it under a fresh state.
    pub fn begin_login(&self) -> Result<LoginRequest, DeliberationError> {
        let pkce = PkcePair::generate();
        let state = new_state();
        let url = authorize_url(&pkce.challenge, &state)?;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.clone(), pkce.verifier);
        Ok(LoginRequest { url, state })
    }

    /// Exchange the authorization code for tokens.
    pub async fn complete_login(&self, callback: &CallbackParams) -> Result<(), DeliberationError> {
        let verifier = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(&callback.state)
            .ok_or_else(|| DeliberationError::AuthFlow("invalid_state".to_string()))?;

        let tokens = self
            .request_tokens(&[
                ("grant_type", "authorization_code"),
                ("client_id", CLIENT_ID),
                ("code", callback.code.as_str()),
                ("redirect_uri", REDIRECT_URI),
                ("code_verifier", verifier.as_str()),
            ])
            .await?;

        info!("OAuth login completed");
        self.store_tokens(tokens);
        Ok(())
    }

    pub fn logout(&self) {
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn store_tokens(&self, tokens: TokenSet) {
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = Some(tokens);
    }

    async fn request_tokens(&self, form: &[(&str, &str)]) -> Result<TokenSet, DeliberationError> {
        let response = self
            .http_client
            .post(&self.token_url)
            .form(form)
            .send()
            .await
            .map_err(|_| DeliberationError::AuthFlow("network_error".to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(DeliberationError::AuthFlow(token_error_message(&body)));
        }

        let data: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| DeliberationError::AuthFlow(format!("invalid token response: {}", e)))?;
        let access_token = data
            .access_token
            .ok_or_else(|| DeliberationError::AuthFlow("no_access_token".to_string()))?;

        Ok(TokenSet {
            access_token,
            refresh_token: data.refresh_token,
            expires_at: SystemTime::now()
                + Duration::from_secs(data.expires_in.unwrap_or(DEFAULT_EXPIRES_IN)),
        })
    }
}

#[async_trait]
impl SessionGate for OAuthSession {
    fn is_session_valid(&self) -> bool {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_expired_at(SystemTime::now()))
    }

    /// Refresh the access token when it has expired.
    async fn ensure_valid(&self) -> bool {
        if self.is_session_valid() {
            return true;
        }

        let refresh_token = self
            .tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|t| t.refresh_token.clone());

        let Some(refresh_token) = refresh_token else {
            return false;
        };

        match self
            .request_tokens(&[
                ("grant_type", "refresh_token"),
                ("client_id", CLIENT_ID),
                ("refresh_token", refresh_token.as_str()),
            ])
            .await
        {
            Ok(mut tokens) => {
                // The provider may omit a new refresh token; keep the old one.
                tokens.refresh_token.get_or_insert(refresh_token);
                self.store_tokens(tokens);
                true
            }
            Err(e) => {
                warn!("token refresh failed: {}", e);
                self.logout();
                false
            }
        }
    }
}

fn token_error_message(body: &str) -> String {
    if let Ok(err) = serde_json::from_str::<TokenErrorResponse>(body) {
        if let Some(message) = err.error_description.or(err.error) {
            return message;
        }
    }
    if body.contains("Just a moment") || body.contains("cf_chl") {
        return "Cloudflare bloqueou a requisição. Tente novamente em alguns segundos.".to_string();
    }
    "token_exchange_failed".to_string()
}

/// Loopback listener receiving the identity provider's redirect.
pub struct CallbackListener {
    listener: TcpListener,
}

impl CallbackListener {
    pub async fn bind() -> Result<Self, DeliberationError> {
        Self::bind_port(CALLBACK_PORT).await
    }

    pub async fn bind_port(port: u16) -> Result<Self, DeliberationError> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                DeliberationError::AuthFlow(format!("Porta {} já está em uso.", port))
            } else {
                DeliberationError::AuthFlow(e.to_string())
            }
        })?;
        Ok(Self { listener })
    }

    pub fn local_port(&self) -> Option<u16> {
        self.listener.local_addr().ok().map(|a| a.port())
    }

    /// Wait for `/auth/callback`, answering any other path with 404.
    pub async fn wait_for_callback(&self) -> Result<CallbackParams, DeliberationError> {
        tokio::time::timeout(CALLBACK_TIMEOUT, self.accept_loop())
            .await
            .map_err(|_| DeliberationError::AuthFlow("Timeout - no callback received".to_string()))?
    }

    async fn accept_loop(&self) -> Result<CallbackParams, DeliberationError> {
        loop {
            let (mut stream, _) = self
                .listener
                .accept()
                .await
                .map_err(|e| DeliberationError::AuthFlow(e.to_string()))?;

            let mut buf = vec![0u8; 8192];
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| DeliberationError::AuthFlow(e.to_string()))?;
            let request = String::from_utf8_lossy(&buf[..n]);
            let target = request
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(1))
                .unwrap_or("/");

            let outcome = parse_callback(target);
            let (status_line, body) = match &outcome {
                None => ("404 Not Found", "Not Found"),
                Some(Ok(_)) => ("200 OK", "Login concluído. Você pode fechar esta janela."),
                Some(Err(_)) => ("400 Bad Request", "Falha no login."),
            };
            let reply = format!(
                "HTTP/1.1 {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            if let Err(e) = stream.write_all(reply.as_bytes()).await {
                debug!("failed to answer callback request: {}", e);
            }

            if let Some(result) = outcome {
                return result;
            }
        }
    }
}

/// `None` when `target` is not the callback path.
fn parse_callback(target: &str) -> Option<Result<CallbackParams, DeliberationError>> {
    let url = reqwest::Url::parse(&format!("http://localhost{}", target)).ok()?;
    if url.path() != "/auth/callback" {
        return None;
    }

    let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
    if let Some(error) = params.get("error") {
        let description = params.get("error_description").unwrap_or(error);
        return Some(Err(DeliberationError::AuthFlow(description.clone())));
    }

    Some(match (params.get("code"), params.get("state")) {
        (Some(code), Some(state)) => Ok(CallbackParams {
            code: code.clone(),
            state: state.clone(),
        }),
        _ => Err(DeliberationError::AuthFlow("missing_params".to_string())),
    })
}
