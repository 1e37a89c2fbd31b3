use std::sync::{Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{GmailSettings, INBOX_LABEL};
use crate::connectors::{MailLabel, MailMessage, MailThread, Mailbox};
use crate::db::Database;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const API_BASE_ENV: &str = "TRIAGE_GMAIL_API_BASE";
const TOKEN_URL_ENV: &str = "TRIAGE_GMAIL_TOKEN_URL";
const CACHE_SKEW_SECONDS: i64 = 60;
const DEFAULT_PAGE_SIZE: usize = 100;
const MAX_RATE_LIMIT_RETRIES: usize = 5;
const ACCESS_TOKEN_KEY: &str = "gmail_access_token";
const TOKEN_CACHE_ENCRYPTION_KEY_ENV: &str = "TRIAGE_TOKEN_CACHE_KEY";
const TOKEN_CACHE_KEY_BYTES: usize = 32;
const TOKEN_CACHE_NONCE_BYTES: usize = 12;
const TOKEN_CACHE_ENVELOPE_VERSION: u8 = 1;
const REDACTED_BODY_MAX_LEN: usize = 200;
const HTML_WRAP_WIDTH: usize = 120;

/// Gmail REST mailbox authenticated with an OAuth refresh token.
#[derive(Debug)]
pub struct GmailMailbox {
    client: Client,
    api_base: String,
    token: Mutex<CachedAccessToken>,
    settings: GmailSettings,
}

impl GmailMailbox {
    /// Resolves credentials and obtains an access token, reusing an
    /// encrypted cached token from `db` when one is still valid.
    pub async fn connect(db: &Database, settings: &GmailSettings) -> Result<Self> {
        let client = Client::new();
        let token = match cached_token(db)? {
            Some(cached) => cached,
            None => {
                let credentials =
                    GmailCredentials::resolve_with(settings, |name| std::env::var(name).ok())?;
                let fresh = fetch_token(&client, &credentials).await?;
                store_token(db, &fresh)?;
                fresh
            }
        };

        let api_base = env_override(API_BASE_ENV).unwrap_or_else(|| GMAIL_API_BASE.to_string());
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: Mutex::new(token),
            settings: settings.clone(),
        })
    }

    /// A mailbox using a fixed access token that is never refreshed.
    pub fn with_access_token(client: Client, api_base: String, access_token: String) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: Mutex::new(CachedAccessToken {
                access_token,
                expires_at: DateTime::<Utc>::MAX_UTC,
            }),
            settings: GmailSettings::default(),
        }
    }

    /// The current access token, exchanged for a fresh one once expired.
    async fn bearer(&self) -> Result<String> {
        let current = self.lock_token().clone();
        if !current.is_expired() {
            return Ok(current.access_token);
        }

        debug!("gmail access token expired; refreshing");
        let credentials =
            GmailCredentials::resolve_with(&self.settings, |name| std::env::var(name).ok())?;
        let fresh = fetch_token(&self.client, &credentials).await?;
        let access_token = fresh.access_token.clone();
        *self.lock_token() = fresh;
        Ok(access_token)
    }

    fn lock_token(&self) -> MutexGuard<'_, CachedAccessToken> {
        self.token.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn send_with_retry(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<String> {
        let access_token = self.bearer().await?;
        let mut backoff_seconds = 1u64;

        for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .bearer_auth(&access_token)
                .header("accept", "application/json");
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request
                .send()
                .await
                .with_context(|| format!("gmail api request: {method} {url}"))?;

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    let body = response.text().await.context("read gmail 429 response body")?;
                    return Err(anyhow!(
                        "gmail api request exhausted retries: {}",
                        redact_response_body(&body)
                    ));
                }

                let wait_seconds = response
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(backoff_seconds);
                debug!(%url, wait_seconds, "gmail rate limited; backing off");
                sleep(StdDuration::from_secs(wait_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(32);
                continue;
            }

            let status = response.status();
            let text = response.text().await.context("read gmail api response body")?;
            if !status.is_success() {
                return Err(anyhow!(
                    "gmail api request failed: status={} body={}",
                    status,
                    redact_response_body(&text)
                ));
            }
            return Ok(text);
        }

        Err(anyhow!("gmail api request failed without response"))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T> {
        let body = self.send_with_retry(Method::GET, url, None).await?;
        serde_json::from_str(&body).with_context(|| format!("decode gmail {what}"))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        url: Url,
        payload: &Value,
        what: &str,
    ) -> Result<T> {
        let body = self.send_with_retry(Method::POST, url, Some(payload)).await?;
        serde_json::from_str(&body).with_context(|| format!("decode gmail {what}"))
    }

    fn url(&self, path: &str, params: &[(&str, String)]) -> Result<Url> {
        let raw = format!("{}/users/me/{path}", self.api_base);
        Url::parse_with_params(&raw, params).with_context(|| format!("build gmail url {raw}"))
    }

    async fn get_thread(&self, thread_id: &str, format: &str) -> Result<GmailThread> {
        let url = self.url(&format!("threads/{thread_id}"), &[("format", format.to_string())])?;
        self.get_json(url, "thread").await
    }

    async fn modify_thread(&self, thread_id: &str, add: &[&str], remove: &[&str]) -> Result<()> {
        let url = self.url(&format!("threads/{thread_id}/modify"), &[])?;
        let payload = json!({ "addLabelIds": add, "removeLabelIds": remove });
        let _: Value = self.post_json(url, &payload, "thread modify response").await?;
        Ok(())
    }
}

#[async_trait(?Send)]
impl Mailbox for GmailMailbox {
    fn name(&self) -> &str {
        "gmail_api"
    }

    async fn list_inbox_threads_since(&self, since_ms: i64) -> Result<Vec<MailThread>> {
        // `after:` has second granularity; the exact millisecond cut happens below.
        let query = format!("after:{}", since_ms.div_euclid(1000));
        let mut page_token: Option<String> = None;
        let mut threads = Vec::new();

        loop {
            let mut params = vec![
                ("labelIds", INBOX_LABEL.to_string()),
                ("q", query.clone()),
                ("maxResults", DEFAULT_PAGE_SIZE.to_string()),
            ];
            if let Some(token) = page_token.take() {
                params.push(("pageToken", token));
            }
            let page: GmailThreadList = self
                .get_json(self.url("threads", &params)?, "thread list")
                .await?;

            for stub in page.threads.unwrap_or_default() {
                let thread = self.get_thread(&stub.id, "minimal").await?;
                let Some(last_activity_ms) = thread.last_activity_ms() else {
                    continue;
                };
                if last_activity_ms > since_ms {
                    threads.push(MailThread {
                        id: stub.id,
                        last_activity_ms,
                    });
                }
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(threads)
    }

    async fn get_messages(&self, thread_id: &str) -> Result<Vec<MailMessage>> {
        let thread = self.get_thread(thread_id, "full").await?;
        Ok(thread
            .messages
            .unwrap_or_default()
            .iter()
            .map(map_gmail_message)
            .collect())
    }

    async fn get_or_create_label(&self, name: &str) -> Result<MailLabel> {
        let list: GmailLabelList = self.get_json(self.url("labels", &[])?, "label list").await?;
        if let Some(label) = list.labels.unwrap_or_default().into_iter().find(|l| l.name == name) {
            return Ok(MailLabel {
                id: label.id,
                name: label.name,
            });
        }

        let payload = json!({
            "name": name,
            "labelListVisibility": "labelShow",
            "messageListVisibility": "show",
        });
        let created: GmailLabel = self
            .post_json(self.url("labels", &[])?, &payload, "created label")
            .await
            .with_context(|| format!("create gmail label '{name}'"))?;
        Ok(MailLabel {
            id: created.id,
            name: created.name,
        })
    }

    async fn archive_thread(&self, thread_id: &str) -> Result<()> {
        self.modify_thread(thread_id, &[], &[INBOX_LABEL])
            .await
            .with_context(|| format!("archive gmail thread {thread_id}"))
    }

    async fn attach_label(&self, thread_id: &str, label: &MailLabel) -> Result<()> {
        self.modify_thread(thread_id, &[label.id.as_str()], &[])
            .await
            .with_context(|| format!("label gmail thread {thread_id} as '{}'", label.name))
    }

    async fn refresh(&self, thread_id: &str) -> Result<()> {
        self.get_thread(thread_id, "minimal").await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct GmailCredentials {
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

impl GmailCredentials {
    /// Environment variables win over the config file section.
    fn resolve_with(
        settings: &GmailSettings,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let pick = |var: &str, configured: &Option<String>, what: &str| {
            env(var)
                .or_else(|| configured.clone())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| anyhow!("missing gmail {what} ({var} or config gmail section)"))
        };

        Ok(Self {
            client_id: pick("TRIAGE_GMAIL_CLIENT_ID", &settings.client_id, "client id")?,
            client_secret: pick(
                "TRIAGE_GMAIL_CLIENT_SECRET",
                &settings.client_secret,
                "client secret",
            )?,
            refresh_token: pick(
                "TRIAGE_GMAIL_REFRESH_TOKEN",
                &settings.refresh_token,
                "refresh token",
            )?,
        })
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

async fn fetch_token(client: &Client, credentials: &GmailCredentials) -> Result<CachedAccessToken> {
    let token_url = env_override(TOKEN_URL_ENV).unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string());

    let response = client
        .post(&token_url)
        .form(&[
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", credentials.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ])
        .send()
        .await
        .with_context(|| format!("request gmail oauth token from {token_url}"))?;

    let status = response.status();
    let body = response.text().await.context("read gmail token response")?;
    if !status.is_success() {
        return Err(anyhow!(
            "gmail oauth token request failed: status={} body={}",
            status,
            redact_response_body(&body)
        ));
    }

    let payload: OAuthTokenResponse =
        serde_json::from_str(&body).context("decode gmail token JSON response")?;
    let lifetime = (payload.expires_in as i64).saturating_sub(CACHE_SKEW_SECONDS);
    Ok(CachedAccessToken {
        access_token: payload.access_token,
        expires_at: Utc::now() + Duration::seconds(lifetime),
    })
}

fn cached_token(db: &Database) -> Result<Option<CachedAccessToken>> {
    let Some(raw) = db
        .get_sync_state(ACCESS_TOKEN_KEY)?
        .and_then(|state| state.value)
    else {
        return Ok(None);
    };

    let Some(key) = token_cache_key()? else {
        db.delete_sync_state(ACCESS_TOKEN_KEY)?;
        return Ok(None);
    };

    match open_token_envelope(&raw, &key) {
        Ok(token) if !token.is_expired() => Ok(Some(token)),
        Ok(_) => {
            db.delete_sync_state(ACCESS_TOKEN_KEY)?;
            Ok(None)
        }
        Err(error) => {
            warn!(%error, "discarding unreadable gmail token cache");
            db.delete_sync_state(ACCESS_TOKEN_KEY)?;
            Ok(None)
        }
    }
}

/// Tokens are only cached when an encryption key is configured.
fn store_token(db: &Database, token: &CachedAccessToken) -> Result<()> {
    let Some(key) = token_cache_key()? else {
        return Ok(());
    };
    let sealed = seal_token_envelope(token, &key)?;
    db.set_sync_state(ACCESS_TOKEN_KEY, &sealed)
        .context("write gmail token cache")
}

fn token_cache_key() -> Result<Option<[u8; TOKEN_CACHE_KEY_BYTES]>> {
    env_override(TOKEN_CACHE_ENCRYPTION_KEY_ENV)
        .map(|value| parse_token_cache_key(&value))
        .transpose()
        .with_context(|| {
            format!("{TOKEN_CACHE_ENCRYPTION_KEY_ENV} must be base64 for exactly 32 bytes")
        })
}

fn parse_token_cache_key(raw: &str) -> Result<[u8; TOKEN_CACHE_KEY_BYTES]> {
    let decoded = STANDARD.decode(raw.trim()).context("decode token cache key")?;
    decoded
        .try_into()
        .map_err(|_| anyhow!("token cache key must be 32 bytes"))
}

fn aead_key(key: &[u8; TOKEN_CACHE_KEY_BYTES]) -> Result<LessSafeKey> {
    let unbound =
        UnboundKey::new(&AES_256_GCM, key).map_err(|_| anyhow!("construct AES-256-GCM key"))?;
    Ok(LessSafeKey::new(unbound))
}

fn seal_token_envelope(
    token: &CachedAccessToken,
    key: &[u8; TOKEN_CACHE_KEY_BYTES],
) -> Result<String> {
    let mut buffer = serde_json::to_vec(token).context("serialize token payload")?;
    let mut nonce = [0u8; TOKEN_CACHE_NONCE_BYTES];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| anyhow!("generate token cache nonce"))?;

    aead_key(key)?
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buffer)
        .map_err(|_| anyhow!("encrypt gmail token cache"))?;

    serde_json::to_string(&TokenEnvelope {
        version: TOKEN_CACHE_ENVELOPE_VERSION,
        nonce: STANDARD.encode(nonce),
        ciphertext: STANDARD.encode(&buffer),
    })
    .context("serialize token envelope")
}

fn open_token_envelope(raw: &str, key: &[u8; TOKEN_CACHE_KEY_BYTES]) -> Result<CachedAccessToken> {
    let envelope: TokenEnvelope = serde_json::from_str(raw).context("parse token envelope")?;
    if envelope.version != TOKEN_CACHE_ENVELOPE_VERSION {
        return Err(anyhow!("unsupported token envelope version {}", envelope.version));
    }

    let nonce: [u8; TOKEN_CACHE_NONCE_BYTES] = STANDARD
        .decode(&envelope.nonce)
        .context("decode envelope nonce")?
        .try_into()
        .map_err(|_| anyhow!("invalid nonce length in token envelope"))?;
    let mut buffer = STANDARD
        .decode(&envelope.ciphertext)
        .context("decode envelope ciphertext")?;

    let plaintext = aead_key(key)?
        .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buffer)
        .map_err(|_| anyhow!("decrypt gmail token cache"))?;
    serde_json::from_slice(plaintext).context("parse decrypted token payload")
}

fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }
    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
}

fn map_gmail_message(message: &GmailMessage) -> MailMessage {
    let payload = message.payload.as_ref();
    MailMessage {
        id: message.id.clone(),
        date_ms: message.internal_date_ms().unwrap_or_default(),
        subject: payload
            .and_then(|p| extract_header(p, "Subject"))
            .unwrap_or_default(),
        plain_body: payload.map(extract_plain_body).unwrap_or_default(),
    }
}

fn extract_header(payload: &GmailPayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// First `text/plain` part; otherwise the first `text/html` part rendered
/// to text.
fn extract_plain_body(payload: &GmailPayload) -> String {
    if let Some(text) = find_part(payload, "text/plain") {
        return text;
    }
    find_part(payload, "text/html")
        .map(|html| html_to_text(&html))
        .unwrap_or_default()
}

/// html2text panics on some malformed documents; those render as empty.
fn html_to_text(html: &str) -> String {
    std::panic::catch_unwind(|| {
        html2text::from_read(html.as_bytes(), HTML_WRAP_WIDTH)
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    })
    .unwrap_or_else(|_| {
        warn!("html body could not be rendered to text");
        String::new()
    })
}

fn find_part(payload: &GmailPayload, mime_type: &str) -> Option<String> {
    let matches = payload
        .mime_type
        .as_deref()
        .is_some_and(|m| m.eq_ignore_ascii_case(mime_type));
    if matches {
        let decoded = payload
            .body
            .as_ref()
            .and_then(|body| body.data.as_deref())
            .filter(|data| !data.is_empty())
            .and_then(|data| decode_body_data(data).ok());
        if decoded.is_some() {
            return decoded;
        }
    }

    payload
        .parts
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find_map(|part| find_part(part, mime_type))
}

fn decode_body_data(data: &str) -> Result<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .context("base64url decode gmail body data")?;
    String::from_utf8(bytes).context("utf8 decode gmail body data")
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedAccessToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedAccessToken {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenEnvelope {
    version: u8,
    nonce: String,
    ciphertext: String,
}

// --- Gmail API response types ---

#[derive(Debug, Clone, Deserialize)]
struct GmailThreadList {
    threads: Option<Vec<GmailThreadStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailThreadStub {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailThread {
    messages: Option<Vec<GmailMessage>>,
}

impl GmailThread {
    fn last_activity_ms(&self) -> Option<i64> {
        self.messages
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(GmailMessage::internal_date_ms)
            .max()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    payload: Option<GmailPayload>,
}

impl GmailMessage {
    fn internal_date_ms(&self) -> Option<i64> {
        self.internal_date.as_deref()?.trim().parse().ok()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GmailPayload {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPayload>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailBody {
    data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailLabelList {
    labels: Option<Vec<GmailLabel>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
}
