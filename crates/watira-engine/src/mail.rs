use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("email is disabled")]
    Disabled,

    #[error("email provider rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("email provider unreachable: {0}")]
    Network(String),

    #[error("unexpected email provider response: {0}")]
    Decode(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SentEmail {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EmailSummary {
    pub id: String,
    pub from: String,
    pub subject: String,
    pub date: String,
    pub snippet: String,
    pub body: String,
}

/// The user's mailbox as seen by the email tools.
#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> Result<SentEmail, MailError>;

    /// Most recent messages matching `query` (provider search syntax).
    async fn search(&self, query: Option<&str>, max_results: u32)
        -> Result<Vec<EmailSummary>, MailError>;
}

/// Used when email is turned off in settings or no token is configured.
pub struct DisabledMailbox;

#[async_trait]
impl Mailbox for DisabledMailbox {
    async fn send(&self, _email: OutgoingEmail) -> Result<SentEmail, MailError> {
        Err(MailError::Disabled)
    }

    async fn search(
        &self,
        _query: Option<&str>,
        _max_results: u32,
    ) -> Result<Vec<EmailSummary>, MailError> {
        Err(MailError::Disabled)
    }
}

#[derive(Clone, Debug)]
pub struct GmailConfig {
    /// e.g. `https://gmail.googleapis.com/gmail/v1/users/me`
    pub api_base: String,
    pub token: SecretString,
    pub sender: Option<String>,
    pub timeout: Duration,
}

/// Gmail REST client authenticated with a bearer token.
pub struct GmailMailbox {
    client: Client,
    config: GmailConfig,
}

impl GmailMailbox {
    pub fn new(config: GmailConfig) -> Result<Self, MailError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MailError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.api_base.trim_end_matches('/'))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T, MailError> {
        let resp = req
            .bearer_auth(self.config.token.expose_secret())
            .send()
            .await
            .map_err(|e| MailError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| MailError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Mailbox for GmailMailbox {
    #[instrument(skip_all, fields(attachments = email.attachments.len()))]
    async fn send(&self, email: OutgoingEmail) -> Result<SentEmail, MailError> {
        let raw = compose_message(self.config.sender.as_deref(), &email);
        let body = serde_json::json!({ "raw": URL_SAFE.encode(raw.as_bytes()) });
        let sent: GmailSendResponse = self
            .get_json(self.client.post(self.url("messages/send")).json(&body))
            .await?;
        debug!(id = %sent.id, "email sent");
        Ok(SentEmail {
            id: sent.id,
            thread_id: sent.thread_id,
        })
    }

    #[instrument(skip(self))]
    async fn search(
        &self,
        query: Option<&str>,
        max_results: u32,
    ) -> Result<Vec<EmailSummary>, MailError> {
        let mut params = vec![("maxResults", max_results.to_string())];
        if let Some(q) = query.filter(|q| !q.trim().is_empty()) {
            params.push(("q", q.to_string()));
        }
        let listing: GmailListResponse = self
            .get_json(self.client.get(self.url("messages")).query(&params))
            .await?;

        let mut out = Vec::with_capacity(listing.messages.len());
        for entry in listing.messages.iter().take(max_results as usize) {
            let message: GmailMessage = self
                .get_json(
                    self.client
                        .get(self.url(&format!("messages/{}", entry.id)))
                        .query(&[("format", "full")]),
                )
                .await?;
            out.push(message.into_summary());
        }
        Ok(out)
    }
}

/// Records sent mail and serves a fixed inbox.
#[derive(Default)]
pub struct MemoryMailbox {
    sent: Mutex<Vec<OutgoingEmail>>,
    inbox: Vec<EmailSummary>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inbox(inbox: Vec<EmailSummary>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            inbox,
        }
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn send(&self, email: OutgoingEmail) -> Result<SentEmail, MailError> {
        let mut sent = self.sent.lock();
        sent.push(email);
        Ok(SentEmail {
            id: format!("mem-{}", sent.len()),
            thread_id: None,
        })
    }

    async fn search(
        &self,
        query: Option<&str>,
        max_results: u32,
    ) -> Result<Vec<EmailSummary>, MailError> {
        let needle = query.map(|q| q.to_lowercase());
        Ok(self
            .inbox
            .iter()
            .filter(|m| match &needle {
                Some(n) => {
                    m.subject.to_lowercase().contains(n.as_str())
                        || m.body.to_lowercase().contains(n.as_str())
                }
                None => true,
            })
            .take(max_results as usize)
            .cloned()
            .collect())
    }
}

/// Render an RFC 2822 message. Text and attachments are base64 encoded, and
/// a non-ASCII subject uses an RFC 2047 encoded word.
pub fn compose_message(sender: Option<&str>, email: &OutgoingEmail) -> String {
    let mut out = String::new();
    if let Some(from) = sender {
        push_header(&mut out, "From", from);
    }
    push_header(&mut out, "To", &email.to);
    push_header(&mut out, "Subject", &encode_header_word(&email.subject));
    push_header(&mut out, "MIME-Version", "1.0");

    if email.attachments.is_empty() {
        push_text_part(&mut out, &email.body);
        return out;
    }

    let boundary = boundary_for(email);
    push_header(
        &mut out,
        "Content-Type",
        &format!("multipart/mixed; boundary=\"{boundary}\""),
    );
    out.push_str("\r\n");

    out.push_str(&format!("--{boundary}\r\n"));
    push_text_part(&mut out, &email.body);
    for attachment in &email.attachments {
        out.push_str(&format!("--{boundary}\r\n"));
        push_header(&mut out, "Content-Type", &attachment.mime_type);
        push_header(&mut out, "Content-Transfer-Encoding", "base64");
        push_header(
            &mut out,
            "Content-Disposition",
            &format!("attachment; filename=\"{}\"", attachment.filename),
        );
        out.push_str("\r\n");
        push_wrapped_base64(&mut out, &attachment.bytes);
    }
    out.push_str(&format!("--{boundary}--\r\n"));
    out
}

fn push_header(out: &mut String, name: &str, value: &str) {
    // Header injection: values never span lines.
    let value: String = value.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    out.push_str(name);
    out.push_str(": ");
    out.push_str(&value);
    out.push_str("\r\n");
}

fn push_text_part(out: &mut String, body: &str) {
    push_header(out, "Content-Type", "text/plain; charset=\"UTF-8\"");
    push_header(out, "Content-Transfer-Encoding", "base64");
    out.push_str("\r\n");
    push_wrapped_base64(out, body.as_bytes());
}

fn push_wrapped_base64(out: &mut String, bytes: &[u8]) {
    let encoded = STANDARD.encode(bytes);
    for chunk in encoded.as_bytes().chunks(76) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }
}

fn encode_header_word(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value.as_bytes()))
    }
}

fn boundary_for(email: &OutgoingEmail) -> String {
    let mut hasher = Sha256::new();
    hasher.update(email.to.as_bytes());
    hasher.update(email.subject.as_bytes());
    hasher.update(email.body.as_bytes());
    for attachment in &email.attachments {
        hasher.update(&attachment.bytes);
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("watira-{}", &digest[..24])
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailSendResponse {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Deserialize)]
struct GmailListResponse {
    #[serde(default)]
    messages: Vec<GmailMessageRef>,
}

#[derive(Deserialize)]
struct GmailMessageRef {
    id: String,
}

#[derive(Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    payload: Option<GmailPart>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    #[serde(default)]
    body: Option<GmailBody>,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

#[derive(Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct GmailBody {
    #[serde(default)]
    data: Option<String>,
}

impl GmailMessage {
    fn into_summary(self) -> EmailSummary {
        let payload = self.payload.unwrap_or_default();
        let header = |name: &str| {
            payload
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case(name))
                .map(|h| h.value.clone())
                .unwrap_or_default()
        };
        EmailSummary {
            from: header("From"),
            subject: header("Subject"),
            date: header("Date"),
            body: payload.plain_text().unwrap_or_default(),
            id: self.id,
            snippet: self.snippet,
        }
    }
}

impl GmailPart {
    /// First `text/plain` body in the part tree, depth first.
    fn plain_text(&self) -> Option<String> {
        if self.mime_type.starts_with("text/plain") {
            if let Some(data) = self.body.as_ref().and_then(|b| b.data.as_deref()) {
                let bytes = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')).ok()?;
                return Some(String::from_utf8_lossy(&bytes).into_owned());
            }
        }
        self.parts.iter().find_map(GmailPart::plain_text)
    }
}
