use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;
use watira_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

use crate::cache::ArtifactCache;
use crate::fingerprint::Fingerprint;
use crate::mail::{Attachment, MailError, Mailbox, OutgoingEmail};

pub const DISABLED_MESSAGE: &str = "email sending is currently disabled";

#[derive(Debug, Deserialize)]
struct SendEmailArgs {
    #[serde(default)]
    to: Option<String>,
    subject: String,
    body: String,
    /// Fingerprint of a previously rendered visual.
    #[serde(default)]
    attach_artifact: Option<String>,
}

pub struct SendEmailTool {
    mailbox: Arc<dyn Mailbox>,
    cache: Arc<ArtifactCache>,
    default_recipient: Option<String>,
}

impl SendEmailTool {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        cache: Arc<ArtifactCache>,
        default_recipient: Option<String>,
    ) -> Self {
        Self {
            mailbox,
            cache,
            default_recipient,
        }
    }

    fn recipient(&self, requested: Option<String>) -> Result<String, ToolError> {
        let to = requested
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| self.default_recipient.clone())
            .ok_or_else(|| {
                ToolError::InvalidArguments("no recipient given and no default configured".into())
            })?;
        if !looks_like_address(&to) {
            return Err(ToolError::InvalidArguments(format!(
                "not an email address: {to}"
            )));
        }
        Ok(to)
    }

    fn attachment(&self, raw: &str) -> Result<Attachment, ToolError> {
        let fp = Fingerprint::parse(raw.trim()).ok_or_else(|| {
            ToolError::InvalidArguments(format!("malformed artifact fingerprint: {raw}"))
        })?;
        let artifact = self
            .cache
            .get(&fp)
            .ok_or_else(|| ToolError::InvalidArguments(format!("unknown artifact: {fp}")))?;
        Ok(Attachment {
            filename: format!("visual-{}.{}", &fp.as_str()[..12], extension(&artifact.mime_type)),
            mime_type: artifact.mime_type.clone(),
            bytes: artifact.bytes.clone(),
        })
    }
}

fn looks_like_address(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !s.chars().any(|c| c.is_whitespace() || c == ',' || c == ';')
                && s.matches('@').count() == 1
        }
        None => false,
    }
}

fn extension(mime_type: &str) -> &'static str {
    match mime_type {
        "image/svg+xml" => "svg",
        "image/png" => "png",
        "application/json" => "json",
        _ => "bin",
    }
}

#[async_trait]
impl Tool for SendEmailTool {
    fn name(&self) -> &str {
        "send_email"
    }

    fn description(&self) -> &str {
        "Send an email on the user's behalf, optionally attaching a visual rendered earlier in the conversation"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["subject", "body"],
            "properties": {
                "to": {
                    "type": "string",
                    "description": "Recipient address. Defaults to the user's own address."
                },
                "subject": { "type": "string" },
                "body": { "type": "string", "description": "Plain text body" },
                "attach_artifact": {
                    "type": "string",
                    "description": "Fingerprint returned by render_visual"
                }
            }
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let args: SendEmailArgs = ToolError::parse_args(args)?;

        let subject = args.subject.trim().to_string();
        if subject.is_empty() {
            return Err(ToolError::InvalidArguments("subject must not be empty".into()));
        }
        if args.body.trim().is_empty() {
            return Err(ToolError::InvalidArguments("body must not be empty".into()));
        }
        let to = self.recipient(args.to)?;
        let attachments = match args.attach_artifact.as_deref() {
            Some(raw) => vec![self.attachment(raw)?],
            None => Vec::new(),
        };

        let email = OutgoingEmail {
            to: to.clone(),
            subject,
            body: args.body,
            attachments,
        };
        let attached = email.attachments.len();

        let sent = self.mailbox.send(email).await.map_err(|e| match e {
            MailError::Disabled => ToolError::Disabled(DISABLED_MESSAGE.into()),
            other => ToolError::ExecutionFailed(other.to_string()),
        })?;
        info!(message_id = %sent.id, attachments = attached, "email sent");

        Ok(ToolOutput::json(serde_json::json!({
            "status": "sent",
            "to": to,
            "message_id": sent.id,
            "attachments": attached,
        })))
    }
}
