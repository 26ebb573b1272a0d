use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use watira_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

use crate::mail::{MailError, Mailbox};
use crate::truncate::{truncate_text, EMAIL_BODY_MAX};

pub const DISABLED_MESSAGE: &str = "email reading is currently disabled";
const MAX_RESULTS_LIMIT: u32 = 20;

fn default_max_results() -> u32 {
    5
}

#[derive(Debug, Deserialize)]
struct ReadEmailArgs {
    #[serde(default)]
    query: Option<String>,
    #[serde(default = "default_max_results")]
    max_results: u32,
}

pub struct ReadEmailTool {
    mailbox: Arc<dyn Mailbox>,
}

impl ReadEmailTool {
    pub fn new(mailbox: Arc<dyn Mailbox>) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl Tool for ReadEmailTool {
    fn name(&self) -> &str {
        "read_email"
    }

    fn description(&self) -> &str {
        "Read the user's most recent emails, optionally filtered by a search query"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Mailbox search query, e.g. 'from:alice subject:report'"
                },
                "max_results": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_RESULTS_LIMIT,
                    "description": "Number of messages (default: 5)"
                }
            }
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let args: ReadEmailArgs = ToolError::parse_args(args)?;
        if !(1..=MAX_RESULTS_LIMIT).contains(&args.max_results) {
            return Err(ToolError::InvalidArguments(format!(
                "max_results must be between 1 and {MAX_RESULTS_LIMIT}"
            )));
        }

        let query = args.query.as_deref().map(str::trim).filter(|q| !q.is_empty());
        let mut messages = self
            .mailbox
            .search(query, args.max_results)
            .await
            .map_err(|e| match e {
                MailError::Disabled => ToolError::Disabled(DISABLED_MESSAGE.into()),
                other => ToolError::ExecutionFailed(other.to_string()),
            })?;

        for message in &mut messages {
            message.body = truncate_text(&message.body, EMAIL_BODY_MAX);
        }

        Ok(ToolOutput::json(serde_json::json!({
            "count": messages.len(),
            "messages": messages,
        })))
    }
}
