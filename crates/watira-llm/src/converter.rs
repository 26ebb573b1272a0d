use serde_json::{json, Value};

use watira_core::context::ModelContext;
use watira_core::messages::{
    AssistantContent, AssistantMessage, Message, ToolResultMessage, VISUAL_PLACEHOLDER,
};
use watira_core::provider::GenerateOptions;

/// Defaults applied when the caller leaves an option unset.
#[derive(Clone, Debug)]
pub struct GenerationDefaults {
    pub max_output_tokens: u32,
    pub temperature: f64,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_output_tokens: 8192,
            temperature: 0.4,
        }
    }
}

/// Convert a ModelContext into a `streamGenerateContent` request body.
pub fn build_request_body(
    context: &ModelContext,
    options: &GenerateOptions,
    defaults: &GenerationDefaults,
) -> Value {
    let mut generation_config = json!({
        "maxOutputTokens": options.max_output_tokens.unwrap_or(defaults.max_output_tokens),
        "temperature": options.temperature.unwrap_or(defaults.temperature),
    });
    if !options.stop_sequences.is_empty() {
        generation_config["stopSequences"] = json!(options.stop_sequences);
    }

    let mut body = json!({
        "contents": convert_messages(&context.messages),
        "generationConfig": generation_config,
    });

    if let Some(prompt) = context.system_prompt.as_deref().filter(|p| !p.is_empty()) {
        body["systemInstruction"] = json!({ "parts": [{ "text": prompt }] });
    }

    if !context.tools.is_empty() {
        let declarations: Vec<Value> = context
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema,
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }

    body
}

/// Convert history into `contents`. Consecutive tool results are merged into
/// one user-role entry so every `functionCall` turn is answered in a single
/// `functionResponse` turn.
pub fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut contents: Vec<Value> = Vec::new();
    let mut pending_responses: Vec<Value> = Vec::new();

    for msg in messages {
        if let Message::ToolResult(tr) = msg {
            pending_responses.push(convert_tool_result(tr));
            continue;
        }
        if !pending_responses.is_empty() {
            contents.push(json!({
                "role": "user",
                "parts": std::mem::take(&mut pending_responses),
            }));
        }
        match msg {
            Message::User(u) => {
                contents.push(json!({
                    "role": "user",
                    "parts": [{ "text": replace_inline_image(&u.text) }],
                }));
            }
            Message::Assistant(a) => {
                if let Some(content) = convert_assistant(a) {
                    contents.push(content);
                }
            }
            Message::ToolResult(_) => {}
        }
    }

    if !pending_responses.is_empty() {
        contents.push(json!({ "role": "user", "parts": pending_responses }));
    }

    contents
}

fn convert_assistant(msg: &AssistantMessage) -> Option<Value> {
    let parts: Vec<Value> = msg
        .content
        .iter()
        .filter_map(|block| match block {
            AssistantContent::Text { text } if text.is_empty() => None,
            AssistantContent::Text { text } => Some(json!({ "text": replace_inline_image(text) })),
            AssistantContent::ToolCall(call) => Some(json!({
                "functionCall": { "name": call.name, "args": call.arguments },
            })),
        })
        .collect();

    // Gemini rejects model turns with no parts; an interrupted empty reply is skipped.
    if parts.is_empty() {
        return None;
    }
    Some(json!({ "role": "model", "parts": parts }))
}

fn convert_tool_result(msg: &ToolResultMessage) -> Value {
    let mut response = json!({ "content": msg.text_content() });
    if msg.is_error {
        response["error"] = json!(true);
    }
    json!({
        "functionResponse": {
            "name": msg.tool_name,
            "response": response,
        }
    })
}

/// Stored history may carry rendered images as data URLs; the model only
/// needs to know a visual was shown.
fn replace_inline_image(text: &str) -> String {
    if text.trim_start().starts_with("data:image/") {
        VISUAL_PLACEHOLDER.to_string()
    } else {
        text.to_string()
    }
}
