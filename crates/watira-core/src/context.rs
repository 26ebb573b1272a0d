use crate::messages::Message;
use crate::tools::ToolDefinition;

/// Everything a provider needs for one generation.
#[derive(Clone, Debug, Default)]
pub struct ModelContext {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

impl ModelContext {
    pub fn new(messages: Vec<Message>, tools: Vec<ToolDefinition>) -> Self {
        Self {
            system_prompt: None,
            messages,
            tools,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}
