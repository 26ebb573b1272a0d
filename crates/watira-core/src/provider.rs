use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;

use crate::context::ModelContext;
use crate::errors::GatewayError;
use crate::stream::ProviderEvent;

pub type ProviderStream = Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>;

/// Options controlling generation.
#[derive(Clone, Debug, Default)]
pub struct GenerateOptions {
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub stop_sequences: Vec<String>,
}

/// Point-in-time view of a provider's resilience state, reported on `/health`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealth {
    /// `closed`, `open` or `half_open`.
    pub circuit: &'static str,
    pub consecutive_failures: u32,
    pub retries: u64,
    /// Remaining cooldown while the circuit is open.
    pub reopens_in_secs: Option<u64>,
}

/// Implemented by each generative-model backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    /// Open a streaming generation. Errors before the first byte are
    /// returned directly; later failures arrive as `ProviderEvent::Error`.
    async fn stream(
        &self,
        context: &ModelContext,
        options: &GenerateOptions,
    ) -> Result<ProviderStream, GatewayError>;

    /// Resilience state, for wrappers that track one.
    fn health(&self) -> Option<ProviderHealth> {
        None
    }
}
