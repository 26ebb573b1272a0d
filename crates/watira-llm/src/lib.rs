pub mod converter;
pub mod provider;
pub mod reliable;
pub mod sse;

pub mod mock;

pub use mock::{MockProvider, MockResponse};
pub use provider::{GeminiConfig, GeminiProvider};
pub use reliable::{ReliableConfig, ReliableProvider};
