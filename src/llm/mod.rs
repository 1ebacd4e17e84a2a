mod tensorzero;

pub use tensorzero::{LlmClient, LlmConfig, LlmError, LlmMessage};
