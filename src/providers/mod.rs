mod error;
mod openai_compatible;

pub use error::ProviderError;
pub use openai_compatible::OpenAiCompatibleProvider;
