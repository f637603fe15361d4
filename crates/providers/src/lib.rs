pub mod classify;
pub mod fallback;
pub mod openai;
pub mod traits;
pub(crate) mod sse;
pub(crate) mod util;

// Re-exports for convenience.
pub use classify::{classify, ContextLengthInfo, ErrorClass};
pub use fallback::{run_with_fallback, Attempt, FallbackEligible};
pub use openai::OpenAiProvider;
pub use traits::{FunctionOutput, ProviderClient, ProviderRequest};
