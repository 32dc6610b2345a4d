pub mod stub;
pub mod traits;

pub use stub::StubProvider;
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
