pub mod chunked;
pub mod prompts;

pub use chunked::ChunkedReviewOrchestrator;
pub use prompts::{chunk_prompt, single_prompt, ChunkId, PromptTemplate};
