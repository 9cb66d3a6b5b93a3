//! Turning raw backend output into OpenAI-shaped responses.

pub mod response;
pub mod stream;

pub use response::assemble_response;
pub use stream::StreamingAssembler;
