mod body;
pub(crate) mod codec;
mod dispatch;
pub(crate) mod forward;
pub(crate) mod pipeline;
pub(crate) mod upstream;

pub use body::BodyTooLarge;
pub use dispatch::handle_http;
pub use pipeline::shutdown_stream;
