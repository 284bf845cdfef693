mod kind;
mod status;

pub use kind::MessageType;
pub use status::Status;
