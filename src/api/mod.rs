mod client;
mod stream;

#[cfg(feature = "stats")]
pub use client::ClientStats;
pub use client::{Client, ClientBuilder, SendStatus, client, client_over};
pub use stream::{Stream, StreamRead};
