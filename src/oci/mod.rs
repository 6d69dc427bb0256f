mod client;
mod error;

pub use client::OciClient;
pub use error::OciError;
