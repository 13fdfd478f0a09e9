// A shared SIP endpoint control plane in Rust
pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;
pub mod bridge;
pub mod config;
pub mod edge;
pub mod error;
pub mod hub;
pub mod message;
pub mod sip;
pub mod transport;
pub use edge::EdgeClient;
pub use hub::Hub;
