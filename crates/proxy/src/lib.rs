//! Engine API man-in-the-middle used to observe and corrupt CL ↔ EL traffic.

pub mod jwt;
pub mod message;
pub mod proxy;

pub use jwt::JwtProvider;
pub use proxy::{Proxy, ProxyConfig, RequestCallback, ResponseCallback};
