//! Client Module
//!
//! Transport seam, the default HTTP transport and failure classification.

pub mod failure;
pub mod http;
pub mod transport;

pub use http::{HttpOptions, HttpTransport};
pub use transport::{OutboundRequest, Transport};
