//! Network adapters for the verification collaborators.

pub mod doh;
pub mod http;
pub mod sink;

pub use doh::DohResolver;
pub use http::ReqwestHttpProbe;
pub use sink::{DisabledAlertSink, WebhookAlertSink};
