//! `sdkx` is the request-execution pipeline behind generated AWS-style service
//! clients: identity resolution, SigV4 signing with clock-skew correction,
//! interceptors, flexible checksums, token-bucket retries and response
//! classification, driven by an async or a blocking orchestrator.
//!
//! # Quick Start
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::{HeaderName, HeaderValue, Uri};
//! use sdkx::prelude::{BoxError, Client, HttpRequest, HttpResponse, Operation, RetryPolicy};
//!
//! struct GetItem;
//!
//! impl Operation for GetItem {
//!     type Input = String;
//!     type Output = Bytes;
//!
//!     fn name(&self) -> &'static str {
//!         "GetItem"
//!     }
//!
//!     fn marshal(&self, key: &String, endpoint: &Uri) -> Result<HttpRequest, BoxError> {
//!         Ok(HttpRequest::post(endpoint.clone())
//!             .with_header(
//!                 HeaderName::from_static("x-amz-target"),
//!                 HeaderValue::from_static("Store.GetItem"),
//!             )
//!             .with_body(Bytes::from(format!("{{\"key\":\"{key}\"}}"))))
//!     }
//!
//!     fn unmarshal(&self, response: &HttpResponse) -> Result<Bytes, BoxError> {
//!         Ok(response.body().clone())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("store")
//!         .region("us-east-1")
//!         .endpoint("https://store.us-east-1.example.com")
//!         .retry_policy(RetryPolicy::standard().max_attempts(4))
//!         .build()?;
//!
//!     let item = client.call(&GetItem, "item-001".to_owned()).await?;
//!     println!("{} bytes", item.len());
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Use `RetryPolicy::standard()`; share one client (and so one retry bucket) per service.
//! - Set a call timeout for latency-sensitive paths; the attempt timeout alone does not bound retries.
//! - Wrap remote identity providers in `CachingIdentityResolver`.

pub mod blocking;
pub mod checksum;
pub mod classify;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod interceptor;
pub mod message;
pub mod metrics;
pub mod operation;
mod orchestrator;
pub mod retry;
pub mod signer;
pub mod skew;
pub mod transport;
mod util;

pub use crate::blocking::{BlockingClient, BlockingClientBuilder};
pub use crate::client::{CallOptions, Client, ClientBuilder};
pub use crate::config::{ClientConfig, ClientProfile};
pub use crate::error::{BoxError, Error, ErrorCode, ErrorKind, Result};
pub use crate::message::{ByteStream, HttpRequest, HttpResponse, ReaderBody, SdkBody, StreamingOutput};
pub use crate::operation::Operation;
pub use tokio_util::sync::CancellationToken;

pub mod prelude {
    pub use crate::checksum::{ChecksumAlgorithm, ChecksumCalculation, ChecksumSpec, ChecksumValidation};
    pub use crate::classify::{JsonErrorClassifier, ResponseClassifier, XmlErrorClassifier};
    pub use crate::context::{AttributeKey, ExecutionContext};
    pub use crate::identity::{
        BlockingIdentityResolver, CachingIdentityResolver, Credentials, IdentityResolver,
        StaticIdentityResolver,
    };
    pub use crate::interceptor::Interceptor;
    pub use crate::retry::{RetryMode, RetryPolicy};
    pub use crate::{
        BlockingClient, BoxError, ByteStream, CallOptions, CancellationToken, Client, ClientProfile,
        Error, ErrorCode, ErrorKind, HttpRequest, HttpResponse, Operation, SdkBody,
    };
}
