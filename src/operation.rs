//! The contract a generated operation presents to the pipeline.

use std::sync::Arc;

use http::Uri;

use crate::checksum::ChecksumSpec;
use crate::classify::{ModeledError, ResponseClassifier};
use crate::error::BoxError;
use crate::message::{HttpRequest, HttpResponse};
use crate::signer::SigningParams;

/// Marshalling and unmarshalling for one API operation.
///
/// `marshal` must be deterministic and free of I/O: it may be called again
/// for a retry when a buffered body has to be rebuilt. `unmarshal` is only
/// invoked for responses the classifier judged successful.
pub trait Operation: Send + Sync {
    type Input: Send + Sync + 'static;
    type Output: Send + Sync + 'static;

    fn name(&self) -> &'static str;

    fn marshal(&self, input: &Self::Input, endpoint: &Uri) -> Result<HttpRequest, BoxError>;

    fn unmarshal(&self, response: &HttpResponse) -> Result<Self::Output, BoxError>;

    /// Refines a decoded error envelope using the operation's own error shapes.
    fn unmarshal_error(&self, _response: &HttpResponse, error: ModeledError) -> ModeledError {
        error
    }

    /// Endpoint for this call; `None` uses the client's base endpoint.
    fn endpoint(&self, _input: &Self::Input) -> Option<Uri> {
        None
    }

    fn checksum_spec(&self) -> Option<ChecksumSpec> {
        None
    }

    /// Overrides the client's response classifier.
    fn classifier(&self) -> Option<Arc<dyn ResponseClassifier>> {
        None
    }

    /// Adjusts the client's signing parameters, e.g. disabling double URI
    /// encoding for S3-style services.
    fn signing_params(&self, params: SigningParams) -> SigningParams {
        params
    }
}
