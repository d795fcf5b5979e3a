//! Response classification: success, modeled service error, or unknown error.

use serde_json::Value;

use crate::message::HttpResponse;
use crate::util::{header_str, truncate_body};

pub const X_AMZN_ERROR_TYPE: &str = "x-amzn-errortype";
pub const X_AMZN_REQUEST_ID: &str = "x-amzn-requestid";
pub const X_AMZ_REQUEST_ID: &str = "x-amz-request-id";

/// Error envelope decoded from a response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModeledError {
    pub code: String,
    pub message: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    Success,
    ModeledError(ModeledError),
    UnknownError { status: u16, body: String },
}

impl Classification {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

pub trait ResponseClassifier: Send + Sync {
    fn classify(&self, response: &HttpResponse) -> Classification;
}

impl<T> ResponseClassifier for std::sync::Arc<T>
where
    T: ResponseClassifier + ?Sized,
{
    fn classify(&self, response: &HttpResponse) -> Classification {
        (**self).classify(response)
    }
}

pub(crate) fn request_id_header(response: &HttpResponse) -> Option<String> {
    header_str(response.headers(), X_AMZN_REQUEST_ID)
        .or_else(|| header_str(response.headers(), X_AMZ_REQUEST_ID))
        .map(str::to_owned)
}

fn unknown(response: &HttpResponse) -> Classification {
    Classification::UnknownError {
        status: response.status().as_u16(),
        body: truncate_body(response.body()),
    }
}

/// Strips a `namespace#` prefix and a `:suffix` from an error type.
pub fn sanitize_error_code(raw: &str) -> &str {
    let code = raw.split(':').next().unwrap_or(raw);
    let code = code.rsplit('#').next().unwrap_or(code);
    code.trim()
}

/// Classifier for the awsJson and restJson protocols.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonErrorClassifier;

impl JsonErrorClassifier {
    fn string_field<'a>(body: &'a Value, names: &[&str]) -> Option<&'a str> {
        names
            .iter()
            .find_map(|name| body.get(*name).and_then(Value::as_str))
    }
}

impl ResponseClassifier for JsonErrorClassifier {
    fn classify(&self, response: &HttpResponse) -> Classification {
        if response.status().is_success() {
            return Classification::Success;
        }
        let body = serde_json::from_slice::<Value>(response.body()).ok();
        let header_code = header_str(response.headers(), X_AMZN_ERROR_TYPE);
        let body_code = body
            .as_ref()
            .and_then(|body| Self::string_field(body, &["__type", "code", "Code"]));
        let Some(code) = header_code
            .or(body_code)
            .map(sanitize_error_code)
            .filter(|code| !code.is_empty())
        else {
            return unknown(response);
        };
        let message = body
            .as_ref()
            .and_then(|body| Self::string_field(body, &["message", "Message", "errorMessage"]))
            .map(str::to_owned);
        Classification::ModeledError(ModeledError {
            code: code.to_owned(),
            message,
            request_id: request_id_header(response),
        })
    }
}

/// Classifier for the restXml and query protocols. A 2xx body whose root
/// element is `<Error>` is also treated as an error.
#[derive(Clone, Copy, Debug, Default)]
pub struct XmlErrorClassifier;

impl XmlErrorClassifier {
    fn element<'a>(body: &'a str, name: &str) -> Option<&'a str> {
        let open = format!("<{name}>");
        let close = format!("</{name}>");
        let start = body.find(&open)? + open.len();
        let end = body[start..].find(&close)? + start;
        Some(body[start..end].trim())
    }

    fn has_error_root(body: &str) -> bool {
        let body = body.trim_start();
        let body = match body.strip_prefix("<?xml") {
            Some(rest) => rest.find("?>").map_or("", |end| rest[end + 2..].trim_start()),
            None => body,
        };
        body.starts_with("<Error>") || body.starts_with("<Error ")
    }
}

impl ResponseClassifier for XmlErrorClassifier {
    fn classify(&self, response: &HttpResponse) -> Classification {
        let text = response.text_lossy();
        if response.status().is_success() && !Self::has_error_root(&text) {
            return Classification::Success;
        }
        let Some(code) = Self::element(&text, "Code").filter(|code| !code.is_empty()) else {
            return unknown(response);
        };
        let request_id = Self::element(&text, "RequestId")
            .map(str::to_owned)
            .or_else(|| request_id_header(response));
        Classification::ModeledError(ModeledError {
            code: code.to_owned(),
            message: Self::element(&text, "Message").map(str::to_owned),
            request_id,
        })
    }
}
