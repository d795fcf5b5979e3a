use std::time::Duration;

use http::Uri;
use sdkx::CallOptions;
use sdkx::classify::XmlErrorClassifier;
use sdkx::identity::{CachingIdentityResolver, EnvironmentIdentityResolver};
use sdkx::prelude::{BlockingClient, BoxError, CancellationToken, HttpRequest, HttpResponse, Operation};

struct GetObject;

impl Operation for GetObject {
    type Input = String;
    type Output = usize;

    fn name(&self) -> &'static str {
        "GetObject"
    }

    fn marshal(&self, key: &String, endpoint: &Uri) -> Result<HttpRequest, BoxError> {
        let uri = format!("{}/{key}", endpoint.to_string().trim_end_matches('/')).parse()?;
        Ok(HttpRequest::get(uri))
    }

    fn unmarshal(&self, response: &HttpResponse) -> Result<usize, BoxError> {
        Ok(response.body().len())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = BlockingClient::builder("s3")
        .region("us-east-1")
        .endpoint("https://demo-bucket.s3.us-east-1.amazonaws.com")
        .double_uri_encode(false)
        .content_sha256_header(true)
        .response_classifier(XmlErrorClassifier)
        .identity_resolver(CachingIdentityResolver::new(EnvironmentIdentityResolver::new()))
        .build()?;

    let token = CancellationToken::new();
    let options = CallOptions::new()
        .cancellation(token)
        .call_timeout(Duration::from_secs(10));
    match client.call_with(&GetObject, "reports/2026.csv".to_owned(), options) {
        Ok(length) => println!("downloaded {length} bytes"),
        Err(error) => println!("error_code={} retryable={}", error.code().as_str(), error.is_retryable()),
    }
    Ok(())
}
