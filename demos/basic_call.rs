use std::time::Duration;

use bytes::Bytes;
use http::{HeaderName, HeaderValue, Uri};
use sdkx::ClientProfile;
use sdkx::checksum::{ChecksumAlgorithm, ChecksumSpec};
use sdkx::prelude::{BoxError, Client, Error, HttpRequest, HttpResponse, Operation};
use sdkx::retry::RetryPolicy;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct PutItemOutput {
    #[serde(rename = "ConsumedCapacity", default)]
    consumed_capacity: Option<serde_json::Value>,
}

struct PutItem;

impl Operation for PutItem {
    type Input = serde_json::Value;
    type Output = PutItemOutput;

    fn name(&self) -> &'static str {
        "PutItem"
    }

    fn marshal(&self, input: &serde_json::Value, endpoint: &Uri) -> Result<HttpRequest, BoxError> {
        Ok(HttpRequest::post(endpoint.clone())
            .with_header(
                HeaderName::from_static("x-amz-target"),
                HeaderValue::from_static("DynamoDB_20120810.PutItem"),
            )
            .with_header(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/x-amz-json-1.0"),
            )
            .with_body(Bytes::from(serde_json::to_vec(input)?)))
    }

    fn unmarshal(&self, response: &HttpResponse) -> Result<PutItemOutput, BoxError> {
        Ok(serde_json::from_slice(response.body())?)
    }

    fn checksum_spec(&self) -> Option<ChecksumSpec> {
        Some(ChecksumSpec::new().request_algorithm(ChecksumAlgorithm::Crc32))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::builder("dynamodb")
        .profile(ClientProfile::LowLatency)
        .with_env()?
        .region("us-east-1")
        .endpoint("https://dynamodb.us-east-1.amazonaws.com")
        .retry_policy(
            RetryPolicy::standard()
                .max_attempts(4)
                .max_delay(Duration::from_secs(2)),
        )
        .build()?;

    let item = serde_json::json!({
        "TableName": "demo",
        "Item": { "pk": { "S": "item-001" } },
    });
    match client.call(&PutItem, item).await {
        Ok(output) => println!("stored, consumed={:?}", output.consumed_capacity),
        Err(Error::RetriesExhausted { history, source }) => {
            println!(
                "gave up after {} attempts ({:?}): {source}",
                history.attempts, history.stop_reason
            );
        }
        Err(error) => println!("error_code={} kind={}", error.code().as_str(), error.kind().as_str()),
    }

    let metrics = client.metrics_snapshot();
    println!(
        "attempts={} retries={} capacity={}/{}",
        metrics.attempts, metrics.retries, metrics.retry_capacity_available, metrics.retry_capacity
    );
    Ok(())
}
