// HTTP helpers for cases that talk to a served application.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

pub type H = HashMap<String, String>;

/// Makes an HTTP request with an optional JSON body.
pub async fn do_request(
    method: &str,
    url: &str,
    headers: &H,
    body: Option<Value>,
) -> Result<reqwest::Response, reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let mut request = match method {
        "GET" => client.get(url),
        "POST" => client.post(url),
        "PUT" => client.put(url),
        "PATCH" => client.patch(url),
        "DELETE" => client.delete(url),
        _ => panic!("unsupported method: {}", method),
    };

    for (k, v) in headers {
        request = request.header(k, v);
    }

    if let Some(body) = body {
        request = request.json(&body);
    }

    request.send().await
}

/// Makes an HTTP request and returns the status with the JSON body, or
/// `Value::Null` when the body is empty or not JSON.
pub async fn do_json(method: &str, url: &str, body: Option<Value>) -> (u16, Value) {
    let resp = do_request(method, url, &H::new(), body).await.expect("request failed");
    let status = resp.status().as_u16();
    let bytes = resp.bytes().await.expect("read body");
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}
