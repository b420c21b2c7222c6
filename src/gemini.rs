use serde_json::{json, Value};
use std::env;

const API_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Sends one image and prompt to the hosted model and returns its text
/// reply. One call per invocation, no retries, no streaming; the caller
/// decides what a failure means.
pub async fn describe(
    model: &str,
    mime_type: &str,
    image_base64: &str,
    prompt: &str,
) -> Result<String, failure::Error> {
    // Read the key here rather than at startup so a missing key fails the
    // request, not the whole process.
    let api_key = env::var("GEMINI_API_KEY")
        .map_err(|_| format_err!("GEMINI_API_KEY environment variable unset"))?;
    let url = format!("{}/{}:generateContent?key={}", API_URL, model, api_key);
    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .json(&build_request(mime_type, image_base64, prompt))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(format_err!(
            "Model call failed with status {}",
            response.status()
        ));
    }
    let json = response.json::<Value>().await?;
    parse_response(&json)
}

fn build_request(mime_type: &str, image_base64: &str, prompt: &str) -> Value {
    json!({
        "contents": [{
            "parts": [
                { "text": prompt },
                { "inlineData": { "mimeType": mime_type, "data": image_base64 } }
            ]
        }]
    })
}

/// Pulls the text out of a generateContent response. Whitespace is
/// stripped: downstream matching treats the text as a near-exact label and
/// a stray newline would wreck it.
fn parse_response(json: &Value) -> Result<String, failure::Error> {
    let text = json["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .ok_or_else(|| format_err!("No text in model response: {}", json))?;
    Ok(text.trim().to_string())
}
