use crate::capture::Classifier;
use crate::gemini;
use async_trait::async_trait;
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::Filter;

/// Defaults for the classify endpoint. Named configuration rather than
/// literals at the call site, so behavior is discoverable and testable.
pub struct ClassifyConfig {
    pub model: String,
    pub mime_type: String,
    pub default_prompt: String,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        ClassifyConfig {
            model: "gemini-1.5-flash".to_string(),
            mime_type: "image/jpeg".to_string(),
            default_prompt: "describe this image".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize)]
pub struct ClassifyRequest {
    #[serde(default)]
    pub image: String,
    pub prompt: Option<String>,
}

pub async fn run() {
    warp::serve(route(Arc::new(ClassifyConfig::default())))
        .run(([0, 0, 0, 0], 8411))
        .await;
}

fn route(
    config: Arc<ClassifyConfig>,
) -> impl Filter<Extract = (warp::reply::WithStatus<warp::reply::Json>,), Error = warp::Rejection> + Clone
{
    warp::post()
        .and(warp::path!("api" / "classify"))
        .and(warp::body::content_length_limit(16 * 1024 * 1024))
        .and(warp::body::json())
        .and(warp::any().map(move || config.clone()))
        .and_then(|request, config| async {
            Ok::<_, warp::Rejection>(handle_classify(request, config).await)
        })
}

async fn handle_classify(
    request: ClassifyRequest,
    config: Arc<ClassifyConfig>,
) -> warp::reply::WithStatus<warp::reply::Json> {
    if request.image.is_empty() {
        return reply_error(StatusCode::BAD_REQUEST, "No image provided");
    }
    let payload = strip_data_url(&request.image);
    let prompt = prompt_for(&request, &config);
    match gemini::describe(&config.model, &config.mime_type, payload, prompt).await {
        Ok(text) => {
            info!("Classified image as: {}", text);
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({ "text": text })),
                StatusCode::OK,
            )
        }
        Err(e) => {
            // Log the real cause; the client only gets a generic error.
            error!("Error classifying image: {:?}", e);
            reply_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to process image")
        }
    }
}

fn reply_error(status: StatusCode, message: &str) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": message })),
        status,
    )
}

fn prompt_for<'a>(request: &'a ClassifyRequest, config: &'a ClassifyConfig) -> &'a str {
    request.prompt.as_deref().unwrap_or(&config.default_prompt)
}

/// Front-ends hand us data URLs; the model wants the bare payload. The
/// MIME type is forced to JPEG either way.
fn strip_data_url(image: &str) -> &str {
    match image.find("base64,") {
        Some(index) => &image[index + "base64,".len()..],
        None => image,
    }
}

/// Client for the same endpoint, used by the capture controller. External
/// front-ends talk to the endpoint the same way, so the contract stays
/// single.
pub struct ProxyClient {
    url: String,
}

impl ProxyClient {
    pub fn from_env() -> ProxyClient {
        ProxyClient {
            url: env::var("CLASSIFY_URL")
                .unwrap_or_else(|_| "http://localhost:8411/api/classify".to_string()),
        }
    }
}

#[async_trait]
impl Classifier for ProxyClient {
    async fn classify(&self, image: &str, prompt: &str) -> Result<String, failure::Error> {
        let client = reqwest::Client::new();
        let response = client
            .post(&self.url)
            .json(&ClassifyRequest {
                image: image.to_string(),
                prompt: Some(prompt.to_string()),
            })
            .send()
            .await?;
        let json = response.json::<Value>().await?;
        if let Some(text) = json["text"].as_str() {
            return Ok(text.to_string());
        }
        match json["error"].as_str() {
            Some(message) => Err(format_err!("Classify endpoint error: {}", message)),
            None => Err(format_err!("Malformed classify response: {}", json)),
        }
    }
}
