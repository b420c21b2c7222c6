use async_trait::async_trait;
use bytes::Bytes;
use image::imageops::FilterType;
use log::warn;
use std::env;
use std::path::Path;
use url::Url;
use uuid::Uuid;

/// Camera device boundary. Production uses an HTTP snapshot camera; tests
/// use a recording fake. A browser media stream would sit behind the same
/// seam.
#[async_trait]
pub trait CameraSource {
    /// Acquire the device. `facing` is a preference, not a demand; sources
    /// with no notion of facing ignore it.
    async fn open(&mut self, facing: Facing) -> Result<(), failure::Error>;
    /// Rasterize the current frame.
    async fn grab(&mut self) -> Result<Bytes, failure::Error>;
    /// Give the hardware back. Must be safe to call when nothing is held.
    fn release(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Facing {
    Environment,
    User,
}

#[async_trait]
pub trait Classifier {
    async fn classify(&self, image: &str, prompt: &str) -> Result<String, failure::Error>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CaptureState {
    Idle,
    RequestingCamera,
    Streaming,
    Captured,
    Analyzing,
}

const CAPTURE_PROMPT: &str =
    "Identify this place or building on the university campus. Reply only with the name if you know it.";

pub struct CaptureConfig {
    pub prompt: String,
    pub facing: Facing,
    pub snapshots_url: Option<String>,
}

impl CaptureConfig {
    pub fn from_env() -> CaptureConfig {
        CaptureConfig {
            prompt: env::var("CAPTURE_PROMPT").unwrap_or_else(|_| CAPTURE_PROMPT.to_string()),
            // Rear-facing unless explicitly told otherwise.
            facing: match env::var("CAMERA_FACING").as_deref() {
                Ok("user") => Facing::User,
                _ => Facing::Environment,
            },
            snapshots_url: env::var("SNAPSHOTS_URL").ok(),
        }
    }
}

/// What one cycle ended with. Cleanup has already run by the time the
/// caller sees this; the controller is back in Idle on every variant.
#[derive(Debug)]
pub enum CycleOutcome {
    Labelled {
        label: String,
        image_url: Option<String>,
    },
    CameraUnavailable {
        message: String,
    },
    Failed {
        message: String,
    },
}

pub struct CaptureController<C: CameraSource, L: Classifier> {
    camera: C,
    classifier: L,
    config: CaptureConfig,
    state: CaptureState,
}

impl<C: CameraSource, L: Classifier> CaptureController<C, L> {
    pub fn new(camera: C, classifier: L, config: CaptureConfig) -> Self {
        CaptureController {
            camera,
            classifier,
            config,
            state: CaptureState::Idle,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// One full cycle. Every exit path releases the camera and lands back
    /// in Idle. The camera is let go at the capture step, before the model
    /// call, so the hardware is never held while we wait on the network.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.state = CaptureState::RequestingCamera;
        if let Err(e) = self.camera.open(self.config.facing).await {
            self.state = CaptureState::Idle;
            return CycleOutcome::CameraUnavailable {
                message: e.to_string(),
            };
        }
        self.state = CaptureState::Streaming;
        let frame = match self.camera.grab().await {
            Ok(frame) => frame,
            Err(e) => return self.fail_streaming(format!("Unable to grab frame: {}", e)),
        };
        let still = match encode_still(&frame) {
            Ok(still) => still,
            Err(e) => return self.fail_streaming(format!("Unable to encode frame: {}", e)),
        };
        self.camera.release();
        self.state = CaptureState::Captured;

        let image_url = save_snapshot(&still, self.config.snapshots_url.as_deref());

        self.state = CaptureState::Analyzing;
        let result = self
            .classifier
            .classify(&still.data_url, &self.config.prompt)
            .await;
        // Unconditional cleanup: success and failure both end the cycle.
        self.state = CaptureState::Idle;
        match result {
            Ok(label) => CycleOutcome::Labelled { label, image_url },
            Err(e) => CycleOutcome::Failed {
                message: format!("Unable to classify image: {}", e),
            },
        }
    }

    /// User-initiated cancellation. Safe in any state.
    pub fn abort(&mut self) {
        self.camera.release();
        self.state = CaptureState::Idle;
    }

    fn fail_streaming(&mut self, message: String) -> CycleOutcome {
        self.abort();
        CycleOutcome::Failed { message }
    }
}

pub struct Still {
    pub data_url: String,
    jpeg: Vec<u8>,
}

/// Decodes whatever the camera produced and re-encodes a bounded JPEG
/// still, wrapped the way the classify endpoint expects it.
fn encode_still(frame: &[u8]) -> Result<Still, failure::Error> {
    let decoded = image::load_from_memory(frame)?;
    let mut jpeg = vec![];
    decoded
        .resize(1024, 768, FilterType::Triangle)
        .write_to(&mut jpeg, image::ImageOutputFormat::Jpeg(85))?;
    let data_url = format!("data:image/jpeg;base64,{}", base64::encode(&jpeg));
    Ok(Still { data_url, jpeg })
}

/// Best effort; a failed save only costs the attachment, never the cycle.
fn save_snapshot(still: &Still, snapshots_url: Option<&str>) -> Option<String> {
    let snapshots_url = snapshots_url?;
    let name = format!("{:x}.jpeg", Uuid::new_v4().to_simple());
    let path = Path::new("/snapshots").join(&name);
    match std::fs::write(&path, &still.jpeg) {
        Ok(_) => Some(snapshots_url.to_string() + &name),
        Err(e) => {
            warn!("Error saving snapshot to {:?}: {:?}", path, e);
            None
        }
    }
}

/// Production camera: an IP camera that serves one still per GET. Opening
/// resolves the configuration up front so a bad or missing URL fails at
/// the requesting-camera step, the same way a denied permission would.
pub struct SnapshotCamera {
    url: Option<Url>,
}

impl SnapshotCamera {
    pub fn from_env() -> SnapshotCamera {
        SnapshotCamera { url: None }
    }
}

#[async_trait]
impl CameraSource for SnapshotCamera {
    async fn open(&mut self, _facing: Facing) -> Result<(), failure::Error> {
        let raw = env::var("CAMERA_URL")
            .map_err(|_| format_err!("CAMERA_URL environment variable unset"))?;
        self.url = Some(Url::parse(&raw)?);
        Ok(())
    }

    async fn grab(&mut self) -> Result<Bytes, failure::Error> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| format_err!("Camera not open"))?;
        let response = reqwest::get(url.as_str()).await?;
        if !response.status().is_success() {
            return Err(format_err!(
                "Camera returned status {}",
                response.status()
            ));
        }
        Ok(response.bytes().await?)
    }

    fn release(&mut self) {
        self.url = None;
    }
}
