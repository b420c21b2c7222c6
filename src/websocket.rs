use crate::capture::{CaptureConfig, CaptureController, CycleOutcome, SnapshotCamera};
use crate::classify::ProxyClient;
use crate::matcher;
use crate::types::{LookupOutcome, Place};
use futures::{pin_mut, FutureExt, SinkExt, StreamExt, TryFutureExt};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::env;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::Mutex;
use tokio::time::delay_for;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

type Callback = Box<dyn FnOnce(bool, Option<&Value>) + Send>;

struct MapSocketWriter {
    sink: futures::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
        Message,
    >,
    next_message_id: AtomicU64,
    callbacks: HashMap<u64, Callback>,
}

impl MapSocketWriter {
    async fn send<F>(&mut self, func: F) -> Result<(), tungstenite::error::Error>
    where
        F: Fn(u64) -> (Value, Option<Callback>),
    {
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let (message, callback) = func(id);
        if let Some(callback) = callback {
            self.callbacks.insert(id, callback);
        }
        self.sink.send(Message::text(message.to_string())).await
    }
}

pub async fn run(
    tx: Sender<LookupOutcome>,
    mut rx: Receiver<LookupOutcome>,
    places: Arc<Vec<Place>>,
) {
    let map_host = env::var("MAP_HOST").unwrap_or_else(|_| "localhost:3000".to_string());
    let url = Url::parse(&format!("ws://{}/api/ws", map_host)).unwrap();
    // One capture cycle at a time; the UI can't re-open the camera until
    // the previous modal closed, and neither can we.
    let in_flight = Arc::new(AtomicBool::new(false));
    loop {
        match tokio_tungstenite::connect_async(&url).await {
            Ok(connection) => {
                handle_connection(connection.0, &tx, &mut rx, &places, &in_flight).await
            }
            Err(e) => error!("Error connecting to map host: {}", e),
        }
        info!("Waiting 10 seconds and reconnecting to map host...");
        delay_for(Duration::from_secs(10)).await;
        info!("Reconnecting to map host...");
    }
}

async fn handle_connection(
    connection: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    tx: &Sender<LookupOutcome>,
    rx: &mut Receiver<LookupOutcome>,
    places: &Arc<Vec<Place>>,
    in_flight: &Arc<AtomicBool>,
) {
    info!("Handling map host connection");
    let (ws_write, ws_read) = connection.split();
    let ws_writer = Arc::new(Mutex::new(MapSocketWriter {
        sink: ws_write,
        next_message_id: AtomicU64::new(1),
        callbacks: HashMap::new(),
    }));
    let ws_read_future = ws_read
        .for_each(|message_result| async {
            match message_result {
                Ok(message) => {
                    process_map_message(message, ws_writer.clone(), tx, places, in_flight).await
                }
                Err(e) => error!("Websocket error: {:?}", e),
            }
        })
        .fuse();
    // Outcomes are published on whatever connection is live when they
    // arrive, even if the cycle started under an earlier one. The map app
    // decides whether it still cares.
    let rx_read_future = rx
        .for_each(|outcome| async {
            if let Err(e) = publish_outcome(outcome, ws_writer.clone()).await {
                error!("Error publishing lookup outcome: {}", e);
            }
        })
        .fuse();
    pin_mut!(ws_read_future, rx_read_future);
    futures::select!(
        _ = ws_read_future => info!("Map host connection dropped"),
        _ = rx_read_future => error!("Rx stream ended"),
    );
}

async fn process_map_message(
    message: Message,
    ws_writer: Arc<Mutex<MapSocketWriter>>,
    tx: &Sender<LookupOutcome>,
    places: &Arc<Vec<Place>>,
    in_flight: &Arc<AtomicBool>,
) {
    // Errors are logged and swallowed; only the server closing the stream
    // should end the connection.
    match message {
        Message::Text(s) => {
            if let Err(msg) = handle_map_message(&s, ws_writer, tx, places, in_flight).await {
                error!("Error handling map host message: {}", msg);
            }
        }
        Message::Close(close_frame) => warn!("Map host close message: {:?}", close_frame),
        _ => debug!("Ignoring websocket message: {:?}", message),
    }
}

async fn handle_map_message(
    s: &str,
    ws_writer: Arc<Mutex<MapSocketWriter>>,
    tx: &Sender<LookupOutcome>,
    places: &Arc<Vec<Place>>,
    in_flight: &Arc<AtomicBool>,
) -> Result<(), String> {
    let value = serde_json::from_str(s)
        .map_err(|_| format!("Failed to parse websocket message: {:?}", s))
        .and_then(|v| {
            if let Value::Object(o) = v {
                Ok(o)
            } else {
                Err(format!("Unexpected message JSON type: {}", s))
            }
        })?;
    let tp = value["type"]
        .as_str()
        .ok_or_else(|| format!("Unrecognized type for message {}", s))?;
    info!("Handling map host message of type: {}", tp);
    match tp {
        "auth_required" => {
            let access_token = env::var("ACCESS_TOKEN")
                .map_err(|_| "ACCESS_TOKEN environment variable unset".to_string())?;
            ws_writer
                .lock()
                .await
                .send(|_id| {
                    (
                        json!({ // the auth reply carries no id
                            "type": "auth",
                            "access_token": access_token,
                        }),
                        None, // and without an id there is nothing to ack
                    )
                })
                .await
                .map_err(|e| format!("Error sending auth message: {}", e))
        }
        "auth_ok" => ws_writer
            .lock()
            .await
            .send(|id| {
                (
                    json!({
                        "id": id,
                        "type": "subscribe",
                        "event": "camera_lookup_requested"
                    }),
                    Some(Box::new(|success, data| {
                        if success {
                            info!("Successfully subscribed to capture requests");
                        } else {
                            error!("Failed to subscribe to capture requests: {:?}", data);
                        }
                    })),
                )
            })
            .await
            .map_err(|e| format!("Error subscribing to capture requests: {}", e)),
        "result" => handle_result(&value, ws_writer).await,
        "event" => handle_event(&value, tx, places, in_flight).await,
        x => Err(format!("Unrecognized message type {}", x)),
    }
}

async fn handle_event(
    value: &serde_json::Map<String, Value>,
    tx: &Sender<LookupOutcome>,
    places: &Arc<Vec<Place>>,
    in_flight: &Arc<AtomicBool>,
) -> Result<(), String> {
    let event_type = value["event"]["event_type"].as_str();
    if event_type != Some("camera_lookup_requested") {
        return Err(format!("Unexpected event type {:?}", event_type));
    }
    if in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        warn!("Ignoring capture request while a cycle is in flight");
        return Ok(());
    }
    info!("Starting capture cycle");
    let mut tx = tx.clone();
    let places = places.clone();
    let in_flight = in_flight.clone();
    tokio::spawn(async move {
        let outcome = run_lookup(&places).await;
        in_flight.store(false, Ordering::SeqCst);
        if let Err(e) = tx.send(outcome).await {
            error!("Error sending lookup outcome: {}", e);
        }
    });
    Ok(())
}

/// One capture -> classify -> match pass. Matching happens here so the
/// controller stays ignorant of the dataset.
async fn run_lookup(places: &[Place]) -> LookupOutcome {
    let camera = SnapshotCamera::from_env();
    let classifier = ProxyClient::from_env();
    let mut controller = CaptureController::new(camera, classifier, CaptureConfig::from_env());
    match controller.run_cycle().await {
        CycleOutcome::Labelled { label, image_url } => {
            match matcher::best_match(places, &label) {
                Some(place) => {
                    info!("Matched label '{}' to place '{}'", label, place.name);
                    LookupOutcome::Selected {
                        place: place.clone(),
                        image_url,
                    }
                }
                None => {
                    info!("No place within tolerance for label '{}'", label);
                    LookupOutcome::Unresolved { label }
                }
            }
        }
        CycleOutcome::CameraUnavailable { message } => LookupOutcome::Failed {
            message: format!("Could not access the camera: {}", message),
        },
        CycleOutcome::Failed { message } => LookupOutcome::Failed { message },
    }
}

async fn handle_result(
    value: &serde_json::Map<String, Value>,
    ws_writer: Arc<Mutex<MapSocketWriter>>,
) -> Result<(), String> {
    let id = value["id"]
        .as_u64()
        .ok_or_else(|| "No id field in result".to_string())?;
    let success = value["success"]
        .as_bool()
        .ok_or_else(|| "No success field in result".to_string())?;
    if let Some((_, callback)) = ws_writer.lock().await.callbacks.remove_entry(&id) {
        callback(success, value.get("result"));
    }
    Ok(())
}

async fn publish_outcome(
    outcome: LookupOutcome,
    ws_writer: Arc<Mutex<MapSocketWriter>>,
) -> Result<(), String> {
    info!("Publishing lookup outcome: {:?}", outcome);
    let (event, data) = outcome_message(&outcome);
    ws_writer
        .lock()
        .await
        .send(|id| {
            (
                json!({
                    "id": id,
                    "type": "publish",
                    "event": event,
                    "data": data
                }),
                Some(Box::new(move |success, result: Option<&Value>| {
                    if success {
                        info!("Successfully published {}", event);
                    } else {
                        error!("Failed to publish {}: {:?}", event, result);
                    }
                })),
            )
        })
        .map_err(|e| format!("Error publishing outcome: {}", e))
        .await
}

/// Event name and payload for one outcome. A notice is not an error: the
/// user should learn what the model saw even when it isn't on the map.
fn outcome_message(outcome: &LookupOutcome) -> (&'static str, Value) {
    match outcome {
        LookupOutcome::Selected { place, image_url } => {
            let mut data = json!({
                "name": place.name,
                "lat": place.lat,
                "lon": place.lon,
            });
            if let Some(url) = image_url {
                data["image_url"] = json!(url);
            }
            ("place_selected", data)
        }
        LookupOutcome::Unresolved { label } => (
            "lookup_notice",
            json!({
                "message": format!("Model says: {} (not found on the map)", label),
                "label": label,
            }),
        ),
        LookupOutcome::Failed { message } => ("lookup_error", json!({ "message": message })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::channel;

    #[test]
    fn test_outcome_message_for_selection() {
        let outcome = LookupOutcome::Selected {
            place: Place {
                name: "Biblioteca Central".to_string(),
                lat: -33.4985,
                lon: -70.6109,
            },
            image_url: Some("http://maps.example/snapshots/abc.jpeg".to_string()),
        };
        let (event, data) = outcome_message(&outcome);
        assert_eq!(event, "place_selected");
        assert_eq!(data["name"], "Biblioteca Central");
        assert_eq!(data["lat"], -33.4985);
        assert_eq!(data["lon"], -70.6109);
        assert_eq!(data["image_url"], "http://maps.example/snapshots/abc.jpeg");
    }

    #[test]
    fn test_outcome_message_selection_without_snapshot() {
        let outcome = LookupOutcome::Selected {
            place: Place {
                name: "Casa Central".to_string(),
                lat: -33.4418,
                lon: -70.6402,
            },
            image_url: None,
        };
        let (_, data) = outcome_message(&outcome);
        assert!(data.get("image_url").is_none());
    }

    #[test]
    fn test_outcome_message_keeps_raw_label_on_no_match() {
        let outcome = LookupOutcome::Unresolved {
            label: "PET".to_string(),
        };
        let (event, data) = outcome_message(&outcome);
        assert_eq!(event, "lookup_notice");
        assert_eq!(data["label"], "PET");
        assert_eq!(data["message"], "Model says: PET (not found on the map)");
    }

    #[test]
    fn test_outcome_message_for_failure() {
        let outcome = LookupOutcome::Failed {
            message: "Could not access the camera: permission denied".to_string(),
        };
        let (event, data) = outcome_message(&outcome);
        assert_eq!(event, "lookup_error");
        assert_eq!(
            data["message"],
            "Could not access the camera: permission denied"
        );
    }

    #[tokio::test]
    async fn test_handle_event_rejects_unknown_event_type() {
        let (tx, _rx) = channel(1);
        let places = Arc::new(vec![]);
        let in_flight = Arc::new(AtomicBool::new(false));
        let value = json!({ "event": { "event_type": "something_else" } });
        let result = handle_event(value.as_object().unwrap(), &tx, &places, &in_flight).await;
        assert!(result.is_err());
        assert!(!in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_handle_event_ignores_request_while_in_flight() {
        let (tx, _rx) = channel(1);
        let places = Arc::new(vec![]);
        let in_flight = Arc::new(AtomicBool::new(true));
        let value = json!({ "event": { "event_type": "camera_lookup_requested" } });
        let result = handle_event(value.as_object().unwrap(), &tx, &places, &in_flight).await;
        assert!(result.is_ok());
        // Still held by the cycle that was already running.
        assert!(in_flight.load(Ordering::SeqCst));
    }
}
