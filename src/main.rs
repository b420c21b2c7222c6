mod capture;
mod classify;
mod gemini;
mod matcher;
mod places;
mod types;
mod websocket;

use env_logger::Env;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::mpsc::channel;

#[macro_use]
extern crate failure;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    info!("Starting campus-lens");

    let places = Arc::new(places::load());
    info!("Loaded {} places", places.len());

    let (tx, rx) = channel(8);
    let classify_task = tokio::spawn(classify::run());
    let websocket_task = tokio::spawn(websocket::run(tx, rx, places));
    tokio::select! {
        result = classify_task => {
            if let Err(e) = result {
                error!("Classify task failed: {}", e);
            }
        }
        result = websocket_task => {
            if let Err(e) = result {
                error!("Websocket task failed: {}", e);
            }
        }
    }
    info!("Exiting main");
}
