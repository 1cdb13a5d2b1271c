//! WebSocket transport (ambient; grounded in the teacher's `ws.rs`): bridges
//! the Reader Loop's blocking `crossbeam-channel` event stream into a
//! `tokio::sync::broadcast` channel that `warp` fans out to every connected
//! client, and turns incoming `WRITE_DATA` messages into `WriteRequest`s.

use std::net::IpAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use log::warn;
use tokio::sync::broadcast;
use warp::Filter;

use crate::error::ErrorKind;
use crate::reader_loop::{ReaderLoop, WriteRequest};
use crate::types::{write_result_message, IncomingMessage, OutgoingMessage};

const BROADCAST_CAPACITY: usize = 32;

/// Runs the WebSocket server until the process exits. Spawns a dedicated
/// thread to drain the (blocking) reader-loop event channel, since
/// `crossbeam_channel::Receiver::recv` cannot be awaited directly.
pub async fn start_server(reader_loop: Arc<ReaderLoop>, bind_addr: IpAddr, port: u16) {
    let (broadcast_tx, _) = broadcast::channel::<OutgoingMessage>(BROADCAST_CAPACITY);
    let broadcast_tx = Arc::new(broadcast_tx);

    {
        let broadcast_tx = broadcast_tx.clone();
        let events = reader_loop.events();
        std::thread::spawn(move || {
            while let Ok(event) = events.recv() {
                let _ = broadcast_tx.send(OutgoingMessage::from(&event));
            }
        });
    }

    let route = warp::path::end().and(warp::ws()).map(move |ws: warp::ws::Ws| {
        let reader_loop = reader_loop.clone();
        let broadcast_tx = broadcast_tx.clone();
        ws.on_upgrade(move |socket| handle_connection(socket, reader_loop, broadcast_tx))
    });

    let routes = route.with(warp::cors().allow_any_origin());
    warp::serve(routes).run((bind_addr, port)).await;
}

async fn handle_connection(
    socket: warp::ws::WebSocket,
    reader_loop: Arc<ReaderLoop>,
    broadcast_tx: Arc<broadcast::Sender<OutgoingMessage>>,
) {
    let (mut client_tx, mut client_rx) = socket.split();
    let mut subscription = broadcast_tx.subscribe();

    let forward = tokio::spawn(async move {
        while let Ok(msg) = subscription.recv().await {
            let json = serde_json::to_string(&msg).expect("OutgoingMessage always serialises");
            if client_tx.send(warp::ws::Message::text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = client_rx.next().await {
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.to_str() else { continue };
        let Ok(parsed) = serde_json::from_str::<IncomingMessage>(text) else {
            warn!("unrecognised websocket message: {text}");
            continue;
        };
        match parsed {
            IncomingMessage::GET_READER_STATUS => {
                // Status is already pushed on every lifecycle transition;
                // nothing to do beyond letting the client keep listening.
            }
            IncomingMessage::WRITE_DATA { data } => {
                let reply = submit_write(&reader_loop, &data).await;
                let _ = broadcast_tx.send(write_result_message(&reply));
            }
        }
    }

    forward.abort();
}

async fn submit_write(reader_loop: &Arc<ReaderLoop>, hex_data: &str) -> Result<(), ErrorKind> {
    let Ok(data) = hex::decode(hex_data) else {
        return Err(ErrorKind::InvalidData(format!("not valid hex: {hex_data}")));
    };
    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
    let sender = reader_loop.write_sender();
    if sender.send(WriteRequest { data, reply: reply_tx }).is_err() {
        return Err(ErrorKind::DeviceClosed);
    }
    tokio::task::spawn_blocking(move || {
        reply_rx.recv().unwrap_or(Err(ErrorKind::DeviceClosed))
    })
    .await
    .unwrap_or(Err(ErrorKind::DeviceClosed))
}
