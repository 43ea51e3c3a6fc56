//! JSON-RPC over web socket: every text frame is a message, every answer a text frame.

use crate::{
	rpc::{
		dispatch_payload,
		types::{Call, ErrorObject, Payload, Response},
		Dispatcher,
	},
	utils::spawn_in_span,
};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, warn};
use warp::ws::{Message, WebSocket};

pub async fn connect(web_socket: WebSocket, dispatcher: Arc<dyn Dispatcher>) {
	let (web_socket_sender, mut web_socket_receiver) = web_socket.split();
	let (sender, receiver) = mpsc::unbounded_channel();
	let receiver_stream = UnboundedReceiverStream::new(receiver);

	spawn_in_span(receiver_stream.forward(web_socket_sender).map(|result| {
		if let Err(error) = result {
			error!(%error, event_type = "WS_CONNECT", "Error sending web socket message");
		}
	}));

	while let Some(result) = web_socket_receiver.next().await {
		let message = match result {
			Err(error) => {
				error!(%error, event_type = "WS_CONNECT", "Error receiving client message");
				break;
			},
			Ok(message) if message.is_close() => break,
			Ok(message) if !message.is_text() => continue,
			Ok(message) => message,
		};

		let dispatcher = dispatcher.clone();
		let sender = sender.clone();
		spawn_in_span(async move {
			let reply = match handle_message(message.as_bytes(), dispatcher.as_ref()).await {
				Ok(reply) => reply,
				Err(error) => {
					error!(%error, event_type = "WS_CONNECT", "Failed to serialize reply");
					return;
				},
			};
			if let Err(error) = sender.send(Ok::<_, warp::Error>(Message::text(reply))) {
				warn!("Error sending message: {error:#}");
			}
		});
	}
	debug!("Web socket closed");
}

async fn handle_message(body: &[u8], dispatcher: &dyn Dispatcher) -> serde_json::Result<String> {
	let payload = match Payload::parse(body) {
		Ok(payload) => payload,
		Err(response) => return serde_json::to_string(&response),
	};

	let id = match &payload {
		Payload::Single(Call::Valid(request)) => request.id.clone(),
		_ => Value::Null,
	};
	match dispatch_payload(dispatcher, payload).await {
		Ok(value) => serde_json::to_string(&value),
		Err(error) => {
			error!(%error, event_type = "WS_CONNECT", "Failed to handle request");
			serde_json::to_string(&Response::failure(id, ErrorObject::internal_error()))
		},
	}
}
