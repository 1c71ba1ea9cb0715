#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use huddle_domain::Username;
use huddle_protocol::{ClientEvent, DEFAULT_MAX_FRAME_SIZE, ServerEvent, decode_client_event, encode_event};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, info, warn};

use crate::server::auth::{Authenticator, Credentials};
use crate::server::presence::ConnectionHandle;
use crate::server::router::{MessageRouter, SendOutcome};

/// How long queued events may keep flushing after the session ends.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	pub outbound_queue_capacity: usize,
	pub send_rate_limit_burst: u32,
	pub send_rate_limit_per_minute: u32,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 256,
			send_rate_limit_burst: 0,
			send_rate_limit_per_minute: 0,
		}
	}
}

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	/// `None` when either knob is zero, which disables limiting.
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Serve one websocket client until it disconnects.
pub async fn handle_connection<S>(
	conn_id: u64,
	stream: S,
	router: Arc<MessageRouter>,
	authenticator: Authenticator,
	settings: ConnectionSettings,
) -> anyhow::Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("huddle_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("huddle_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let mut creds = Credentials::default();
	let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
		creds = Credentials::from_query(req.uri().query());
		let header = req.headers().get("authorization").and_then(|v| v.to_str().ok());
		if let Some(token) = Credentials::from_authorization(header).token {
			creds.token = Some(token);
		}
		Ok::<Response, ErrorResponse>(resp)
	})
	.await
	.context("websocket handshake")?;
	let (mut ws_sender, mut ws_receiver) = ws.split();

	let user = match authenticator.authenticate(router.store().as_ref(), &creds).await {
		Ok(user) => user,
		Err(e) => {
			metrics::counter!("huddle_server_auth_failures_total").increment(1);
			info!(conn_id, error = %e, "rejecting unauthenticated connection");
			let frame = encode_event(&router.scoped_error("Authentication failed", &e), settings.max_frame_bytes)?;
			let _ = ws_sender.send(Message::Text(frame.into())).await;
			let _ = ws_sender.close().await;
			return Ok(());
		}
	};

	let (tx, mut rx) = mpsc::channel::<ServerEvent>(settings.outbound_queue_capacity.max(1));
	let max_frame_bytes = settings.max_frame_bytes;
	let writer_user = user.clone();
	let mut writer = tokio::spawn(async move {
		while let Some(event) = rx.recv().await {
			// Server-built events are sized where they are produced; the inbound limit does not apply.
			let frame = match encode_event(&event, usize::MAX) {
				Ok(frame) => frame,
				Err(e) => {
					warn!(conn_id, user = %writer_user, event = event.name(), error = %e, "dropping unencodable event");
					continue;
				}
			};
			metrics::counter!("huddle_server_frames_out_total").increment(1);
			if ws_sender.send(Message::Text(frame.into())).await.is_err() {
				return;
			}
		}
		let _ = ws_sender.close().await;
	});

	let presence = router.presence().clone();
	if presence.connect(&user, ConnectionHandle::new(conn_id, tx.clone())) {
		info!(conn_id, user = %user, "session superseded an older connection");
	}
	info!(conn_id, user = %user, "session started");

	let mut send_limiter = TokenBucket::new(settings.send_rate_limit_burst, settings.send_rate_limit_per_minute);
	let session = Session {
		conn_id,
		user: &user,
		router: &router,
		reply: &tx,
	};

	while let Some(msg) = ws_receiver.next().await {
		let msg = match msg {
			Ok(msg) => msg,
			Err(e) => {
				debug!(conn_id, user = %user, error = %e, "websocket read failed");
				break;
			}
		};

		let text = match msg {
			Message::Text(text) => text,
			Message::Close(_) => break,
			Message::Binary(_) => {
				session.reply(ServerEvent::error("Binary frames are not supported")).await;
				continue;
			}
			_ => continue,
		};
		metrics::counter!("huddle_server_frames_in_total").increment(1);

		if !presence.is_current(&user, conn_id) {
			session.reply(ServerEvent::error("Session replaced by a newer connection")).await;
			break;
		}

		let event = match decode_client_event(text.as_str(), max_frame_bytes) {
			Ok(event) => event,
			Err(e) => {
				metrics::counter!("huddle_server_decode_errors_total").increment(1);
				debug!(conn_id, user = %user, error = %e, "undecodable frame");
				session.reply(router.scoped_error("Invalid event", &e)).await;
				continue;
			}
		};

		if matches!(event, ClientEvent::SendMessage(_))
			&& let Some(bucket) = send_limiter.as_mut()
			&& !bucket.allow()
		{
			metrics::counter!("huddle_server_send_rate_limited_total").increment(1);
			session.reply(ServerEvent::error("Rate limit exceeded")).await;
			continue;
		}

		session.dispatch(event).await;
	}

	presence.disconnect(&user, conn_id);
	drop(session);
	drop(tx);
	info!(conn_id, user = %user, "session ended");

	if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
		writer.abort();
	}
	Ok(())
}

struct Session<'a> {
	conn_id: u64,
	user: &'a Username,
	router: &'a MessageRouter,
	reply: &'a mpsc::Sender<ServerEvent>,
}

impl Session<'_> {
	/// Errors go to this connection only, even after the session was superseded.
	async fn reply(&self, event: ServerEvent) {
		if self.reply.send(event).await.is_err() {
			debug!(conn_id = self.conn_id, "reply dropped; writer is gone");
		}
	}

	async fn dispatch(&self, event: ClientEvent) {
		metrics::counter!("huddle_server_events_total", "event" => event.name()).increment(1);

		match event {
			ClientEvent::JoinRoom(join) => {
				if let Err(e) = self.router.join_room(self.user, join.kind, &join.target).await {
					debug!(conn_id = self.conn_id, user = %self.user, error = %e, "join_room failed");
					self.reply(self.router.to_client_error(&e, "Failed to join room")).await;
				}
			}
			ClientEvent::LeaveRoom(leave) => {
				self.router.leave_room(self.user, &leave.room);
			}
			ClientEvent::SendMessage(send) => {
				match self
					.router
					.send_message(self.user, send.kind, &send.target, &send.content)
					.await
				{
					Ok(SendOutcome::Dropped) => {
						debug!(conn_id = self.conn_id, user = %self.user, "blank message dropped");
					}
					Ok(SendOutcome::Delivered {
						room,
						message_id,
						recipients,
					}) => {
						debug!(conn_id = self.conn_id, user = %self.user, %room, message_id, recipients, "message delivered");
					}
					Err(e) => {
						debug!(conn_id = self.conn_id, user = %self.user, error = %e, "send_message failed");
						self.reply(self.router.to_client_error(&e, "Failed to send message")).await;
					}
				}
			}
		}
	}
}
