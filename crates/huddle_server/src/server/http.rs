#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use huddle_domain::{GroupId, Username};
use hyper::body::Incoming;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::server::auth::{AuthError, Authenticator, Credentials};
use crate::server::presence::PresenceRegistry;
use crate::store::{ChatStore, JoinGroupOutcome, StoreError};
use crate::util::time::format_timestamp;

const MAX_BODY_BYTES: usize = 16 * 1024;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Everything the HTTP surface reads from.
#[derive(Clone)]
pub struct HttpState {
	pub health: HealthState,
	pub store: Arc<dyn ChatStore>,
	pub presence: PresenceRegistry,
	pub authenticator: Authenticator,
}

/// A parsed request, independent of hyper's body type.
#[derive(Debug, Clone)]
pub struct ApiRequest {
	pub method: Method,
	pub path: String,
	pub query: Option<String>,
	pub authorization: Option<String>,
	pub body: Bytes,
}

pub fn spawn_http_server(bind: SocketAddr, state: HttpState) {
	tokio::spawn(async move {
		if let Err(err) = run_http_server(bind, state).await {
			warn!(error = %err, "http server stopped");
		}
	});
}

async fn run_http_server(bind: SocketAddr, state: HttpState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_http(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "http connection error");
			}
		});
	}
}

async fn handle_http(req: Request<Incoming>, state: HttpState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let (parts, body) = req.into_parts();
	let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
		Ok(collected) => collected.to_bytes(),
		Err(_) => return Ok(error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large")),
	};

	let req = ApiRequest {
		method: parts.method,
		path: parts.uri.path().to_string(),
		query: parts.uri.query().map(str::to_string),
		authorization: parts
			.headers
			.get(AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string),
		body,
	};
	Ok(route(&state, req).await)
}

/// Dispatch one request.
pub async fn route(state: &HttpState, req: ApiRequest) -> Response<Full<Bytes>> {
	metrics::counter!("huddle_server_http_requests_total").increment(1);

	match (req.method.clone(), req.path.as_str()) {
		(Method::GET, "/healthz") => text_response(StatusCode::OK, "ok"),
		(Method::GET, "/readyz") => {
			if state.health.is_ready() {
				text_response(StatusCode::OK, "ready")
			} else {
				text_response(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
			}
		}
		(_, path) if path.starts_with("/api/") => match api(state, &req).await {
			Ok(resp) => resp,
			Err(ApiError::Auth(e)) => {
				debug!(error = %e, path = %req.path, "http api: unauthenticated");
				error_response(StatusCode::UNAUTHORIZED, "authentication required")
			}
			Err(ApiError::Store(e)) => {
				warn!(error = %e, path = %req.path, "http api: store failure");
				error_response(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable")
			}
		},
		(Method::GET, _) => error_response(StatusCode::NOT_FOUND, "not found"),
		_ => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
	}
}

enum ApiError {
	Auth(AuthError),
	Store(StoreError),
}

impl From<AuthError> for ApiError {
	fn from(e: AuthError) -> Self {
		match e {
			AuthError::Store(e) => Self::Store(e),
			other => Self::Auth(other),
		}
	}
}

impl From<StoreError> for ApiError {
	fn from(e: StoreError) -> Self {
		Self::Store(e)
	}
}

#[derive(Deserialize)]
struct CreateGroup {
	name: String,
}

async fn api(state: &HttpState, req: &ApiRequest) -> Result<Response<Full<Bytes>>, ApiError> {
	let mut creds = Credentials::from_query(req.query.as_deref());
	if let Some(token) = Credentials::from_authorization(req.authorization.as_deref()).token {
		creds.token = Some(token);
	}
	let me = state.authenticator.authenticate(state.store.as_ref(), &creds).await?;

	let segments: Vec<&str> = req.path.trim_matches('/').split('/').collect();
	let resp = match (&req.method, segments.as_slice()) {
		(&Method::GET, ["api", "private-messages"]) => {
			let Some(other) = query_param(req, "other_user").and_then(|v| Username::new(v).ok()) else {
				return Ok(error_response(StatusCode::BAD_REQUEST, "other_user is required"));
			};
			let messages = state.store.list_private_messages(&me, &other).await?;
			let items: Vec<Value> = messages
				.iter()
				.map(|m| {
					json!({
						"id": m.id,
						"sender": m.sender,
						"recipient": m.recipient,
						"content": m.content,
						"timestamp": format_timestamp(m.timestamp_ms),
					})
				})
				.collect();
			json_response(StatusCode::OK, &Value::Array(items))
		}
		(&Method::GET, ["api", "group-messages"]) => {
			let Some(group) = query_param(req, "group_id").and_then(|v| v.parse::<GroupId>().ok()) else {
				return Ok(error_response(StatusCode::BAD_REQUEST, "group_id is required"));
			};
			if !state.store.group_membership(&me, group).await? {
				return Ok(error_response(StatusCode::FORBIDDEN, "not a member of this group"));
			}
			let messages = state.store.list_group_messages(group).await?;
			let items: Vec<Value> = messages
				.iter()
				.map(|m| {
					json!({
						"id": m.id,
						"group_id": m.group_id,
						"sender": m.sender,
						"content": m.content,
						"timestamp": format_timestamp(m.timestamp_ms),
					})
				})
				.collect();
			json_response(StatusCode::OK, &Value::Array(items))
		}
		(&Method::GET, ["api", "contacts"]) => {
			let contacts = state.store.list_contacts(&me).await?;
			json_response(StatusCode::OK, &json!(contacts))
		}
		(&Method::GET, ["api", "online-users"]) => json_response(StatusCode::OK, &json!(state.presence.online_users())),
		(&Method::GET, ["api", "rooms"]) => {
			let rooms: Vec<Value> = state
				.presence
				.rooms_of(&me)
				.into_iter()
				.map(|room| {
					let members = state.presence.members_of(&room);
					json!({ "room": room, "kind": room.kind(), "members": members })
				})
				.collect();
			json_response(StatusCode::OK, &Value::Array(rooms))
		}
		(&Method::GET, ["api", "groups"]) => {
			let groups = state.store.list_groups(&me).await?;
			json_response(StatusCode::OK, &json!(groups))
		}
		(&Method::POST, ["api", "groups"]) => {
			let name = serde_json::from_slice::<CreateGroup>(&req.body)
				.ok()
				.map(|b| b.name.trim().to_string())
				.filter(|n| !n.is_empty());
			let Some(name) = name else {
				return Ok(error_response(StatusCode::BAD_REQUEST, "group name is required"));
			};
			let group = state.store.create_group(&name, &me).await?;
			debug!(user = %me, group_id = %group.id, "group created");
			json_response(StatusCode::CREATED, &json!(group))
		}
		(&Method::POST, ["api", "groups", id, "join"]) => {
			let Ok(group) = id.parse::<GroupId>() else {
				return Ok(error_response(StatusCode::BAD_REQUEST, "invalid group id"));
			};
			match state.store.join_group(&me, group).await? {
				JoinGroupOutcome::Joined => json_response(StatusCode::OK, &json!({ "status": "joined" })),
				JoinGroupOutcome::AlreadyMember => json_response(StatusCode::OK, &json!({ "status": "already_member" })),
				JoinGroupOutcome::NoSuchGroup => error_response(StatusCode::NOT_FOUND, "group not found"),
			}
		}
		_ => error_response(StatusCode::NOT_FOUND, "not found"),
	};
	Ok(resp)
}

fn query_param(req: &ApiRequest, key: &str) -> Option<String> {
	let query = req.query.as_deref()?;
	form_urlencoded::parse(query.as_bytes())
		.find(|(k, _)| k == key)
		.map(|(_, v)| v.into_owned())
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
	*resp.status_mut() = status;
	resp
}

fn json_response(status: StatusCode, value: &Value) -> Response<Full<Bytes>> {
	let body = serde_json::to_vec(value).unwrap_or_default();
	let mut resp = Response::new(Full::new(Bytes::from(body)));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
	json_response(status, &json!({ "error": message }))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::SecretString;
	use crate::server::auth::sign_token;
	use crate::store::InMemoryStore;

	const SECRET: &str = "http-secret";

	fn user(s: &str) -> Username {
		Username::new(s).expect("valid username")
	}

	fn state() -> (HttpState, Arc<InMemoryStore>) {
		let store = Arc::new(InMemoryStore::new());
		for name in ["alice", "bob", "carol"] {
			store.add_user(user(name));
		}
		let state = HttpState {
			health: HealthState::new(),
			store: store.clone(),
			presence: PresenceRegistry::new(),
			authenticator: Authenticator::new(Some(SecretString::new(SECRET)), false),
		};
		(state, store)
	}

	fn request(method: Method, path_and_query: &str, as_user: Option<&str>, body: &str) -> ApiRequest {
		let (path, query) = match path_and_query.split_once('?') {
			Some((p, q)) => (p.to_string(), Some(q.to_string())),
			None => (path_and_query.to_string(), None),
		};
		ApiRequest {
			method,
			path,
			query,
			authorization: as_user.map(|u| format!("Bearer {}", sign_token(u, 60, SECRET).unwrap())),
			body: Bytes::from(body.to_string()),
		}
	}

	async fn body_json(resp: Response<Full<Bytes>>) -> Value {
		let bytes = resp.into_body().collect().await.unwrap().to_bytes();
		serde_json::from_slice(&bytes).unwrap()
	}

	#[tokio::test]
	async fn readiness_follows_health_state() {
		let (state, _) = state();
		let resp = route(&state, request(Method::GET, "/readyz", None, "")).await;
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

		state.health.mark_ready();
		let resp = route(&state, request(Method::GET, "/readyz", None, "")).await;
		assert_eq!(resp.status(), StatusCode::OK);

		let resp = route(&state, request(Method::GET, "/healthz", None, "")).await;
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn api_requires_a_token() {
		let (state, _) = state();
		let resp = route(&state, request(Method::GET, "/api/contacts", None, "")).await;
		assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
	}

	#[tokio::test]
	async fn private_history_is_scoped_to_the_pair() {
		let (state, store) = state();
		store.insert_private_message(&user("alice"), &user("bob"), "hi").await.unwrap();
		store.insert_private_message(&user("bob"), &user("alice"), "hey").await.unwrap();
		store.insert_private_message(&user("carol"), &user("alice"), "psst").await.unwrap();

		let resp = route(
			&state,
			request(Method::GET, "/api/private-messages?other_user=bob", Some("alice"), ""),
		)
		.await;
		assert_eq!(resp.status(), StatusCode::OK);
		let v = body_json(resp).await;
		let contents: Vec<&str> = v.as_array().unwrap().iter().map(|m| m["content"].as_str().unwrap()).collect();
		assert_eq!(contents, vec!["hi", "hey"]);
	}

	#[tokio::test]
	async fn group_history_is_members_only() {
		let (state, store) = state();
		let team = store.add_group("team", &user("alice"));
		store.insert_group_message(&user("alice"), team, "standup").await.unwrap();

		let path = format!("/api/group-messages?group_id={team}");
		let resp = route(&state, request(Method::GET, &path, Some("carol"), "")).await;
		assert_eq!(resp.status(), StatusCode::FORBIDDEN);

		let resp = route(&state, request(Method::GET, &path, Some("alice"), "")).await;
		assert_eq!(resp.status(), StatusCode::OK);
		let v = body_json(resp).await;
		assert_eq!(v[0]["content"], "standup");
		assert_eq!(v[0]["group_id"], team.get());
	}

	#[tokio::test]
	async fn create_list_and_join_groups() {
		let (state, _) = state();

		let resp = route(&state, request(Method::POST, "/api/groups", Some("alice"), r#"{"name":"  "}"#)).await;
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

		let resp = route(&state, request(Method::POST, "/api/groups", Some("alice"), r#"{"name":"team"}"#)).await;
		assert_eq!(resp.status(), StatusCode::CREATED);
		let created = body_json(resp).await;
		let id = created["id"].as_i64().unwrap();
		assert_eq!(created["created_by"], "alice");

		let join = format!("/api/groups/{id}/join");
		let resp = route(&state, request(Method::POST, &join, Some("bob"), "")).await;
		assert_eq!(body_json(resp).await["status"], "joined");
		let resp = route(&state, request(Method::POST, &join, Some("bob"), "")).await;
		assert_eq!(body_json(resp).await["status"], "already_member");

		let resp = route(&state, request(Method::POST, "/api/groups/999/join", Some("bob"), "")).await;
		assert_eq!(resp.status(), StatusCode::NOT_FOUND);

		let resp = route(&state, request(Method::GET, "/api/groups", Some("carol"), "")).await;
		let groups = body_json(resp).await;
		assert_eq!(groups[0]["member_count"], 2);
		assert_eq!(groups[0]["joined"], false);
	}

	#[tokio::test]
	async fn query_token_is_accepted_without_a_header() {
		let (state, _) = state();
		let token = sign_token("bob", 60, SECRET).unwrap();
		let mut req = request(Method::GET, &format!("/api/contacts?token={token}"), None, "");
		req.authorization = None;
		let resp = route(&state, req).await;
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn rooms_lists_the_callers_live_rooms() {
		use huddle_domain::RoomKey;
		use tokio::sync::mpsc;

		use crate::server::presence::ConnectionHandle;

		let (state, _) = state();
		let (tx_a, _rx_a) = mpsc::channel(16);
		let (tx_b, _rx_b) = mpsc::channel(16);
		state.presence.connect(&user("alice"), ConnectionHandle::new(1, tx_a));
		state.presence.connect(&user("bob"), ConnectionHandle::new(2, tx_b));
		let room = RoomKey::private(&user("alice"), &user("bob"));
		state.presence.join(&user("alice"), &room).unwrap();
		state.presence.join(&user("bob"), &room).unwrap();

		let resp = route(&state, request(Method::GET, "/api/rooms", Some("alice"), "")).await;
		let v = body_json(resp).await;
		assert_eq!(
			v,
			json!([{ "room": "private_alice_bob", "kind": "private", "members": ["alice", "bob"] }])
		);

		let resp = route(&state, request(Method::GET, "/api/rooms", Some("carol"), "")).await;
		assert_eq!(body_json(resp).await, json!([]));
	}

	#[tokio::test]
	async fn contacts_exclude_the_caller() {
		let (state, _) = state();
		let resp = route(&state, request(Method::GET, "/api/contacts", Some("bob"), "")).await;
		assert_eq!(body_json(resp).await, json!(["alice", "carol"]));
	}
}
