#![forbid(unsafe_code)]

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use huddle_domain::Username;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use url::form_urlencoded;

use crate::config::SecretString;
use crate::store::{ChatStore, StoreError};
use crate::util::time::unix_ms_now;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("missing credentials")]
	Missing,
	#[error("invalid token format")]
	Malformed,
	#[error("invalid token signature")]
	BadSignature,
	#[error("token expired")]
	Expired,
	#[error("invalid token claims: {0}")]
	Claims(String),
	#[error("unknown user")]
	UnknownUser,
	#[error(transparent)]
	Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	/// Expiry, Unix seconds.
	pub exp: u64,
}

/// Issue a `v1.<payload>.<sig>` token for `sub`, valid for `ttl_secs`.
pub fn sign_token(sub: &str, ttl_secs: u64, secret: &str) -> Result<String, AuthError> {
	let claims = AuthClaims {
		sub: sub.to_string(),
		exp: now_secs().saturating_add(ttl_secs),
	};
	let payload = serde_json::to_vec(&claims).map_err(|e| AuthError::Claims(e.to_string()))?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = mac(secret)?.chain_update(payload_b64.as_bytes()).finalize().into_bytes();
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	let mut parts = token.trim().split('.');
	let (Some("v1"), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(AuthError::Malformed);
	};

	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| AuthError::Malformed)?;
	mac(secret)?
		.chain_update(payload_b64.as_bytes())
		.verify_slice(&provided_sig)
		.map_err(|_| AuthError::BadSignature)?;

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthError::Malformed)?;
	let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|e| AuthError::Claims(e.to_string()))?;
	if claims.exp <= now_secs() {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

fn mac(secret: &str) -> Result<HmacSha256, AuthError> {
	HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::Malformed)
}

fn now_secs() -> u64 {
	(unix_ms_now() / 1000).max(0) as u64
}

/// What a client presented when connecting.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
	pub token: Option<String>,
	/// Plain `?user=` claim, honoured only when insecure usernames are allowed.
	pub username: Option<String>,
}

impl Credentials {
	/// Pull `token` and `user` out of a URL query string.
	pub fn from_query(query: Option<&str>) -> Self {
		let mut creds = Self::default();
		for (k, v) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
			match k.as_ref() {
				"token" if !v.is_empty() => creds.token = Some(v.into_owned()),
				"user" if !v.is_empty() => creds.username = Some(v.into_owned()),
				_ => {}
			}
		}
		creds
	}

	/// Extract a bearer token from an `Authorization` header value.
	pub fn from_authorization(header: Option<&str>) -> Self {
		let token = header
			.and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("bearer ")))
			.map(|t| t.trim().to_string())
			.filter(|t| !t.is_empty());
		Self { token, username: None }
	}
}

/// Resolves credentials to a registered username.
#[derive(Debug, Clone)]
pub struct Authenticator {
	secret: Option<SecretString>,
	allow_insecure_usernames: bool,
}

impl Authenticator {
	pub fn new(secret: Option<SecretString>, allow_insecure_usernames: bool) -> Self {
		Self {
			secret,
			allow_insecure_usernames,
		}
	}

	pub async fn authenticate(&self, store: &dyn ChatStore, creds: &Credentials) -> Result<Username, AuthError> {
		let claimed = match (&creds.token, &self.secret) {
			(Some(token), Some(secret)) => verify_hmac_token(token, secret.expose())?.sub,
			_ => match &creds.username {
				Some(name) if self.allow_insecure_usernames => name.clone(),
				_ => return Err(AuthError::Missing),
			},
		};

		let username = Username::new(claimed).map_err(|e| AuthError::Claims(e.to_string()))?;
		if store.find_user(&username).await?.is_none() {
			return Err(AuthError::UnknownUser);
		}
		Ok(username)
	}
}
