#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use cohort_domain::{EntityKey, ParticipantId};
use cohort_util::SecretString;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Claims of a connection token issued by the web layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthClaims {
	/// Participant id.
	pub sub: String,
	/// Entity key, `group:<id>` or `batch:<id>`.
	pub ent: String,
	pub exp: u64,
}

/// Connection admission settings.
#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
	pub static_token: Option<SecretString>,
	pub hmac_secret: Option<SecretString>,
}

impl AuthPolicy {
	pub fn is_open(&self) -> bool {
		self.static_token.is_none() && self.hmac_secret.is_none()
	}

	/// Accept the static token, or an HMAC token bound to this participant and entity.
	pub fn check(&self, token: &str, participant: ParticipantId, entity: EntityKey) -> anyhow::Result<()> {
		if self.is_open() {
			return Ok(());
		}

		if let Some(expected) = &self.static_token
			&& constant_time_eq(expected.expose().as_bytes(), token.as_bytes())
		{
			return Ok(());
		}

		let Some(secret) = &self.hmac_secret else {
			return Err(anyhow!("invalid auth token"));
		};

		let claims = verify_hmac_token(token, secret.expose())?;
		if claims.sub != participant.to_string() {
			return Err(anyhow!("token subject does not match participant"));
		}
		let ent = EntityKey::parse(&claims.ent).context("parse token entity")?;
		if ent != entity {
			return Err(anyhow!("token is not valid for {entity}"));
		}
		Ok(())
	}
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a token the way the web layer does.
#[allow(dead_code)]
pub fn issue_hmac_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("encode token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|_| anyhow!("invalid hmac key"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn claims(sub: &str, ent: &str, ttl: i64) -> AuthClaims {
		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
		AuthClaims {
			sub: sub.to_string(),
			ent: ent.to_string(),
			exp: (now + ttl).max(0) as u64,
		}
	}

	fn hmac_policy() -> AuthPolicy {
		AuthPolicy {
			static_token: None,
			hmac_secret: Some(SecretString::new("s3cret")),
		}
	}

	#[test]
	fn open_policy_accepts_anything() {
		assert!(AuthPolicy::default().check("", ParticipantId(1), EntityKey::group(1)).is_ok());
	}

	#[test]
	fn static_token_must_match() {
		let policy = AuthPolicy {
			static_token: Some(SecretString::new("tok")),
			hmac_secret: None,
		};
		assert!(policy.check("tok", ParticipantId(1), EntityKey::group(1)).is_ok());
		assert!(policy.check("nope", ParticipantId(1), EntityKey::group(1)).is_err());
	}

	#[test]
	fn hmac_token_is_bound_to_participant_and_entity() {
		let policy = hmac_policy();
		let token = issue_hmac_token(&claims("7", "group:42", 60), "s3cret").unwrap();

		assert!(policy.check(&token, ParticipantId(7), EntityKey::group(42)).is_ok());
		assert!(policy.check(&token, ParticipantId(8), EntityKey::group(42)).is_err());
		assert!(policy.check(&token, ParticipantId(7), EntityKey::batch(42)).is_err());
	}

	#[test]
	fn rejects_expired_and_forged_tokens() {
		let policy = hmac_policy();
		let expired = issue_hmac_token(&claims("7", "group:42", -10), "s3cret").unwrap();
		assert!(policy.check(&expired, ParticipantId(7), EntityKey::group(42)).is_err());

		let forged = issue_hmac_token(&claims("7", "group:42", 60), "other").unwrap();
		assert!(policy.check(&forged, ParticipantId(7), EntityKey::group(42)).is_err());
		assert!(verify_hmac_token("v2.a.b", "s3cret").is_err());
	}
}
