//! OAuth 2.0 authorization-code + PKCE support for the broker session.

use core::fmt::Debug;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::EngineError;

/// Produces the authorization code for the first leg of the OAuth flow.
///
/// The engine builds the `/authorize` URL (PKCE S256) and hands it to an
/// implementor, which must get it in front of the account holder — a browser
/// automation in production, a canned value in tests — and return the `code`
/// query parameter delivered to the redirect URI.
pub trait AuthorizationCodeProvider: Send + Sync + Debug {
    /// Obtain the authorization code for the given authorize URL.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the user never completes the flow or the redirect
    /// could not be captured.
    fn obtain_code(&self, authorize_url: &Url) -> Result<String, EngineError>;
}

/// A provider returning a pre-baked code, for tests and replayed sessions.
#[derive(Debug)]
pub struct StaticCodeProvider {
    code: String,
}

impl StaticCodeProvider {
    /// Wrap a known-good authorization code.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self { code: code.into() }
    }
}

impl AuthorizationCodeProvider for StaticCodeProvider {
    fn obtain_code(&self, _authorize_url: &Url) -> Result<String, EngineError> {
        Ok(self.code.clone())
    }
}

/// A PKCE verifier/challenge pair plus the `state` nonce of one authorize
/// round trip.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    /// High-entropy secret kept client side.
    pub verifier: String,
    /// `BASE64URL(SHA256(verifier))`, sent with the authorize request.
    pub challenge: String,
    /// CSRF nonce echoed back on the redirect.
    pub state: String,
}

impl PkceChallenge {
    /// Generate a fresh verifier, its S256 challenge, and a state nonce.
    #[must_use]
    pub fn generate() -> Self {
        let verifier = random_token(64);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        let state = random_token(16);

        Self {
            verifier,
            challenge,
            state,
        }
    }
}

/// Random alphanumeric token of the given length.
fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Build the `/authorize` URL for an authorization-code + PKCE round trip.
#[must_use]
pub fn build_authorize_url(
    authorize_base: &Url,
    client_id: &str,
    redirect_uri: &Url,
    pkce: &PkceChallenge,
) -> Url {
    let mut url = authorize_base.clone();

    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri.as_str())
        .append_pair("code_challenge", &pkce.challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("state", &pkce.state);

    url
}

/// Form body of the authorization-code token grant.
#[derive(Serialize, Debug)]
pub struct CodeGrant<'a> {
    /// `authorization_code`.
    pub grant_type: &'a str,
    /// The code returned by the provider.
    pub code: &'a str,
    /// Must match the authorize request.
    pub redirect_uri: &'a str,
    /// The PKCE verifier matching the challenge sent earlier.
    pub code_verifier: &'a str,
}

/// Form body of the refresh-token grant.
#[derive(Serialize, Debug)]
pub struct RefreshGrant<'a> {
    /// `refresh_token`.
    pub grant_type: &'a str,
    /// The refresh token of the running session.
    pub refresh_token: &'a str,
}
