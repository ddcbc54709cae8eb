//! SASL authentication hook.
//!
//! A broker connection authenticates right after the ApiVersions exchange
//! when `net.sasl.enable` is set. The connection sends SaslHandshake with the
//! [`Authenticator::mechanism`] name, then drives a [`SaslExchange`]: every
//! token the exchange produces is sent to the broker and the broker's answer
//! is fed back in, until the exchange reports [`SaslStep::Done`] or fails.
//!
//! Built-in mechanisms:
//!
//! - [`PlainAuthenticator`]: `PLAIN`, credentials in cleartext
//! - [`ScramAuthenticator`]: `SCRAM-SHA-256` / `SCRAM-SHA-512` (RFC 5802),
//!   including verification of the server signature
//! - [`OAuthBearerAuthenticator`]: `OAUTHBEARER` over a [`TokenProvider`]
//!
//! Any other mechanism (GSSAPI included) plugs in through a user supplied
//! [`Authenticator`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use hmac::{Hmac, Mac, digest::KeyInit};
use rand::Rng;
use sha2::{Digest, Sha256, Sha512};

use crate::error::{Error, Result};

/// SASL mechanisms the configuration can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
    OAuthBearer,
    Gssapi,
}

impl SaslMechanism {
    /// Mechanism name as sent in SaslHandshake.
    pub fn name(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
            SaslMechanism::OAuthBearer => "OAUTHBEARER",
            SaslMechanism::Gssapi => "GSSAPI",
        }
    }
}

impl fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SaslMechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().replace('_', "-").as_str() {
            "PLAIN" => Ok(SaslMechanism::Plain),
            "SCRAM-SHA-256" => Ok(SaslMechanism::ScramSha256),
            "SCRAM-SHA-512" => Ok(SaslMechanism::ScramSha512),
            "OAUTHBEARER" => Ok(SaslMechanism::OAuthBearer),
            "GSSAPI" => Ok(SaslMechanism::Gssapi),
            other => Err(Error::Config(format!("unknown SASL mechanism {other:?}"))),
        }
    }
}

/// Outcome of one exchange step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslStep {
    /// Send these bytes to the broker and feed its answer back in.
    Respond(Bytes),
    /// Authentication finished successfully.
    Done,
}

/// The client side of one authentication conversation.
pub trait SaslExchange: Send {
    /// Advance the conversation. The first call gets `None`; later calls get
    /// the broker's answer to the previous token.
    fn step(&mut self, challenge: Option<&[u8]>) -> Result<SaslStep>;
}

/// Produces an exchange for every new broker connection.
#[async_trait]
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Mechanism name announced in SaslHandshake.
    fn mechanism(&self) -> &str;

    async fn begin(&self) -> Result<Box<dyn SaslExchange>>;
}

// ============================================================================
// PLAIN
// ============================================================================

#[derive(Clone)]
pub struct PlainAuthenticator {
    authzid: Option<String>,
    user: String,
    password: String,
}

impl fmt::Debug for PlainAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainAuthenticator")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl PlainAuthenticator {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authzid: None,
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn with_authzid(mut self, authzid: impl Into<String>) -> Self {
        self.authzid = Some(authzid.into());
        self
    }

    /// `[authzid] NUL user NUL password`
    pub fn encode_credentials(&self) -> Bytes {
        let authzid = self.authzid.as_deref().unwrap_or("");
        Bytes::from(format!("{authzid}\0{}\0{}", self.user, self.password))
    }
}

struct PlainExchange {
    token: Option<Bytes>,
}

impl SaslExchange for PlainExchange {
    fn step(&mut self, _challenge: Option<&[u8]>) -> Result<SaslStep> {
        Ok(match self.token.take() {
            Some(token) => SaslStep::Respond(token),
            None => SaslStep::Done,
        })
    }
}

#[async_trait]
impl Authenticator for PlainAuthenticator {
    fn mechanism(&self) -> &str {
        SaslMechanism::Plain.name()
    }

    async fn begin(&self) -> Result<Box<dyn SaslExchange>> {
        Ok(Box::new(PlainExchange {
            token: Some(self.encode_credentials()),
        }))
    }
}

// ============================================================================
// SCRAM
// ============================================================================

/// Hash function behind a SCRAM mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramHash {
    Sha256,
    Sha512,
}

impl ScramHash {
    fn mechanism(self) -> SaslMechanism {
        match self {
            ScramHash::Sha256 => SaslMechanism::ScramSha256,
            ScramHash::Sha512 => SaslMechanism::ScramSha512,
        }
    }

    pub fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        match self {
            ScramHash::Sha256 => {
                let mut mac = <Hmac<Sha256> as KeyInit>::new_from_slice(key)
                    .map_err(|e| Error::SaslAuthentication(e.to_string()))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            ScramHash::Sha512 => {
                let mut mac = <Hmac<Sha512> as KeyInit>::new_from_slice(key)
                    .map_err(|e| Error::SaslAuthentication(e.to_string()))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            ScramHash::Sha256 => Sha256::digest(data).to_vec(),
            ScramHash::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// `Hi(password, salt, iterations)` from RFC 5802.
    pub fn salted_password(self, password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
        match self {
            ScramHash::Sha256 => {
                let mut out = [0u8; 32];
                pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
                out.to_vec()
            }
            ScramHash::Sha512 => {
                let mut out = [0u8; 64];
                pbkdf2::pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, iterations, &mut out);
                out.to_vec()
            }
        }
    }
}

#[derive(Clone)]
pub struct ScramAuthenticator {
    hash: ScramHash,
    user: String,
    password: String,
}

impl fmt::Debug for ScramAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScramAuthenticator")
            .field("hash", &self.hash)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl ScramAuthenticator {
    pub fn new(hash: ScramHash, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            hash,
            user: user.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl Authenticator for ScramAuthenticator {
    fn mechanism(&self) -> &str {
        self.hash.mechanism().name()
    }

    async fn begin(&self) -> Result<Box<dyn SaslExchange>> {
        let mut nonce = [0u8; 24];
        rand::thread_rng().fill(&mut nonce);
        Ok(Box::new(ScramExchange::new(
            self.hash,
            &self.user,
            &self.password,
            BASE64.encode(nonce),
        )))
    }
}

enum ScramState {
    Initial,
    ClientFirstSent,
    ClientFinalSent { server_signature: Vec<u8> },
    Done,
}

/// RFC 5802 client: client-first, client-final, then server-final check.
pub struct ScramExchange {
    hash: ScramHash,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    state: ScramState,
}

/// Escape `=` and `,` in a SCRAM username.
fn sasl_name(user: &str) -> String {
    user.replace('=', "=3D").replace(',', "=2C")
}

fn scram_attribute<'a>(message: &'a str, key: char) -> Option<&'a str> {
    message.split(',').find_map(|part| {
        let mut chars = part.chars();
        if chars.next() == Some(key) && chars.next() == Some('=') {
            Some(&part[2..])
        } else {
            None
        }
    })
}

impl ScramExchange {
    pub fn new(hash: ScramHash, user: &str, password: &str, client_nonce: String) -> Self {
        let client_first_bare = format!("n={},r={}", sasl_name(user), client_nonce);
        Self {
            hash,
            password: password.to_string(),
            client_nonce,
            client_first_bare,
            state: ScramState::Initial,
        }
    }

    fn client_final(&self, server_first: &str) -> Result<(String, Vec<u8>)> {
        let nonce = scram_attribute(server_first, 'r')
            .ok_or_else(|| Error::SaslAuthentication("server-first without nonce".to_string()))?;
        if !nonce.starts_with(&self.client_nonce) {
            return Err(Error::SaslAuthentication(
                "server nonce does not extend client nonce".to_string(),
            ));
        }
        let salt = scram_attribute(server_first, 's')
            .ok_or_else(|| Error::SaslAuthentication("server-first without salt".to_string()))
            .and_then(|s| {
                BASE64
                    .decode(s)
                    .map_err(|e| Error::SaslAuthentication(format!("invalid salt: {e}")))
            })?;
        let iterations: u32 = scram_attribute(server_first, 'i')
            .and_then(|i| i.parse().ok())
            .filter(|i| *i > 0)
            .ok_or_else(|| Error::SaslAuthentication("invalid iteration count".to_string()))?;

        let salted = self.hash.salted_password(&self.password, &salt, iterations);
        let client_key = self.hash.hmac(&salted, b"Client Key")?;
        let stored_key = self.hash.digest(&client_key);
        let without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!("{},{server_first},{without_proof}", self.client_first_bare);
        let client_signature = self.hash.hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();
        let server_key = self.hash.hmac(&salted, b"Server Key")?;
        let server_signature = self.hash.hmac(&server_key, auth_message.as_bytes())?;

        Ok((
            format!("{without_proof},p={}", BASE64.encode(proof)),
            server_signature,
        ))
    }
}

impl SaslExchange for ScramExchange {
    fn step(&mut self, challenge: Option<&[u8]>) -> Result<SaslStep> {
        match std::mem::replace(&mut self.state, ScramState::Done) {
            ScramState::Initial => {
                self.state = ScramState::ClientFirstSent;
                Ok(SaslStep::Respond(Bytes::from(format!(
                    "n,,{}",
                    self.client_first_bare
                ))))
            }
            ScramState::ClientFirstSent => {
                let server_first = std::str::from_utf8(challenge.unwrap_or_default())
                    .map_err(|_| Error::SaslAuthentication("server-first is not UTF-8".to_string()))?;
                let (client_final, server_signature) = self.client_final(server_first)?;
                self.state = ScramState::ClientFinalSent { server_signature };
                Ok(SaslStep::Respond(Bytes::from(client_final)))
            }
            ScramState::ClientFinalSent { server_signature } => {
                let server_final = std::str::from_utf8(challenge.unwrap_or_default())
                    .map_err(|_| Error::SaslAuthentication("server-final is not UTF-8".to_string()))?;
                if let Some(error) = scram_attribute(server_final, 'e') {
                    return Err(Error::SaslAuthentication(error.to_string()));
                }
                let verifier = scram_attribute(server_final, 'v')
                    .and_then(|v| BASE64.decode(v).ok())
                    .ok_or_else(|| Error::SaslAuthentication("server-final without verifier".to_string()))?;
                if verifier != server_signature {
                    return Err(Error::SaslAuthentication(
                        "server signature mismatch".to_string(),
                    ));
                }
                Ok(SaslStep::Done)
            }
            ScramState::Done => Ok(SaslStep::Done),
        }
    }
}

// ============================================================================
// OAUTHBEARER
// ============================================================================

/// A bearer token plus optional SASL extensions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccessToken {
    pub token: String,
    pub extensions: BTreeMap<String, String>,
}

/// Source of OAuth bearer tokens, asked once per connection.
#[async_trait]
pub trait TokenProvider: Send + Sync + fmt::Debug {
    async fn token(&self) -> Result<AccessToken>;
}

/// Always hands out the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider(pub AccessToken);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<AccessToken> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
pub struct OAuthBearerAuthenticator {
    provider: Arc<dyn TokenProvider>,
}

impl OAuthBearerAuthenticator {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self { provider }
    }
}

/// RFC 7628 initial client response.
fn oauth_initial_response(token: &AccessToken) -> Result<Bytes> {
    let mut message = format!("n,,\x01auth=Bearer {}", token.token);
    for (key, value) in &token.extensions {
        if key == "auth" {
            return Err(Error::SaslAuthentication(
                "extension name \"auth\" is reserved".to_string(),
            ));
        }
        message.push_str(&format!("\x01{key}={value}"));
    }
    message.push_str("\x01\x01");
    Ok(Bytes::from(message))
}

struct OAuthExchange {
    initial: Option<Bytes>,
}

impl SaslExchange for OAuthExchange {
    fn step(&mut self, challenge: Option<&[u8]>) -> Result<SaslStep> {
        if let Some(initial) = self.initial.take() {
            return Ok(SaslStep::Respond(initial));
        }
        // A non-empty answer to the initial response carries the error JSON.
        match challenge {
            Some(error) if !error.is_empty() => Err(Error::SaslAuthentication(
                String::from_utf8_lossy(error).into_owned(),
            )),
            _ => Ok(SaslStep::Done),
        }
    }
}

#[async_trait]
impl Authenticator for OAuthBearerAuthenticator {
    fn mechanism(&self) -> &str {
        SaslMechanism::OAuthBearer.name()
    }

    async fn begin(&self) -> Result<Box<dyn SaslExchange>> {
        let token = self.provider.token().await?;
        Ok(Box::new(OAuthExchange {
            initial: Some(oauth_initial_response(&token)?),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mechanism_names() {
        assert_eq!(SaslMechanism::ScramSha512.name(), "SCRAM-SHA-512");
        assert_eq!(
            "scram_sha_256".parse::<SaslMechanism>().unwrap(),
            SaslMechanism::ScramSha256
        );
        assert_eq!("oauthbearer".parse::<SaslMechanism>().unwrap(), SaslMechanism::OAuthBearer);
        assert!("kerberos".parse::<SaslMechanism>().is_err());
    }

    #[tokio::test]
    async fn test_plain_exchange() {
        let auth = PlainAuthenticator::new("alice", "secret");
        let mut exchange = auth.begin().await.unwrap();
        assert_eq!(
            exchange.step(None).unwrap(),
            SaslStep::Respond(Bytes::from_static(b"\0alice\0secret"))
        );
        assert_eq!(exchange.step(Some(b"")).unwrap(), SaslStep::Done);
    }

    #[test]
    fn test_sasl_name_escaping() {
        assert_eq!(sasl_name("a=b,c"), "a=3Db=2Cc");
    }

    /// RFC 7677 section 3 test vector.
    #[test]
    fn test_scram_sha256_rfc7677_vector() {
        let mut exchange = ScramExchange::new(
            ScramHash::Sha256,
            "user",
            "pencil",
            "rOprNGfwEbeRWgbNEkqO".to_string(),
        );
        assert_eq!(
            exchange.step(None).unwrap(),
            SaslStep::Respond(Bytes::from_static(b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO"))
        );

        let server_first =
            "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        let client_final = exchange.step(Some(server_first.as_bytes())).unwrap();
        assert_eq!(
            client_final,
            SaslStep::Respond(Bytes::from_static(
                b"c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
            ))
        );

        let server_final = b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";
        assert_eq!(exchange.step(Some(server_final)).unwrap(), SaslStep::Done);
    }

    #[test]
    fn test_scram_rejects_foreign_nonce() {
        let mut exchange =
            ScramExchange::new(ScramHash::Sha512, "user", "pw", "abc".to_string());
        exchange.step(None).unwrap();
        let err = exchange
            .step(Some(b"r=xyz123,s=c2FsdA==,i=4096"))
            .unwrap_err();
        assert!(matches!(err, Error::SaslAuthentication(_)));
    }

    #[test]
    fn test_scram_rejects_bad_server_signature() {
        let mut exchange = ScramExchange::new(ScramHash::Sha256, "user", "pw", "abc".to_string());
        exchange.step(None).unwrap();
        exchange.step(Some(b"r=abcdef,s=c2FsdA==,i=16")).unwrap();
        let err = exchange.step(Some(b"v=AAAA")).unwrap_err();
        assert!(matches!(err, Error::SaslAuthentication(_)));
    }

    #[test]
    fn test_scram_server_error() {
        let mut exchange = ScramExchange::new(ScramHash::Sha256, "user", "pw", "abc".to_string());
        exchange.step(None).unwrap();
        exchange.step(Some(b"r=abcdef,s=c2FsdA==,i=16")).unwrap();
        let err = exchange.step(Some(b"e=invalid-proof")).unwrap_err();
        assert_eq!(err, Error::SaslAuthentication("invalid-proof".to_string()));
    }

    #[tokio::test]
    async fn test_oauth_initial_response() {
        let mut token = AccessToken {
            token: "tok".to_string(),
            ..Default::default()
        };
        token.extensions.insert("traceId".to_string(), "1".to_string());
        let auth = OAuthBearerAuthenticator::new(Arc::new(StaticTokenProvider(token)));
        let mut exchange = auth.begin().await.unwrap();
        assert_eq!(
            exchange.step(None).unwrap(),
            SaslStep::Respond(Bytes::from_static(b"n,,\x01auth=Bearer tok\x01traceId=1\x01\x01"))
        );
        assert_eq!(exchange.step(Some(b"")).unwrap(), SaslStep::Done);
    }

    #[test]
    fn test_oauth_error_challenge() {
        let mut exchange = OAuthExchange { initial: None };
        let err = exchange.step(Some(b"{\"status\":\"invalid_token\"}")).unwrap_err();
        assert!(matches!(err, Error::SaslAuthentication(_)));
    }
}
