/*!
 * OAuth credentials for the Drive sink
 *
 * Tokens are cached on disk across runs. The interactive consent flow only
 * runs when there is no cached token that is valid or refreshable.
 */

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

/// Drive scope limited to files this application creates
pub const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Environment variable holding a pre-issued access token
pub const ACCESS_TOKEN_ENV: &str = "CAPSULE_ACCESS_TOKEN";

/// Tokens this close to expiry are refreshed
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Failed to load client secrets '{}': {reason}", path.display())]
    Secrets { path: PathBuf, reason: String },

    #[error("Token cache '{}': {reason}", path.display())]
    Cache { path: PathBuf, reason: String },

    #[error("Token endpoint rejected the request: {0}")]
    TokenEndpoint(String),

    #[error("Consent flow failed: {0}")]
    Consent(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::Http(err.to_string())
    }
}

/// Supplies a valid, possibly refreshed, access token
pub trait CredentialProvider {
    fn access_token(&self) -> Result<String, AuthError>;
}

/// A token handed in from outside (environment, tests)
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Read `CAPSULE_ACCESS_TOKEN` if set and non-empty
    pub fn from_env() -> Option<Self> {
        std::env::var(ACCESS_TOKEN_ENV)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(Self::new)
    }
}

impl CredentialProvider for StaticTokenProvider {
    fn access_token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }
}

/// On-disk token cache, field-compatible with Google's authorized-user files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedToken {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl CachedToken {
    /// A token with no expiry never expires
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) => expiry - now > ChronoDuration::seconds(EXPIRY_SKEW_SECS),
            None => !self.token.is_empty(),
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn load(path: &Path) -> Result<Option<Self>, AuthError> {
        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AuthError::Cache {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| AuthError::Cache {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    pub fn save(&self, path: &Path) -> Result<(), AuthError> {
        let cache_err = |reason: String| AuthError::Cache {
            path: path.to_path_buf(),
            reason,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| cache_err(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| cache_err(e.to_string()))?;
        fs::write(path, json).map_err(|e| cache_err(e.to_string()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .map_err(|e| cache_err(e.to_string()))?;
        }
        Ok(())
    }
}

/// Installed-app client secrets (`credentials.json`)
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Deserialize)]
struct SecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let secrets_err = |reason: String| AuthError::Secrets {
            path: path.to_path_buf(),
            reason,
        };
        let contents = fs::read_to_string(path).map_err(|e| secrets_err(e.to_string()))?;
        let file: SecretsFile =
            serde_json::from_str(&contents).map_err(|e| secrets_err(e.to_string()))?;
        file.installed
            .or(file.web)
            .ok_or_else(|| secrets_err("expected an 'installed' or 'web' section".to_string()))
    }
}

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Installed-app OAuth 2.0 with a loopback redirect and a persisted token cache
pub struct OAuthCredentialProvider {
    secrets_path: PathBuf,
    cache_path: PathBuf,
    scopes: Vec<String>,
    client: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl OAuthCredentialProvider {
    pub fn new(secrets_path: impl Into<PathBuf>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            secrets_path: secrets_path.into(),
            cache_path: cache_path.into(),
            scopes: vec![DRIVE_FILE_SCOPE.to_string()],
            client: Client::new(),
            cached: Mutex::new(None),
        }
    }

    fn load_cache(&self) -> Option<CachedToken> {
        match CachedToken::load(&self.cache_path) {
            Ok(token) => token,
            Err(e) => {
                warn!("{}; ignoring cached token", e);
                None
            }
        }
    }

    fn refresh(&self, token: &CachedToken) -> Result<CachedToken, AuthError> {
        let refresh_token = token.refresh_token.clone().unwrap_or_default();
        let response = self
            .client
            .post(&token.token_uri)
            .form(&[
                ("client_id", token.client_id.as_str()),
                ("client_secret", token.client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()?;
        let granted = read_token_response(response)?;
        debug!("Refreshed access token");

        Ok(CachedToken {
            token: granted.access_token,
            refresh_token: granted.refresh_token.or(Some(refresh_token)),
            expiry: granted
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
            ..token.clone()
        })
    }

    fn consent(&self) -> Result<CachedToken, AuthError> {
        let secrets = ClientSecrets::load(&self.secrets_path)?;
        let listener = TcpListener::bind("127.0.0.1:0")
            .map_err(|e| AuthError::Consent(format!("cannot bind loopback listener: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| AuthError::Consent(e.to_string()))?
            .port();
        let redirect_uri = format!("http://localhost:{}/", port);
        let state: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();

        let consent_url = consent_url(&secrets, &redirect_uri, &self.scopes, &state)?;
        info!("Waiting for authorization on {}", redirect_uri);
        eprintln!(
            "Please visit this URL to authorize this application:\n{}",
            consent_url
        );

        let (stream, _) = listener
            .accept()
            .map_err(|e| AuthError::Consent(e.to_string()))?;
        let mut reader = BufReader::new(stream);
        let mut request_line = String::new();
        reader
            .read_line(&mut request_line)
            .map_err(|e| AuthError::Consent(e.to_string()))?;

        let outcome = parse_redirect(&request_line, &state);
        let page = match outcome {
            Ok(_) => "The authentication flow has completed. You may close this window.",
            Err(_) => "Authorization failed. You may close this window.",
        };
        let mut stream = reader.into_inner();
        let _ = write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            page.len(),
            page
        );
        let code = outcome?;

        let response = self
            .client
            .post(&secrets.token_uri)
            .form(&[
                ("code", code.as_str()),
                ("client_id", secrets.client_id.as_str()),
                ("client_secret", secrets.client_secret.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()?;
        let granted = read_token_response(response)?;
        info!("Authorization granted");

        Ok(CachedToken {
            token: granted.access_token,
            refresh_token: granted.refresh_token,
            token_uri: secrets.token_uri,
            client_id: secrets.client_id,
            client_secret: secrets.client_secret,
            scopes: self.scopes.clone(),
            expiry: granted
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
        })
    }
}

impl CredentialProvider for OAuthCredentialProvider {
    fn access_token(&self) -> Result<String, AuthError> {
        let mut guard = self.cached.lock().map_err(|_| AuthError::Cache {
            path: self.cache_path.clone(),
            reason: "token lock poisoned".to_string(),
        })?;

        let current = guard.take().or_else(|| self.load_cache());
        let (token, fresh) = match current {
            Some(token) if token.is_valid(Utc::now()) => (token, false),
            Some(token) if token.can_refresh() => match self.refresh(&token) {
                Ok(refreshed) => (refreshed, true),
                Err(e) => {
                    warn!("Token refresh failed: {}; requesting new consent", e);
                    (self.consent()?, true)
                }
            },
            _ => (self.consent()?, true),
        };

        if fresh {
            token.save(&self.cache_path)?;
            debug!("Token cached at {}", self.cache_path.display());
        }

        let access = token.token.clone();
        *guard = Some(token);
        Ok(access)
    }
}

fn read_token_response(response: reqwest::blocking::Response) -> Result<TokenResponse, AuthError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(AuthError::TokenEndpoint(format!("HTTP {}: {}", status, body)));
    }
    response
        .json()
        .map_err(|e| AuthError::TokenEndpoint(format!("malformed token response: {}", e)))
}

/// Build the browser consent URL
pub fn consent_url(
    secrets: &ClientSecrets,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
) -> Result<Url, AuthError> {
    let scope = scopes.join(" ");
    Url::parse_with_params(
        &secrets.auth_uri,
        &[
            ("response_type", "code"),
            ("client_id", secrets.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("scope", scope.as_str()),
            ("state", state),
            ("access_type", "offline"),
            ("prompt", "consent"),
        ],
    )
    .map_err(|e| AuthError::Consent(format!("invalid auth_uri: {}", e)))
}

/// Extract the authorization code from the redirect's request line
pub fn parse_redirect(request_line: &str, expected_state: &str) -> Result<String, AuthError> {
    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| AuthError::Consent(format!("malformed redirect: {}", request_line.trim())))?;
    let url = Url::parse(&format!("http://localhost{}", target))
        .map_err(|e| AuthError::Consent(format!("malformed redirect target: {}", e)))?;

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => return Err(AuthError::Consent(format!("access denied: {}", value))),
            _ => {}
        }
    }

    if state.as_deref() != Some(expected_state) {
        return Err(AuthError::Consent("state mismatch in redirect".to_string()));
    }
    code.ok_or_else(|| AuthError::Consent("redirect carried no authorization code".to_string()))
}
