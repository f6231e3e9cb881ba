use goauth::auth::{JwtClaims, Token};
use goauth::credentials::Credentials;
use goauth::scopes::Scope;
use goauth::GoErr;
use smpl_jwt::Jwt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

const SERVICE_ACCOUNT_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

// Renew this long before the token actually expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(200);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid GCP credentials file '{0}': {1}")]
    InvalidCredentials(String, GoErr),

    #[error("invalid RSA key in GCP credentials: {0}")]
    InvalidRsaKey(GoErr),

    #[error("failed to get OAuth token: {0}")]
    GetToken(GoErr),

    #[error("failed to get implicit GCP token: {0}")]
    Implicit(#[from] reqwest::Error),

    #[error("metadata server returned status {0}")]
    MetadataStatus(u16),

    #[error("failed to parse OAuth token JSON: {0}")]
    TokenJson(#[from] serde_json::Error),
}

impl AuthError {
    pub fn is_retriable(&self) -> bool {
        match self {
            AuthError::GetToken(_) | AuthError::Implicit(_) => true,
            AuthError::MetadataStatus(status) => *status >= 500,
            AuthError::InvalidCredentials(..)
            | AuthError::InvalidRsaKey(_)
            | AuthError::TokenJson(_) => false,
        }
    }
}

/// Source of `Authorization` headers for Pub/Sub requests.
///
/// Resolution order: explicit credentials file, `GOOGLE_APPLICATION_CREDENTIALS`,
/// then the GCE metadata server. `None` is used against the emulator.
#[derive(Clone, Debug)]
pub enum GcpAuthenticator {
    Credentials(Arc<InnerCreds>),
    None,
}

#[derive(Debug)]
pub struct InnerCreds {
    creds: Option<Credentials>,
    http: reqwest::Client,
    token: RwLock<CachedToken>,
}

#[derive(Debug)]
struct CachedToken {
    token: Token,
    refresh_at: Instant,
}

impl CachedToken {
    fn new(token: Token) -> Self {
        let lifetime = Duration::from_secs(u64::from(token.expires_in()));
        Self {
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
            token,
        }
    }

    fn header(&self) -> String {
        format!("{} {}", self.token.token_type(), self.token.access_token())
    }
}

impl GcpAuthenticator {
    pub async fn build(
        credentials_path: Option<&Path>,
        skip_authentication: bool,
    ) -> Result<Self, AuthError> {
        if skip_authentication {
            return Ok(Self::None);
        }

        let from_env = std::env::var("GOOGLE_APPLICATION_CREDENTIALS")
            .ok()
            .map(PathBuf::from);
        match credentials_path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path).await,
            None => Self::new_implicit().await,
        }
    }

    pub async fn from_file(path: &Path) -> Result<Self, AuthError> {
        let path_str = path.to_string_lossy();
        let creds = Credentials::from_file(&path_str)
            .map_err(|e| AuthError::InvalidCredentials(path_str.to_string(), e))?;
        let token = fetch_token(&creds).await?;
        Ok(Self::Credentials(Arc::new(InnerCreds {
            creds: Some(creds),
            http: reqwest::Client::new(),
            token: RwLock::new(CachedToken::new(token)),
        })))
    }

    pub async fn new_implicit() -> Result<Self, AuthError> {
        let http = reqwest::Client::new();
        let token = fetch_implicit_token(&http).await?;
        Ok(Self::Credentials(Arc::new(InnerCreds {
            creds: None,
            http,
            token: RwLock::new(CachedToken::new(token)),
        })))
    }

    /// Header value to send, renewing the token when it is close to expiry.
    pub async fn authorization(&self) -> Result<Option<String>, AuthError> {
        match self {
            Self::Credentials(inner) => inner.authorization().await.map(Some),
            Self::None => Ok(None),
        }
    }
}

impl InnerCreds {
    async fn authorization(&self) -> Result<String, AuthError> {
        {
            let cached = self.token.read().await;
            if Instant::now() < cached.refresh_at {
                return Ok(cached.header());
            }
        }

        let mut cached = self.token.write().await;
        // Another request may have renewed it while we waited for the lock.
        if Instant::now() >= cached.refresh_at {
            debug!("Renewing GCP authentication token");
            let token = match &self.creds {
                Some(creds) => fetch_token(creds).await?,
                None => fetch_implicit_token(&self.http).await?,
            };
            *cached = CachedToken::new(token);
        }
        Ok(cached.header())
    }
}

async fn fetch_token(creds: &Credentials) -> Result<Token, AuthError> {
    let claims = JwtClaims::new(creds.iss(), &[Scope::PubSub], creds.token_uri(), None, None);
    let rsa_key = creds.rsa_key().map_err(AuthError::InvalidRsaKey)?;
    let jwt = Jwt::new(claims, rsa_key, None);

    debug!(
        project = ?creds.project(),
        iss = ?creds.iss(),
        "Fetching GCP authentication token"
    );
    goauth::get_token(&jwt, creds)
        .await
        .map_err(AuthError::GetToken)
}

async fn fetch_implicit_token(http: &reqwest::Client) -> Result<Token, AuthError> {
    debug!("Fetching implicit GCP authentication token");
    let response = http
        .get(SERVICE_ACCOUNT_TOKEN_URL)
        .header("Metadata-Flavor", "Google")
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(AuthError::MetadataStatus(response.status().as_u16()));
    }

    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice::<Token>(&bytes)?)
}
