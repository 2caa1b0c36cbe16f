//! Cached backend handshake metadata.
//!
//! The handshake carries everything needed to validate access tokens without a
//! network round trip. It is fetched lazily, shared process-wide and replaced
//! only after an explicit invalidation.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::backend::SessionBackend;
use crate::codec::TokenCodec;
use crate::error::SessionError;

/// Default access token lifetime: 1 hour
pub const DEFAULT_ACCESS_TOKEN_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// Default refresh token lifetime: 100 days
pub const DEFAULT_REFRESH_TOKEN_VALIDITY: Duration = Duration::from_secs(100 * 24 * 60 * 60);

pub const API_VERSION: &str = "2.0";

/// How long unknown key ids stop triggering refetches after one failed to
/// resolve.
pub const UNKNOWN_KEY_COOLDOWN: Duration = Duration::from_secs(30);

/// Cookie `SameSite` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

impl std::str::FromStr for SameSite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(SameSite::Strict),
            "lax" => Ok(SameSite::Lax),
            "none" => Ok(SameSite::None),
            _ => Err(format!("Invalid SameSite policy: {}", s)),
        }
    }
}

/// Backend-issued metadata. Immutable once fetched.
#[derive(Clone)]
pub struct HandshakeInfo {
    key_id: String,
    codec: TokenCodec,
    pub access_token_validity: Duration,
    pub refresh_token_validity: Duration,
    pub cookie_domain: Option<String>,
    pub cookie_same_site: SameSite,
    /// Cookie path of the refresh token
    pub refresh_token_path: String,
    /// Whether access tokens are bound to an anti-CSRF token
    pub anti_csrf: bool,
    /// Whether every validation is confirmed with the backend
    pub access_token_blacklisting: bool,
    pub api_version: String,
}

impl HandshakeInfo {
    pub fn new(key_id: impl Into<String>, signing_key: &[u8]) -> Self {
        let key_id = key_id.into();
        Self {
            codec: TokenCodec::new(key_id.clone(), signing_key),
            key_id,
            access_token_validity: DEFAULT_ACCESS_TOKEN_VALIDITY,
            refresh_token_validity: DEFAULT_REFRESH_TOKEN_VALIDITY,
            cookie_domain: None,
            cookie_same_site: SameSite::default(),
            refresh_token_path: "/".to_string(),
            anti_csrf: false,
            access_token_blacklisting: true,
            api_version: API_VERSION.to_string(),
        }
    }

    /// Version of the signing key, matched against the token `kid` header.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }
}

impl std::fmt::Debug for HandshakeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeInfo")
            .field("key_id", &self.key_id)
            .field("access_token_validity", &self.access_token_validity)
            .field("refresh_token_validity", &self.refresh_token_validity)
            .field("cookie_domain", &self.cookie_domain)
            .field("cookie_same_site", &self.cookie_same_site)
            .field("refresh_token_path", &self.refresh_token_path)
            .field("anti_csrf", &self.anti_csrf)
            .field("access_token_blacklisting", &self.access_token_blacklisting)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<HandshakeInfo>, SessionError>>>;

enum CacheState {
    Empty,
    Fetching(SharedFetch),
    Ready(Arc<HandshakeInfo>),
}

struct CacheInner {
    /// Bumped on every invalidation so that late fetches cannot repopulate.
    generation: u64,
    state: CacheState,
    /// Until this instant, unknown key ids do not trigger refetches.
    unknown_key_cooldown: Option<Instant>,
}

/// Lazily-populated handshake cache with coalesced fetches.
pub struct HandshakeCache {
    backend: Arc<dyn SessionBackend>,
    inner: Mutex<CacheInner>,
}

impl HandshakeCache {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend,
            inner: Mutex::new(CacheInner {
                generation: 0,
                state: CacheState::Empty,
                unknown_key_cooldown: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached handshake, fetching it on a miss.
    ///
    /// Concurrent misses share one backend fetch and all observe its outcome.
    pub async fn get(&self) -> Result<Arc<HandshakeInfo>, SessionError> {
        let (generation, fetch) = {
            let mut inner = self.lock();
            let in_flight = match &inner.state {
                CacheState::Ready(info) => return Ok(Arc::clone(info)),
                CacheState::Fetching(fetch) => Some(fetch.clone()),
                CacheState::Empty => None,
            };
            let fetch = match in_flight {
                Some(fetch) => fetch,
                None => {
                    let fetch = self.spawn_fetch();
                    inner.state = CacheState::Fetching(fetch.clone());
                    fetch
                }
            };
            (inner.generation, fetch)
        };

        let result = fetch.await;

        let mut inner = self.lock();
        if inner.generation == generation && matches!(inner.state, CacheState::Fetching(_)) {
            inner.state = match &result {
                Ok(info) => CacheState::Ready(Arc::clone(info)),
                Err(_) => CacheState::Empty,
            };
        }
        result
    }

    /// Drop the cached value. The next `get` fetches again.
    pub fn invalidate(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.state = CacheState::Empty;
        inner.unknown_key_cooldown = None;
        debug!(generation = inner.generation, "Handshake info invalidated");
    }

    /// Handshake info for a token signed with `key_id`.
    ///
    /// A key id other than the cached one triggers one refetch, shared by
    /// every concurrent caller. Unless that refetch produces the requested
    /// key, other unknown key ids are answered from the cache until
    /// [`UNKNOWN_KEY_COOLDOWN`] has passed. The key id comes from an
    /// unverified token header and must not be able to drive fetches.
    pub async fn get_for_key(&self, key_id: &str) -> Result<Arc<HandshakeInfo>, SessionError> {
        let info = self.get().await?;
        if info.key_id() == key_id {
            return Ok(info);
        }

        {
            let mut inner = self.lock();
            let now = Instant::now();
            if inner.unknown_key_cooldown.is_some_and(|until| now < until) {
                return Ok(info);
            }
            debug!(
                token_kid = %key_id,
                cached_kid = %info.key_id(),
                "Signing key version mismatch, refetching handshake"
            );
            inner.unknown_key_cooldown = Some(now + UNKNOWN_KEY_COOLDOWN);
            if matches!(&inner.state, CacheState::Ready(current) if Arc::ptr_eq(current, &info)) {
                inner.generation += 1;
                inner.state = CacheState::Empty;
            }
        }

        let info = self.get().await?;
        if info.key_id() == key_id {
            self.lock().unknown_key_cooldown = None;
        } else {
            warn!(token_kid = %key_id, "Token signed with a key the backend does not know");
        }
        Ok(info)
    }

    /// The cached value, without fetching.
    pub fn cached(&self) -> Option<Arc<HandshakeInfo>> {
        match &self.lock().state {
            CacheState::Ready(info) => Some(Arc::clone(info)),
            _ => None,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cached().is_some()
    }

    /// The fetch runs on its own task so that dropping every waiter does not
    /// abort a backend call halfway.
    fn spawn_fetch(&self) -> SharedFetch {
        let backend = Arc::clone(&self.backend);
        let task = tokio::spawn(async move { backend.fetch_handshake_info().await });

        async move {
            match task.await {
                Ok(Ok(info)) => {
                    debug!(key_id = %info.key_id(), "Fetched handshake info");
                    Ok(Arc::new(info))
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Failed to fetch handshake info");
                    Err(match e {
                        SessionError::BackendUnavailable(_) => e,
                        other => SessionError::unavailable(other.to_string()),
                    })
                }
                Err(e) => Err(SessionError::unavailable(format!(
                    "handshake fetch task failed: {}",
                    e
                ))),
            }
        }
        .boxed()
        .shared()
    }
}
