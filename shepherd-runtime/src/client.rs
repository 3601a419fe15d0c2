//! Authenticated client binding.
//!
//! The runtime never constructs GitHub clients itself; it asks a
//! [`ClientCache`] for one per repository. The cache memoizes clients so
//! repeated reconciles of the same repository reuse the same connection
//! and token plumbing, and a [`TokenSource`] hands short-lived installation
//! tokens to collaborators that need raw credentials (the clone pool's
//! push path).

use std::{collections::HashMap, fmt, future::Future, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use shepherd_core::RepoId;
use thiserror::Error;
use tracing::debug;

/// Client binding failures. Both variants are retriable from the
/// dispatcher's point of view: token minting and client construction talk
/// to external services.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Minting or refreshing a token failed.
    #[error("failed to mint token for {repo}")]
    Token {
        /// The repository the token was for.
        repo: RepoId,
        /// Underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Building the client failed.
    #[error("failed to build client for {repo}")]
    Build {
        /// The repository the client was for.
        repo: RepoId,
        /// Underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// A short-lived credential for one repository.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Token {
    /// A token with an optional expiry.
    pub fn new(secret: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    /// The credential itself.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// When the token stops working, if it expires at all.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the token is within `margin` of its expiry.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        match self.expires_at {
            None => false,
            Some(at) => Utc::now() + margin >= at,
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Mints tokens per repository.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    /// A currently valid token for `repo`.
    async fn token(&self, repo: &RepoId) -> Result<Token, ClientError>;
}

/// Caches tokens from an inner source and refreshes them transparently
/// before they expire.
pub struct CachingTokenSource<S> {
    inner: S,
    margin: Duration,
    cache: RwLock<HashMap<RepoId, Token>>,
}

impl<S> CachingTokenSource<S> {
    /// Cache around `inner` with a five minute refresh margin.
    pub fn new(inner: S) -> Self {
        Self::with_margin(inner, Duration::from_secs(300))
    }

    /// Cache around `inner`, refreshing tokens within `margin` of expiry.
    pub fn with_margin(inner: S, margin: Duration) -> Self {
        Self {
            inner,
            margin,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<S: TokenSource> TokenSource for CachingTokenSource<S> {
    async fn token(&self, repo: &RepoId) -> Result<Token, ClientError> {
        if let Some(token) = self.cache.read().get(repo) {
            if !token.needs_refresh(self.margin) {
                return Ok(token.clone());
            }
        }
        // Mint outside any lock, then double-check: another task may have
        // refreshed in the meantime, in which case the fresher entry wins.
        let minted = self.inner.token(repo).await?;
        let mut cache = self.cache.write();
        let entry = cache.entry(repo.clone()).or_insert_with(|| minted.clone());
        if entry.needs_refresh(self.margin) {
            *entry = minted.clone();
            debug!(%repo, "refreshed cached token");
        }
        Ok(entry.clone())
    }
}

/// Hands out an authenticated client per repository.
#[async_trait]
pub trait ClientCache: Send + Sync + 'static {
    /// The client type this cache produces.
    type Client: Clone + Send + Sync + 'static;

    /// A client for `repo`, built on first use and memoized after.
    async fn client_for(&self, repo: &RepoId) -> Result<Self::Client, ClientError>;
}

/// A [`ClientCache`] that memoizes clients built by an async factory.
///
/// Reads take the common path under a shared lock; insertion is
/// double-checked so a racing build for the same repository yields one
/// canonical client.
pub struct MemoizedClients<F, C> {
    build: F,
    clients: RwLock<HashMap<RepoId, C>>,
}

impl<F, C> MemoizedClients<F, C> {
    /// Memoize clients produced by `build`.
    pub fn new(build: F) -> Self {
        Self {
            build,
            clients: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<F, Fut, C> ClientCache for MemoizedClients<F, C>
where
    F: Fn(RepoId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, ClientError>> + Send,
    C: Clone + Send + Sync + 'static,
{
    type Client = C;

    async fn client_for(&self, repo: &RepoId) -> Result<C, ClientError> {
        if let Some(client) = self.clients.read().get(repo) {
            return Ok(client.clone());
        }
        let built = (self.build)(repo.clone()).await?;
        let mut clients = self.clients.write();
        // First build wins; a racing builder's client is discarded.
        let client = clients.entry(repo.clone()).or_insert(built).clone();
        debug!(%repo, "client bound");
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::{CachingTokenSource, ClientCache, ClientError, MemoizedClients, Token, TokenSource};
    use chrono::{Duration as ChronoDuration, Utc};
    use shepherd_core::RepoId;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    struct CountingSource {
        minted: AtomicUsize,
        ttl: ChronoDuration,
    }

    #[async_trait::async_trait]
    impl TokenSource for CountingSource {
        async fn token(&self, _repo: &RepoId) -> Result<Token, ClientError> {
            let n = self.minted.fetch_add(1, Ordering::SeqCst);
            Ok(Token::new(format!("tok-{n}"), Some(Utc::now() + self.ttl)))
        }
    }

    #[tokio::test]
    async fn tokens_are_cached_until_the_refresh_margin() {
        let source = CachingTokenSource::with_margin(
            CountingSource {
                minted: AtomicUsize::new(0),
                ttl: ChronoDuration::hours(1),
            },
            Duration::from_secs(300),
        );
        let repo = RepoId::new("octo", "widgets");
        let first = source.token(&repo).await.unwrap();
        let second = source.token(&repo).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn expiring_tokens_are_refreshed() {
        let source = CachingTokenSource::with_margin(
            CountingSource {
                minted: AtomicUsize::new(0),
                // Already inside the refresh margin when minted.
                ttl: ChronoDuration::seconds(10),
            },
            Duration::from_secs(300),
        );
        let repo = RepoId::new("octo", "widgets");
        let first = source.token(&repo).await.unwrap();
        let second = source.token(&repo).await.unwrap();
        assert_ne!(first.secret(), second.secret());
    }

    #[tokio::test]
    async fn clients_are_built_once_per_repo() {
        let built = std::sync::Arc::new(AtomicUsize::new(0));
        let cache = {
            let built = std::sync::Arc::clone(&built);
            MemoizedClients::new(move |repo: RepoId| {
                let built = std::sync::Arc::clone(&built);
                async move {
                    built.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("client-for-{repo}"))
                }
            })
        };
        let widgets = RepoId::new("octo", "widgets");
        let gadgets = RepoId::new("octo", "gadgets");
        assert_eq!(cache.client_for(&widgets).await.unwrap(), "client-for-octo/widgets");
        assert_eq!(cache.client_for(&widgets).await.unwrap(), "client-for-octo/widgets");
        assert_eq!(cache.client_for(&gadgets).await.unwrap(), "client-for-octo/gadgets");
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn token_debug_redacts_the_secret() {
        let token = Token::new("ghs_sensitive", None);
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("ghs_sensitive"));
        assert!(rendered.contains("<redacted>"));
    }
}
