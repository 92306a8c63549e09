//! # Request-Scoped Context (spec §9 "Request-scoped context")
//!
//! The source threads an optional context into `get()` to pick up batching
//! loaders. Here that becomes an explicit [`RequestContext`] value carrying
//! the loader set, a cancellation signal, and a cache-bypass flag, passed
//! explicitly to read paths. The default (`RequestContext::direct()`) means
//! "direct DB, no batching, honor cache".

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::loaders::LoaderSet;

/// Which caches a single call should bypass (spec §4.G `noCache({prepared?, component?})`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheBypass {
    /// Skip the prepared-statement cache for this call.
    pub prepared: bool,
    /// Skip the component cache for this call.
    pub component: bool,
}

impl CacheBypass {
    /// Bypasses neither cache.
    pub fn none() -> Self {
        CacheBypass::default()
    }

    /// Bypasses both caches.
    pub fn all() -> Self {
        CacheBypass {
            prepared: true,
            component: true,
        }
    }
}

/// Per-request state: batching loaders, a cancellation signal, and cache
/// bypass hints. Entities and queries are not thread-safe (spec §5); one
/// `RequestContext` belongs to one in-flight request.
pub struct RequestContext {
    loaders: Option<Arc<LoaderSet>>,
    pool: Option<PgPool>,
    cancellation: CancellationToken,
    cache_bypass: CacheBypass,
}

impl RequestContext {
    /// Builds a context backed by `loaders`, honoring caches, with no
    /// cancellation signal attached yet.
    pub fn new(loaders: Arc<LoaderSet>) -> Self {
        RequestContext {
            loaders: Some(loaders),
            pool: None,
            cancellation: CancellationToken::new(),
            cache_bypass: CacheBypass::none(),
        }
    }

    /// The "no context" default: direct DB access, no batching, caches honored.
    /// Carries no pool of its own; attach one with [`RequestContext::with_pool`]
    /// for read paths that need to fall through to storage directly.
    pub fn direct() -> Self {
        RequestContext {
            loaders: None,
            pool: None,
            cancellation: CancellationToken::new(),
            cache_bypass: CacheBypass::none(),
        }
    }

    /// Attaches a pool for direct-DB fallback reads (spec §4.F `get`:
    /// "fetch via the request loader in ctx (preferred) or directly from
    /// storage").
    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Returns the attached loader set, if any.
    pub fn loaders(&self) -> Option<&LoaderSet> {
        self.loaders.as_deref()
    }

    /// Returns the attached pool for direct reads, if any.
    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }

    /// Returns this context's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns the cache-bypass hints in effect.
    pub fn cache_bypass(&self) -> CacheBypass {
        self.cache_bypass
    }

    /// Returns a copy of this context with the given cache-bypass hints applied.
    pub fn with_cache_bypass(mut self, bypass: CacheBypass) -> Self {
        self.cache_bypass = bypass;
        self
    }

    /// True once this context's cancellation signal has fired.
    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Races `future` against this context's cancellation signal and an
    /// optional deadline, returning `Canceled`/`Timeout` if either wins
    /// (spec §5 "Cancellation & timeouts").
    pub async fn run_cancellable<T>(
        &self,
        deadline: Option<Duration>,
        future: impl std::future::Future<Output = crate::error::EngineResult<T>>,
    ) -> crate::error::EngineResult<T> {
        use crate::error::EngineError;

        let timed = async {
            match deadline {
                Some(duration) => tokio::time::timeout(duration, future)
                    .await
                    .map_err(|_| EngineError::Timeout)?,
                None => future.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(EngineError::Canceled),
            result = timed => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn direct_context_has_no_loaders() {
        let ctx = RequestContext::direct();
        assert!(ctx.loaders().is_none());
        assert!(!ctx.is_canceled());
    }

    #[tokio::test]
    async fn run_cancellable_surfaces_timeout() {
        let ctx = RequestContext::direct();
        let result = ctx
            .run_cancellable(Some(Duration::from_millis(5)), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(crate::error::EngineError::Timeout)));
    }

    #[tokio::test]
    async fn run_cancellable_surfaces_cancellation() {
        let ctx = RequestContext::direct();
        ctx.cancellation().cancel();
        let result = ctx.run_cancellable(None, async { Ok(()) }).await;
        assert!(matches!(result, Err(crate::error::EngineError::Canceled)));
    }
}
