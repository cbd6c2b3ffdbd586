//! Cache Builders
//!
//! Fluent construction of [`PersistentObjectCache`] and [`MruCache`].
//!
//! ```ignore
//! let cache = CacheBuilder::new(refresher)
//!     .name("products")
//!     .refresh_every(Duration::from_secs(30))
//!     .with_stats()
//!     .build()?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::config::CacheSettings;
use super::mru::{
    mru_sorter, MruCache, PromoteNever, PromoteWhenNewOnly, PromoteWhenNewOrUpdated,
    PromotionStrategy, MRU_SORT_ID,
};
use super::store::PersistentObjectCache;
use crate::clock::{Clock, SystemClock};
use crate::domain::PersistentObject;
use crate::error::Result;
use crate::index::TieBreaker;
use crate::refresh::DataRefresher;

/// Builder for [`PersistentObjectCache`].
pub struct CacheBuilder<O: PersistentObject> {
    refresher: Arc<DataRefresher<O>>,
    settings: CacheSettings,
    refreshable: bool,
}

impl<O: PersistentObject> CacheBuilder<O> {
    /// Cache fed by `refresher`.
    pub fn new(refresher: impl Into<Arc<DataRefresher<O>>>) -> Self {
        Self {
            refresher: refresher.into(),
            settings: CacheSettings::default(),
            refreshable: true,
        }
    }

    /// Cache without a backing store; it only changes through direct puts and
    /// removes.
    pub fn without_refresher() -> Self {
        Self {
            refresher: Arc::new(DataRefresher::noop()),
            settings: CacheSettings::default(),
            refreshable: false,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.settings.name = name.into();
        self
    }

    pub fn with_stats(mut self) -> Self {
        self.settings.record_stats = true;
        self
    }

    pub fn without_stats(mut self) -> Self {
        self.settings.record_stats = false;
        self
    }

    /// Refresh in the background every `interval`.
    pub fn refresh_every(mut self, interval: Duration) -> Self {
        self.settings = self.settings.with_refresh_interval(Some(interval));
        self
    }

    /// Load synchronously in `build`, failing the build if the load fails.
    pub fn refresh_on_construction(mut self, enabled: bool) -> Self {
        self.settings.start_with_refresh = enabled;
        self
    }

    /// Replace all settings at once, e.g. with ones read from a config file.
    pub fn with_settings(mut self, settings: CacheSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Switch to building an [`MruCache`].
    pub fn with_mru_sort(self) -> MruCacheBuilder<O> {
        MruCacheBuilder {
            base: self,
            strategy: Arc::new(PromoteWhenNewOnly),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn build(self) -> Result<PersistentObjectCache<O>> {
        let cache = PersistentObjectCache::open(self.refresher, &self.settings, None)?;
        if self.refreshable {
            cache.begin_refreshing(&self.settings)?;
        }
        Ok(cache)
    }
}

/// Builder for [`MruCache`].
pub struct MruCacheBuilder<O: PersistentObject> {
    base: CacheBuilder<O>,
    strategy: Arc<dyn PromotionStrategy<O>>,
    clock: Arc<dyn Clock>,
}

impl<O: PersistentObject> MruCacheBuilder<O> {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.base = self.base.name(name);
        self
    }

    pub fn with_stats(mut self) -> Self {
        self.base = self.base.with_stats();
        self
    }

    pub fn refresh_every(mut self, interval: Duration) -> Self {
        self.base = self.base.refresh_every(interval);
        self
    }

    pub fn refresh_on_construction(mut self, enabled: bool) -> Self {
        self.base = self.base.refresh_on_construction(enabled);
        self
    }

    /// Promote objects the first time they are seen (the default).
    pub fn promote_when_new_only(self) -> Self {
        self.with_promotion_strategy(PromoteWhenNewOnly)
    }

    /// Promote objects whenever they are created or updated.
    pub fn promote_when_new_or_updated(self) -> Self {
        self.with_promotion_strategy(PromoteWhenNewOrUpdated)
    }

    /// Order only by explicit [`MruCache::touch`] calls.
    pub fn promote_only_when_touched(self) -> Self {
        self.with_promotion_strategy(PromoteNever)
    }

    pub fn with_promotion_strategy(mut self, strategy: impl PromotionStrategy<O> + 'static) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    /// Time source for recency keys.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the cache. The recency sort is attached before the initial load
    /// so loaded objects are ordered by the strategy like any later update.
    pub fn build(self) -> Result<MruCache<O>> {
        let CacheBuilder {
            refresher,
            settings,
            refreshable,
        } = self.base;

        let cache = PersistentObjectCache::open(refresher, &settings, Some(MRU_SORT_ID))?;
        let ties = Arc::new(TieBreaker::new());
        let sorter = mru_sorter(self.strategy, Arc::clone(&self.clock), Arc::clone(&ties));
        let (mru, seeded) = cache.install_sort(MRU_SORT_ID, sorter)?;
        seeded.wait()?;

        if refreshable {
            cache.begin_refreshing(&settings)?;
        }
        info!(cache = %cache.name(), "MRU cache ready");
        Ok(MruCache::new(cache, mru, self.clock, ties))
    }
}
