//! Per-site cache table.
//!
//! One [`CompositeEphemeronCache`] per static definition site, created the
//! first time control reaches the site and kept until the registry is
//! released. The registry is explicit state owned by its runtime.

use std::collections::BTreeMap;

use crate::cache::{CacheError, CacheStats, CompositeEphemeronCache};
use crate::heap::EphemeronHost;
use crate::scope::SiteId;

#[derive(Debug, Clone, Default)]
pub struct CacheRegistry {
    caches: BTreeMap<SiteId, CompositeEphemeronCache>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache for `site`, creating it with `arity` on first reach. The
    /// flag reports whether it was created by this call.
    pub fn get_or_create(
        &mut self,
        host: &mut impl EphemeronHost,
        site: SiteId,
        arity: usize,
    ) -> Result<(&mut CompositeEphemeronCache, bool), CacheError> {
        let created = !self.caches.contains_key(&site);
        if created {
            let cache = CompositeEphemeronCache::new(host, site, arity)?;
            self.caches.insert(site, cache);
        }
        let cache = self
            .caches
            .get_mut(&site)
            .ok_or_else(|| CacheError::ConsistencyViolation {
                site,
                detail: "registry lost a cache it just created".to_string(),
            })?;
        if cache.arity() != arity {
            return Err(CacheError::ArityMismatch {
                site,
                expected: cache.arity(),
                actual: arity,
            });
        }
        Ok((cache, created))
    }

    pub fn get(&self, site: SiteId) -> Option<&CompositeEphemeronCache> {
        self.caches.get(&site)
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, &CompositeEphemeronCache)> {
        self.caches.iter()
    }

    /// Totals across every site.
    pub fn stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        for cache in self.caches.values() {
            total.merge(&cache.stats());
        }
        total
    }

    /// Compact every cache, returning the number of nodes pruned.
    pub fn compact_all(&mut self, host: &mut impl EphemeronHost) -> Result<usize, CacheError> {
        let mut pruned = 0;
        for cache in self.caches.values_mut() {
            pruned += cache.compact(host)?;
        }
        Ok(pruned)
    }

    /// Unpin every cache root and forget all caches.
    pub fn release(&mut self, host: &mut impl EphemeronHost) -> Result<(), CacheError> {
        for (_, cache) in std::mem::take(&mut self.caches) {
            cache.release(host)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::key::{KeyComponent, KeyTuple};
    use crate::value::PrimitiveKey;

    #[test]
    fn caches_are_created_once_per_site() {
        let mut heap = Heap::new();
        let mut registry = CacheRegistry::new();
        let (_, created) = registry.get_or_create(&mut heap, SiteId(3), 1).unwrap();
        assert!(created);
        let (_, created) = registry.get_or_create(&mut heap, SiteId(3), 1).unwrap();
        assert!(!created);
        registry.get_or_create(&mut heap, SiteId(1), 0).unwrap();
        assert_eq!(registry.len(), 2);
        let sites: Vec<SiteId> = registry.iter().map(|(site, _)| *site).collect();
        assert_eq!(sites, vec![SiteId(1), SiteId(3)]);
    }

    #[test]
    fn cache_roots_survive_collection() {
        let mut heap = Heap::new();
        let mut registry = CacheRegistry::new();
        registry.get_or_create(&mut heap, SiteId(0), 0).unwrap();
        heap.collect();
        let root = registry.get(SiteId(0)).unwrap().root();
        assert!(heap.contains(root));
    }

    #[test]
    fn arity_change_for_a_site_is_rejected() {
        let mut heap = Heap::new();
        let mut registry = CacheRegistry::new();
        registry.get_or_create(&mut heap, SiteId(0), 2).unwrap();
        let err = registry.get_or_create(&mut heap, SiteId(0), 1).unwrap_err();
        assert!(matches!(err, CacheError::ArityMismatch { .. }));
    }

    #[test]
    fn stats_aggregate_over_sites() {
        let mut heap = Heap::new();
        let mut registry = CacheRegistry::new();
        for site in 0..3 {
            let (cache, _) = registry.get_or_create(&mut heap, SiteId(site), 1).unwrap();
            let key = KeyTuple::new(vec![KeyComponent::Primitive(PrimitiveKey::Number(1))]);
            for _ in 0..2 {
                cache
                    .get_or_insert_with(&mut heap, &key, |h| Ok::<_, CacheError>(h.new_tuple(0)))
                    .unwrap();
            }
        }
        let stats = registry.stats();
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.inserts, 3);
    }

    #[test]
    fn release_unpins_all_roots() {
        let mut heap = Heap::new();
        let mut registry = CacheRegistry::new();
        registry.get_or_create(&mut heap, SiteId(0), 0).unwrap();
        registry.get_or_create(&mut heap, SiteId(1), 0).unwrap();
        registry.release(&mut heap).unwrap();
        assert!(registry.is_empty());
        heap.collect();
        assert_eq!(heap.object_count(), 0);
    }
}
