//! Content-keyed caches of derived driver objects.

use std::hash::Hash;

use hashbrown::HashMap;
use parking_lot::RwLock;
use rhi_tracing::trace_span;

use crate::backend::RenderPassLayout;
use crate::pipeline::{Pipeline, PipelineKey};
use crate::render_pass::{Framebuffer, FramebufferKey, RenderPass};
use crate::resource::ResourceId;
use crate::sampler::{Sampler, SamplerDescriptor};

pub(crate) type PipelineCache = ObjectCache<PipelineKey, Pipeline>;
pub(crate) type SamplerCache = ObjectCache<SamplerDescriptor, Sampler>;
pub(crate) type RenderPassCache = ObjectCache<RenderPassLayout, RenderPass>;

/// A map from the description of an object to the object.
///
/// Lookups only take a read lock. Objects are created under the write lock, so two threads
/// requesting the same missing key never create the object twice.
#[derive(Debug)]
pub(crate) struct ObjectCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for ObjectCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> ObjectCache<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Returns the object for `key`, creating it with `create` if it does not exist.
    pub(crate) fn get_or_try_insert_with<F, E>(&self, key: K, create: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let _span = trace_span!("ObjectCache::get_or_try_insert_with").entered();

        {
            let entries = self.entries.read();
            if let Some(value) = entries.get(&key) {
                return Ok(value.clone());
            }
        }

        let mut entries = self.entries.write();
        // Another thread may have created the object while no lock was held.
        if let Some(value) = entries.get(&key) {
            return Ok(value.clone());
        }

        let value = create()?;
        entries.insert(key, value.clone());
        Ok(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Framebuffers keyed by their size and attachments.
///
/// Entries hold weak references to their attachments and are recreated when an attachment
/// was dropped.
#[derive(Debug, Default)]
pub(crate) struct FramebufferCache {
    entries: RwLock<HashMap<FramebufferKey, Framebuffer>>,
}

impl FramebufferCache {
    pub(crate) fn get_or_try_insert_with<F, E>(
        &self,
        key: FramebufferKey,
        create: F,
    ) -> Result<Framebuffer, E>
    where
        F: FnOnce() -> Result<Framebuffer, E>,
    {
        let _span = trace_span!("FramebufferCache::get_or_try_insert_with").entered();

        {
            let entries = self.entries.read();
            if let Some(framebuffer) = entries.get(&key) {
                if framebuffer.is_valid() {
                    return Ok(framebuffer.clone());
                }
            }
        }

        let mut entries = self.entries.write();
        if let Some(framebuffer) = entries.get(&key) {
            if framebuffer.is_valid() {
                return Ok(framebuffer.clone());
            }

            // Resource ids are never reused, so a stale entry can only be hit through a clone
            // of the old key. Drop it either way.
            entries.remove(&key);
        }

        let framebuffer = create()?;
        entries.insert(key, framebuffer.clone());
        Ok(framebuffer)
    }

    /// Removes all framebuffers that reference the texture.
    ///
    /// Returns the number of removed framebuffers.
    pub(crate) fn invalidate_texture(&self, id: ResourceId) -> usize {
        let mut entries = self.entries.write();
        let len = entries.len();
        entries.retain(|_, framebuffer| !framebuffer.references(id));
        len - entries.len()
    }

    /// Removes all framebuffers with a dropped attachment.
    pub(crate) fn purge_stale(&self) -> usize {
        let mut entries = self.entries.write();
        let len = entries.len();
        entries.retain(|_, framebuffer| framebuffer.is_valid());
        len - entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::ObjectCache;

    #[test]
    fn creates_once_per_key() {
        let cache: ObjectCache<u32, Arc<u32>> = ObjectCache::default();
        let created = AtomicUsize::new(0);

        let create = |value: u32| {
            created.fetch_add(1, Ordering::Relaxed);
            Ok::<_, ()>(Arc::new(value))
        };

        let a = cache.get_or_try_insert_with(1, || create(1)).unwrap();
        let b = cache.get_or_try_insert_with(1, || create(1)).unwrap();
        let c = cache.get_or_try_insert_with(2, || create(2)).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(created.load(Ordering::Relaxed), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn failed_creation_is_not_cached() {
        let cache: ObjectCache<u32, u32> = ObjectCache::default();

        assert_eq!(cache.get_or_try_insert_with(1, || Err("failed")), Err("failed"));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get_or_try_insert_with(1, || Ok::<_, ()>(5)), Ok(5));
    }

    #[test]
    fn concurrent_lookups_create_once() {
        let cache: Arc<ObjectCache<u32, Arc<u32>>> = Arc::new(ObjectCache::default());
        let created = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let created = created.clone();
                thread::spawn(move || {
                    cache
                        .get_or_try_insert_with(7, || {
                            created.fetch_add(1, Ordering::Relaxed);
                            Ok::<_, ()>(Arc::new(7))
                        })
                        .unwrap()
                })
            })
            .collect();

        let values: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(created.load(Ordering::Relaxed), 1);
        assert!(values.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
