use std::sync::Mutex;

use anyhow::Context;
use ash::vk;
use slotmap::{SlotMap, new_key_type};

new_key_type! { pub struct StagingKey; }

/// Anything the pool can hand out. Production blocks are [`Buffer`]s; tests
/// substitute a device-free fake.
///
/// [`Buffer`]: crate::buffer::Buffer
pub trait StagingBlock {
    fn capacity(&self) -> vk::DeviceSize;
}

/// Creates and destroys backing blocks on the pool's behalf. The production
/// source is the [`MemoryAllocator`].
///
/// [`MemoryAllocator`]: crate::memory::MemoryAllocator
pub trait StagingSource<B: StagingBlock> {
    fn create_staging(&mut self, size: vk::DeviceSize) -> anyhow::Result<B>;
    fn destroy_staging(&mut self, block: B);
}

struct PoolEntry<B> {
    // `None` while the block is checked out by the scoped helper; idle
    // entries always hold their block.
    block: Option<B>,
    in_use: bool,
    released_at: u64,
}

impl<B: StagingBlock> PoolEntry<B> {
    fn capacity(&self) -> Option<vk::DeviceSize> {
        self.block.as_ref().map(|b| b.capacity())
    }
}

struct PoolInner<B> {
    entries: SlotMap<StagingKey, PoolEntry<B>>,
    epoch: u64,
}

impl<B: StagingBlock> PoolInner<B> {
    fn acquire(
        &mut self,
        source: &mut impl StagingSource<B>,
        size: vk::DeviceSize,
        max_entries: usize,
        idle_age: u64,
    ) -> anyhow::Result<Option<StagingKey>> {
        // First-fit over idle entries; low scan cost matters more here than
        // tight packing.
        let reusable = self
            .entries
            .iter()
            .find(|(_, e)| !e.in_use && e.capacity().is_some_and(|c| c >= size))
            .map(|(key, _)| key);
        if let Some(key) = reusable {
            self.entries[key].in_use = true;
            return Ok(Some(key));
        }

        if self.entries.len() >= max_entries {
            self.collect_aged(source, idle_age);
        }

        if self.entries.len() >= max_entries {
            // Every idle entry is smaller than the request at this point,
            // otherwise first-fit would have taken it. Never touch an
            // in-use entry.
            let victim = self
                .entries
                .iter()
                .filter(|(_, e)| !e.in_use && e.capacity().is_some_and(|c| c < size))
                .min_by_key(|(_, e)| e.capacity())
                .map(|(key, _)| key);
            match victim {
                Some(key) => {
                    let entry = self
                        .entries
                        .remove(key)
                        .expect("eviction victim vanished from pool");
                    if let Some(block) = entry.block {
                        source.destroy_staging(block);
                    }
                }
                None => {
                    log::warn!(
                        "staging pool exhausted: {} entries all in use, request of {} bytes denied",
                        self.entries.len(),
                        size
                    );
                    return Ok(None);
                }
            }
        }

        let block = source
            .create_staging(size)
            .context("failed to create staging buffer for pool")?;
        Ok(Some(self.entries.insert(PoolEntry {
            block: Some(block),
            in_use: true,
            released_at: self.epoch,
        })))
    }

    fn release(&mut self, key: StagingKey) {
        match self.entries.get_mut(key) {
            Some(entry) if entry.in_use => {
                entry.in_use = false;
                entry.released_at = self.epoch;
            }
            Some(_) => log::warn!("release of staging buffer that was not acquired"),
            None => log::warn!("release of unknown staging buffer"),
        }
    }

    fn collect_aged(&mut self, source: &mut impl StagingSource<B>, idle_age: u64) -> usize {
        let aged: Vec<StagingKey> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.in_use && self.epoch.saturating_sub(e.released_at) > idle_age)
            .map(|(key, _)| key)
            .collect();
        let removed = aged.len();
        for key in aged {
            let entry = self
                .entries
                .remove(key)
                .expect("aged entry vanished from pool");
            if let Some(block) = entry.block {
                source.destroy_staging(block);
            }
        }
        removed
    }
}

/// Reuse pool for CPU-visible staging buffers. Hands out a block sized at
/// least the request, tracks in-use state, and evicts aged-out idle blocks.
/// A single mutex covers scan, create, evict and release; staging
/// acquisition is not a hot path within a frame, so coarse is fine.
pub struct StagingBufferPool<B: StagingBlock> {
    inner: Mutex<PoolInner<B>>,
    min_size: vk::DeviceSize,
    max_entries: usize,
    idle_age: u64,
}

impl<B: StagingBlock> StagingBufferPool<B> {
    pub fn new(min_size: vk::DeviceSize, max_entries: usize, idle_age: u64) -> Self {
        assert!(max_entries > 0);
        Self {
            inner: Mutex::new(PoolInner {
                entries: SlotMap::default(),
                epoch: 0,
            }),
            min_size,
            max_entries,
            idle_age,
        }
    }

    /// Scoped acquisition: acquire, run `f`, release on every exit path.
    /// This is the primary contract; raw [`acquire`]/[`release`] exist for
    /// callers that need to hold a block across a recording boundary.
    ///
    /// The mutex covers only the pool bookkeeping. The block is checked out
    /// of its entry and the lock dropped before `f` runs, so a closure that
    /// blocks on the GPU does not stall other pool callers, and nested
    /// scoped acquisitions are legal.
    ///
    /// Pool exhaustion surfaces as an error here; it is a transient
    /// backpressure condition the caller may retry.
    ///
    /// [`acquire`]: StagingBufferPool::acquire
    /// [`release`]: StagingBufferPool::release
    pub fn with_staging_buffer<S, T>(
        &self,
        source: &mut S,
        size: vk::DeviceSize,
        f: impl FnOnce(&mut S, &mut B) -> anyhow::Result<T>,
    ) -> anyhow::Result<T>
    where
        S: StagingSource<B>,
    {
        let size = size.max(self.min_size);
        let (key, mut block) = {
            let mut inner = self.lock();
            let key = inner
                .acquire(source, size, self.max_entries, self.idle_age)?
                .context("staging pool exhausted")?;
            let block = inner
                .entries
                .get_mut(key)
                .and_then(|e| e.block.take())
                .context("acquired staging entry vanished from pool")?;
            (key, block)
        };

        let result = f(source, &mut block);

        let mut inner = self.lock();
        match inner.entries.get_mut(key) {
            // In-use entries are never evicted or collected, so the entry
            // is still there to take the block back.
            Some(entry) => entry.block = Some(block),
            None => {
                log::warn!("staging entry vanished while its block was checked out");
                source.destroy_staging(block);
            }
        }
        inner.release(key);
        result
    }

    /// `None` means the pool is full of in-use entries; treat it as
    /// backpressure, not a fatal error.
    pub fn acquire(
        &self,
        source: &mut impl StagingSource<B>,
        size: vk::DeviceSize,
    ) -> anyhow::Result<Option<StagingKey>> {
        let size = size.max(self.min_size);
        self.lock()
            .acquire(source, size, self.max_entries, self.idle_age)
    }

    pub fn release(&self, key: StagingKey) {
        self.lock().release(key);
    }

    /// Removes idle entries older than the age threshold. Called
    /// periodically by the owner, not every frame.
    pub fn garbage_collect(&self, source: &mut impl StagingSource<B>) -> usize {
        let idle_age = self.idle_age;
        let removed = self.lock().collect_aged(source, idle_age);
        if removed > 0 {
            log::debug!("staging pool collected {removed} idle buffers");
        }
        removed
    }

    /// Advances the pool's notion of time, once per frame.
    pub fn advance_epoch(&self) {
        self.lock().epoch += 1;
    }

    /// Destroys every entry. Blocks still in use are released forcibly with
    /// a warning; shutdown cleanup must not crash.
    pub fn destroy(&self, source: &mut impl StagingSource<B>) {
        let mut inner = self.lock();
        for (_, entry) in inner.entries.drain() {
            if entry.in_use {
                log::warn!("staging pool destroyed while a buffer is still acquired");
            }
            match entry.block {
                Some(block) => source.destroy_staging(block),
                None => log::warn!("staging pool destroyed while a block is checked out"),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Read access to a block by key, for callers holding a raw
    /// acquisition. `None` for unknown keys and for blocks currently
    /// checked out by the scoped helper.
    pub fn block<R>(&self, key: StagingKey, f: impl FnOnce(&B) -> R) -> Option<R> {
        self.lock()
            .entries
            .get(key)
            .and_then(|e| e.block.as_ref())
            .map(f)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner<B>> {
        self.inner.lock().expect("staging pool mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeBlock {
        capacity: vk::DeviceSize,
        id: u32,
    }

    impl StagingBlock for FakeBlock {
        fn capacity(&self) -> vk::DeviceSize {
            self.capacity
        }
    }

    #[derive(Default)]
    struct FakeSource {
        created: u32,
        destroyed: u32,
    }

    impl StagingSource<FakeBlock> for FakeSource {
        fn create_staging(&mut self, size: vk::DeviceSize) -> anyhow::Result<FakeBlock> {
            self.created += 1;
            Ok(FakeBlock {
                capacity: size,
                id: self.created,
            })
        }

        fn destroy_staging(&mut self, _block: FakeBlock) {
            self.destroyed += 1;
        }
    }

    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    const MIN: vk::DeviceSize = 256;

    fn pool(max_entries: usize) -> StagingBufferPool<FakeBlock> {
        StagingBufferPool::new(MIN, max_entries, 30)
    }

    #[test]
    fn acquire_respects_size_floor() {
        let pool = pool(4);
        let mut source = FakeSource::default();

        let key = pool.acquire(&mut source, 1).unwrap().unwrap();
        let capacity = pool.block(key, |b| b.capacity()).unwrap();
        assert!(capacity >= MIN);

        let key = pool.acquire(&mut source, 100_000).unwrap().unwrap();
        let capacity = pool.block(key, |b| b.capacity()).unwrap();
        assert!(capacity >= 100_000);
    }

    #[test]
    fn released_entry_is_reused_first_fit() {
        let pool = pool(4);
        let mut source = FakeSource::default();

        let key = pool.acquire(&mut source, 1000).unwrap().unwrap();
        assert_eq!(source.created, 1);
        pool.release(key);

        let again = pool.acquire(&mut source, 500).unwrap().unwrap();
        assert_eq!(again, key, "smaller request should reuse the idle entry");
        assert_eq!(source.created, 1, "no new allocation expected");
    }

    #[test]
    fn full_pool_of_small_idle_entries_evicts_smallest() {
        let pool = pool(2);
        let mut source = FakeSource::default();

        let a = pool.acquire(&mut source, 300).unwrap().unwrap();
        let b = pool.acquire(&mut source, 400).unwrap().unwrap();
        pool.release(a);
        pool.release(b);

        let big = pool.acquire(&mut source, 20_000).unwrap().unwrap();
        let capacity = pool.block(big, |blk| blk.capacity()).unwrap();
        assert!(capacity >= 20_000);
        assert_eq!(source.destroyed, 1, "exactly one idle entry evicted");
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let pool = pool(2);
        let mut source = FakeSource::default();

        let _a = pool.acquire(&mut source, 300).unwrap().unwrap();
        let _b = pool.acquire(&mut source, 300).unwrap().unwrap();

        let denied = pool.acquire(&mut source, 300).unwrap();
        assert!(denied.is_none());
        assert_eq!(source.destroyed, 0, "in-use entries must never be evicted");
    }

    #[test]
    fn release_of_unknown_key_is_a_noop() {
        let pool = pool(2);
        let mut source = FakeSource::default();

        let key = pool.acquire(&mut source, 300).unwrap().unwrap();
        pool.release(key);
        // Double release and a stale key: warnings, no state change.
        pool.release(key);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn garbage_collect_removes_only_aged_idle_entries() {
        let pool = pool(4);
        let mut source = FakeSource::default();

        let old = pool.acquire(&mut source, 300).unwrap().unwrap();
        pool.release(old);

        for _ in 0..31 {
            pool.advance_epoch();
        }

        let fresh = pool.acquire(&mut source, 300).unwrap().unwrap();
        // `fresh` reused the idle entry; acquire a second one and keep the
        // first idle so both age classes exist.
        let held = pool.acquire(&mut source, 300).unwrap().unwrap();
        pool.release(fresh);
        assert_ne!(fresh, held);

        for _ in 0..31 {
            pool.advance_epoch();
        }

        let removed = pool.garbage_collect(&mut source);
        assert_eq!(removed, 1, "only the idle entry is collected");
        assert_eq!(pool.len(), 1, "the in-use entry survives");
    }

    #[test]
    fn garbage_collect_is_idempotent() {
        let pool = pool(4);
        let mut source = FakeSource::default();

        for _ in 0..3 {
            let key = pool.acquire(&mut source, 300).unwrap().unwrap();
            pool.release(key);
        }
        for _ in 0..31 {
            pool.advance_epoch();
        }

        let first = pool.garbage_collect(&mut source);
        assert!(first > 0);
        let second = pool.garbage_collect(&mut source);
        assert_eq!(second, 0, "second pass with no releases removes nothing");
    }

    #[test]
    fn scoped_acquisition_releases_on_error() {
        let pool = pool(2);
        let mut source = FakeSource::default();

        let result: anyhow::Result<()> =
            pool.with_staging_buffer(&mut source, 300, |_, _| anyhow::bail!("upload failed"));
        assert!(result.is_err());

        // The entry must be idle again: a full round of acquires succeeds.
        let a = pool.acquire(&mut source, 300).unwrap();
        let b = pool.acquire(&mut source, 300).unwrap();
        assert!(a.is_some() && b.is_some());
    }

    #[test]
    fn nested_scoped_acquisitions_get_distinct_blocks() {
        // The closure re-enters the pool; the bookkeeping mutex must not be
        // held while user code runs.
        let pool = pool(4);
        let mut source = FakeSource::default();

        let (outer_id, inner_id) = pool
            .with_staging_buffer(&mut source, 300, |source, outer| {
                let outer_id = outer.id;
                let inner_id =
                    pool.with_staging_buffer(source, 300, |_, inner| Ok(inner.id))?;
                Ok((outer_id, inner_id))
            })
            .unwrap();

        assert_ne!(outer_id, inner_id, "checked-out block was handed out again");
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn checked_out_block_is_invisible_to_other_callers() {
        let pool = pool(4);
        let mut source = FakeSource::default();

        pool.with_staging_buffer(&mut source, 300, |source, outer| {
            let outer_id = outer.id;
            // A raw acquire while the scoped block is out must find a
            // different block, never the one in flight.
            let key = pool.acquire(source, 300)?.unwrap();
            let raw_id = pool.block(key, |b| b.id).unwrap();
            assert_ne!(outer_id, raw_id);
            pool.release(key);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn no_block_is_handed_out_twice_under_random_interleaving() {
        let pool = pool(4);
        let mut source = FakeSource::default();
        let mut rng = XorShift(0x9E3779B97F4A7C15);
        let mut held: HashSet<StagingKey> = HashSet::new();
        let mut held_ids: HashSet<u32> = HashSet::new();

        for _ in 0..2000 {
            if rng.next() % 2 == 0 {
                let size = 64 + (rng.next() % 4096);
                if let Some(key) = pool.acquire(&mut source, size).unwrap() {
                    let id = pool.block(key, |b| b.id).unwrap();
                    assert!(
                        held_ids.insert(id),
                        "block {id} handed out while still acquired"
                    );
                    held.insert(key);
                }
            } else if let Some(&key) = held.iter().next() {
                let id = pool.block(key, |b| b.id).unwrap();
                held.remove(&key);
                held_ids.remove(&id);
                pool.release(key);
            }
            if rng.next() % 64 == 0 {
                pool.advance_epoch();
            }
        }
    }
}
