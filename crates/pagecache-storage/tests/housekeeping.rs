//! Integration tests for eviction and the memory budget.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pagecache_common::config::{BufferAllocatorConfig, PageCacheConfig, StorageConfig};
use pagecache_common::types::PageIndex;
use pagecache_storage::{CacheState, MemoryChannel, PageCache, PagedStorage};

const PAGE: u64 = 4096;

fn memory_storage(cache: &PageCache, name: &str) -> (PagedStorage, Arc<MemoryChannel>) {
    let channel = Arc::new(MemoryChannel::new(name));
    let storage = PagedStorage::with_channel(
        Box::new(Arc::clone(&channel)),
        StorageConfig::new(PAGE as usize),
        cache,
    )
    .expect("Failed to open storage");
    (storage, channel)
}

/// Runs manual turns until resident bytes fit the capacity.
fn turn_until_within_capacity(cache: &PageCache, max_turns: usize) {
    for _ in 0..max_turns {
        if cache.resident_bytes() <= cache.capacity_bytes() {
            return;
        }
        cache.run_maintenance_turn();
    }
    panic!(
        "cache still over capacity after {max_turns} turns: {}",
        cache.stats()
    );
}

#[test]
fn test_least_recently_used_page_is_evicted_first() {
    let cache = PageCache::manual(PageCacheConfig::new(2 * PAGE)).unwrap();
    let (storage, _channel) = memory_storage(&cache, "/mem/lru.bin");

    storage.put_int(0, 10).unwrap();
    cache.run_maintenance_turn();
    storage.put_int(PAGE, 11).unwrap();
    cache.run_maintenance_turn();
    // no room left: this page goes over capacity until the next turns
    storage.put_int(2 * PAGE, 12).unwrap();
    assert_eq!(cache.resident_bytes(), 3 * PAGE);
    assert_eq!(cache.stats().pages_allocated_heap, 1);

    turn_until_within_capacity(&cache, 200);
    assert!(!storage.is_page_cached(PageIndex::new(0)));
    assert!(storage.is_page_cached(PageIndex::new(1)));
    assert!(storage.is_page_cached(PageIndex::new(2)));

    // a fourth page pushes out the next least useful one
    storage.put_int(3 * PAGE, 13).unwrap();
    turn_until_within_capacity(&cache, 200);
    assert!(!storage.is_page_cached(PageIndex::new(1)));
    assert!(storage.is_page_cached(PageIndex::new(2)));
    assert!(storage.is_page_cached(PageIndex::new(3)));

    // evicted pages were written back
    assert_eq!(storage.get_int(0).unwrap(), 10);
    assert_eq!(storage.get_int(PAGE).unwrap(), 11);
    storage.close().unwrap();
}

#[test]
fn test_budget_converges_with_housekeeper_thread() {
    let capacity = 16 * PAGE;
    let cache = PageCache::new(PageCacheConfig::new(capacity)).unwrap();
    let (storage, channel) = memory_storage(&cache, "/mem/budget.bin");
    assert_eq!(cache.state(), CacheState::Working);

    for page in 0..128u64 {
        storage.put_long(page * PAGE, page as i64).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(20);
    while cache.resident_bytes() > capacity && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(
        cache.resident_bytes() <= capacity,
        "resident {} > capacity {capacity}: {}",
        cache.resident_bytes(),
        cache.stats()
    );
    assert!(storage.cached_pages() <= 16);

    storage.close().unwrap();
    for page in 0..128u64 {
        let offset = (page * PAGE) as usize;
        let bytes: [u8; 8] = channel.content()[offset..offset + 8].try_into().unwrap();
        assert_eq!(i64::from_ne_bytes(bytes), page as i64);
    }
    cache.close().unwrap();
}

#[test]
fn test_heap_pages_when_nothing_is_reclaimable() {
    let cache = PageCache::manual(PageCacheConfig::new(PAGE)).unwrap();
    let (storage, _channel) = memory_storage(&cache, "/mem/heap.bin");

    let guards: Vec<_> = (0..4u32)
        .map(|index| storage.read_page(PageIndex::new(index)).unwrap())
        .collect();
    let stats = cache.stats();
    assert_eq!(stats.pages_allocated_native, 1);
    assert_eq!(stats.pages_allocated_heap, 3);
    assert_eq!(cache.resident_bytes(), 4 * PAGE);

    // pages in use are never evicted
    for _ in 0..50 {
        cache.run_maintenance_turn();
    }
    assert_eq!(storage.cached_pages(), 4);

    drop(guards);
    turn_until_within_capacity(&cache, 200);
    assert_eq!(storage.cached_pages(), 1);
    storage.close().unwrap();
}

#[test]
fn test_buffers_are_pooled_across_storages() {
    let config = PageCacheConfig::new(64 * PAGE).with_allocator(BufferAllocatorConfig::default());
    let cache = PageCache::manual(config).unwrap();

    let (first, _) = memory_storage(&cache, "/mem/pool-1.bin");
    for page in 0..8u64 {
        first.put_byte(page * PAGE, 1).unwrap();
    }
    first.close().unwrap();
    let after_first = cache.allocator_stats();
    assert_eq!(after_first.misses, 8);

    let (second, _) = memory_storage(&cache, "/mem/pool-2.bin");
    for page in 0..8u64 {
        second.put_byte(page * PAGE, 2).unwrap();
    }
    let after_second = cache.allocator_stats();
    assert_eq!(after_second.hits, 8);
    assert_eq!(after_second.misses, 8);
    second.close().unwrap();
}

#[test]
fn test_close_many_storages() {
    let cache = PageCache::new(PageCacheConfig::new(32 * PAGE)).unwrap();
    let storages: Vec<_> = (0..10)
        .map(|i| memory_storage(&cache, &format!("/mem/many-{i}.bin")))
        .collect();
    for (i, (storage, _)) in storages.iter().enumerate() {
        storage.put_int(0, i as i32).unwrap();
        storage.put_int(PAGE, i as i32).unwrap();
    }
    let futures: Vec<_> = storages.iter().map(|(storage, _)| storage.close_async()).collect();
    for future in futures {
        future.wait().unwrap();
    }
    assert_eq!(cache.registered_storages(), 0);
    assert_eq!(cache.resident_bytes(), 0);
    assert_eq!(cache.stats().storages_closed, 10);
    for (i, (_, channel)) in storages.iter().enumerate() {
        let content = channel.content();
        assert_eq!(i32::from_ne_bytes(content[..4].try_into().unwrap()), i as i32);
    }
    cache.close().unwrap();
    assert_eq!(cache.state(), CacheState::Closed);
}
