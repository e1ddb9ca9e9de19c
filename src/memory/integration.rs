//! Multi-threaded integration tests exercising the allocator façade under
//! contention with real mappings. Loom model tests live in `loom_tests`.

#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::code_alloc::{CreateParams, JitAllocator};
    use crate::memory::vm::{protect_jit_memory, JitAccess};
    use crate::memory::TEST_MUTEX;
    use crate::sync::barrier::Barrier;
    use crate::sync::{thread, Arc};
    use std::ptr::NonNull;

    fn tag(thread_id: usize, iter: usize) -> u8 {
        (thread_id as u8).wrapping_mul(31).wrapping_add(iter as u8)
    }

    // Safety: the span is owned by the caller.
    unsafe fn write_tag(rw: NonNull<u8>, value: u8) {
        protect_jit_memory(JitAccess::ReadWrite);
        unsafe { rw.as_ptr().write(value) };
        protect_jit_memory(JitAccess::ReadExecute);
    }

    #[test]
    fn test_concurrent_alloc_release_quiesces() {
        let _guard = TEST_MUTEX.read().unwrap();

        let allocator = Arc::new(JitAllocator::default());
        let num_threads = 8;
        let iters = 200;
        let barrier = Arc::new(Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let allocator = Arc::clone(&allocator);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut live: Vec<(NonNull<u8>, u8)> = Vec::new();
                    for i in 0..iters {
                        let size = 64 << (i % 4);
                        let (rw, _rx) = allocator.alloc(size).unwrap();
                        let value = tag(t, i);
                        // Safety: freshly allocated span, owned by this thread.
                        unsafe { write_tag(rw, value) };
                        live.push((rw, value));

                        // Interleave releases so free runs fragment and merge.
                        if i % 3 == 0 {
                            let (rw, value) = live.swap_remove(i % live.len());
                            // Safety: the span is still live.
                            unsafe { assert_eq!(rw.as_ptr().read(), value) };
                            allocator.release(rw).unwrap();
                        }
                    }
                    for (rw, value) in live {
                        // No other thread's writes may have landed in our span.
                        // Safety: the span is still live.
                        unsafe { assert_eq!(rw.as_ptr().read(), value) };
                        allocator.release(rw).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let s = allocator.statistics();
        assert_eq!(s.used_size, 0);
        assert_eq!(s.allocation_count, 0);
        // At most the cached empty block remains.
        assert!(s.block_count <= 1);
    }

    #[test]
    fn test_concurrent_multi_pool_mixed_sizes() {
        let _guard = TEST_MUTEX.read().unwrap();

        let allocator = Arc::new(JitAllocator::new(CreateParams {
            use_multiple_pools: true,
            fill_unused_memory: true,
            ..CreateParams::default()
        }));
        let num_threads = 4;
        let barrier = Arc::new(Barrier::new(num_threads));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let allocator = Arc::clone(&allocator);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..100 {
                        // Sizes that land in all three pools.
                        let size = [60, 128, 192, 256, 300, 512][(t + i) % 6];
                        let (rw, _rx) = allocator.alloc(size).unwrap();
                        let (_, _, len) = allocator.query(rw).unwrap();
                        assert!(len >= size);

                        if i % 2 == 0 {
                            allocator.shrink(rw, size / 2).unwrap();
                        }
                        allocator.release(rw).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let s = allocator.statistics();
        assert_eq!(s.used_size, 0);
        assert_eq!(s.allocation_count, 0);
        // At most one cached empty block per pool.
        assert!(s.block_count <= 3);
    }

    #[test]
    fn test_concurrent_statistics_snapshots_are_sane() {
        let _guard = TEST_MUTEX.read().unwrap();

        let allocator = Arc::new(JitAllocator::default());
        let num_workers = 4;
        let barrier = Arc::new(Barrier::new(num_workers + 1));

        let workers: Vec<_> = (0..num_workers)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..300 {
                        let (rw, _rx) = allocator.alloc(64 + (i % 8) * 64).unwrap();
                        allocator.release(rw).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let allocator = Arc::clone(&allocator);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..300 {
                    // Each snapshot is internally consistent even mid-churn.
                    let s = allocator.statistics();
                    assert!(s.used_size <= s.reserved_size);
                    assert!(s.allocation_count <= num_workers);
                    thread::yield_now();
                }
            })
        };

        for handle in workers {
            handle.join().unwrap();
        }
        reader.join().unwrap();

        let s = allocator.statistics();
        assert_eq!(s.used_size, 0);
        assert_eq!(s.allocation_count, 0);
    }
}
