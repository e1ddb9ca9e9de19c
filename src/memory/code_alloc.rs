use super::block_index::{BlockId, BlockIndex};
use super::occupancy::OccupancyMap;
use super::stats;
use super::vm::{
    flush_instruction_cache, protect_jit_memory, JitAccess, Mapping, PlatformVmOps, VmError, VmOps,
};
use crate::sync::Mutex;
use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;

/// Default block size when `CreateParams::block_size` is zero or invalid.
const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Minimum granularity (and the default for pool #0).
const MIN_GRANULARITY: usize = 64;
const MAX_GRANULARITY: usize = 256;

/// Largest accepted block size.
const MAX_BLOCK_SIZE: usize = 256 * 1024 * 1024;

/// Number of pools when `use_multiple_pools` is set. Granularity doubles per
/// pool: 64, 128, 256 with the default base granularity.
const MULTI_POOL_COUNT: usize = 3;

/// Fill byte pattern for unused memory: int3 on x86 so a stray jump into
/// freed code traps immediately.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
const DEFAULT_FILL_PATTERN: u32 = 0xCCCC_CCCC;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
const DEFAULT_FILL_PATTERN: u32 = 0;

#[derive(Debug)]
pub enum AllocError {
    /// Zero-size request or otherwise malformed argument.
    InvalidArgument,
    /// The pointer was not produced by this allocator, or was already
    /// released.
    InvalidPointer,
    /// Request exceeds the maximum supported allocation size.
    TooLarge,
    /// The underlying memory-mapping call failed.
    Vm(VmError),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidArgument => write!(f, "invalid argument"),
            AllocError::InvalidPointer => write!(f, "pointer is not owned by this allocator"),
            AllocError::TooLarge => write!(f, "allocation size too large"),
            AllocError::Vm(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AllocError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AllocError::Vm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<VmError> for AllocError {
    fn from(e: VmError) -> Self {
        AllocError::Vm(e)
    }
}

/// A policy that can be passed to `reset()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Release all blocks but keep the pool bookkeeping allocated for reuse.
    Soft,
    /// Release all blocks and return the bookkeeping capacity as well.
    Hard,
}

/// Construction parameters for [`JitAllocator`]. All fields have documented
/// defaults; invalid values are silently corrected to them.
#[derive(Clone, Debug)]
pub struct CreateParams {
    /// Map each block into two views — read+execute and read+write — instead
    /// of one RWX mapping. Required where W^X policy forbids RWX pages.
    pub use_dual_mapping: bool,

    /// Use three pools with granularities 64/128/256 instead of one. Pays
    /// off only for workloads that generate a lot of code: coarser pools
    /// bound the bitmap overhead of large allocations.
    pub use_multiple_pools: bool,

    /// Fill freshly created blocks and freed spans with the fill pattern so
    /// stale code bytes never linger in executable memory.
    pub fill_unused_memory: bool,

    /// Unmap a block the instant it becomes empty. When unset, one empty
    /// block per pool is kept as a cache, which amortizes repeated
    /// alloc/release cycles of near block-sized requests.
    pub immediate_release: bool,

    /// Overrides the default fill byte pattern (int3 on x86, zero
    /// elsewhere). Only used together with `fill_unused_memory`.
    pub custom_fill_pattern: Option<u32>,

    /// Block size in bytes. Must be a power of two, at least one page and
    /// at most 256 MiB; corrected to 64 KiB otherwise. Zero means default.
    pub block_size: usize,

    /// Allocation granularity and natural alignment in bytes. Must be a
    /// power of two in 64..=256; corrected to 64 otherwise. Zero means
    /// default.
    pub granularity: usize,
}

impl Default for CreateParams {
    fn default() -> Self {
        Self {
            use_dual_mapping: false,
            use_multiple_pools: false,
            fill_unused_memory: false,
            immediate_release: false,
            custom_fill_pattern: None,
            block_size: DEFAULT_BLOCK_SIZE,
            granularity: MIN_GRANULARITY,
        }
    }
}

/// Consistent snapshot of allocator state, taken under the allocator lock.
#[derive(Clone, Copy, Debug, Default)]
pub struct Statistics {
    /// Number of live blocks across all pools.
    pub block_count: usize,
    /// Number of live allocations.
    pub allocation_count: usize,
    /// Bytes currently handed out to callers.
    pub used_size: usize,
    /// Total bytes of all block mappings.
    pub reserved_size: usize,
    /// Bookkeeping bytes (block structs and occupancy bitmaps) kept outside
    /// the executable mappings.
    pub overhead_size: usize,
}

impl Statistics {
    pub fn unused_size(&self) -> usize {
        self.reserved_size - self.used_size
    }
}

/// One executable-memory mapping managed as an allocation arena.
///
/// The address range is immutable after creation; only the occupancy
/// bitmaps and counters mutate.
struct Block {
    mapping: Mapping,
    size: usize,
    /// Owning pool, needed to find the granularity on the release path.
    pool: usize,
    occupancy: OccupancyMap,
    /// Upper bound on the largest free run, in cells. Lets the search skip
    /// blocks that cannot satisfy a request without scanning their bitmaps;
    /// made exact lazily after a failed scan.
    largest_free_run: usize,
}

// Safety: Block owns its mapping; the raw pointers are not aliased elsewhere.
unsafe impl Send for Block {}

impl Block {
    fn create(
        size: usize,
        granularity: usize,
        pool: usize,
        dual: bool,
        fill: Option<u32>,
    ) -> Result<Self, VmError> {
        // Safety: FFI mapping call; size is page-aligned and non-zero.
        let mapping = unsafe {
            if dual {
                PlatformVmOps::map_dual(size)?
            } else {
                PlatformVmOps::map_rwx(size)?
            }
        };
        if let Some(pattern) = fill {
            // Safety: the whole mapping was just created and is unused.
            unsafe { fill_span(mapping, 0, size, pattern) };
        }
        let cells = size / granularity;
        Ok(Self {
            mapping,
            size,
            pool,
            occupancy: OccupancyMap::new(cells),
            largest_free_run: cells,
        })
    }

    /// Bookkeeping bytes this block costs outside its mapping.
    fn overhead_bytes(&self) -> usize {
        size_of::<Self>() + 2 * self.occupancy.cells().div_ceil(64) * size_of::<usize>()
    }

    /// # Safety
    /// No live allocation may reference the mapping.
    unsafe fn destroy(self) {
        // Safety: upheld by caller.
        unsafe { PlatformVmOps::unmap(self.mapping, self.size) };
    }
}

/// A set of blocks sharing one allocation granularity.
struct Pool {
    granularity: usize,
    /// Insertion order; address lookup goes through the global index.
    blocks: Vec<BlockId>,
    /// Block most recently allocated from; tried first on the next alloc.
    cursor: Option<BlockId>,
    reserved_bytes: usize,
    used_bytes: usize,
    /// Fully-empty blocks retained as a cache (0 or 1).
    empty_block_count: usize,
}

impl Pool {
    fn new(granularity: usize) -> Self {
        Self {
            granularity,
            blocks: Vec::new(),
            cursor: None,
            reserved_bytes: 0,
            used_bytes: 0,
            empty_block_count: 0,
        }
    }
}

struct Inner {
    /// Central block table; ids stay stable across removals.
    blocks: Vec<Option<Block>>,
    free_ids: Vec<BlockId>,
    pools: Vec<Pool>,
    index: BlockIndex,
    allocation_count: usize,
}

/// Memory allocator for machine code produced at runtime.
///
/// Hands out spans that are writable through one pointer and executable
/// through another (the same pointer unless dual mapping is enabled). No
/// allocator metadata is stored inside the executable mappings: occupancy
/// is tracked by per-block bit-vector pairs in ordinary memory, and an
/// ordered index over block address ranges resolves `release`/`shrink`
/// pointers back to their block in O(log blocks).
///
/// `alloc`, `release`, `shrink`, `query` and `statistics` are thread-safe
/// and serialize on one internal lock. `reset` takes the same lock but
/// invalidates every outstanding pointer, so the caller must guarantee
/// quiescence around it.
pub struct JitAllocator {
    params: CreateParams,
    block_size: usize,
    granularity: usize,
    fill_pattern: u32,
    inner: Mutex<Inner>,
}

impl Default for JitAllocator {
    fn default() -> Self {
        Self::new(CreateParams::default())
    }
}

impl JitAllocator {
    /// Creates an allocator. Invalid `params` fields fall back to their
    /// documented defaults instead of erroring.
    pub fn new(params: CreateParams) -> Self {
        let page = PlatformVmOps::page_size();

        let mut block_size = params.block_size;
        if block_size < page || block_size > MAX_BLOCK_SIZE || !block_size.is_power_of_two() {
            block_size = DEFAULT_BLOCK_SIZE.max(page);
        }

        let mut granularity = params.granularity;
        if !(MIN_GRANULARITY..=MAX_GRANULARITY).contains(&granularity)
            || !granularity.is_power_of_two()
        {
            granularity = MIN_GRANULARITY;
        }

        let fill_pattern = params.custom_fill_pattern.unwrap_or(DEFAULT_FILL_PATTERN);

        let pool_count = if params.use_multiple_pools {
            MULTI_POOL_COUNT
        } else {
            1
        };
        let pools = (0..pool_count)
            .map(|i| Pool::new(granularity << i))
            .collect();

        // Normalize so accessors report the effective configuration.
        let mut params = params;
        params.block_size = block_size;
        params.granularity = granularity;

        Self {
            params,
            block_size,
            granularity,
            fill_pattern,
            inner: Mutex::new(Inner {
                blocks: Vec::new(),
                free_ids: Vec::new(),
                pools,
                index: BlockIndex::new(),
                allocation_count: 0,
            }),
        }
    }

    /// Effective (validated) construction parameters.
    pub fn options(&self) -> &CreateParams {
        &self.params
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Base granularity (pool #0's granularity in multi-pool mode).
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    pub fn fill_pattern(&self) -> u32 {
        self.fill_pattern
    }

    fn fill(&self) -> Option<u32> {
        self.params.fill_unused_memory.then_some(self.fill_pattern)
    }

    /// Pool routing: the coarsest pool whose granularity divides the
    /// rounded size, so allocations never waste alignment padding and large
    /// requests land in pools with the smallest bitmap overhead.
    fn pool_for_size(&self, pool_count: usize, rounded: usize) -> usize {
        let mut pool_id = pool_count - 1;
        while pool_id > 0 && !rounded.is_multiple_of(self.granularity << pool_id) {
            pool_id -= 1;
        }
        pool_id
    }

    /// Allocate `size` bytes of executable memory.
    ///
    /// Returns the writable pointer and the executable pointer for the span
    /// (equal unless dual mapping is enabled). All code writes must go
    /// through the writable pointer; `release`/`shrink`/`query` take it too.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for zero size, `TooLarge` for absurd sizes, and
    /// `Vm` when the OS mapping call fails during pool growth.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn alloc(&self, size: usize) -> Result<(NonNull<u8>, NonNull<u8>), AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidArgument);
        }
        if size > isize::MAX as usize / 2 {
            return Err(AllocError::TooLarge);
        }
        let rounded = size.next_multiple_of(self.granularity);

        let mut inner = self.inner.lock().unwrap();
        let Inner {
            blocks,
            free_ids,
            pools,
            index,
            allocation_count,
        } = &mut *inner;

        let pool_id = self.pool_for_size(pools.len(), rounded);
        let pool = &mut pools[pool_id];
        let g = pool.granularity;
        let cells = rounded / g;

        // Fast path: the block we allocated from last. Slow path: the rest
        // of the pool in insertion order.
        let mut found: Option<(BlockId, usize)> = None;
        let cursor = pool.cursor;
        let candidates = cursor
            .into_iter()
            .chain(pool.blocks.iter().copied().filter(|&id| Some(id) != cursor));
        for id in candidates {
            let block = blocks[id].as_mut().expect("pool references a live block");
            if block.occupancy.free_cells() >= cells && block.largest_free_run >= cells {
                if let Some(start) = block.occupancy.find_free_run(cells) {
                    found = Some((id, start));
                    break;
                }
                // The cached hint was stale; make it exact so the next miss
                // rejects this block without a scan.
                block.largest_free_run = block.occupancy.largest_free_run();
            }
        }

        let (id, start, is_new) = match found {
            Some((id, start)) => (id, start, false),
            None => {
                let page = PlatformVmOps::page_size();
                let bytes = self.block_size.max(rounded).next_multiple_of(page);
                let block =
                    Block::create(bytes, g, pool_id, self.params.use_dual_mapping, self.fill())?;
                let base = block.mapping.rw.as_ptr() as usize;
                let id = match free_ids.pop() {
                    Some(id) => {
                        blocks[id] = Some(block);
                        id
                    }
                    None => {
                        blocks.push(Some(block));
                        blocks.len() - 1
                    }
                };
                index.insert(base, bytes, id);
                pool.blocks.push(id);
                pool.reserved_bytes += bytes;
                stats::TOTAL_RESERVED.add(bytes);
                stats::BLOCK_COUNT.add(1);
                (id, 0, true)
            }
        };

        let block = blocks[id].as_mut().expect("pool references a live block");
        if !is_new && block.occupancy.is_empty() && pool.empty_block_count > 0 {
            // Allocating from the cached empty block takes it out of the cache.
            pool.empty_block_count -= 1;
        }
        block.occupancy.reserve(start, cells);
        pool.used_bytes += rounded;
        pool.cursor = Some(id);
        *allocation_count += 1;
        stats::TOTAL_USED.add(rounded);

        let offset = start * g;
        // Safety: the span lies within the mapping; both views cover the
        // full block.
        let rw = unsafe { NonNull::new_unchecked(block.mapping.rw.as_ptr().add(offset)) };
        let rx = unsafe { NonNull::new_unchecked(block.mapping.rx.as_ptr().add(offset)) };
        Ok((rw, rx))
    }

    /// Release a span previously returned by [`alloc`](Self::alloc).
    ///
    /// `rw_ptr` must be the writable pointer of a live allocation. A pointer
    /// this allocator does not own — including one already released — fails
    /// with `InvalidPointer` and changes nothing; silently ignoring it would
    /// mask double-release bugs.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn release(&self, rw_ptr: NonNull<u8>) -> Result<(), AllocError> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            blocks,
            free_ids,
            pools,
            index,
            allocation_count,
        } = &mut *inner;

        let addr = rw_ptr.as_ptr() as usize;
        let id = index
            .find_containing(addr)
            .ok_or(AllocError::InvalidPointer)?;

        let block = blocks[id].as_mut().expect("index references a live block");
        let pool_id = block.pool;
        let g = pools[pool_id].granularity;
        let offset = addr - block.mapping.rw.as_ptr() as usize;
        if !offset.is_multiple_of(g) {
            return Err(AllocError::InvalidPointer);
        }
        let cells = block
            .occupancy
            .release(offset / g)
            .ok_or(AllocError::InvalidPointer)?;

        let bytes = cells * g;
        let pool = &mut pools[pool_id];
        pool.used_bytes -= bytes;
        *allocation_count -= 1;
        stats::sub_saturating(&stats::TOTAL_USED, bytes);

        if let Some(pattern) = self.fill() {
            // Safety: the span lies within the block's mapping.
            unsafe { fill_span(block.mapping, offset, bytes, pattern) };
        }
        // Total free cells bound the largest run from above; the exact value
        // is recomputed lazily on the next failed search.
        block.largest_free_run = block.occupancy.free_cells();
        let emptied = block.occupancy.is_empty();

        if emptied {
            if self.params.immediate_release || pool.empty_block_count > 0 {
                destroy_block(blocks, free_ids, index, pool, id);
            } else {
                pool.empty_block_count += 1;
            }
        }
        Ok(())
    }

    /// Shrink a live span to `new_size` bytes, freeing the tail cells.
    ///
    /// `new_size == 0` is equivalent to [`release`](Self::release). A
    /// `new_size` at or beyond the span's current size is a no-op — spans
    /// never grow in place; release and re-alloc instead.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn shrink(&self, rw_ptr: NonNull<u8>, new_size: usize) -> Result<(), AllocError> {
        if new_size == 0 {
            return self.release(rw_ptr);
        }
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            blocks,
            pools,
            index,
            ..
        } = &mut *inner;

        let addr = rw_ptr.as_ptr() as usize;
        let id = index
            .find_containing(addr)
            .ok_or(AllocError::InvalidPointer)?;
        let block = blocks[id].as_mut().expect("index references a live block");
        let pool = &mut pools[block.pool];
        let g = pool.granularity;
        let offset = addr - block.mapping.rw.as_ptr() as usize;
        if !offset.is_multiple_of(g) {
            return Err(AllocError::InvalidPointer);
        }
        let start = offset / g;
        let len = block
            .occupancy
            .run_len(start)
            .ok_or(AllocError::InvalidPointer)?;

        if new_size >= len * g {
            return Ok(());
        }
        let keep = new_size.div_ceil(g);
        if keep == len {
            return Ok(());
        }
        let freed = block
            .occupancy
            .shrink(start, keep)
            .ok_or(AllocError::InvalidPointer)?;

        let bytes = freed * g;
        pool.used_bytes -= bytes;
        stats::sub_saturating(&stats::TOTAL_USED, bytes);

        if let Some(pattern) = self.fill() {
            // Safety: the freed tail lies within the block's mapping.
            unsafe { fill_span(block.mapping, offset + keep * g, bytes, pattern) };
        }
        block.largest_free_run = block.occupancy.free_cells();
        Ok(())
    }

    /// Resolve a writable pointer back to its span: the writable and
    /// executable views plus the span's byte length.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn query(
        &self,
        rw_ptr: NonNull<u8>,
    ) -> Result<(NonNull<u8>, NonNull<u8>, usize), AllocError> {
        let inner = self.inner.lock().unwrap();

        let addr = rw_ptr.as_ptr() as usize;
        let id = inner
            .index
            .find_containing(addr)
            .ok_or(AllocError::InvalidPointer)?;
        let block = inner.blocks[id]
            .as_ref()
            .expect("index references a live block");
        let g = inner.pools[block.pool].granularity;
        let offset = addr - block.mapping.rw.as_ptr() as usize;
        if !offset.is_multiple_of(g) {
            return Err(AllocError::InvalidPointer);
        }
        let len = block
            .occupancy
            .run_len(offset / g)
            .ok_or(AllocError::InvalidPointer)?
            * g;
        // Safety: the span lies within the mapping.
        let rw = unsafe { NonNull::new_unchecked(block.mapping.rw.as_ptr().add(offset)) };
        let rx = unsafe { NonNull::new_unchecked(block.mapping.rx.as_ptr().add(offset)) };
        Ok((rw, rx, len))
    }

    /// Release every block and empty all pools, invalidating every pointer
    /// returned by `alloc`.
    ///
    /// The lock is held for the duration, but that does not protect callers
    /// still holding pointers — they must guarantee quiescence first.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn reset(&self, policy: ResetPolicy) {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            blocks,
            free_ids,
            pools,
            index,
            allocation_count,
        } = &mut *inner;

        for pool in pools.iter_mut() {
            for &id in &pool.blocks {
                let block = blocks[id].take().expect("pool references a live block");
                stats::sub_saturating(&stats::TOTAL_RESERVED, block.size);
                stats::BLOCK_COUNT.sub(1);
                // Safety: reset invalidates all outstanding pointers by
                // contract.
                unsafe { block.destroy() };
            }
            pool.blocks.clear();
            pool.cursor = None;
            pool.reserved_bytes = 0;
            stats::sub_saturating(&stats::TOTAL_USED, pool.used_bytes);
            pool.used_bytes = 0;
            pool.empty_block_count = 0;
        }
        index.clear();
        blocks.clear();
        free_ids.clear();
        *allocation_count = 0;

        if policy == ResetPolicy::Hard {
            blocks.shrink_to_fit();
            free_ids.shrink_to_fit();
            for pool in pools.iter_mut() {
                pool.blocks.shrink_to_fit();
            }
        }
    }

    /// Consistent snapshot of allocator state.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn statistics(&self) -> Statistics {
        let inner = self.inner.lock().unwrap();
        let mut s = Statistics {
            allocation_count: inner.allocation_count,
            ..Statistics::default()
        };
        for pool in &inner.pools {
            s.block_count += pool.blocks.len();
            s.reserved_size += pool.reserved_bytes;
            s.used_size += pool.used_bytes;
        }
        for block in inner.blocks.iter().flatten() {
            s.overhead_size += block.overhead_bytes();
        }
        s
    }
}

impl Drop for JitAllocator {
    fn drop(&mut self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for pool in &inner.pools {
            stats::sub_saturating(&stats::TOTAL_USED, pool.used_bytes);
        }
        for block in inner.blocks.drain(..).flatten() {
            stats::sub_saturating(&stats::TOTAL_RESERVED, block.size);
            stats::BLOCK_COUNT.sub(1);
            // Safety: caller contract — no outstanding allocations at drop.
            unsafe { block.destroy() };
        }
    }
}

/// Unmap a fully-empty block and drop it from all bookkeeping.
fn destroy_block(
    blocks: &mut Vec<Option<Block>>,
    free_ids: &mut Vec<BlockId>,
    index: &mut BlockIndex,
    pool: &mut Pool,
    id: BlockId,
) {
    let block = blocks[id].take().expect("destroying a live block");
    index.remove(block.mapping.rw.as_ptr() as usize);
    pool.blocks.retain(|&b| b != id);
    if pool.cursor == Some(id) {
        pool.cursor = pool.blocks.last().copied();
    }
    pool.reserved_bytes -= block.size;
    free_ids.push(id);
    stats::sub_saturating(&stats::TOTAL_RESERVED, block.size);
    stats::BLOCK_COUNT.sub(1);
    // Safety: the block is empty — no live allocation references the mapping.
    unsafe { block.destroy() };
}

/// Overwrite a span with the fill pattern through the writable view, then
/// flush the executable view's instruction cache.
///
/// # Safety
/// `[offset, offset + len)` must lie within the mapping.
unsafe fn fill_span(mapping: Mapping, offset: usize, len: usize, pattern: u32) {
    debug_assert!(len.is_multiple_of(4) && offset.is_multiple_of(4));
    protect_jit_memory(JitAccess::ReadWrite);
    // Safety: upheld by caller; offset is 4-byte aligned (granularity is at
    // least 64).
    let p = unsafe { mapping.rw.as_ptr().add(offset).cast::<u32>() };
    for i in 0..len / 4 {
        // Safety: i * 4 < len.
        unsafe { p.add(i).write(pattern) };
    }
    protect_jit_memory(JitAccess::ReadExecute);
    // Safety: upheld by caller.
    flush_instruction_cache(unsafe { mapping.rx.as_ptr().add(offset) }, len);
}
