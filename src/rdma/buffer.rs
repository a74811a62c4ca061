use std::alloc::{alloc, dealloc, Layout};

use rdma_sys::{ibv_access_flags, ibv_dereg_mr, ibv_mr, ibv_pd, ibv_reg_mr};

use crate::rdma::RdmaError;

pub const PAGE_SIZE: usize = 4096;

/// A page-aligned byte region registered as a memory region with the HCA.
/// The allocation and its registration are released together exactly once,
/// in `Drop`. Ownership is linear: a buffer is held by the receive pool, a
/// posted work request, or the in-flight send queue, never two at once.
pub struct Buffer {
    data: *mut u8,
    capacity: usize,
    len: usize,
    mr: *mut ibv_mr,
}

// The region is owned by exactly one holder at a time and the HCA only
// touches it while a WR is posted.
unsafe impl Send for Buffer {}

impl Buffer {
    /// Allocates at least `n` bytes rounded up to whole pages and registers
    /// the region with local-write access.
    pub fn new(pd: *mut ibv_pd, n: usize) -> Result<Box<Buffer>, RdmaError> {
        let capacity = n.max(1).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let layout =
            Layout::from_size_align(capacity, PAGE_SIZE).map_err(|_| RdmaError::Alloc)?;
        // SAFETY: layout has non-zero size.
        let data = unsafe { alloc(layout) };
        if data.is_null() {
            return Err(RdmaError::Alloc);
        }

        // SAFETY: data points to `capacity` owned bytes; pd is a live PD.
        let mr = unsafe {
            ibv_reg_mr(
                pd,
                data.cast(),
                capacity,
                ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0 as i32,
            )
        };
        if mr.is_null() {
            // SAFETY: same layout the allocation was made with.
            unsafe { dealloc(data, layout) };
            return Err(RdmaError::RegMr);
        }

        Ok(Box::new(Buffer {
            data,
            capacity,
            len: 0,
            mr,
        }))
    }

    pub fn fill(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.capacity);
        // SAFETY: capacity checked above; regions cannot overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data, bytes.len());
        }
        self.len = bytes.len();
    }

    /// The first `n` bytes of the region, as written by the HCA.
    pub fn as_slice(&self, n: usize) -> &[u8] {
        let n = n.min(self.capacity);
        // SAFETY: n is within the allocation.
        unsafe { std::slice::from_raw_parts(self.data, n) }
    }

    pub fn addr(&self) -> u64 {
        self.data as u64
    }

    pub fn lkey(&self) -> u32 {
        // SAFETY: mr is valid until Drop.
        unsafe { (*self.mr).lkey }
    }

    /// Meaningful bytes (set by `fill`); the wire length of a send.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // SAFETY: mr and data were created together in new(); this is the
        // single release point for both.
        unsafe {
            ibv_dereg_mr(self.mr);
            let layout = Layout::from_size_align_unchecked(self.capacity, PAGE_SIZE);
            dealloc(self.data, layout);
        }
    }
}
