use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;
use rdma_sys::{
    ibv_pd, ibv_post_recv, ibv_post_send, ibv_qp, ibv_recv_wr, ibv_send_flags, ibv_send_wr,
    ibv_sge, ibv_wr_opcode, rdma_cm_id,
};

use crate::cache::{CacheEntry, LruCache};
use crate::config::Config;
use crate::fs::{make_etag, map_url_to_fs, read_file};
use crate::metrics::metrics;
use crate::rdma::buffer::Buffer;
use crate::rdma::protocol::{self, Op};
use crate::rdma::RdmaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Recv,
    Send,
}

/// Tags a posted work request. Holds a strong reference to its connection
/// so a completion arriving after close still dispatches safely, plus the
/// raw address of the buffer pinned for the operation. The work item is
/// the unique owner of the WR's lifecycle: it is boxed into `wr_id` at
/// post time and reclaimed exactly once by the poller.
pub struct Work {
    pub conn: Arc<RdmaConnection>,
    pub kind: WorkKind,
    pub buf: *mut Buffer,
}

unsafe impl Send for Work {}

struct ConnState {
    closed: bool,
    recv_pool: Vec<Box<Buffer>>,
    recv_inflight: usize,
    // Posted sends in FIFO post order; completions reconcile front-first.
    send_queue: VecDeque<Box<Buffer>>,
    sends_inflight: usize,
    // Prepared body chunks waiting for send credit.
    deferred: VecDeque<Box<Buffer>>,
}

/// Per-QP state: the posted RECV pool, request dispatch, the chunked SEND
/// pipeline and its flow-control accounting. Poller threads may deliver
/// completions for one connection concurrently, so every state transition
/// goes through the connection mutex.
pub struct RdmaConnection {
    id: *mut rdma_cm_id,
    pd: *mut ibv_pd,
    cfg: Arc<Config>,
    cache: Arc<LruCache>,
    state: Mutex<ConnState>,
}

unsafe impl Send for RdmaConnection {}
unsafe impl Sync for RdmaConnection {}

impl RdmaConnection {
    pub fn new(
        id: *mut rdma_cm_id,
        pd: *mut ibv_pd,
        cfg: Arc<Config>,
        cache: Arc<LruCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            pd,
            cfg,
            cache,
            state: Mutex::new(ConnState {
                closed: false,
                recv_pool: Vec::new(),
                recv_inflight: 0,
                send_queue: VecDeque::new(),
                sends_inflight: 0,
                deferred: VecDeque::new(),
            }),
        })
    }

    /// Allocates and posts the whole RECV pool. Must run before accept.
    pub fn init(self: &Arc<Self>) -> Result<(), RdmaError> {
        let mut st = self.state.lock();
        st.recv_pool.reserve(self.cfg.rdma_recv_bufs_per_conn);
        for _ in 0..self.cfg.rdma_recv_bufs_per_conn {
            st.recv_pool
                .push(Buffer::new(self.pd, self.cfg.rdma_recv_buf_size)?);
        }
        let posted = self.post_recvs_locked(&mut st, self.cfg.rdma_recv_bufs_per_conn);
        if posted == 0 {
            return Err(RdmaError::Sys("ibv_post_recv"));
        }
        Ok(())
    }

    pub fn qp_num(&self) -> u32 {
        let qp = self.qp();
        if qp.is_null() {
            0
        } else {
            // SAFETY: qp checked non-null; the CM owns it until disconnect.
            unsafe { (*qp).qp_num }
        }
    }

    fn qp(&self) -> *mut ibv_qp {
        // SAFETY: id outlives the connection (destroyed by the server after
        // this connection leaves the live set).
        unsafe { (*self.id).qp }
    }

    fn post_recvs_locked(self: &Arc<Self>, st: &mut ConnState, count: usize) -> usize {
        let mut posted = 0;
        for _ in 0..count {
            if st.closed {
                break;
            }
            let Some(buf) = st.recv_pool.pop() else {
                break;
            };
            let raw = Box::into_raw(buf);
            let work = Box::into_raw(Box::new(Work {
                conn: Arc::clone(self),
                kind: WorkKind::Recv,
                buf: raw,
            }));

            // SAFETY: raw points to a live Buffer owned by this WR until
            // its completion is reaped.
            let mut sge = unsafe {
                ibv_sge {
                    addr: (*raw).addr(),
                    length: (*raw).capacity() as u32,
                    lkey: (*raw).lkey(),
                }
            };
            let mut wr: ibv_recv_wr = unsafe { std::mem::zeroed() };
            wr.wr_id = work as u64;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            let mut bad: *mut ibv_recv_wr = std::ptr::null_mut();

            // SAFETY: qp is live, wr/sge are valid for the call duration.
            let rc = unsafe { ibv_post_recv(self.qp(), &mut wr, &mut bad) };
            if rc != 0 {
                // SAFETY: both raws came from Box::into_raw above.
                unsafe {
                    drop(Box::from_raw(work));
                    st.recv_pool.push(Box::from_raw(raw));
                }
                break;
            }
            st.recv_inflight += 1;
            posted += 1;
        }
        posted
    }

    /// A request landed in `work`'s buffer. Dispatch it, then return the
    /// buffer to the pool and repost one RECV to keep the credit.
    pub fn on_recv_complete(self: &Arc<Self>, work: Box<Work>, byte_len: u32) {
        debug_assert_eq!(work.kind, WorkKind::Recv);
        // SAFETY: the work item uniquely owns this buffer.
        let buf = unsafe { Box::from_raw(work.buf) };
        drop(work);

        match protocol::parse_request(buf.as_slice(byte_len as usize)) {
            None => {
                let _ = self.send_header(400, 0, 0);
            }
            Some(req) => {
                metrics().rdma_requests.fetch_add(1, Ordering::Relaxed);
                match req.op {
                    Op::Ping => {
                        let _ = self.send_header(200, 0, 0);
                        metrics().rdma_ok.fetch_add(1, Ordering::Relaxed);
                    }
                    Op::Get => self.handle_get(&req.path),
                }
            }
        }

        let mut st = self.state.lock();
        st.recv_pool.push(buf);
        st.recv_inflight = st.recv_inflight.saturating_sub(1);
        self.post_recvs_locked(&mut st, 1);
    }

    fn handle_get(self: &Arc<Self>, url_path: &str) {
        let mapped = match map_url_to_fs(&self.cfg.doc_root, url_path) {
            Ok(m) => m,
            Err(_) => {
                let _ = self.send_header(400, 0, 0);
                metrics().rdma_err.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if !mapped.exists {
            let _ = self.send_header(404, 0, 0);
            metrics().rdma_err.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let entry = match self.cache.get(&mapped.cache_key) {
            Some(entry) => entry,
            None => match read_file(&mapped.fs_path) {
                Err(_) => {
                    let _ = self.send_header(500, 0, 0);
                    metrics().rdma_err.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Ok(contents) => {
                    let body: Arc<[u8]> = contents.data.into();
                    let etag = make_etag(body.len(), contents.last_modified);
                    let entry = CacheEntry::new(body, contents.last_modified, etag);
                    self.cache.put(mapped.cache_key.clone(), entry.clone());
                    entry
                }
            },
        };

        let total = entry.size as u64;
        let chunk = protocol::chunk_for(self.cfg.rdma_send_chunk, total);
        if self.send_header(200, total, chunk).is_err() {
            metrics().rdma_err.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if total > 0 {
            if self.send_body_chunks(&entry.body, chunk).is_err() {
                metrics().rdma_err.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        metrics().rdma_ok.fetch_add(1, Ordering::Relaxed);
        metrics().rdma_bytes.fetch_add(total, Ordering::Relaxed);
    }

    /// Response headers bypass flow control; there is exactly one per
    /// request and the credit ceiling applies to body chunks.
    fn send_header(
        self: &Arc<Self>,
        status: u16,
        content_len: u64,
        chunk: u32,
    ) -> Result<(), RdmaError> {
        let bytes = protocol::make_resp_header(status, content_len, chunk);
        let mut buf = Buffer::new(self.pd, bytes.len())?;
        buf.fill(&bytes);
        let mut st = self.state.lock();
        self.post_send_locked(&mut st, buf)
    }

    /// Splits the body into `chunk`-byte SENDs in offset order. Chunks past
    /// the outstanding-send ceiling are parked on the deferred queue and
    /// posted from `on_send_complete` as credit frees up.
    fn send_body_chunks(self: &Arc<Self>, body: &Arc<[u8]>, chunk: u32) -> Result<(), RdmaError> {
        let chunk = chunk as usize;
        let total = body.len();
        let mut off = 0;
        let mut st = self.state.lock();
        while off < total {
            let n = chunk.min(total - off);
            let mut buf = Buffer::new(self.pd, n)?;
            buf.fill(&body[off..off + n]);
            if st.sends_inflight >= self.cfg.rdma_max_outstanding_sends {
                st.deferred.push_back(buf);
            } else {
                self.post_send_locked(&mut st, buf)?;
            }
            off += n;
        }
        Ok(())
    }

    fn post_send_locked(
        self: &Arc<Self>,
        st: &mut ConnState,
        mut buf: Box<Buffer>,
    ) -> Result<(), RdmaError> {
        if st.closed {
            return Err(RdmaError::Closed);
        }
        let raw: *mut Buffer = &mut *buf;
        let work = Box::into_raw(Box::new(Work {
            conn: Arc::clone(self),
            kind: WorkKind::Send,
            buf: raw,
        }));

        let mut sge = ibv_sge {
            addr: buf.addr(),
            length: buf.len() as u32,
            lkey: buf.lkey(),
        };
        let mut wr: ibv_send_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = work as u64;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        let mut bad: *mut ibv_send_wr = std::ptr::null_mut();

        // SAFETY: qp is live; the buffer outlives the WR because it moves
        // into the in-flight queue below and is only released on completion.
        let rc = unsafe { ibv_post_send(self.qp(), &mut wr, &mut bad) };
        if rc != 0 {
            // SAFETY: work came from Box::into_raw above; buf is still ours.
            unsafe { drop(Box::from_raw(work)) };
            return Err(RdmaError::Sys("ibv_post_send"));
        }
        st.sends_inflight += 1;
        st.send_queue.push_back(buf);
        Ok(())
    }

    /// Releases the completed buffer (FIFO identity, linear fallback) and
    /// drains deferred chunks back up to the credit ceiling.
    pub fn on_send_complete(self: &Arc<Self>, work: Box<Work>) {
        debug_assert_eq!(work.kind, WorkKind::Send);
        let mut st = self.state.lock();
        Self::reclaim_send_locked(&mut st, work.buf);

        while st.sends_inflight < self.cfg.rdma_max_outstanding_sends {
            let Some(buf) = st.deferred.pop_front() else {
                break;
            };
            if let Err(e) = self.post_send_locked(&mut st, buf) {
                warn!("[rdma] deferred send failed: {}", e);
                break;
            }
        }
    }

    /// A completion failed (flush or error status). The work item is gone;
    /// the buffer it pinned still has to be returned to its owner so pools
    /// stay balanced.
    pub fn on_completion_failed(self: &Arc<Self>, work: Box<Work>) {
        let mut st = self.state.lock();
        match work.kind {
            WorkKind::Recv => {
                // SAFETY: the work item uniquely owns a recv buffer.
                let buf = unsafe { Box::from_raw(work.buf) };
                st.recv_pool.push(buf);
                st.recv_inflight = st.recv_inflight.saturating_sub(1);
            }
            WorkKind::Send => {
                Self::reclaim_send_locked(&mut st, work.buf);
            }
        }
    }

    fn reclaim_send_locked(st: &mut ConnState, buf: *mut Buffer) {
        let front_matches = st
            .send_queue
            .front()
            .map_or(false, |b| std::ptr::eq(&**b, buf));
        if front_matches {
            let _ = st.send_queue.pop_front();
        } else if let Some(i) = st
            .send_queue
            .iter()
            .position(|b| std::ptr::eq(&**b, buf))
        {
            let _ = st.send_queue.remove(i);
        }
        st.sends_inflight = st.sends_inflight.saturating_sub(1);
    }

    /// Marks the connection closed. Outstanding completions still drain
    /// through the strong references held by their work items; nothing new
    /// is posted after this.
    pub fn close(&self) {
        let mut st = self.state.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        st.deferred.clear();
    }
}
