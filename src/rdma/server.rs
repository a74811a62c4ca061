use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::raw::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::Mutex;
use rdma_sys::{
    ibv_ack_cq_events, ibv_alloc_pd, ibv_comp_channel, ibv_cq, ibv_create_comp_channel,
    ibv_create_cq, ibv_dealloc_pd, ibv_destroy_comp_channel, ibv_destroy_cq, ibv_get_cq_event,
    ibv_pd, ibv_poll_cq, ibv_qp_init_attr, ibv_qp_type, ibv_req_notify_cq, ibv_wc,
    ibv_wc_status, rdma_accept, rdma_ack_cm_event, rdma_bind_addr, rdma_cm_event,
    rdma_cm_event_type, rdma_cm_id, rdma_conn_param, rdma_create_event_channel, rdma_create_id,
    rdma_create_qp, rdma_destroy_event_channel, rdma_destroy_id, rdma_destroy_qp,
    rdma_event_channel, rdma_get_cm_event, rdma_listen, rdma_port_space, rdma_reject,
};

use crate::cache::LruCache;
use crate::config::Config;
use crate::rdma::connection::{RdmaConnection, Work, WorkKind};
use crate::rdma::RdmaError;

const CQ_DEPTH: i32 = 512;
const LISTEN_BACKLOG: i32 = 64;
const QP_MAX_WR: u32 = 1024;
const POLL_BATCH: usize = 32;
// Event-channel fds are polled with this timeout so stop() can join the
// threads instead of hanging in the blocking verbs calls.
const POLL_INTERVAL_MS: i32 = 100;

// Lazily created on the first CONNECT_REQUEST, shared by every QP, and
// destroyed only after all QPs are gone.
struct Verbs {
    pd: *mut ibv_pd,
    comp_ch: *mut ibv_comp_channel,
    cq: *mut ibv_cq,
}

struct Shared {
    cfg: Arc<Config>,
    cache: Arc<LruCache>,
    running: AtomicBool,
    ec: *mut rdma_event_channel,
    listen_id: *mut rdma_cm_id,
    verbs: Mutex<Verbs>,
    // Live connections keyed by qp_num.
    conns: Mutex<HashMap<u32, Arc<RdmaConnection>>>,
}

// Raw verbs handles are only touched by the CM thread, the pollers, and
// stop() after both are joined.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Connection-manager event loop plus completion-queue pollers over one
/// shared protection domain and CQ.
pub struct RdmaServer {
    shared: Arc<Shared>,
    cm_thread: Option<JoinHandle<()>>,
    pollers: Vec<JoinHandle<()>>,
}

impl RdmaServer {
    /// Binds and listens, then spawns the CM thread and the poller threads.
    /// Any failure here is fatal for startup.
    pub fn start(cfg: Arc<Config>, cache: Arc<LruCache>) -> Result<Self, RdmaError> {
        let addr: Ipv4Addr = cfg
            .rdma_bind
            .parse()
            .map_err(|_| RdmaError::BadAddr)?;

        // SAFETY: plain constructor; null-checked below.
        let ec = unsafe { rdma_create_event_channel() };
        if ec.is_null() {
            return Err(RdmaError::Sys("rdma_create_event_channel"));
        }

        let mut listen_id: *mut rdma_cm_id = ptr::null_mut();
        // SAFETY: ec is live; listen_id receives the new id.
        if unsafe { rdma_create_id(ec, &mut listen_id, ptr::null_mut(), rdma_port_space::RDMA_PS_TCP) }
            != 0
        {
            unsafe { rdma_destroy_event_channel(ec) };
            return Err(RdmaError::Sys("rdma_create_id"));
        }

        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = cfg.rdma_port.to_be();
        sin.sin_addr.s_addr = u32::from(addr).to_be();

        // SAFETY: listen_id is live; sin outlives the call.
        let bound = unsafe {
            rdma_bind_addr(listen_id, (&mut sin as *mut libc::sockaddr_in).cast())
        };
        if bound != 0 {
            unsafe {
                rdma_destroy_id(listen_id);
                rdma_destroy_event_channel(ec);
            }
            return Err(RdmaError::Sys("rdma_bind_addr"));
        }
        // SAFETY: listen_id is bound.
        if unsafe { rdma_listen(listen_id, LISTEN_BACKLOG) } != 0 {
            unsafe {
                rdma_destroy_id(listen_id);
                rdma_destroy_event_channel(ec);
            }
            return Err(RdmaError::Sys("rdma_listen"));
        }

        // SAFETY: ec is live; its fd stays valid until destroy.
        unsafe { set_nonblocking((*ec).fd) };

        info!(
            "[rdma] Listening on {}:{} (cq_depth={}, pollers={})",
            cfg.rdma_bind, cfg.rdma_port, CQ_DEPTH, cfg.rdma_pollers
        );

        let shared = Arc::new(Shared {
            cfg: cfg.clone(),
            cache,
            running: AtomicBool::new(true),
            ec,
            listen_id,
            verbs: Mutex::new(Verbs {
                pd: ptr::null_mut(),
                comp_ch: ptr::null_mut(),
                cq: ptr::null_mut(),
            }),
            conns: Mutex::new(HashMap::new()),
        });

        let cm_shared = shared.clone();
        let cm_thread = thread::Builder::new()
            .name("rdma-cm".to_string())
            .spawn(move || cm_event_loop(cm_shared))
            .map_err(|_| RdmaError::Sys("spawn"))?;

        let mut pollers = Vec::with_capacity(cfg.rdma_pollers);
        for i in 0..cfg.rdma_pollers {
            let poll_shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("rdma-cq-{}", i))
                .spawn(move || cq_poller_loop(poll_shared))
                .map_err(|_| RdmaError::Sys("spawn"))?;
            pollers.push(handle);
        }

        Ok(Self {
            shared,
            cm_thread: Some(cm_thread),
            pollers,
        })
    }

    /// Joins the threads, releases live connections, then destroys the
    /// verbs objects and CM resources in dependency order.
    pub fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(t) = self.cm_thread.take() {
            let _ = t.join();
        }
        for t in self.pollers.drain(..) {
            let _ = t.join();
        }

        self.shared.conns.lock().clear();

        let mut verbs = self.shared.verbs.lock();
        unsafe {
            if !verbs.cq.is_null() {
                ibv_destroy_cq(verbs.cq);
                verbs.cq = ptr::null_mut();
            }
            if !verbs.comp_ch.is_null() {
                ibv_destroy_comp_channel(verbs.comp_ch);
                verbs.comp_ch = ptr::null_mut();
            }
            if !verbs.pd.is_null() {
                ibv_dealloc_pd(verbs.pd);
                verbs.pd = ptr::null_mut();
            }
        }
        drop(verbs);

        // SAFETY: both threads are joined; nothing else touches these.
        unsafe {
            rdma_destroy_id(self.shared.listen_id);
            rdma_destroy_event_channel(self.shared.ec);
        }

        info!("[rdma] Stopped");
    }
}

impl Drop for RdmaServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn cm_event_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        // SAFETY: ec is live until stop(), which joins this thread first.
        if !poll_fd(unsafe { (*shared.ec).fd }, POLL_INTERVAL_MS) {
            continue;
        }
        let mut ev: *mut rdma_cm_event = ptr::null_mut();
        // SAFETY: ec live; nonblocking fd was reported readable.
        if unsafe { rdma_get_cm_event(shared.ec, &mut ev) } != 0 {
            continue;
        }
        // SAFETY: ev is a valid event until acked; copy what we need first.
        let (event, id) = unsafe { ((*ev).event, (*ev).id) };
        unsafe { rdma_ack_cm_event(ev) };

        match event {
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => {
                handle_connect_request(&shared, id)
            }
            rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => handle_disconnect(&shared, id),
            _ => {}
        }
    }
}

fn handle_connect_request(shared: &Arc<Shared>, id: *mut rdma_cm_id) {
    let (pd, cq) = {
        let mut verbs = shared.verbs.lock();
        if verbs.pd.is_null() {
            // SAFETY: id carries the device context for this HCA.
            let ctx = unsafe { (*id).verbs };
            let pd = unsafe { ibv_alloc_pd(ctx) };
            if pd.is_null() {
                error!("[rdma] ibv_alloc_pd failed");
                unsafe { rdma_reject(id, ptr::null(), 0) };
                return;
            }
            let comp_ch = unsafe { ibv_create_comp_channel(ctx) };
            if comp_ch.is_null() {
                error!("[rdma] ibv_create_comp_channel failed");
                unsafe { rdma_reject(id, ptr::null(), 0) };
                return;
            }
            // SAFETY: comp_ch checked non-null.
            unsafe { set_nonblocking((*comp_ch).fd) };
            let cq = unsafe { ibv_create_cq(ctx, CQ_DEPTH, ptr::null_mut(), comp_ch, 0) };
            if cq.is_null() {
                error!("[rdma] ibv_create_cq failed");
                unsafe { rdma_reject(id, ptr::null(), 0) };
                return;
            }
            unsafe { ibv_req_notify_cq(cq, 0) };
            verbs.pd = pd;
            verbs.comp_ch = comp_ch;
            verbs.cq = cq;
        }
        (verbs.pd, verbs.cq)
    };

    let mut qp_attr: ibv_qp_init_attr = unsafe { std::mem::zeroed() };
    qp_attr.send_cq = cq;
    qp_attr.recv_cq = cq;
    qp_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
    qp_attr.cap.max_send_wr = QP_MAX_WR;
    qp_attr.cap.max_recv_wr = QP_MAX_WR;
    qp_attr.cap.max_send_sge = 1;
    qp_attr.cap.max_recv_sge = 1;

    // SAFETY: id, pd live; attr valid for the call.
    if unsafe { rdma_create_qp(id, pd, &mut qp_attr) } != 0 {
        error!("[rdma] rdma_create_qp failed");
        unsafe { rdma_reject(id, ptr::null(), 0) };
        return;
    }

    let conn = RdmaConnection::new(id, pd, shared.cfg.clone(), shared.cache.clone());
    if conn.init().is_err() {
        error!("[rdma] connection init failed");
        unsafe {
            rdma_destroy_qp(id);
            rdma_reject(id, ptr::null(), 0);
        }
        return;
    }

    let mut param: rdma_conn_param = unsafe { std::mem::zeroed() };
    param.initiator_depth = 1;
    param.responder_resources = 1;
    param.rnr_retry_count = 7;

    // SAFETY: id has a QP and posted RECVs.
    if unsafe { rdma_accept(id, &mut param) } != 0 {
        error!("[rdma] rdma_accept failed");
        unsafe { rdma_destroy_qp(id) };
        return;
    }

    let qpn = conn.qp_num();
    shared.conns.lock().insert(qpn, conn);
    info!("[rdma] Accepted connection qp_num={}", qpn);
}

fn handle_disconnect(shared: &Arc<Shared>, id: *mut rdma_cm_id) {
    // SAFETY: id is valid until rdma_destroy_id below.
    let qp = unsafe { (*id).qp };
    let qpn = if qp.is_null() {
        0
    } else {
        unsafe { (*qp).qp_num }
    };

    if let Some(conn) = shared.conns.lock().remove(&qpn) {
        conn.close();
    }
    // Outstanding completions flush through the CQ; the work items keep
    // the connection itself alive until the pollers reap them.
    unsafe {
        if !qp.is_null() {
            rdma_destroy_qp(id);
        }
        rdma_destroy_id(id);
    }
    info!("[rdma] Disconnected qp_num={}", qpn);
}

fn cq_poller_loop(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        let comp_ch = shared.verbs.lock().comp_ch;
        if comp_ch.is_null() {
            // No connection has arrived yet.
            thread::sleep(Duration::from_millis(POLL_INTERVAL_MS as u64));
            continue;
        }
        // SAFETY: comp_ch stays valid until stop() joins this thread.
        if !poll_fd(unsafe { (*comp_ch).fd }, POLL_INTERVAL_MS) {
            continue;
        }

        let mut cq: *mut ibv_cq = ptr::null_mut();
        let mut cq_ctx: *mut c_void = ptr::null_mut();
        // SAFETY: comp_ch reported readable.
        if unsafe { ibv_get_cq_event(comp_ch, &mut cq, &mut cq_ctx) } != 0 {
            continue;
        }
        // SAFETY: cq came from the event; ack before re-arming.
        unsafe {
            ibv_ack_cq_events(cq, 1);
            ibv_req_notify_cq(cq, 0);
        }

        loop {
            let mut wcs: [ibv_wc; POLL_BATCH] = unsafe { std::mem::zeroed() };
            // SAFETY: wcs has POLL_BATCH slots.
            let n = unsafe { ibv_poll_cq(cq, POLL_BATCH as i32, wcs.as_mut_ptr()) };
            if n < 0 {
                error!("[rdma] ibv_poll_cq error");
                break;
            }
            if n == 0 {
                break;
            }
            for wc in &wcs[..n as usize] {
                dispatch_completion(wc);
            }
        }
    }
}

fn dispatch_completion(wc: &ibv_wc) {
    // SAFETY: wr_id is always a Work boxed at post time; each completion
    // reclaims its work item exactly once.
    let work = unsafe { Box::from_raw(wc.wr_id as *mut Work) };
    let conn = work.conn.clone();

    if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
        warn!("[rdma] CQE status {} wr_id {}", wc.status, wc.wr_id);
        conn.on_completion_failed(work);
        return;
    }

    match work.kind {
        WorkKind::Recv => conn.on_recv_complete(work, wc.byte_len),
        WorkKind::Send => conn.on_send_complete(work),
    }
}

fn poll_fd(fd: i32, timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pfd is a valid pollfd for the call duration.
    let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    rc > 0 && (pfd.revents & libc::POLLIN) != 0
}

// SAFETY contract: fd must be an open descriptor.
unsafe fn set_nonblocking(fd: i32) {
    let flags = libc::fcntl(fd, libc::F_GETFL);
    if flags >= 0 {
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}
