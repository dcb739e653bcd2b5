// Copyright (C) 2024 the rtpush developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-SSRC flow state: the reordering queue and the worker task that
//! drives packets through the attached stage chain.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::rtp::{BufferPool, Packet};
use crate::stage::{Stage, StageItem};
use crate::Error;

/// Reorder window, in packets. An arrival more than this far ahead of the
/// next expected sequence number declares the gap lost.
pub(crate) const REORDER_CAPACITY: u16 = 200;

/// Bound of the per-session receive queue. The reader never blocks on a
/// full queue; it drops.
const RECEIVE_QUEUE_CAPACITY: usize = 200;

/// How often at most a loss summary is logged per session.
const LOSS_LOG_WINDOW: Duration = Duration::from_secs(60);

/// One RTP flow, keyed by SSRC in the server's flow table.
///
/// The session is a handle; packet processing happens on a dedicated
/// worker task that pulls from the receive queue through the reorder
/// queue and runs the attached stage chain. The chain lives behind a
/// mutex so an `attach` cannot race a release from the worker.
pub struct Session {
    ssrc: u32,
    addr: SocketAddr,
    created: chrono::DateTime<chrono::Utc>,
    epoch: Instant,
    last_active_ms: AtomicU64,
    tx: mpsc::Sender<Packet>,
    close_tx: watch::Sender<bool>,
    chain_ready_tx: watch::Sender<bool>,
    chain: Mutex<Option<Box<dyn Stage>>>,
    err_tx: Mutex<Option<oneshot::Sender<Error>>>,
    err_rx: Mutex<Option<oneshot::Receiver<Error>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Creates the session handle and its (not yet spawned) worker.
    /// `first_seq` seeds the next expected sequence number.
    pub(crate) fn new(
        ssrc: u32,
        addr: SocketAddr,
        first_seq: u16,
        pool: Arc<BufferPool>,
    ) -> (Arc<Session>, SessionWorker) {
        let (tx, rx) = mpsc::channel(RECEIVE_QUEUE_CAPACITY);
        let (close_tx, close_rx) = watch::channel(false);
        let (chain_ready_tx, chain_ready_rx) = watch::channel(false);
        let (err_tx, err_rx) = oneshot::channel();
        let session = Arc::new(Session {
            ssrc,
            addr,
            created: chrono::Utc::now(),
            epoch: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            tx,
            close_tx,
            chain_ready_tx,
            chain: Mutex::new(None),
            err_tx: Mutex::new(Some(err_tx)),
            err_rx: Mutex::new(Some(err_rx)),
            worker: Mutex::new(None),
        });
        let worker = SessionWorker {
            session: session.clone(),
            rx,
            closed: close_rx,
            chain_ready: chain_ready_rx,
            queue: ReorderQueue::new(first_seq, REORDER_CAPACITY),
            pool,
        };
        (session, worker)
    }

    #[inline]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// The remote address the flow was first seen from.
    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn created(&self) -> chrono::DateTime<chrono::Utc> {
        self.created
    }

    /// Replaces the stage chain, releasing any displaced one. The worker
    /// holds packets until the first chain is attached.
    pub fn attach(&self, stage: Box<dyn Stage>) {
        let old = self.chain.lock().unwrap().replace(stage);
        if let Some(mut old) = old {
            old.release();
        }
        self.chain_ready_tx.send_replace(true);
    }

    /// Signals the worker to stop. Idempotent.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Resolves when the session ends: `Ok` on an orderly close, `Err`
    /// with the stage chain's error otherwise.
    pub async fn wait(&self) -> Result<(), Error> {
        let err_rx = self.err_rx.lock().unwrap().take();
        let mut close_rx = self.close_tx.subscribe();
        match err_rx {
            Some(err_rx) => {
                tokio::select! {
                    biased;
                    r = err_rx => match r {
                        Ok(e) => Err(e),
                        Err(_) => Ok(()),
                    },
                    _ = close_rx.wait_for(|closed| *closed) => Ok(()),
                }
            }
            None => {
                let _ = close_rx.wait_for(|closed| *closed).await;
                Ok(())
            }
        }
    }

    /// Non-blocking enqueue from the reader; hands the packet back when
    /// the queue is full.
    pub(crate) fn enqueue(&self, pkt: Packet) -> Result<(), Packet> {
        self.tx.try_send(pkt).map_err(|e| match e {
            mpsc::error::TrySendError::Full(pkt) => pkt,
            mpsc::error::TrySendError::Closed(pkt) => pkt,
        })
    }

    pub(crate) fn touch(&self) {
        self.last_active_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    pub(crate) fn set_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub(crate) fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().unwrap().take()
    }

    fn release_chain(&self) {
        let old = self.chain.lock().unwrap().take();
        if let Some(mut old) = old {
            old.release();
        }
    }

    fn send_error(&self, e: Error) {
        if let Some(tx) = self.err_tx.lock().unwrap().take() {
            let _ = tx.send(e);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("ssrc", &self.ssrc)
            .field("addr", &self.addr)
            .field("created", &self.created)
            .finish()
    }
}

/// The task half of a session.
pub(crate) struct SessionWorker {
    session: Arc<Session>,
    rx: mpsc::Receiver<Packet>,
    closed: watch::Receiver<bool>,
    chain_ready: watch::Receiver<bool>,
    queue: ReorderQueue,
    pool: Arc<BufferPool>,
}

impl SessionWorker {
    /// Runs until the session closes or the stage chain fails. Every
    /// packet buffer goes back to the pool no matter how the loop ends.
    pub(crate) async fn run(mut self) -> Result<(), Error> {
        let result = match self.wait_for_chain().await {
            true => self.process_loop().await,
            false => Ok(()),
        };

        for pkt in self.queue.drain() {
            self.pool.put(pkt.into_buffer());
        }
        while let Ok(pkt) = self.rx.try_recv() {
            self.pool.put(pkt.into_buffer());
        }
        self.session.release_chain();
        if let Err(e) = &result {
            warn!(
                "session ssrc={:08x}: stage chain failed: {e}",
                self.session.ssrc()
            );
            self.session.send_error(e.clone());
        }
        self.session.close();
        result
    }

    /// Packets are held (and eventually dropped by backpressure) until the
    /// owner attaches a chain; returns false if the session closed first.
    async fn wait_for_chain(&mut self) -> bool {
        let mut chain_ready = self.chain_ready.clone();
        tokio::select! {
            biased;
            _ = self.closed.wait_for(|closed| *closed) => false,
            r = chain_ready.wait_for(|ready| *ready) => r.is_ok(),
        }
    }

    async fn process_loop(&mut self) -> Result<(), Error> {
        let mut last_seq: Option<u16> = None;
        let mut lost: u64 = 0;
        let mut window_start = Instant::now();

        loop {
            let pkt = match self.pull().await {
                Some(pkt) => pkt,
                None => return Ok(()),
            };

            let seq = pkt.sequence_number();
            if let Some(last) = last_seq {
                let gap = seq.wrapping_sub(last);
                if gap > 1 {
                    lost += u64::from(gap) - 1;
                }
            }
            last_seq = Some(seq);
            if lost > 0 && window_start.elapsed() >= LOSS_LOG_WINDOW {
                info!(
                    "session ssrc={:08x}: lost {} packets in the last {}s, current seq {:04x}",
                    self.session.ssrc(),
                    lost,
                    window_start.elapsed().as_secs(),
                    seq
                );
                lost = 0;
                window_start = Instant::now();
            }

            let result = {
                let mut chain = self.session.chain.lock().unwrap();
                let mut item = StageItem::Packet(pkt);
                let result = match chain.as_mut() {
                    Some(stage) => stage.process(&mut item),
                    None => Ok(()),
                };
                if let StageItem::Packet(pkt) = item {
                    self.pool.put(pkt.into_buffer());
                }
                result
            };
            result?;
        }
    }

    /// Delivers the next packet in sequence order, or `None` once the
    /// session is closed.
    async fn pull(&mut self) -> Option<Packet> {
        if let Some(pkt) = self.queue.pop_ready() {
            self.recycle_discarded();
            return Some(pkt);
        }
        self.recycle_discarded();
        loop {
            let pkt = match self.queue.take_pending() {
                Some(pkt) => pkt,
                None => {
                    tokio::select! {
                        biased;
                        _ = self.closed.wait_for(|closed| *closed) => return None,
                        received = self.rx.recv() => received?,
                    }
                }
            };
            let emitted = self.queue.accept(pkt);
            self.recycle_discarded();
            if let Some(pkt) = emitted {
                return Some(pkt);
            }
        }
    }

    fn recycle_discarded(&mut self) {
        for pkt in self.queue.take_discarded() {
            self.pool.put(pkt.into_buffer());
        }
    }
}

/// Sequence-number reordering over a fixed ring of future packets.
///
/// The ring is anchored by `head_seq`, the sequence number the slot at
/// `offset` corresponds to; a buffered packet `s` lives at slot
/// `(offset + (s - head_seq)) % capacity`. `expected` may run ahead of
/// `head_seq` (in-order packets are emitted without touching the ring);
/// the head is realigned lazily before the ring is read or written. All
/// sequence arithmetic is modulo 2^16.
pub(crate) struct ReorderQueue {
    expected: u16,
    head_seq: u16,
    ring: Vec<Option<Packet>>,
    offset: u16,
    count: u16,
    capacity: u16,
    pending: Option<Packet>,
    discarded: Vec<Packet>,
}

/// True if `a` precedes `b` in wrap-around sequence order.
fn seq_before(a: u16, b: u16) -> bool {
    let d = b.wrapping_sub(a);
    d != 0 && d < 0x8000
}

impl ReorderQueue {
    pub(crate) fn new(first_seq: u16, capacity: u16) -> Self {
        let mut ring = Vec::new();
        ring.resize_with(usize::from(capacity), || None);
        Self {
            expected: first_seq,
            head_seq: first_seq.wrapping_add(1),
            ring,
            offset: 0,
            count: 0,
            capacity,
            pending: None,
            discarded: Vec::new(),
        }
    }

    /// Pops the head slot if the next expected packet is buffered there.
    pub(crate) fn pop_ready(&mut self) -> Option<Packet> {
        self.align_head_to(self.expected);
        if self.head_seq != self.expected {
            return None;
        }
        let pkt = self.pop_slot()?;
        debug_assert_eq!(pkt.sequence_number(), self.expected);
        self.expected = self.expected.wrapping_add(1);
        Some(pkt)
    }

    /// Takes the lookahead packet stashed by a loss drain.
    pub(crate) fn take_pending(&mut self) -> Option<Packet> {
        self.pending.take()
    }

    /// Packets displaced as duplicates or stale entries, for recycling.
    pub(crate) fn take_discarded(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.discarded)
    }

    /// Offers one arrival. Returns the packet to emit now, if any;
    /// otherwise the arrival was buffered for later.
    pub(crate) fn accept(&mut self, pkt: Packet) -> Option<Packet> {
        debug_assert!(self.pending.is_none());
        let delta = pkt.sequence_number().wrapping_sub(self.expected);
        if delta == 0 {
            self.expected = self.expected.wrapping_add(1);
            return Some(pkt);
        }
        if delta <= self.capacity {
            self.align_head_to(self.expected.wrapping_add(1));
            let rel = pkt.sequence_number().wrapping_sub(self.head_seq);
            debug_assert!(rel < self.capacity);
            let idx = usize::from((self.offset + rel) % self.capacity);
            if let Some(displaced) = self.ring[idx].replace(pkt) {
                self.discarded.push(displaced);
            } else {
                self.count += 1;
            }
            return None;
        }

        // Too far ahead: everything between `expected` and this arrival is
        // declared lost. Drain what the ring holds, oldest first; the
        // arrival waits as the lookahead. Emitted sequence numbers keep
        // moving forward; the stream restarts at the jump target once the
        // ring is empty.
        while self.count > 0 {
            if let Some(buffered) = self.pop_slot() {
                if seq_before(self.expected, buffered.sequence_number()) {
                    self.expected = buffered.sequence_number().wrapping_add(1);
                    self.pending = Some(pkt);
                    return Some(buffered);
                }
                self.discarded.push(buffered);
            }
        }
        self.expected = pkt.sequence_number().wrapping_add(1);
        self.head_seq = self.expected;
        Some(pkt)
    }

    /// Everything still buffered, for cleanup.
    pub(crate) fn drain(&mut self) -> Vec<Packet> {
        let mut out: Vec<Packet> = self.ring.iter_mut().filter_map(Option::take).collect();
        out.extend(self.pending.take());
        out.append(&mut self.discarded);
        self.count = 0;
        out
    }

    /// Walks the head forward until it corresponds to `target`, shedding
    /// empty slots and stale duplicates along the way. No-op when the head
    /// is already at or past the target; O(1) when the ring is empty.
    fn align_head_to(&mut self, target: u16) {
        if self.count == 0 {
            self.head_seq = target;
            return;
        }
        while seq_before(self.head_seq, target) {
            if let Some(stale) = self.pop_slot() {
                self.discarded.push(stale);
            }
        }
    }

    /// Unconditionally consumes the head slot and advances the anchor.
    fn pop_slot(&mut self) -> Option<Packet> {
        let pkt = self.ring[usize::from(self.offset)].take();
        self.offset = (self.offset + 1) % self.capacity;
        self.head_seq = self.head_seq.wrapping_add(1);
        if pkt.is_some() {
            self.count -= 1;
        }
        pkt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::MAX_PACKET_SIZE;
    use crate::stage::testutil::Recorder;

    fn pkt(seq: u16) -> Packet {
        crate::rtp::PacketBuilder {
            sequence_number: seq,
            timestamp: u32::from(seq) * 3000,
            ssrc: 0xDEAD_BEEF,
            payload_type: 96,
            mark: false,
        }
        .build([0u8; 10])
        .unwrap()
    }

    /// Mimics the worker's pull loop over a fixed arrival order: each
    /// "pull" checks the ring head once, then feeds lookahead/arrivals
    /// into `accept` until something is emitted.
    fn run_queue(queue: &mut ReorderQueue, arrivals: Vec<Packet>) -> Vec<u16> {
        let mut out = Vec::new();
        let mut arrivals = arrivals.into_iter();
        'pull: loop {
            if let Some(p) = queue.pop_ready() {
                out.push(p.sequence_number());
                continue 'pull;
            }
            loop {
                let candidate = match queue.take_pending().or_else(|| arrivals.next()) {
                    Some(c) => c,
                    None => break 'pull,
                };
                let emitted = queue.accept(candidate);
                let _ = queue.take_discarded();
                if let Some(p) = emitted {
                    out.push(p.sequence_number());
                    continue 'pull;
                }
            }
        }
        out
    }

    #[test]
    fn in_order_passthrough() {
        let mut q = ReorderQueue::new(1000, 8);
        let emitted = run_queue(&mut q, (1000..1005).map(pkt).collect());
        assert_eq!(emitted, vec![1000, 1001, 1002, 1003, 1004]);
    }

    #[test]
    fn reorders_within_window() {
        let mut q = ReorderQueue::new(1000, 8);
        let order = [1000u16, 1002, 1001, 1005, 1003, 1004];
        let emitted = run_queue(&mut q, order.iter().copied().map(pkt).collect());
        assert_eq!(emitted, vec![1000, 1001, 1002, 1003, 1004, 1005]);
    }

    #[test]
    fn every_permutation_of_a_window_emits_in_order() {
        let seqs = [0u16, 1, 2, 3];
        let mut perms = Vec::new();
        permute(&seqs, &mut vec![], &mut perms);
        for perm in perms {
            let mut q = ReorderQueue::new(0, 8);
            let emitted = run_queue(&mut q, perm.iter().copied().map(pkt).collect());
            assert_eq!(emitted, vec![0, 1, 2, 3], "arrival order {perm:?}");
        }
    }

    fn permute(rest: &[u16], prefix: &mut Vec<u16>, out: &mut Vec<Vec<u16>>) {
        if rest.is_empty() {
            out.push(prefix.clone());
            return;
        }
        for (i, &s) in rest.iter().enumerate() {
            let mut rest = rest.to_vec();
            rest.remove(i);
            prefix.push(s);
            permute(&rest, prefix, out);
            prefix.pop();
        }
    }

    #[test]
    fn sequence_numbers_wrap() {
        let mut q = ReorderQueue::new(0xFFFE, 8);
        let order = [0xFFFEu16, 0x0000, 0xFFFF, 0x0001];
        let emitted = run_queue(&mut q, order.iter().copied().map(pkt).collect());
        assert_eq!(emitted, vec![0xFFFE, 0xFFFF, 0x0000, 0x0001]);
    }

    #[test]
    fn far_jump_declares_loss_and_restarts() {
        let mut q = ReorderQueue::new(100, 8);
        let order = [100u16, 102, 500];
        let emitted = run_queue(&mut q, order.iter().copied().map(pkt).collect());
        // The buffered packet drains first, then the sequence restarts at
        // the jump target.
        assert_eq!(emitted, vec![100, 102, 500]);
        // In-order delivery continues from there.
        assert_eq!(q.accept(pkt(501)).unwrap().sequence_number(), 501);
    }

    #[test]
    fn far_jump_with_empty_ring() {
        let mut q = ReorderQueue::new(100, 8);
        let emitted = run_queue(&mut q, [100u16, 400].iter().copied().map(pkt).collect());
        assert_eq!(emitted, vec![100, 400]);
    }

    #[test]
    fn duplicate_is_discarded() {
        let mut q = ReorderQueue::new(10, 8);
        assert!(q.accept(pkt(12)).is_none());
        assert!(q.accept(pkt(12)).is_none());
        assert_eq!(q.take_discarded().len(), 1);
        let emitted = run_queue(&mut q, vec![pkt(10), pkt(11)]);
        assert_eq!(emitted, vec![10, 11, 12]);
    }

    #[test]
    fn drain_returns_everything_buffered() {
        let mut q = ReorderQueue::new(0, 8);
        assert!(q.accept(pkt(2)).is_none());
        assert!(q.accept(pkt(5)).is_none());
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
    }

    fn pooled_packet(pool: &BufferPool, seq: u16, payload_len: usize) -> Packet {
        let mut raw = Vec::new();
        raw.extend_from_slice(&[2 << 6, 96]);
        raw.extend_from_slice(&seq.to_be_bytes());
        raw.extend_from_slice(&(u32::from(seq) * 3000).to_be_bytes());
        raw.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        raw.extend_from_slice(&vec![0xAB; payload_len]);
        let mut buf = pool.take();
        buf.resize(MAX_PACKET_SIZE, 0);
        buf[..raw.len()].copy_from_slice(&raw);
        buf.truncate(raw.len());
        Packet::parse(buf).unwrap()
    }

    fn test_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn eventually<F: Fn() -> bool>(what: &str, f: F) {
        for _ in 0..200 {
            if f() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn worker_orders_packets_and_recycles_buffers() {
        let pool = Arc::new(BufferPool::new());
        let (session, worker) = Session::new(0xDEAD_BEEF, test_addr(), 1000, pool.clone());
        let recorder = Recorder::new();
        let packets = recorder.packets.clone();
        session.attach(Box::new(recorder));
        let handle = tokio::spawn(worker.run());

        for seq in [1000u16, 1002, 1001] {
            session.enqueue(pooled_packet(&pool, seq, 10)).unwrap();
        }
        let seen = packets.clone();
        eventually("three packets", move || seen.lock().unwrap().len() == 3).await;
        assert_eq!(
            packets
                .lock()
                .unwrap()
                .iter()
                .map(|(seq, _, _)| *seq)
                .collect::<Vec<_>>(),
            vec![1000, 1001, 1002]
        );

        session.close();
        handle.await.unwrap().unwrap();
        session.wait().await.unwrap();
        assert_eq!(pool.idle(), pool.allocated());
    }

    #[tokio::test]
    async fn stage_error_surfaces_and_closes_session() {
        struct Failing;
        impl Stage for Failing {
            fn process(&mut self, _item: &mut StageItem) -> Result<(), Error> {
                Err(wrap!(crate::ErrorInt::ConnectionClosed))
            }
            fn attach(&mut self, _next: Box<dyn Stage>) {}
            fn release(&mut self) {}
        }

        let pool = Arc::new(BufferPool::new());
        let (session, worker) = Session::new(1, test_addr(), 5, pool.clone());
        session.attach(Box::new(Failing));
        let handle = tokio::spawn(worker.run());
        session.enqueue(pooled_packet(&pool, 5, 4)).unwrap();

        let err = session.wait().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ConnectionClosed);
        handle.await.unwrap().unwrap_err();
        assert_eq!(pool.idle(), pool.allocated());
    }

    #[tokio::test]
    async fn close_before_attach_drains_cleanly() {
        let pool = Arc::new(BufferPool::new());
        let (session, worker) = Session::new(2, test_addr(), 0, pool.clone());
        let handle = tokio::spawn(worker.run());
        session.enqueue(pooled_packet(&pool, 0, 8)).unwrap();
        session.enqueue(pooled_packet(&pool, 1, 8)).unwrap();
        session.close();
        handle.await.unwrap().unwrap();
        assert_eq!(pool.idle(), pool.allocated());
        session.wait().await.unwrap();
    }
}
