// Copyright (C) 2024 the rtpush developers
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The UDP ingress server: reads datagrams, demultiplexes them by SSRC
//! into sessions, and sweeps out idle flows.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::rtp::{BufferPool, Packet, MAX_PACKET_SIZE};
use crate::session::Session;
use crate::{Error, ErrorInt};

/// How many newly created sessions may wait for an `accept` call before
/// further unknown flows are turned away.
const ACCEPT_QUEUE_CAPACITY: usize = 1;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum State {
    Ready,
    Running,
    Stopping,
}

/// UDP server terminating many concurrent RTP flows.
///
/// Lifecycle: `Ready` --`serve`--> `Running` --`close`--> back to `Ready`.
/// The reader task owns the socket: it parses each datagram, looks up (or
/// admits) the flow's session, and enqueues the packet without ever
/// blocking; a second task sweeps out sessions idle longer than
/// `active_timeout`.
pub struct Server {
    addr: SocketAddr,
    active_timeout: Option<Duration>,
    pool: Arc<BufferPool>,
    sessions: Arc<DashMap<u32, Arc<Session>>>,
    state: Mutex<State>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    accept_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Arc<Session>>>>,
}

impl Server {
    /// `active_timeout` of `None` disables the idle sweeper's closing.
    pub fn new(addr: SocketAddr, active_timeout: Option<Duration>) -> Server {
        Server {
            addr,
            active_timeout,
            pool: Arc::new(BufferPool::new()),
            sessions: Arc::new(DashMap::new()),
            state: Mutex::new(State::Ready),
            local_addr: Mutex::new(None),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            accept_rx: tokio::sync::Mutex::new(None),
        }
    }

    /// The bound address, once running. Differs from the configured
    /// address when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Binds the socket and spawns the reader and the idle sweeper.
    /// Returns once the server is running; fails with `AlreadyRunning` if
    /// it is not in the ready state.
    pub async fn serve(&self) -> Result<(), Error> {
        let socket = UdpSocket::bind(self.addr).await.map_err(|source| {
            wrap!(ErrorInt::Io {
                context: format!("binding {}", self.addr),
                source,
            })
        })?;
        let local_addr = socket.local_addr().map_err(|source| {
            wrap!(ErrorInt::Io {
                context: "reading bound address".to_owned(),
                source,
            })
        })?;

        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Ready {
                bail!(ErrorInt::AlreadyRunning);
            }
            *state = State::Running;
        }

        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        *self.accept_rx.lock().await = Some(accept_rx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);
        *self.local_addr.lock().unwrap() = Some(local_addr);
        info!("rtp server listening: addr={local_addr}");

        let reader = tokio::spawn(read_loop(
            socket,
            self.pool.clone(),
            self.sessions.clone(),
            accept_tx,
            shutdown_rx.clone(),
        ));
        let sweeper = tokio::spawn(sweep_loop(
            self.sessions.clone(),
            self.active_timeout,
            shutdown_rx,
        ));
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(reader);
        tasks.push(sweeper);
        Ok(())
    }

    /// Blocks for the next newly admitted session. Fails with
    /// `ServerClosed` once shutdown begins (or if the server never ran).
    pub async fn accept(&self) -> Result<Arc<Session>, Error> {
        let mut shutdown_rx = {
            let shutdown = self.shutdown.lock().unwrap();
            match shutdown.as_ref() {
                Some(tx) => tx.subscribe(),
                None => bail!(ErrorInt::ServerClosed),
            }
        };
        let mut guard = self.accept_rx.lock().await;
        let rx = match guard.as_mut() {
            Some(rx) => rx,
            None => bail!(ErrorInt::ServerClosed),
        };
        tokio::select! {
            biased;
            session = rx.recv() => match session {
                Some(session) => Ok(session),
                None => Err(wrap!(ErrorInt::ServerClosed)),
            },
            _ = shutdown_rx.wait_for(|closed| *closed) => Err(wrap!(ErrorInt::ServerClosed)),
        }
    }

    /// Stops the reader and sweeper, closes every session, waits for all
    /// of their tasks to quiesce, and returns the server to the ready
    /// state.
    pub async fn close(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Running {
                bail!(ErrorInt::ServerClosed);
            }
            *state = State::Stopping;
        }
        if let Some(shutdown) = self.shutdown.lock().unwrap().as_ref() {
            shutdown.send_replace(true);
        }
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }

        let sessions: Vec<Arc<Session>> =
            self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in sessions {
            session.close();
            if let Some(worker) = session.take_worker() {
                let _ = worker.await;
            }
        }
        self.sessions.clear();

        *self.accept_rx.lock().await = None;
        *self.shutdown.lock().unwrap() = None;
        *self.local_addr.lock().unwrap() = None;
        *self.state.lock().unwrap() = State::Ready;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }
}

async fn read_loop(
    socket: UdpSocket,
    pool: Arc<BufferPool>,
    sessions: Arc<DashMap<u32, Arc<Session>>>,
    accept_tx: mpsc::Sender<Arc<Session>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut buf = pool.take();
        buf.resize(MAX_PACKET_SIZE, 0);
        let (n, peer) = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => {
                pool.put(buf);
                break;
            }
            received = socket.recv_from(&mut buf[..]) => match received {
                Ok(x) => x,
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    pool.put(buf);
                    continue;
                }
                Err(e) => {
                    error!("udp receive failed: {e}");
                    pool.put(buf);
                    break;
                }
            },
        };
        buf.truncate(n);

        let pkt = match Packet::parse(buf) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!("dropping datagram from {peer}: {e:?}");
                let (_, buf) = e.into_parts();
                pool.put(buf);
                continue;
            }
        };

        let ssrc = pkt.ssrc();
        // The lookup guard must drop before a possible insert below.
        let existing = sessions.get(&ssrc).map(|e| e.value().clone());
        let session = match existing {
            Some(existing) => existing,
            None => {
                let (session, worker) =
                    Session::new(ssrc, peer, pkt.sequence_number(), pool.clone());
                match accept_tx.try_send(session.clone()) {
                    Ok(()) => {
                        info!("new session ssrc={ssrc:08x} from {peer}");
                        sessions.insert(ssrc, session.clone());
                        let sessions = sessions.clone();
                        let handle = {
                            let session = session.clone();
                            tokio::spawn(async move {
                                let _ = worker.run().await;
                                sessions.remove(&session.ssrc());
                            })
                        };
                        session.set_worker(handle);
                        session
                    }
                    Err(_) => {
                        debug!(
                            "accept queue full, turning away new flow ssrc={ssrc:08x} from {peer}"
                        );
                        pool.put(pkt.into_buffer());
                        continue;
                    }
                }
            }
        };

        session.touch();
        if let Err(pkt) = session.enqueue(pkt) {
            debug!(
                "receive queue full for ssrc={ssrc:08x}, dropping seq={:04x}",
                pkt.sequence_number()
            );
            pool.put(pkt.into_buffer());
        }
    }
}

async fn sweep_loop(
    sessions: Arc<DashMap<u32, Arc<Session>>>,
    active_timeout: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => break,
            _ = tick.tick() => {}
        }
        let Some(timeout) = active_timeout else {
            continue;
        };
        let idle: Vec<Arc<Session>> = sessions
            .iter()
            .filter(|e| e.value().idle_for() > timeout)
            .map(|e| e.value().clone())
            .collect();
        for session in idle {
            info!(
                "closing idle session ssrc={:08x} (created {})",
                session.ssrc(),
                session.created().format("%FT%T%.3f")
            );
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::testutil::Recorder;
    use crate::ErrorKind;
    use tokio::time::timeout;

    async fn send_rtp(
        socket: &UdpSocket,
        target: SocketAddr,
        ssrc: u32,
        seq: u16,
        ts: u32,
        payload: &[u8],
    ) {
        let mut raw = vec![2 << 6, 96];
        raw.extend_from_slice(&seq.to_be_bytes());
        raw.extend_from_slice(&ts.to_be_bytes());
        raw.extend_from_slice(&ssrc.to_be_bytes());
        raw.extend_from_slice(payload);
        socket.send_to(&raw, target).await.unwrap();
    }

    async fn client() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    fn test_server(active_timeout: Option<Duration>) -> Server {
        Server::new("127.0.0.1:0".parse().unwrap(), active_timeout)
    }

    #[tokio::test]
    async fn single_datagram_creates_one_session() {
        let server = test_server(None);
        server.serve().await.unwrap();
        let target = server.local_addr().unwrap();
        let client = client().await;

        send_rtp(&client, target, 0xDEAD_BEEF, 1000, 90_000, &[0x11; 10]).await;
        let session = timeout(Duration::from_secs(2), server.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.ssrc(), 0xDEAD_BEEF);

        let recorder = Recorder::new();
        let packets = recorder.packets.clone();
        session.attach(Box::new(recorder));
        for _ in 0..200 {
            if packets.lock().unwrap().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        {
            let seen = packets.lock().unwrap();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].0, 1000);
            assert_eq!(seen[0].2.len(), 10);
        }
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_and_wrong_version_datagrams_are_dropped() {
        let server = test_server(None);
        server.serve().await.unwrap();
        let target = server.local_addr().unwrap();
        let client = client().await;

        client.send_to(&[0x80, 0x00], target).await.unwrap(); // too short
        let mut v1 = vec![1 << 6, 96];
        v1.extend_from_slice(&[0u8; 10]); // version 1
        client.send_to(&v1, target).await.unwrap();

        let accepted = timeout(Duration::from_millis(300), server.accept()).await;
        assert!(accepted.is_err(), "no session should have been created");
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn serve_twice_is_already_running() {
        let server = test_server(None);
        server.serve().await.unwrap();
        let err = server.serve().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyRunning);
        server.close().await.unwrap();
        // The server returns to ready and can run again.
        server.serve().await.unwrap();
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn admission_control_drops_second_unaccepted_flow() {
        let server = test_server(None);
        server.serve().await.unwrap();
        let target = server.local_addr().unwrap();
        let client = client().await;

        // Nobody is waiting in accept(), so the single accept-queue slot
        // takes the first flow and the second is turned away.
        send_rtp(&client, target, 1, 1, 0, &[0u8; 4]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        send_rtp(&client, target, 2, 1, 0, &[0u8; 4]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let first = timeout(Duration::from_secs(1), server.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.ssrc(), 1);
        let second = timeout(Duration::from_millis(300), server.accept()).await;
        assert!(second.is_err(), "second flow should have been dropped");
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn idle_sessions_are_closed_and_new_flows_still_accepted() {
        let server = test_server(Some(Duration::from_millis(100)));
        server.serve().await.unwrap();
        let target = server.local_addr().unwrap();
        let client = client().await;

        send_rtp(&client, target, 0xAAAA, 1, 0, &[0u8; 4]).await;
        let first = timeout(Duration::from_secs(2), server.accept())
            .await
            .unwrap()
            .unwrap();
        // The sweeper runs once per second; the idle session must be
        // closed shortly after.
        timeout(Duration::from_secs(3), first.wait())
            .await
            .unwrap()
            .unwrap();

        send_rtp(&client, target, 0xBBBB, 1, 0, &[0u8; 4]).await;
        let second = timeout(Duration::from_secs(2), server.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.ssrc(), 0xBBBB);
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_returns_buffers_and_fails_further_accepts() {
        let server = test_server(None);
        server.serve().await.unwrap();
        let target = server.local_addr().unwrap();
        let client = client().await;

        send_rtp(&client, target, 7, 100, 0, &[1u8; 16]).await;
        let session = timeout(Duration::from_secs(2), server.accept())
            .await
            .unwrap()
            .unwrap();
        let recorder = Recorder::new();
        let packets = recorder.packets.clone();
        session.attach(Box::new(recorder));
        for seq in 101u16..110 {
            send_rtp(&client, target, 7, seq, 0, &[1u8; 16]).await;
        }
        for _ in 0..200 {
            if packets.lock().unwrap().len() >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        server.close().await.unwrap();
        let err = server.accept().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerClosed);
        assert_eq!(server.pool().idle(), server.pool().allocated());
    }
}
