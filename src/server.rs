//! Chat TCP server.
//!
//! Provides an async `run` function that listens for inbound connections,
//! pins each accepted socket to an io-pool worker, and tracks the resulting
//! sessions in a shared table until they close.

use crate::dispatch::LogicNode;
use crate::io_pool::IoPool;
use crate::session::{Session, SessionHandler};
use crate::users::UserMap;
use crate::{Connection, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum number of concurrent sessions the server will accept.
///
/// When this limit is reached, the server stops accepting connections until
/// an active session terminates.
const MAX_SESSIONS: usize = 1024;

/// Transient accept failures tolerated before the listener gives up.
const MAX_ACCEPT_RETRIES: u32 = 6;

/// A session with no inbound frame for this long is presumed dead.
const HEARTBEAT_TIMEOUT_SECS: i64 = 30;

/// Cadence of the idle-session sweep.
const WATCHDOG_PERIOD: Duration = Duration::from_secs(10);

/// All live sessions, indexed by session id.
///
/// Sessions reference this table (through an `Arc`) for their own removal,
/// and the table references sessions; keeping the table outside the server
/// struct avoids owning cycles. Critical sections are insert, lookup and
/// erase only.
#[derive(Debug, Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.inner
            .lock()
            .unwrap()
            .insert(session.id().to_string(), session);
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Clone out the current sessions so sweeps run without the lock.
    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.inner.lock().unwrap().values().cloned().collect()
    }
}

/// Server listener state. Created in the `run` call.
#[derive(Debug)]
struct Listener<'a> {
    /// TCP listener supplied by the `run` caller.
    listener: TcpListener,
    /// Worker loops; each accepted socket is pinned to the next one.
    io_pool: &'a IoPool,
    /// Live sessions by id.
    sessions: Arc<SessionTable>,
    /// uid -> session bindings, unbound on session close.
    users: Arc<UserMap>,
    /// Producer half of the logic dispatcher's queue; each session task gets
    /// a clone.
    dispatch: mpsc::UnboundedSender<LogicNode>,
    /// Limit the max number of sessions.
    ///
    /// Before accepting, a permit is acquired; when a session's task ends,
    /// the permit returns.
    limit_sessions: Arc<Semaphore>,
    /// Stop token observed by the watchdog and every session task.
    stop: CancellationToken,
    /// Used as part of the graceful shutdown process to wait for session
    /// tasks to complete. Every task holds a clone; the channel closes when
    /// the last one drops.
    shutdown_complete_tx: mpsc::Sender<()>,
}

/// Run the chat server.
///
/// Accepts connections from the supplied listener until the `shutdown`
/// future completes, then cancels the stop token and waits for every session
/// task to finish.
///
/// `tokio::signal::ctrl_c()` can be used as the `shutdown` argument.
pub async fn run(
    listener: TcpListener,
    io_pool: &IoPool,
    sessions: Arc<SessionTable>,
    users: Arc<UserMap>,
    dispatch: mpsc::UnboundedSender<LogicNode>,
    shutdown: impl Future,
) {
    let stop = CancellationToken::new();
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

    let watchdog = tokio::spawn(watchdog(Arc::clone(&sessions), stop.clone()));

    let mut server = Listener {
        listener,
        io_pool,
        sessions,
        users,
        dispatch,
        limit_sessions: Arc::new(Semaphore::new(MAX_SESSIONS)),
        stop,
        shutdown_complete_tx,
    };

    tokio::select! {
        res = server.run() => {
            // Errors here mean accepting failed repeatedly and the server is
            // giving up; individual session errors never bubble up this far.
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = shutdown => {
            info!("shutting down");
        }
    }

    // Cancelling the token wakes every session task and the watchdog;
    // dropping the final mpsc sender lets the drain below complete.
    let Listener {
        shutdown_complete_tx,
        stop,
        ..
    } = server;
    stop.cancel();
    drop(shutdown_complete_tx);

    let _ = watchdog.await;
    let _ = shutdown_complete_rx.recv().await;
}

impl Listener<'_> {
    /// Listen for inbound connections, spawning a session task per socket.
    ///
    /// # Errors
    ///
    /// Returns `Err` if accepting keeps failing after backoff; see `accept`.
    async fn run(&mut self) -> Result<()> {
        info!("accepting inbound connections");

        loop {
            // `acquire_owned` returns a permit tied to the semaphore; the
            // session task drops it when it ends. The semaphore is never
            // closed, so `unwrap()` is safe.
            let permit = self
                .limit_sessions
                .clone()
                .acquire_owned()
                .await
                .unwrap();

            let socket = self.accept().await?;

            let (session, outbound_rx) = Session::new();
            self.sessions.insert(Arc::clone(&session));
            debug!(session = session.id(), total = self.sessions.len(), "session accepted");

            let sessions = Arc::clone(&self.sessions);
            let users = Arc::clone(&self.users);
            let dispatch = self.dispatch.clone();
            let stop = self.stop.clone();
            let shutdown_complete = self.shutdown_complete_tx.clone();

            // The socket moves across threads as a std socket and is
            // re-registered with the worker's reactor, pinning the session
            // to that loop for its lifetime.
            match socket.into_std() {
                Ok(std_socket) => {
                    self.io_pool.handle().spawn(async move {
                        let _shutdown_complete = shutdown_complete;
                        session_task(
                            std_socket,
                            Arc::clone(&session),
                            outbound_rx,
                            dispatch,
                            stop,
                        )
                        .await;

                        // Cleanup: the session leaves the table, and its
                        // user binding (if login got that far) is removed.
                        session.close();
                        sessions.remove(session.id());
                        let uid = session.user_id();
                        if uid != 0 {
                            if let Err(err) = users.unbind(uid, session.id()).await {
                                warn!(uid, error = %err, "failed to unbind user");
                            }
                        }
                        drop(permit);
                    });
                }
                Err(err) => {
                    error!(cause = %err, "failed to detach accepted socket");
                    self.sessions.remove(session.id());
                }
            }
        }
    }

    /// Accept an inbound connection.
    ///
    /// Accept errors are usually transient (fd exhaustion and the like), so
    /// each failure doubles a waiting period starting at one second; once
    /// [`MAX_ACCEPT_RETRIES`] consecutive attempts have failed, the listener
    /// reports the last error and the server exits.
    async fn accept(&mut self) -> Result<TcpStream> {
        let mut attempt = 0u32;

        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => {
                    return Ok(socket);
                }
                Err(err) if attempt >= MAX_ACCEPT_RETRIES => {
                    error!(%err, attempt, "listener cannot recover, giving up");
                    return Err(err.into());
                }
                Err(err) => {
                    let wait = 1u64 << attempt;
                    warn!(%err, attempt, wait_secs = wait, "accept failed, backing off");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Body of one session's task on its worker loop.
async fn session_task(
    std_socket: std::net::TcpStream,
    session: Arc<Session>,
    outbound_rx: mpsc::Receiver<crate::frame::Frame>,
    dispatch: mpsc::UnboundedSender<LogicNode>,
    stop: CancellationToken,
) {
    let socket = match TcpStream::from_std(std_socket) {
        Ok(socket) => socket,
        Err(err) => {
            error!(cause = %err, "failed to register socket with worker loop");
            return;
        }
    };

    let mut handler = SessionHandler::new(
        Arc::clone(&session),
        Connection::new(socket),
        outbound_rx,
        dispatch,
        stop,
    );
    if let Err(err) = handler.run().await {
        // Protocol violations and transport errors land here; the session
        // dies, the process does not.
        error!(session = session.id(), cause = %err, "connection error");
    }
}

/// Periodic sweep closing sessions whose heartbeat went quiet.
async fn watchdog(sessions: Arc<SessionTable>, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(WATCHDOG_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for session in sessions.snapshot() {
                    let idle = session.idle_secs();
                    if idle > HEARTBEAT_TIMEOUT_SECS {
                        warn!(session = session.id(), idle, "closing idle session");
                        session.close();
                    }
                }
            }
            _ = stop.cancelled() => break,
        }
    }
    debug!("heartbeat watchdog stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    struct TestServer {
        addr: std::net::SocketAddr,
        sessions: Arc<SessionTable>,
        users: Arc<UserMap>,
        dispatch_rx: mpsc::UnboundedReceiver<LogicNode>,
        stop: Option<oneshot::Sender<()>>,
        done: oneshot::Receiver<()>,
    }

    async fn start_server() -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sessions = Arc::new(SessionTable::new());
        let users = Arc::new(UserMap::new());
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let table = Arc::clone(&sessions);
        let map = Arc::clone(&users);
        tokio::spawn(async move {
            let io_pool = IoPool::new(2).unwrap();
            run(listener, &io_pool, table, map, dispatch_tx, async {
                let _ = stop_rx.await;
            })
            .await;
            io_pool.shutdown();
            let _ = done_tx.send(());
        });

        TestServer {
            addr,
            sessions,
            users,
            dispatch_rx,
            stop: Some(stop_tx),
            done: done_rx,
        }
    }

    #[tokio::test]
    async fn test_oversize_frame_closes_session_without_dispatch() {
        let mut server = start_server().await;

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        let sessions = Arc::clone(&server.sessions);
        wait_until(move || sessions.len() == 1).await;

        // Header announcing 0xFFFF bytes, then the body.
        let mut bytes = vec![0x27u8, 0x0F, 0xFF, 0xFF];
        bytes.extend_from_slice(&vec![0u8; 0xFFFF]);
        // The server may slam the door while the body is still in flight.
        let _ = client.write_all(&bytes).await;

        // The server must close the socket...
        let mut sink = Vec::new();
        let _ = client.read_to_end(&mut sink).await;

        // ...remove the session, and dispatch nothing.
        let sessions = Arc::clone(&server.sessions);
        wait_until(move || sessions.is_empty()).await;
        assert!(server.dispatch_rx.try_recv().is_err());

        server.stop.take().unwrap().send(()).unwrap();
        server.done.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_removed_after_peer_disconnect() {
        let mut server = start_server().await;

        let client = TcpStream::connect(server.addr).await.unwrap();
        let sessions = Arc::clone(&server.sessions);
        wait_until(move || sessions.len() == 1).await;

        drop(client);
        let sessions = Arc::clone(&server.sessions);
        wait_until(move || sessions.is_empty()).await;
        assert!(server.users.is_empty());

        server.stop.take().unwrap().send(()).unwrap();
        server.done.await.unwrap();
    }

    #[tokio::test]
    async fn test_graceful_shutdown_closes_all_sessions() {
        let mut server = start_server().await;

        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(TcpStream::connect(server.addr).await.unwrap());
        }
        let sessions = Arc::clone(&server.sessions);
        wait_until(move || sessions.len() == 5).await;

        server.stop.take().unwrap().send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server.done)
            .await
            .expect("server did not drain in time")
            .unwrap();

        // Every client observes its socket closing.
        for mut client in clients {
            let mut sink = Vec::new();
            let n = tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut sink))
                .await
                .expect("socket not closed")
                .unwrap();
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn test_inbound_frame_reaches_dispatcher() {
        let mut server = start_server().await;

        let mut client = TcpStream::connect(server.addr).await.unwrap();
        // LoginReq frame, one byte at a time.
        let body = br#"{"uid":1001,"token":"abc"}"#;
        let mut bytes = vec![0x03u8, 0xED];
        bytes.extend_from_slice(&(body.len() as u16).to_be_bytes());
        bytes.extend_from_slice(body);
        for b in bytes {
            client.write_all(&[b]).await.unwrap();
            client.flush().await.unwrap();
        }

        let node = tokio::time::timeout(Duration::from_secs(2), server.dispatch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.frame.id, 1005);
        assert_eq!(&node.frame.body[..], body);

        drop(client);
        server.stop.take().unwrap().send(()).unwrap();
        server.done.await.unwrap();
    }
}
