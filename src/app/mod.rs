//! The I/O driver.
//!
//! A current-thread tokio runtime feeds socket bytes into the engine and
//! pumps its queued output back to the wire. Every engine access happens
//! inside a short synchronous lock scope, so the core stays the cooperative
//! single-threaded machine it is designed as; the tasks here only move
//! bytes.

pub mod args;
pub mod logger;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Notify};

use crate::admin::Command;
use crate::config::{self, Config};
use crate::errors::Error;
use crate::pool::janitor::FULL_MAINT_PERIOD;
use crate::pool::sched::ServerAddr;
use crate::pool::{Bouncer, CoreEvent, PauseMode, SocketId};
use crate::utils::clock;

/// Read chunk size: the engine expects modest whole-packet-or-more chunks.
const READ_BUF_SIZE: usize = 2048;

struct Shared {
    core: Mutex<Bouncer>,
    writers: Mutex<HashMap<SocketId, mpsc::UnboundedSender<BytesMut>>>,
    wakeups: Mutex<HashMap<SocketId, Arc<Notify>>>,
    stop: watch::Sender<bool>,
}

pub async fn run(cli: args::Args) -> Result<(), Error> {
    let mut bouncer = Bouncer::new(Config::default());
    config::load_config(&mut bouncer, &cli.config_file, false)?;
    config::users_check(&mut bouncer);

    let listen_addr = bouncer.cf.listen_addr.clone();
    let listen_port = bouncer.cf.listen_port;
    let unix_dir = bouncer.cf.unix_socket_dir.clone();

    let (stop_tx, stop_rx) = watch::channel(false);
    let shared = Arc::new(Shared {
        core: Mutex::new(bouncer),
        writers: Mutex::new(HashMap::new()),
        wakeups: Mutex::new(HashMap::new()),
        stop: stop_tx,
    });

    let tcp = TcpListener::bind((listen_addr.as_str(), listen_port)).await?;
    info!("listening on {listen_addr}:{listen_port}");
    tokio::spawn(accept_tcp(shared.clone(), tcp, stop_rx.clone()));

    if !unix_dir.is_empty() {
        let path = format!("{unix_dir}/.s.PGSQL.{listen_port}");
        let _ = std::fs::remove_file(&path);
        match UnixListener::bind(&path) {
            Ok(listener) => {
                info!("listening on unix:{path}");
                tokio::spawn(accept_unix(shared.clone(), listener, stop_rx.clone()));
            }
            Err(err) => warn!("cannot listen on unix:{path}: {err}"),
        }
    }

    tokio::spawn(janitor_loop(shared.clone(), stop_rx.clone()));
    tokio::spawn(signal_loop(shared.clone()));

    let mut stop_rx = stop_rx;
    while !*stop_rx.borrow() {
        if stop_rx.changed().await.is_err() {
            break;
        }
    }
    info!("event loop stopped");
    Ok(())
}

/// Run one engine operation, then a scheduler pass, then move any queued
/// output toward the wire.
fn with_core(shared: &Arc<Shared>, f: impl FnOnce(&mut Bouncer)) {
    let mut core = shared.core.lock();
    f(&mut core);
    core.per_loop_maint(clock::now_usec());
    pump(shared, &mut core);
}

/// Drain the engine's flush list and event queue.
fn pump(shared: &Arc<Shared>, core: &mut Bouncer) {
    for id in core.take_flush_list() {
        let paused = core.sockets.get(id).map(|s| s.sbuf.is_paused());
        if let Some(sock) = core.sockets.get_mut(id) {
            let out = sock.sbuf.take_output();
            if !out.is_empty() {
                if let Some(tx) = shared.writers.lock().get(&id) {
                    let _ = tx.send(out);
                }
            }
        }
        if paused == Some(false) {
            if let Some(wakeup) = shared.wakeups.lock().get(&id) {
                wakeup.notify_one();
            }
        }
    }

    for event in core.take_events() {
        match event {
            CoreEvent::ConnectServer { server } => {
                tokio::spawn(connect_server(shared.clone(), server));
            }
            CoreEvent::SocketClosed {
                socket,
                final_output,
                reason,
                ..
            } => {
                debug!("driver: {socket:?} closed ({reason})");
                if !final_output.is_empty() {
                    if let Some(tx) = shared.writers.lock().get(&socket) {
                        let _ = tx.send(final_output);
                    }
                }
                // Dropping the sender lets the writer flush and exit.
                shared.writers.lock().remove(&socket);
                if let Some(wakeup) = shared.wakeups.lock().remove(&socket) {
                    wakeup.notify_one();
                }
            }
            CoreEvent::PauseDone { mode } => match mode {
                PauseMode::Pause => info!("pause complete"),
                PauseMode::Suspend => info!("suspend complete, sockets are quiesced"),
                PauseMode::None => info!("paused databases are drained"),
            },
            CoreEvent::LoopBreak => {
                let _ = shared.stop.send(true);
            }
        }
    }
}

async fn accept_tcp(shared: Arc<Shared>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let (rd, wr) = stream.into_split();
                    tokio::spawn(client_task(shared.clone(), rd, wr, peer.to_string()));
                }
                Err(err) => {
                    warn!("accept failed: {err}");
                }
            },
            _ = stop.changed() => return,
        }
    }
}

async fn accept_unix(shared: Arc<Shared>, listener: UnixListener, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let (rd, wr) = stream.into_split();
                    tokio::spawn(client_task(shared.clone(), rd, wr, "unix".to_string()));
                }
                Err(err) => {
                    warn!("accept failed: {err}");
                }
            },
            _ = stop.changed() => return,
        }
    }
}

async fn client_task<R, W>(shared: Arc<Shared>, rd: R, wr: W, addr: String)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut client_id = None;
    with_core(&shared, |core| {
        client_id = core.accept_client(addr, clock::now_usec());
    });
    let Some(id) = client_id else {
        return;
    };
    let writer = register_socket(&shared, id, wr);
    pump_socket(shared, id, rd, writer, false).await;
}

async fn connect_server(shared: Arc<Shared>, server: SocketId) {
    let addr = shared.core.lock().server_dial_addr(server);
    let Some(addr) = addr else {
        with_core(&shared, |core| core.server_connect_failed(server));
        return;
    };

    match addr {
        ServerAddr::Tcp(ip, port) => match TcpStream::connect((ip, port)).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let (rd, wr) = stream.into_split();
                // Register the writer first: login (or a one-shot cancel
                // packet) goes out the moment the engine learns of the
                // connection.
                let writer = register_socket(&shared, server, wr);
                with_core(&shared, |core| {
                    core.server_connected(server, clock::now_usec())
                });
                pump_socket(shared, server, rd, writer, true).await;
            }
            Err(err) => {
                error!("connect to {ip}:{port} failed: {err}");
                with_core(&shared, |core| core.server_connect_failed(server));
            }
        },
        ServerAddr::Unix(path) => match UnixStream::connect(&path).await {
            Ok(stream) => {
                let (rd, wr) = stream.into_split();
                let writer = register_socket(&shared, server, wr);
                with_core(&shared, |core| {
                    core.server_connected(server, clock::now_usec())
                });
                pump_socket(shared, server, rd, writer, true).await;
            }
            Err(err) => {
                error!("connect to unix:{path} failed: {err}");
                with_core(&shared, |core| core.server_connect_failed(server));
            }
        },
    }
}

struct RegisteredWriter {
    wakeup: Arc<Notify>,
    handle: tokio::task::JoinHandle<()>,
}

/// Wire a socket's writer channel and read-wakeup into the registry.
fn register_socket<W>(shared: &Arc<Shared>, id: SocketId, wr: W) -> RegisteredWriter
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<BytesMut>();
    let wakeup = Arc::new(Notify::new());
    shared.writers.lock().insert(id, tx);
    shared.wakeups.lock().insert(id, wakeup.clone());
    RegisteredWriter {
        wakeup,
        handle: tokio::spawn(write_loop(rx, wr)),
    }
}

/// Move bytes between one real socket and its engine-side buffer until
/// either side goes away.
async fn pump_socket<R>(shared: Arc<Shared>, id: SocketId, mut rd: R, writer: RegisteredWriter, is_server: bool)
where
    R: AsyncRead + Unpin,
{
    let RegisteredWriter { wakeup, handle } = writer;

    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        enum Gate {
            Gone,
            Paused,
            Open,
        }
        let gate = {
            let core = shared.core.lock();
            match core.sockets.get(id) {
                None => Gate::Gone,
                Some(sock) if sock.sbuf.is_paused() => Gate::Paused,
                Some(_) => Gate::Open,
            }
        };
        match gate {
            Gate::Gone => break,
            Gate::Paused => {
                wakeup.notified().await;
                continue;
            }
            Gate::Open => {}
        }

        match rd.read(&mut buf).await {
            Ok(0) | Err(_) => {
                with_core(&shared, |core| {
                    if !core.sockets.contains(id) {
                        return;
                    }
                    if is_server {
                        core.server_gone(id);
                    } else {
                        core.client_gone(id);
                    }
                });
                break;
            }
            Ok(n) => {
                let now = clock::now_usec();
                with_core(&shared, |core| {
                    if is_server {
                        core.server_data(id, &buf[..n], now);
                    } else {
                        core.client_data(id, &buf[..n], now);
                    }
                });
            }
        }
    }

    shared.writers.lock().remove(&id);
    shared.wakeups.lock().remove(&id);
    let _ = handle.await;
}

async fn write_loop<W>(mut rx: mpsc::UnboundedReceiver<BytesMut>, mut wr: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        if wr.write_all(&chunk).await.is_err() {
            return;
        }
    }
    let _ = wr.shutdown().await;
}

/// Fixed-cadence janitor tick.
async fn janitor_loop(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(Duration::from_micros(FULL_MAINT_PERIOD));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                with_core(&shared, |core| core.do_full_maint(clock::now_usec()));
            }
            _ = stop.changed() => return,
        }
    }
}

async fn signal_loop(shared: Arc<Shared>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("got SIGINT, shutting down gracefully");
    with_core(&shared, |core| {
        let _ = core.admin_command(Command::Shutdown, clock::now_usec());
    });
}
