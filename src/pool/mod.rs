//! The pooling engine: socket/pool/database/user objects, their lifecycle
//! state machines, and the context that owns them all.
//!
//! Everything here is synchronous and single-threaded: one event loop owns
//! every socket, and the I/O driver feeds events in and pumps the queued
//! output back out.

pub mod janitor;
pub mod objects;
pub mod sched;


use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};
use log::{info, warn};

use crate::config::Config;
use crate::errors::Error;
use crate::messages;
use crate::sbuf::SBuf;
use crate::utils::tracebuf::TraceBuf;
use crate::vars::VarCache;

use objects::{Arena, Id};

pub type SocketId = Id<PgSocket>;
pub type PoolId = Id<PgPool>;
pub type DbId = Id<PgDatabase>;
pub type UserId = Id<PgUser>;

/// Upper bound on the cached welcome message.
pub const WELCOME_MSG_MAX: usize = 8 * 1024;

/// Cap on buffered bytes from a socket that has not completed login.
pub const LOGIN_RECV_MAX: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockState {
    ClJustConnect,
    ClLogin,
    ClWaiting,
    ClActive,
    ClCancel,
    SvLogin,
    SvIdle,
    SvActive,
    SvUsed,
    SvTested,
}

impl SockState {
    pub fn is_server(self) -> bool {
        matches!(
            self,
            SockState::SvLogin
                | SockState::SvIdle
                | SockState::SvActive
                | SockState::SvUsed
                | SockState::SvTested
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PauseMode {
    /// Normal operation.
    #[default]
    None,
    /// Finish in-flight queries, drop idle servers, keep clients.
    Pause,
    /// Quiesce all I/O for an online restart.
    Suspend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shutdown {
    #[default]
    No,
    /// Graceful shutdown requested; waiting for servers to drain.
    Requested,
    /// Event loop has been asked to stop.
    Done,
}

/// Where a database's backend lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    /// Unix socket directory; empty means the configured default.
    Unix { dir: String },
    Tcp { ip: Ipv4Addr },
}

/// What the engine asks of the I/O driver.
#[derive(Debug)]
pub enum CoreEvent {
    /// Dial the backend for this freshly created server socket.
    ConnectServer { server: SocketId },
    /// The socket has been closed and freed; flush these last bytes and
    /// stop pumping it.
    SocketClosed {
        socket: SocketId,
        is_server: bool,
        reason: String,
        final_output: BytesMut,
    },
    /// PAUSE/SUSPEND has drained; the admin side may acknowledge.
    PauseDone { mode: PauseMode },
    /// Graceful shutdown complete; stop the event loop.
    LoopBreak,
}

/// One client or server connection.
pub struct PgSocket {
    pub state: SockState,
    /// Paired socket while actively exchanging; both ends always point at
    /// each other.
    pub link: Option<SocketId>,
    pub pool: Option<PoolId>,
    pub vars: VarCache,
    pub cancel_key: [u8; 8],
    pub connect_time: u64,
    /// When the last byte arrived.
    pub request_time: u64,
    /// When the current query started waiting for a server.
    pub query_start: u64,
    /// Server sits at ReadyForQuery with nothing in flight.
    pub ready: bool,
    pub suspended: bool,
    /// Client authenticated before the pool learned its welcome message.
    pub wait_for_welcome: bool,
    /// Server must be recycled once it returns to idle.
    pub close_needed: bool,
    /// Server dialed only to forward a cancel request.
    pub for_cancel: bool,
    /// Server busy applying session variables for its next client.
    pub setting_vars: bool,
    /// connect_query has been issued on this new server.
    pub connect_query_sent: bool,
    pub sbuf: SBuf,
    pub trace: Option<TraceBuf>,
    /// Inbound bytes not yet parsed.
    pub recv: BytesMut,
    /// Bytes of the current packet already committed to the peer.
    pub fwd_remaining: usize,
    /// Client bytes held back until a server is linked.
    pub pending: BytesMut,
    pub addr: String,
    pub login_user: String,
    pub login_db: String,
    pub auth_salt: [u8; 4],
}

impl PgSocket {
    fn new(state: SockState, addr: String, now: u64, trace: bool) -> PgSocket {
        PgSocket {
            state,
            link: None,
            pool: None,
            vars: VarCache::new(),
            cancel_key: [0u8; 8],
            connect_time: now,
            request_time: now,
            query_start: 0,
            ready: false,
            suspended: false,
            wait_for_welcome: false,
            close_needed: false,
            for_cancel: false,
            setting_vars: false,
            connect_query_sent: false,
            sbuf: SBuf::new(),
            trace: trace.then(TraceBuf::new),
            recv: BytesMut::new(),
            fwd_remaining: 0,
            pending: BytesMut::new(),
            addr,
            login_user: String::new(),
            login_db: String::new(),
            auth_salt: [0u8; 4],
        }
    }

    pub fn new_client(addr: String, now: u64, trace: bool) -> PgSocket {
        PgSocket::new(SockState::ClJustConnect, addr, now, trace)
    }

    pub fn new_server(addr: String, now: u64, trace: bool) -> PgSocket {
        PgSocket::new(SockState::SvLogin, addr, now, trace)
    }
}

/// The server connections dedicated to one `(database, user)` pair, plus
/// the clients using them.
pub struct PgPool {
    pub db: DbId,
    pub user: UserId,

    /// Clients bound to a server or holding an idle prompt.
    pub active_client_list: VecDeque<SocketId>,
    /// Clients queued for a server, dispatched in insertion order.
    pub waiting_client_list: VecDeque<SocketId>,
    /// Transient cancel-request connections.
    pub cancel_req_list: VecDeque<SocketId>,

    /// Servers linked to a client.
    pub active_server_list: VecDeque<SocketId>,
    /// Clean servers ready for assignment; the head is the warmest.
    pub idle_server_list: VecDeque<SocketId>,
    /// Servers returned since the last recheck.
    pub used_server_list: VecDeque<SocketId>,
    /// Servers running the reset query.
    pub tested_server_list: VecDeque<SocketId>,
    /// Servers dialing or authenticating.
    pub new_server_list: VecDeque<SocketId>,

    pub welcome_msg: BytesMut,
    pub welcome_msg_ready: bool,
    /// Session defaults observed from the reference server login.
    pub orig_vars: VarCache,
    /// Rate-limits lifetime kills so the pool does not expire together.
    pub last_lifetime_disconnect: u64,
}

impl PgPool {
    fn new(db: DbId, user: UserId) -> PgPool {
        PgPool {
            db,
            user,
            active_client_list: VecDeque::new(),
            waiting_client_list: VecDeque::new(),
            cancel_req_list: VecDeque::new(),
            active_server_list: VecDeque::new(),
            idle_server_list: VecDeque::new(),
            used_server_list: VecDeque::new(),
            tested_server_list: VecDeque::new(),
            new_server_list: VecDeque::new(),
            welcome_msg: BytesMut::new(),
            welcome_msg_ready: false,
            orig_vars: VarCache::new(),
            last_lifetime_disconnect: 0,
        }
    }

    pub fn client_count(&self) -> usize {
        self.active_client_list.len()
            + self.waiting_client_list.len()
            + self.cancel_req_list.len()
    }

    pub fn server_count(&self) -> usize {
        self.active_server_list.len()
            + self.idle_server_list.len()
            + self.used_server_list.len()
            + self.tested_server_list.len()
            + self.new_server_list.len()
    }

    pub fn all_servers(&self) -> Vec<SocketId> {
        self.new_server_list
            .iter()
            .chain(self.active_server_list.iter())
            .chain(self.idle_server_list.iter())
            .chain(self.used_server_list.iter())
            .chain(self.tested_server_list.iter())
            .copied()
            .collect()
    }
}

pub struct PgDatabase {
    pub name: String,
    /// Database name on the backend.
    pub dbname: String,
    pub location: DbLocation,
    pub port: u16,
    /// Prebuilt StartupMessage key/value tail, starting with `database`.
    pub startup_params: BytesMut,
    pub forced_user: Option<UserId>,
    pub pool_size: i32,
    pub res_pool_size: i32,
    pub max_client_conn: i32,
    pub connect_query: Option<String>,
    /// Materialized from the `*` template.
    pub db_auto: bool,
    /// Scheduled for removal after a reload.
    pub db_dead: bool,
    pub db_paused: bool,
    /// When the auto-database went idle; zero while in use.
    pub inactive_time: u64,
}

impl PgDatabase {
    fn new(name: &str) -> PgDatabase {
        PgDatabase {
            name: name.to_string(),
            dbname: String::new(),
            location: DbLocation::Unix { dir: String::new() },
            port: 5432,
            startup_params: BytesMut::new(),
            forced_user: None,
            pool_size: -2,
            res_pool_size: -1,
            max_client_conn: -2,
            connect_query: None,
            db_auto: false,
            db_dead: false,
            db_paused: false,
            inactive_time: 0,
        }
    }
}

pub struct PgUser {
    pub name: String,
    /// Plaintext or an `md5` hex digest. Empty marks the user disabled
    /// after a reload dropped it from the auth file.
    pub passwd: String,
}

impl PgUser {
    pub fn disabled(&self) -> bool {
        self.passwd.is_empty()
    }
}

/// The whole process state: arenas, global lists and settings.
pub struct Bouncer {
    pub cf: Config,

    pub sockets: Arena<PgSocket>,
    pub pools: Arena<PgPool>,
    pub databases: Arena<PgDatabase>,
    pub users: Arena<PgUser>,

    pub pool_list: Vec<PoolId>,
    pub database_list: Vec<DbId>,
    /// Idle auto-databases in non-decreasing `inactive_time` order.
    pub autodatabase_idle_list: VecDeque<DbId>,
    /// Clients still doing the protocol handshake.
    pub login_client_list: VecDeque<SocketId>,

    user_lookup: HashMap<String, UserId>,
    client_count: usize,

    pub pause_mode: PauseMode,
    pub suspend_start: u64,
    pub shutdown: Shutdown,
    pause_done_sent: bool,

    pub auth_stat: Option<crate::config::users::FileInfo>,

    events: Vec<CoreEvent>,
    flush_list: Vec<SocketId>,
}

impl Bouncer {
    pub fn new(cf: Config) -> Bouncer {
        Bouncer {
            cf,
            sockets: Arena::new(),
            pools: Arena::new(),
            databases: Arena::new(),
            users: Arena::new(),
            pool_list: Vec::new(),
            database_list: Vec::new(),
            autodatabase_idle_list: VecDeque::new(),
            login_client_list: VecDeque::new(),
            user_lookup: HashMap::new(),
            client_count: 0,
            pause_mode: PauseMode::None,
            suspend_start: 0,
            shutdown: Shutdown::No,
            pause_done_sent: false,
            auth_stat: None,
            events: Vec::new(),
            flush_list: Vec::new(),
        }
    }

    /// Drain the driver-facing event queue.
    pub fn take_events(&mut self) -> Vec<CoreEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn push_event(&mut self, event: CoreEvent) {
        self.events.push(event);
    }

    /// Sockets whose send queue or pause flag changed since the last drain.
    pub fn take_flush_list(&mut self) -> Vec<SocketId> {
        std::mem::take(&mut self.flush_list)
    }

    pub fn client_count(&self) -> usize {
        self.client_count
    }

    pub(crate) fn note_client_opened(&mut self) {
        self.client_count += 1;
    }

    // ------------------------------------------------------------------
    // Databases and users
    // ------------------------------------------------------------------

    pub fn database(&self, id: DbId) -> &PgDatabase {
        self.databases.get(id).expect("stale database id")
    }

    pub fn find_database_id(&self, name: &str) -> Option<DbId> {
        self.database_list
            .iter()
            .chain(self.autodatabase_idle_list.iter())
            .copied()
            .find(|&id| self.databases.get(id).map(|db| db.name == name).unwrap_or(false))
    }

    /// Find a live database, pulling an idle auto-database back into
    /// service when a client shows up for it.
    pub fn find_or_wake_database(&mut self, name: &str) -> Option<DbId> {
        if let Some(&id) = self
            .database_list
            .iter()
            .find(|&&id| self.databases.get(id).map(|db| db.name == name).unwrap_or(false))
        {
            return Some(id);
        }
        let pos = self.autodatabase_idle_list.iter().position(|&id| {
            self.databases.get(id).map(|db| db.name == name).unwrap_or(false)
        })?;
        let id = self.autodatabase_idle_list.remove(pos)?;
        if let Some(db) = self.databases.get_mut(id) {
            db.inactive_time = 0;
        }
        self.database_list.push(id);
        Some(id)
    }

    pub fn add_database(&mut self, name: &str) -> DbId {
        let id = self.databases.alloc(PgDatabase::new(name));
        self.database_list.push(id);
        id
    }

    pub fn find_user_id(&self, name: &str) -> Option<UserId> {
        self.user_lookup.get(name).copied()
    }

    /// Insert or update an auth-file user.
    pub fn add_user(&mut self, name: &str, passwd: &str) -> UserId {
        if let Some(&id) = self.user_lookup.get(name) {
            if let Some(user) = self.users.get_mut(id) {
                user.passwd = passwd.to_string();
            }
            return id;
        }
        let id = self.users.alloc(PgUser {
            name: name.to_string(),
            passwd: passwd.to_string(),
        });
        self.user_lookup.insert(name.to_string(), id);
        id
    }

    /// Clear every auth-file password ahead of a reload, so entries gone
    /// from the file stop authenticating.
    pub fn disable_users(&mut self) {
        let ids: Vec<UserId> = self.user_lookup.values().copied().collect();
        for id in ids {
            if let Some(user) = self.users.get_mut(id) {
                user.passwd.clear();
            }
        }
    }

    /// Create or update the standalone user a database forces connections
    /// under. Forced users are not in the auth-file lookup.
    pub fn force_user(&mut self, db_id: DbId, name: &str, passwd: &str) {
        let existing = self.databases.get(db_id).and_then(|db| db.forced_user);
        match existing {
            Some(user_id) => {
                if let Some(user) = self.users.get_mut(user_id) {
                    user.name = name.to_string();
                    user.passwd = passwd.to_string();
                }
            }
            None => {
                let user_id = self.users.alloc(PgUser {
                    name: name.to_string(),
                    passwd: passwd.to_string(),
                });
                if let Some(db) = self.databases.get_mut(db_id) {
                    db.forced_user = Some(user_id);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Pools
    // ------------------------------------------------------------------

    pub fn get_pool(&mut self, db: DbId, user: UserId) -> PoolId {
        if let Some(&id) = self.pool_list.iter().find(|&&id| {
            self.pools
                .get(id)
                .map(|p| p.db == db && p.user == user)
                .unwrap_or(false)
        }) {
            return id;
        }
        let id = self.pools.alloc(PgPool::new(db, user));
        self.pool_list.push(id);
        id
    }

    pub fn get_active_server_count(&self) -> usize {
        self.pool_list
            .iter()
            .filter_map(|&id| self.pools.get(id))
            .map(|p| p.active_server_list.len())
            .sum()
    }

    // ------------------------------------------------------------------
    // Socket plumbing
    // ------------------------------------------------------------------

    /// Queue bytes on a socket and mark it for the driver to flush.
    pub fn sock_send(&mut self, id: SocketId, data: &[u8]) -> Result<(), Error> {
        let Some(sock) = self.sockets.get_mut(id) else {
            return Err(Error::Socket("send on freed socket".into()));
        };
        sock.sbuf.queue(data)?;
        self.flush_list.push(id);
        Ok(())
    }

    pub fn sock_resume(&mut self, id: SocketId) {
        if let Some(sock) = self.sockets.get_mut(id) {
            sock.sbuf.resume();
            self.flush_list.push(id);
        }
    }

    fn remove_from_current_list(&mut self, id: SocketId) {
        let Some(sock) = self.sockets.get(id) else {
            return;
        };
        let state = sock.state;
        let pool_id = sock.pool;
        match state {
            SockState::ClJustConnect | SockState::ClLogin => {
                remove_id(&mut self.login_client_list, id);
            }
            _ => {
                let Some(pool) = pool_id.and_then(|p| self.pools.get_mut(p)) else {
                    return;
                };
                let list = match state {
                    SockState::ClWaiting => &mut pool.waiting_client_list,
                    SockState::ClActive => &mut pool.active_client_list,
                    SockState::ClCancel => &mut pool.cancel_req_list,
                    SockState::SvLogin => &mut pool.new_server_list,
                    SockState::SvIdle => &mut pool.idle_server_list,
                    SockState::SvActive => &mut pool.active_server_list,
                    SockState::SvUsed => &mut pool.used_server_list,
                    SockState::SvTested => &mut pool.tested_server_list,
                    SockState::ClJustConnect | SockState::ClLogin => unreachable!(),
                };
                remove_id(list, id);
            }
        }
    }

    fn push_to_current_list(&mut self, id: SocketId) {
        let Some(sock) = self.sockets.get(id) else {
            return;
        };
        let state = sock.state;
        let pool_id = sock.pool;
        match state {
            SockState::ClJustConnect | SockState::ClLogin => {
                self.login_client_list.push_back(id);
            }
            _ => {
                let Some(pool) = pool_id.and_then(|p| self.pools.get_mut(p)) else {
                    warn!("socket in pool state without a pool");
                    return;
                };
                match state {
                    SockState::ClWaiting => pool.waiting_client_list.push_back(id),
                    SockState::ClActive => pool.active_client_list.push_back(id),
                    SockState::ClCancel => pool.cancel_req_list.push_back(id),
                    SockState::SvLogin => pool.new_server_list.push_back(id),
                    // Latest released first: keeps warm servers hot.
                    SockState::SvIdle => pool.idle_server_list.push_front(id),
                    SockState::SvActive => pool.active_server_list.push_back(id),
                    SockState::SvUsed => pool.used_server_list.push_back(id),
                    SockState::SvTested => pool.tested_server_list.push_back(id),
                    SockState::ClJustConnect | SockState::ClLogin => unreachable!(),
                }
            }
        }
    }

    pub fn change_client_state(&mut self, id: SocketId, new_state: SockState) {
        debug_assert!(!new_state.is_server());
        self.remove_from_current_list(id);
        if let Some(sock) = self.sockets.get_mut(id) {
            sock.state = new_state;
        }
        self.push_to_current_list(id);
    }

    pub fn change_server_state(&mut self, id: SocketId, new_state: SockState) {
        debug_assert!(new_state.is_server());
        self.remove_from_current_list(id);
        if let Some(sock) = self.sockets.get_mut(id) {
            sock.state = new_state;
        }
        self.push_to_current_list(id);
    }

    /// Pair a client with a server. The two ends always point at each
    /// other until `unbind`.
    pub fn bind(&mut self, client_id: SocketId, server_id: SocketId) {
        let (client, server) = self
            .sockets
            .get2_mut(client_id, server_id)
            .expect("bind on freed sockets");
        debug_assert!(client.link.is_none() && server.link.is_none());
        client.link = Some(server_id);
        server.link = Some(client_id);
    }

    pub fn unbind(&mut self, server_id: SocketId) {
        let Some(client_id) = self.sockets.get(server_id).and_then(|s| s.link) else {
            return;
        };
        if let Some((client, server)) = self.sockets.get2_mut(client_id, server_id) {
            client.link = None;
            server.link = None;
        }
    }

    // ------------------------------------------------------------------
    // Disconnects
    // ------------------------------------------------------------------

    /// Send the pooler's own error to a client, with a trailing
    /// ReadyForQuery when the client sits at an idle prompt.
    pub fn send_pooler_error(&mut self, client_id: SocketId, msg: &str) {
        let Some(client) = self.sockets.get(client_id) else {
            return;
        };
        if self.cf.log_pooler_errors {
            info!("C-{client_id:?} {}: pooler error: {msg}", client.addr);
        }
        let send_ready = client.state == SockState::ClActive && client.link.is_none();
        let pkt = messages::pooler_error(msg, send_ready);
        let _ = self.sock_send(client_id, &pkt);
    }

    pub fn disconnect_client(&mut self, client_id: SocketId, notice: bool, reason: &str) {
        let Some(client) = self.sockets.get(client_id) else {
            return;
        };
        debug_assert!(!client.state.is_server());
        info!("C-{client_id:?} {}: closing because: {reason}", client.addr);

        if notice {
            self.send_pooler_error(client_id, reason);
        }

        if let Some(server_id) = self.sockets.get(client_id).and_then(|c| c.link) {
            let server_ready = self
                .sockets
                .get(server_id)
                .map(|s| s.ready)
                .unwrap_or(false);
            self.unbind(server_id);
            if server_ready {
                self.release_server(server_id);
            } else {
                self.disconnect_server(server_id, true, "client disconnect");
            }
        }

        self.remove_from_current_list(client_id);
        self.finish_socket(client_id, false, reason);
    }

    pub fn disconnect_server(&mut self, server_id: SocketId, notice: bool, reason: &str) {
        let Some(server) = self.sockets.get(server_id) else {
            return;
        };
        debug_assert!(server.state.is_server());
        info!("S-{server_id:?} {}: closing because: {reason}", server.addr);

        if let Some(client_id) = server.link {
            // Notify while the link still stands, so the error is not
            // followed by a bogus ReadyForQuery.
            if notice {
                self.send_pooler_error(client_id, "connection terminated");
            }
            self.unbind(server_id);
            self.disconnect_client(client_id, false, reason);
        }

        self.remove_from_current_list(server_id);
        self.finish_socket(server_id, true, reason);
    }

    fn finish_socket(&mut self, id: SocketId, is_server: bool, reason: &str) {
        let mut final_output = BytesMut::new();
        if let Some(sock) = self.sockets.get_mut(id) {
            if let Some(trace) = &sock.trace {
                if let Some(path) = trace.dump() {
                    info!("socket trace dumped to {}", path.display());
                }
            }
            final_output = sock.sbuf.take_output();
            sock.sbuf.close();
            if !is_server {
                self.client_count = self.client_count.saturating_sub(1);
            }
        }
        self.sockets.free(id);
        self.events.push(CoreEvent::SocketClosed {
            socket: id,
            is_server,
            reason: reason.to_string(),
            final_output,
        });
    }

    // ------------------------------------------------------------------
    // Server release
    // ------------------------------------------------------------------

    /// Return a server to the pool. Active servers drop their client link;
    /// a configured check query routes them through `SV_USED` first.
    pub fn release_server(&mut self, server_id: SocketId) {
        let Some(server) = self.sockets.get(server_id) else {
            return;
        };
        debug_assert!(server.ready, "releasing a server that is not ready");
        let mut new_state = SockState::SvIdle;
        match server.state {
            SockState::SvActive => {
                self.unbind(server_id);
                if !self.cf.server_check_query.is_empty() {
                    new_state = SockState::SvUsed;
                }
            }
            SockState::SvUsed | SockState::SvTested | SockState::SvLogin => {}
            _ => {
                warn!("S-{server_id:?}: release in unexpected state");
                return;
            }
        }

        let close_needed = self
            .sockets
            .get(server_id)
            .map(|s| s.close_needed)
            .unwrap_or(false);
        if close_needed {
            self.disconnect_server(server_id, true, "database configuration changed");
            return;
        }

        self.change_server_state(server_id, new_state);
    }

    // ------------------------------------------------------------------
    // Welcome message cache
    // ------------------------------------------------------------------

    /// Record one ParameterStatus from the pool's reference login. Values
    /// the VarCache recognizes are captured there instead, so each client
    /// later sees its own settings.
    pub fn add_welcome_parameter(&mut self, pool_id: PoolId, key: &str, value: &str) {
        let Some(pool) = self.pools.get_mut(pool_id) else {
            return;
        };
        if pool.welcome_msg_ready {
            return;
        }
        if pool.welcome_msg.is_empty() {
            pool.welcome_msg.put(messages::auth_ok());
        }
        if !pool.orig_vars.set(key, value) {
            let pkt = messages::parameter_status(key, value);
            if pool.welcome_msg.len() + pkt.len() > WELCOME_MSG_MAX {
                warn!("welcome message overflow, dropping parameter {key}");
                return;
            }
            pool.welcome_msg.put(pkt);
        }
    }

    /// All startup parameters processed; the cache may now be replayed.
    pub fn finish_welcome_msg(&mut self, pool_id: PoolId) {
        let Some(pool) = self.pools.get_mut(pool_id) else {
            return;
        };
        if pool.welcome_msg_ready {
            return;
        }
        if pool.welcome_msg.is_empty() {
            pool.welcome_msg.put(messages::auth_ok());
        }
        pool.welcome_msg_ready = true;
    }

    /// Replay the cached session start to a fresh client: AuthenticationOk
    /// and ParameterStatus packets, the client's own variables, a new
    /// cancel key, and a final ReadyForQuery.
    pub fn welcome_client(&mut self, client_id: SocketId) -> bool {
        let Some(client) = self.sockets.get(client_id) else {
            return false;
        };
        let Some(pool_id) = client.pool else {
            return false;
        };
        let (welcome, orig_vars, ready) = {
            let Some(pool) = self.pools.get(pool_id) else {
                return false;
            };
            (
                pool.welcome_msg.clone(),
                pool.orig_vars.clone(),
                pool.welcome_msg_ready,
            )
        };
        if !ready {
            return false;
        }

        let cancel_key: [u8; 8] = rand::random();
        let client_vars = {
            let Some(client) = self.sockets.get_mut(client_id) else {
                return false;
            };
            client.vars.fill_unset(&orig_vars);
            client.cancel_key = cancel_key;
            client.vars.clone()
        };

        let mut msg = BytesMut::with_capacity(welcome.len() + 256);
        msg.extend_from_slice(&welcome);
        client_vars.add_params(&mut msg);
        msg.put(messages::backend_key_data(&cancel_key));
        msg.put(messages::ready_for_query(false));

        if self.sock_send(client_id, &msg).is_err() {
            warn!("unhandled failure to send welcome message");
        }
        true
    }
}

fn remove_id<T: PartialEq + Copy>(list: &mut VecDeque<T>, id: T) {
    if let Some(pos) = list.iter().position(|&x| x == id) {
        list.remove(pos);
    }
}
