//! Per-loop scheduling: pairing waiting clients with servers, launching
//! backend connections, driving the recheck cycle, and servicing pause and
//! suspend modes.

use log::debug;

use crate::messages;
use crate::vars;

use super::{
    Bouncer, CoreEvent, DbLocation, PauseMode, PgSocket, PoolId, SockState, SocketId,
};

/// Which of a pool's socket lists an operation walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockList {
    ActiveClient,
    WaitingClient,
    CancelReq,
    ActiveServer,
    IdleServer,
    UsedServer,
    TestedServer,
    NewServer,
}

/// Where the driver should dial a server socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    /// Path of the Unix socket.
    Unix(String),
    Tcp(std::net::Ipv4Addr, u16),
}

impl Bouncer {
    pub(crate) fn list_snapshot(&self, pool_id: PoolId, which: SockList) -> Vec<SocketId> {
        let Some(pool) = self.pools.get(pool_id) else {
            return Vec::new();
        };
        let list = match which {
            SockList::ActiveClient => &pool.active_client_list,
            SockList::WaitingClient => &pool.waiting_client_list,
            SockList::CancelReq => &pool.cancel_req_list,
            SockList::ActiveServer => &pool.active_server_list,
            SockList::IdleServer => &pool.idle_server_list,
            SockList::UsedServer => &pool.used_server_list,
            SockList::TestedServer => &pool.tested_server_list,
            SockList::NewServer => &pool.new_server_list,
        };
        list.iter().copied().collect()
    }

    pub(crate) fn close_server_list(&mut self, pool_id: PoolId, which: SockList, reason: &str) {
        for server_id in self.list_snapshot(pool_id, which) {
            self.disconnect_server(server_id, true, reason);
        }
    }

    pub(crate) fn close_client_list(&mut self, pool_id: PoolId, which: SockList, reason: &str) {
        for client_id in self.list_snapshot(pool_id, which) {
            self.disconnect_client(client_id, true, reason);
        }
    }

    /// The socket's dial target, resolved against the configured defaults.
    pub fn server_dial_addr(&self, server_id: SocketId) -> Option<ServerAddr> {
        let server = self.sockets.get(server_id)?;
        let pool = self.pools.get(server.pool?)?;
        let db = self.databases.get(pool.db)?;
        Some(match &db.location {
            DbLocation::Unix { dir } => {
                let dir = if dir.is_empty() {
                    &self.cf.unix_socket_dir
                } else {
                    dir
                };
                ServerAddr::Unix(format!("{}/.s.PGSQL.{}", dir, db.port))
            }
            DbLocation::Tcp { ip } => ServerAddr::Tcp(*ip, db.port),
        })
    }

    // ------------------------------------------------------------------
    // Making servers available
    // ------------------------------------------------------------------

    /// Walk the waiting clients in FIFO order and give each a server:
    /// from the idle list when possible, otherwise by finishing a recheck
    /// or dialing one new connection.
    pub fn per_loop_activate(&mut self, pool_id: PoolId, now: u64) {
        for client_id in self.list_snapshot(pool_id, SockList::WaitingClient) {
            if !self.sockets.contains(client_id) {
                continue;
            }
            let Some(pool) = self.pools.get(pool_id) else {
                return;
            };
            let idle_free = !pool.idle_server_list.is_empty();
            let testing = !pool.tested_server_list.is_empty();
            let used_free = !pool.used_server_list.is_empty();
            let welcome_ready = pool.welcome_msg_ready;

            if idle_free {
                let wait_for_welcome = self
                    .sockets
                    .get(client_id)
                    .map(|c| c.wait_for_welcome)
                    .unwrap_or(false);
                // Pool not fully initialized after reboot: the idle server
                // was inherited, so a fresh login must teach the welcome.
                if wait_for_welcome && !welcome_ready {
                    self.launch_new_connection(pool_id, now);
                    continue;
                }
                self.activate_client(client_id);
            } else if testing {
                // Wait for a recheck in flight to finish.
                break;
            } else if used_free {
                self.launch_recheck(pool_id, now);
                break;
            } else {
                self.launch_new_connection(pool_id, now);
                break;
            }
        }
    }

    /// Send the reset query on a used server if needed, or release it
    /// straight to idle.
    fn launch_recheck(&mut self, pool_id: PoolId, now: u64) {
        // Find a clean server, discarding ones that turned dirty.
        let server_id = loop {
            let first = self
                .pools
                .get(pool_id)
                .and_then(|p| p.used_server_list.front().copied());
            let Some(server_id) = first else {
                return;
            };
            let ready = self
                .sockets
                .get(server_id)
                .map(|s| s.ready)
                .unwrap_or(false);
            if ready {
                break server_id;
            }
            self.disconnect_server(server_id, true, "idle server got dirty");
        };

        let query = self.cf.server_check_query.clone();
        let mut need_check = true;
        if query.is_empty() {
            need_check = false;
        } else if self.cf.server_check_delay > 0 {
            let request_time = self
                .sockets
                .get(server_id)
                .map(|s| s.request_time)
                .unwrap_or(0);
            if now.saturating_sub(request_time) < self.cf.server_check_delay {
                need_check = false;
            }
        }

        if need_check {
            debug!("S-{server_id:?}: checking: {query}");
            self.change_server_state(server_id, SockState::SvTested);
            if let Some(server) = self.sockets.get_mut(server_id) {
                server.ready = false;
            }
            let pkt = messages::simple_query(&query);
            if self.sock_send(server_id, &pkt).is_err() {
                self.disconnect_server(server_id, false, "test query failed");
            }
        } else {
            // Make it available immediately.
            self.release_server(server_id);
        }
    }

    /// Dial one new backend connection, respecting the pool cap. Only one
    /// dial is in flight per pool at a time so a slow backend does not get
    /// a thundering herd.
    pub fn launch_new_connection(&mut self, pool_id: PoolId, now: u64) {
        let Some(pool) = self.pools.get(pool_id) else {
            return;
        };
        if !pool.new_server_list.is_empty() {
            debug!("launch_new_connection: already in progress");
            return;
        }

        // A cancel dial bypasses the cap; it never joins the pool.
        let for_cancel = !pool.cancel_req_list.is_empty();
        let db_id = pool.db;
        let total = pool.server_count();
        let Some(db) = self.databases.get(db_id) else {
            return;
        };
        if !for_cancel && db.pool_size >= 0 {
            let cap = db.pool_size + db.res_pool_size.max(0);
            if total as i32 >= cap {
                debug!("launch_new_connection: pool full ({total}/{cap})");
                return;
            }
        }

        let addr = match &db.location {
            DbLocation::Unix { dir } if dir.is_empty() => {
                format!("unix:{}", self.cf.unix_socket_dir)
            }
            DbLocation::Unix { dir } => format!("unix:{dir}"),
            DbLocation::Tcp { ip } => format!("{}:{}", ip, db.port),
        };
        let trace = self.cf.trace_connections;
        let mut server = PgSocket::new_server(addr, now, trace);
        server.pool = Some(pool_id);
        server.for_cancel = for_cancel;
        let server_id = self.sockets.alloc(server);
        if let Some(pool) = self.pools.get_mut(pool_id) {
            pool.new_server_list.push_back(server_id);
        }
        self.push_event(CoreEvent::ConnectServer { server: server_id });
    }

    /// Bind the head of the idle list to this waiting client and reconcile
    /// session variables before any of its bytes reach the server.
    pub fn activate_client(&mut self, client_id: SocketId) {
        let Some(pool_id) = self.sockets.get(client_id).and_then(|c| c.pool) else {
            return;
        };
        let Some(server_id) = self
            .pools
            .get(pool_id)
            .and_then(|p| p.idle_server_list.front().copied())
        else {
            return;
        };

        let wait_for_welcome = self
            .sockets
            .get(client_id)
            .map(|c| c.wait_for_welcome)
            .unwrap_or(false);
        if wait_for_welcome {
            if !self.welcome_client(client_id) {
                return;
            }
            if let Some(client) = self.sockets.get_mut(client_id) {
                client.wait_for_welcome = false;
            }
        }

        self.change_server_state(server_id, SockState::SvActive);
        self.change_client_state(client_id, SockState::ClActive);
        self.bind(client_id, server_id);
        self.sock_resume(client_id);

        let sql = {
            let Some((client, server)) = self.sockets.get2_mut(client_id, server_id) else {
                return;
            };
            vars::diff_sql(&client.vars, &server.vars)
        };
        match sql {
            Some(sql) => {
                if let Some(server) = self.sockets.get_mut(server_id) {
                    server.setting_vars = true;
                    server.ready = false;
                }
                let pkt = messages::simple_query(&sql);
                if self.sock_send(server_id, &pkt).is_err() {
                    self.disconnect_server(server_id, true, "varcache apply failed");
                }
            }
            None => self.forward_pending(client_id, server_id),
        }
    }

    /// Pass the client's held bytes on to its freshly linked server.
    pub(crate) fn forward_pending(&mut self, client_id: SocketId, server_id: SocketId) {
        let pending = self
            .sockets
            .get_mut(client_id)
            .map(|c| c.pending.split())
            .unwrap_or_default();
        if pending.is_empty() {
            return;
        }
        if let Some(server) = self.sockets.get_mut(server_id) {
            server.ready = false;
        }
        if self.sock_send(server_id, &pending).is_err() {
            self.disconnect_server(server_id, true, "server write failed");
        }
    }

    // ------------------------------------------------------------------
    // Pause and suspend
    // ------------------------------------------------------------------

    /// Drop restartable server connections; report how many are still
    /// finishing work.
    fn per_loop_pause(&mut self, pool_id: PoolId) -> usize {
        self.close_server_list(pool_id, SockList::IdleServer, "pause mode");
        self.close_server_list(pool_id, SockList::UsedServer, "pause mode");
        self.close_server_list(pool_id, SockList::NewServer, "pause mode");

        let Some(pool) = self.pools.get(pool_id) else {
            return 0;
        };
        pool.active_server_list.len() + pool.tested_server_list.len()
    }

    /// Park one socket's I/O. Returns whether it is quiesced; with `force`
    /// an unpausable socket is disconnected instead.
    pub fn suspend_socket(&mut self, id: SocketId, force: bool) -> bool {
        let Some(sock) = self.sockets.get_mut(id) else {
            return true;
        };
        if sock.suspended {
            return true;
        }
        let is_server = sock.state.is_server();
        // Waiting clients stay unsuspended so the activate cycle can still
        // bind them to servers freed by the suspend.
        let suspendable = sock.state != SockState::ClWaiting;
        if suspendable && sock.sbuf.is_empty() && sock.sbuf.pause() {
            sock.suspended = true;
            return true;
        }
        if !force {
            return false;
        }
        if is_server {
            self.disconnect_server(id, true, "suspend_timeout");
        } else {
            self.disconnect_client(id, true, "suspend_timeout");
        }
        true
    }

    fn suspend_socket_list(&mut self, pool_id: PoolId, which: SockList, force: bool) -> usize {
        let mut active = 0;
        for id in self.list_snapshot(pool_id, which) {
            if !self.suspend_socket(id, force) {
                active += 1;
            }
        }
        active
    }

    /// Quiesce clients first, then servers; the recheck lists hold file
    /// descriptors that cannot survive a handoff and are closed outright.
    fn per_loop_suspend(&mut self, pool_id: PoolId, force: bool, now: u64) -> usize {
        let mut active = 0;

        active += self.suspend_socket_list(pool_id, SockList::ActiveClient, force);
        active += self.suspend_socket_list(pool_id, SockList::WaitingClient, force);
        if active > 0 {
            self.per_loop_activate(pool_id, now);
        }

        if active == 0 {
            active += self.suspend_socket_list(pool_id, SockList::ActiveServer, force);
            active += self.suspend_socket_list(pool_id, SockList::IdleServer, force);

            self.close_server_list(
                pool_id,
                SockList::TestedServer,
                "close unsafe file descriptors on suspend",
            );
            self.close_server_list(
                pool_id,
                SockList::UsedServer,
                "close unsafe file descriptors on suspend",
            );
        }

        active
    }

    /// Un-suspend every socket after a RESUME.
    pub fn resume_all(&mut self) {
        for pool_id in self.pool_list.clone() {
            for which in [
                SockList::ActiveClient,
                SockList::ActiveServer,
                SockList::IdleServer,
                SockList::UsedServer,
            ] {
                for id in self.list_snapshot(pool_id, which) {
                    if let Some(sock) = self.sockets.get_mut(id) {
                        if sock.suspended {
                            sock.suspended = false;
                            self.sock_resume(id);
                        }
                    }
                }
            }
        }
    }

    /// One scheduler pass over every pool, dispatched by pause mode.
    pub fn per_loop_maint(&mut self, now: u64) {
        let mut active = 0usize;
        let mut partial_pause = false;

        let mut force_suspend = false;
        if self.pause_mode == PauseMode::Suspend && self.cf.suspend_timeout > 0 {
            if now.saturating_sub(self.suspend_start) >= self.cf.suspend_timeout {
                force_suspend = true;
            }
        }

        for pool_id in self.pool_list.clone() {
            if !self.pools.contains(pool_id) {
                continue;
            }
            match self.pause_mode {
                PauseMode::None => {
                    let db_paused = self
                        .pools
                        .get(pool_id)
                        .and_then(|p| self.databases.get(p.db))
                        .map(|db| db.db_paused)
                        .unwrap_or(false);
                    if db_paused {
                        partial_pause = true;
                        active += self.per_loop_pause(pool_id);
                    } else {
                        self.per_loop_activate(pool_id, now);
                    }
                }
                PauseMode::Pause => active += self.per_loop_pause(pool_id),
                PauseMode::Suspend => active += self.per_loop_suspend(pool_id, force_suspend, now),
            }
        }

        match self.pause_mode {
            PauseMode::Suspend => {
                if force_suspend {
                    let logins: Vec<SocketId> = self.login_client_list.iter().copied().collect();
                    for id in logins {
                        self.disconnect_client(id, true, "suspend_timeout");
                    }
                } else {
                    active += self.login_client_list.len();
                }
                // Suspend finishes through the same done check as pause.
                if active == 0 {
                    self.signal_pause_done();
                }
            }
            PauseMode::Pause => {
                if active == 0 {
                    self.signal_pause_done();
                }
            }
            PauseMode::None => {
                if partial_pause && active == 0 {
                    self.signal_pause_done();
                }
            }
        }
    }

    /// Enter a pause mode (or leave it); re-arms the done notification.
    pub fn set_pause_mode(&mut self, mode: PauseMode, now: u64) {
        self.pause_mode = mode;
        self.pause_done_sent = false;
        if mode == PauseMode::Suspend {
            self.suspend_start = now;
        }
    }

    fn signal_pause_done(&mut self) {
        if self.pause_done_sent {
            return;
        }
        self.pause_done_sent = true;
        let mode = self.pause_mode;
        self.push_event(CoreEvent::PauseDone { mode });
    }
}
