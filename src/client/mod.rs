//! Client-side protocol handling: the login handshake, cancel-request
//! entry, query dispatch and forwarding toward the linked server.

use log::{info, warn};

use crate::config::AuthType;
use crate::errors::ClientIdentifier;
use crate::messages::{self, PktType};
use crate::pool::sched::SockList;
use crate::pool::{Bouncer, PgSocket, SockState, SocketId, LOGIN_RECV_MAX};
use crate::server::auth;

impl Bouncer {
    /// Register a freshly accepted client connection. Refuses once the
    /// process-wide client cap is hit.
    pub fn accept_client(&mut self, addr: String, now: u64) -> Option<SocketId> {
        if self.cf.max_client_conn >= 0 && self.client_count() as i32 >= self.cf.max_client_conn {
            warn!("{addr}: client refused: max_client_conn reached");
            return None;
        }
        let trace = self.cf.trace_connections;
        let client = PgSocket::new_client(addr, now, trace);
        let client_id = self.sockets.alloc(client);
        self.note_client_opened();
        self.login_client_list.push_back(client_id);
        Some(client_id)
    }

    /// Bytes arrived from a client socket.
    pub fn client_data(&mut self, client_id: SocketId, data: &[u8], now: u64) {
        let Some(client) = self.sockets.get_mut(client_id) else {
            return;
        };
        client.request_time = now;
        if let Some(trace) = &mut client.trace {
            trace.append(data);
        }
        client.recv.extend_from_slice(data);
        match client.state {
            SockState::ClJustConnect | SockState::ClLogin => {
                self.handle_client_login(client_id, now)
            }
            SockState::ClActive | SockState::ClWaiting => {
                self.handle_client_work(client_id, now)
            }
            // A cancel connection has said everything it ever will.
            SockState::ClCancel => {}
            _ => {}
        }
    }

    /// The driver saw EOF or an error on a client socket.
    pub fn client_gone(&mut self, client_id: SocketId) {
        self.disconnect_client(client_id, false, "client unexpected eof");
    }

    fn handle_client_login(&mut self, client_id: SocketId, now: u64) {
        loop {
            let Some(client) = self.sockets.get(client_id) else {
                return;
            };
            // Login may have completed mid-loop; pipelined bytes after the
            // handshake belong to the work path.
            if matches!(client.state, SockState::ClActive | SockState::ClWaiting) {
                self.handle_client_work(client_id, now);
                return;
            }
            if client.state == SockState::ClCancel {
                return;
            }
            if client.recv.len() > LOGIN_RECV_MAX {
                self.disconnect_client(client_id, true, "startup packet too large");
                return;
            }

            let parsed = messages::get_header(&client.recv[..])
                .map(|hdr| hdr.map(|h| (h.ptype, h.len, h.complete())));
            let (ptype, len) = match parsed {
                Ok(None) => return,
                Ok(Some((_, _, false))) => return,
                Ok(Some((ptype, len, true))) => (ptype, len),
                Err(err) => {
                    warn!("C-{client_id:?}: {err}");
                    self.disconnect_client(client_id, true, "bad packet header");
                    return;
                }
            };

            let payload = {
                let Some(client) = self.sockets.get_mut(client_id) else {
                    return;
                };
                let pkt = client.recv.split_to(len);
                let header = match ptype {
                    PktType::Typed(_) => messages::NEW_HEADER_LEN,
                    _ => messages::OLD_HEADER_LEN,
                };
                pkt[header..].to_vec()
            };

            match ptype {
                PktType::SslReq => {
                    // No TLS here; the client continues in cleartext.
                    let _ = self.sock_send(client_id, &messages::ssl_deny());
                }
                PktType::Cancel => {
                    let key: [u8; 8] = match payload.try_into() {
                        Ok(key) => key,
                        Err(_) => {
                            self.disconnect_client(client_id, false, "bad cancel request");
                            return;
                        }
                    };
                    self.handle_cancel_request(client_id, key, now);
                    return;
                }
                PktType::Startup => {
                    if !self.handle_startup_packet(client_id, &payload, now) {
                        return;
                    }
                }
                PktType::Typed(b'p') => {
                    if !self.handle_password_packet(client_id, &payload, now) {
                        return;
                    }
                }
                PktType::Typed(b'X') => {
                    self.disconnect_client(client_id, false, "client close request");
                    return;
                }
                PktType::Typed(tag) => {
                    warn!("C-{client_id:?}: bad packet {} in login phase", tag as char);
                    self.disconnect_client(client_id, true, "bad packet in login phase");
                    return;
                }
            }
        }
    }

    fn handle_startup_packet(&mut self, client_id: SocketId, payload: &[u8], now: u64) -> bool {
        let params = match messages::parse_startup_params(payload) {
            Ok(params) => params,
            Err(_) => {
                self.disconnect_client(client_id, true, "broken startup packet");
                return false;
            }
        };

        let mut user = String::new();
        let mut database = String::new();
        {
            let Some(client) = self.sockets.get_mut(client_id) else {
                return false;
            };
            for (key, value) in &params {
                match key.as_str() {
                    "user" => user = value.clone(),
                    "database" => database = value.clone(),
                    // Recognized session variables ride along; the rest of
                    // the startup options are not our business.
                    _ => {
                        let _ = client.vars.set(key, value);
                    }
                }
            }
        }
        if user.is_empty() {
            self.disconnect_client(client_id, true, "no user supplied in startup packet");
            return false;
        }
        if database.is_empty() {
            database = user.clone();
        }
        if let Some(client) = self.sockets.get_mut(client_id) {
            client.login_user = user;
            client.login_db = database;
        }
        self.change_client_state(client_id, SockState::ClLogin);

        match self.cf.auth_type {
            AuthType::Trust => self.client_authenticated(client_id, now),
            AuthType::Plain => {
                self.sock_send(client_id, &messages::auth_request_cleartext())
                    .is_ok()
            }
            AuthType::Md5 => {
                let salt: [u8; 4] = rand::random();
                if let Some(client) = self.sockets.get_mut(client_id) {
                    client.auth_salt = salt;
                }
                self.sock_send(client_id, &messages::auth_request_md5(&salt))
                    .is_ok()
            }
        }
    }

    fn handle_password_packet(&mut self, client_id: SocketId, payload: &[u8], now: u64) -> bool {
        let Some((given, _)) = messages::get_cstr(payload) else {
            self.disconnect_client(client_id, true, "broken password packet");
            return false;
        };
        let given = given.to_string();

        let (login_user, salt) = {
            let Some(client) = self.sockets.get(client_id) else {
                return false;
            };
            (client.login_user.clone(), client.auth_salt)
        };

        let stored = self
            .find_user_id(&login_user)
            .and_then(|id| self.users.get(id))
            .map(|user| user.passwd.clone());

        let ok = match stored {
            None => false,
            // Disabled after a reload dropped the entry.
            Some(passwd) if passwd.is_empty() => false,
            Some(passwd) => match self.cf.auth_type {
                AuthType::Trust => true,
                AuthType::Plain => given == passwd,
                AuthType::Md5 => auth::check_md5_client(&given, &passwd, &login_user, &salt),
            },
        };

        if !ok {
            let pkt = messages::wrong_password(&login_user);
            let _ = self.sock_send(client_id, &pkt);
            self.disconnect_client(client_id, false, "auth failed");
            return false;
        }
        self.client_authenticated(client_id, now)
    }

    /// The handshake is done: attach the client to its pool and either
    /// replay the cached welcome or queue it until one is learned.
    pub fn client_authenticated(&mut self, client_id: SocketId, now: u64) -> bool {
        let (login_db, login_user) = {
            let Some(client) = self.sockets.get(client_id) else {
                return false;
            };
            info!(
                "C-{client_id:?}: login attempt: {}",
                ClientIdentifier::new(&client.login_user, &client.login_db, &client.addr)
            );
            (client.login_db.clone(), client.login_user.clone())
        };

        let db_id = match self.find_or_wake_database(&login_db) {
            Some(id) => id,
            None => match crate::config::register_auto_database(self, &login_db) {
                Some(id) => id,
                None => {
                    let pkt = messages::fatal_message(
                        &format!("no such database: {login_db}"),
                        "3D000",
                    );
                    let _ = self.sock_send(client_id, &pkt);
                    self.disconnect_client(client_id, false, "no such database");
                    return false;
                }
            },
        };

        let (max_client_conn, forced_user) = {
            let db = self.database(db_id);
            (db.max_client_conn, db.forced_user)
        };

        let user_id = match forced_user {
            Some(user_id) => user_id,
            None => match self.find_user_id(&login_user) {
                Some(user_id) => user_id,
                None if self.cf.auth_type == AuthType::Trust => {
                    self.add_user(&login_user, "")
                }
                None => {
                    let pkt = messages::wrong_password(&login_user);
                    let _ = self.sock_send(client_id, &pkt);
                    self.disconnect_client(client_id, false, "unknown user");
                    return false;
                }
            },
        };

        let pool_id = self.get_pool(db_id, user_id);

        if max_client_conn >= 0 {
            let count = self
                .pools
                .get(pool_id)
                .map(|p| p.client_count())
                .unwrap_or(0);
            if count as i32 >= max_client_conn {
                let pkt = messages::fatal_message("no more connections allowed", "53300");
                let _ = self.sock_send(client_id, &pkt);
                self.disconnect_client(client_id, false, "max_client_conn reached");
                return false;
            }
        }

        if let Some(client) = self.sockets.get_mut(client_id) {
            client.pool = Some(pool_id);
        }

        let welcome_ready = self
            .pools
            .get(pool_id)
            .map(|p| p.welcome_msg_ready)
            .unwrap_or(false);
        if welcome_ready {
            self.change_client_state(client_id, SockState::ClActive);
            self.welcome_client(client_id);
        } else {
            // Pool has never logged in a server; queue until it does.
            if let Some(client) = self.sockets.get_mut(client_id) {
                client.wait_for_welcome = true;
                client.query_start = now;
            }
            self.change_client_state(client_id, SockState::ClWaiting);
        }
        true
    }

    /// A legacy cancel packet arrived on a fresh connection: find the
    /// client that owns the key and dial a short-lived server connection
    /// to forward the cancellation of its in-flight query.
    fn handle_cancel_request(&mut self, cancel_id: SocketId, key: [u8; 8], now: u64) {
        let mut target = None;
        'search: for pool_id in self.pool_list.clone() {
            for client_id in self.list_snapshot(pool_id, SockList::ActiveClient) {
                let Some(client) = self.sockets.get(client_id) else {
                    continue;
                };
                if client.cancel_key == key {
                    target = Some((pool_id, client_id));
                    break 'search;
                }
            }
        }

        let Some((pool_id, main_id)) = target else {
            self.disconnect_client(cancel_id, false, "failed cancel request");
            return;
        };

        // The backend needs the linked server's key, not the client's.
        let server_key = self
            .sockets
            .get(main_id)
            .and_then(|c| c.link)
            .and_then(|s| self.sockets.get(s))
            .map(|s| s.cancel_key);
        let Some(server_key) = server_key else {
            self.disconnect_client(cancel_id, false, "cancel request for idle client");
            return;
        };

        if let Some(sock) = self.sockets.get_mut(cancel_id) {
            sock.pool = Some(pool_id);
            sock.cancel_key = server_key;
        }
        self.change_client_state(cancel_id, SockState::ClCancel);
        self.launch_new_connection(pool_id, now);
    }

    /// Data from a client that has finished login.
    fn handle_client_work(&mut self, client_id: SocketId, now: u64) {
        loop {
            let Some(client) = self.sockets.get(client_id) else {
                return;
            };
            if client.recv.is_empty() {
                return;
            }
            let state = client.state;
            let link = client.link;

            let Some(server_id) = link else {
                self.queue_client_request(client_id, state, now);
                return;
            };

            // While the server is still applying session variables (or
            // older bytes are held back), new bytes queue behind them so
            // nothing overtakes on the wire.
            let must_hold = {
                let setting = self
                    .sockets
                    .get(server_id)
                    .map(|s| s.setting_vars)
                    .unwrap_or(false);
                setting
                    || self
                        .sockets
                        .get(client_id)
                        .map(|c| !c.pending.is_empty())
                        .unwrap_or(false)
            };
            if must_hold {
                if let Some(client) = self.sockets.get_mut(client_id) {
                    let bytes = client.recv.split();
                    client.pending.extend_from_slice(&bytes);
                }
                return;
            }

            // Stream the current packet through to the server.
            let fwd_remaining = client.fwd_remaining;
            if fwd_remaining > 0 {
                let chunk = {
                    let Some(client) = self.sockets.get_mut(client_id) else {
                        return;
                    };
                    let n = fwd_remaining.min(client.recv.len());
                    client.fwd_remaining -= n;
                    client.recv.split_to(n)
                };
                if self.sock_send(server_id, &chunk).is_err() {
                    self.disconnect_server(server_id, true, "server write failed");
                    return;
                }
                continue;
            }

            let parsed = messages::get_header(&client.recv[..])
                .map(|hdr| hdr.map(|h| (h.ptype, h.len)));
            let (ptype, len) = match parsed {
                Ok(None) => return,
                Ok(Some(parts)) => parts,
                Err(err) => {
                    warn!("C-{client_id:?}: {err}");
                    self.disconnect_client(client_id, true, "broken packet");
                    return;
                }
            };
            if !matches!(ptype, PktType::Typed(_)) {
                self.disconnect_client(client_id, true, "unexpected legacy packet");
                return;
            }
            if ptype == PktType::Typed(b'X') {
                self.disconnect_client(client_id, false, "client close request");
                return;
            }

            // Commit the packet to the server.
            if let Some(server) = self.sockets.get_mut(server_id) {
                server.ready = false;
            }
            let chunk = {
                let Some(client) = self.sockets.get_mut(client_id) else {
                    return;
                };
                let n = len.min(client.recv.len());
                client.fwd_remaining = len - n;
                client.recv.split_to(n)
            };
            if self.sock_send(server_id, &chunk).is_err() {
                self.disconnect_server(server_id, true, "server write failed");
                return;
            }
        }
    }

    /// No server is linked: hold the bytes and queue for one.
    fn queue_client_request(&mut self, client_id: SocketId, state: SockState, now: u64) {
        if state == SockState::ClActive {
            // Catch a clean Terminate before queueing.
            let parsed = {
                let Some(client) = self.sockets.get(client_id) else {
                    return;
                };
                match messages::get_header(&client.recv[..]) {
                    Ok(None) => return,
                    Ok(Some(hdr)) => Ok(hdr.ptype),
                    Err(err) => Err(err),
                }
            };
            match parsed {
                Ok(PktType::Typed(b'X')) => {
                    self.disconnect_client(client_id, false, "client close request");
                    return;
                }
                Ok(PktType::Typed(_)) => {}
                Ok(_) => {
                    self.disconnect_client(client_id, true, "unexpected legacy packet");
                    return;
                }
                Err(err) => {
                    warn!("C-{client_id:?}: {err}");
                    self.disconnect_client(client_id, true, "broken packet");
                    return;
                }
            }
            if let Some(client) = self.sockets.get_mut(client_id) {
                let bytes = client.recv.split();
                client.pending.extend_from_slice(&bytes);
                client.query_start = now;
                // Stop reading until a server frees up.
                let _ = client.sbuf.pause();
            }
            self.change_client_state(client_id, SockState::ClWaiting);
        } else {
            // Already waiting: keep buffering whatever trickles in.
            if let Some(client) = self.sockets.get_mut(client_id) {
                let bytes = client.recv.split();
                client.pending.extend_from_slice(&bytes);
            }
        }
    }
}
