//! Server-side protocol handling: the backend login sequence, linked
//! forwarding with ParameterStatus/ReadyForQuery interposition, the
//! reset-query cycle, and dirty detection.

pub mod auth;

use log::{debug, error, warn};

use crate::errors::ServerIdentifier;
use crate::messages::{self, PktType};
use crate::pool::{Bouncer, SockState, SocketId, LOGIN_RECV_MAX};

use auth::AuthAnswer;

impl Bouncer {
    /// The driver finished dialing a server socket.
    pub fn server_connected(&mut self, server_id: SocketId, now: u64) {
        let Some(server) = self.sockets.get_mut(server_id) else {
            return;
        };
        server.connect_time = now;
        server.request_time = now;
        let Some(pool_id) = server.pool else {
            return;
        };

        if server.for_cancel {
            // This connection exists only to carry one cancel packet.
            let cancel_client = self
                .pools
                .get(pool_id)
                .and_then(|p| p.cancel_req_list.front().copied());
            if let Some(cancel_id) = cancel_client {
                let key = self
                    .sockets
                    .get(cancel_id)
                    .map(|c| c.cancel_key)
                    .unwrap_or_default();
                let _ = self.sock_send(server_id, &messages::cancel_request(&key));
                self.disconnect_client(cancel_id, false, "cancel request served");
            }
            self.disconnect_server(server_id, false, "cancel request served");
            return;
        }

        let (user_name, params) = {
            let Some(pool) = self.pools.get(pool_id) else {
                return;
            };
            let user_name = self
                .users
                .get(pool.user)
                .map(|u| u.name.clone())
                .unwrap_or_default();
            let params = self
                .databases
                .get(pool.db)
                .map(|db| db.startup_params.clone())
                .unwrap_or_default();
            (user_name, params)
        };
        let pkt = messages::startup_message(&user_name, &params);
        if self.sock_send(server_id, &pkt).is_err() {
            self.disconnect_server(server_id, false, "server write failed");
        }
    }

    /// The driver could not reach the backend.
    pub fn server_connect_failed(&mut self, server_id: SocketId) {
        self.disconnect_server(server_id, false, "server connect failed");
    }

    /// The driver saw EOF or an error on a server socket.
    pub fn server_gone(&mut self, server_id: SocketId) {
        self.disconnect_server(server_id, true, "server conn crashed?");
    }

    /// Bytes arrived from a server socket.
    pub fn server_data(&mut self, server_id: SocketId, data: &[u8], now: u64) {
        let Some(server) = self.sockets.get_mut(server_id) else {
            return;
        };
        server.request_time = now;
        if let Some(trace) = &mut server.trace {
            trace.append(data);
        }
        server.recv.extend_from_slice(data);
        match server.state {
            SockState::SvLogin => self.handle_server_login(server_id),
            SockState::SvActive => self.handle_server_active(server_id),
            SockState::SvTested => self.handle_server_tested(server_id),
            SockState::SvIdle | SockState::SvUsed => {
                // Unsolicited bytes on a pooled server: it is no longer
                // trustworthy and the janitor will drop it.
                if let Some(server) = self.sockets.get_mut(server_id) {
                    server.ready = false;
                }
            }
            _ => {}
        }
    }

    fn server_identifier(&self, server_id: SocketId) -> ServerIdentifier {
        let names = self
            .sockets
            .get(server_id)
            .and_then(|s| s.pool)
            .and_then(|p| self.pools.get(p))
            .map(|pool| {
                let user = self
                    .users
                    .get(pool.user)
                    .map(|u| u.name.clone())
                    .unwrap_or_default();
                let db = self
                    .databases
                    .get(pool.db)
                    .map(|db| db.name.clone())
                    .unwrap_or_default();
                (user, db)
            })
            .unwrap_or_default();
        ServerIdentifier::new(&names.0, &names.1)
    }

    /// Consume one complete packet from the socket's buffer. `Ok(None)`
    /// means more bytes are needed.
    fn next_complete_packet(
        &mut self,
        server_id: SocketId,
    ) -> Result<Option<(u8, Vec<u8>)>, ()> {
        let Some(server) = self.sockets.get(server_id) else {
            return Err(());
        };
        let (tag, len) = match messages::get_header(&server.recv[..]) {
            Ok(None) => return Ok(None),
            Ok(Some(hdr)) => {
                if !hdr.complete() {
                    return Ok(None);
                }
                match hdr.ptype {
                    PktType::Typed(tag) => (tag, hdr.len),
                    _ => return Err(()),
                }
            }
            Err(err) => {
                warn!("S-{server_id:?}: {err}");
                return Err(());
            }
        };
        let Some(server) = self.sockets.get_mut(server_id) else {
            return Err(());
        };
        let pkt = server.recv.split_to(len);
        Ok(Some((tag, pkt[messages::NEW_HEADER_LEN..].to_vec())))
    }

    /// Packets from a server that is still logging in.
    fn handle_server_login(&mut self, server_id: SocketId) {
        loop {
            let Some(server) = self.sockets.get(server_id) else {
                return;
            };
            if server.state != SockState::SvLogin {
                // Login completed inside this loop.
                if !server.recv.is_empty() {
                    warn!("S-{server_id:?}: unexpected data right after login");
                    if let Some(server) = self.sockets.get_mut(server_id) {
                        server.ready = false;
                    }
                }
                return;
            }
            if server.recv.len() > LOGIN_RECV_MAX {
                self.disconnect_server(server_id, false, "login reply too large");
                return;
            }
            let connect_query_running = server.connect_query_sent;

            let (tag, payload) = match self.next_complete_packet(server_id) {
                Ok(Some(pkt)) => pkt,
                Ok(None) => return,
                Err(()) => {
                    self.disconnect_server(server_id, false, "bad packet from server");
                    return;
                }
            };

            match tag {
                b'R' => {
                    let id = self.server_identifier(server_id);
                    let (user, passwd) = self.pool_credentials(server_id);
                    match auth::answer_auth_request(&payload, &id, &user, &passwd) {
                        Ok(AuthAnswer::Done) => {
                            debug!("S-{server_id:?}: auth ok");
                        }
                        Ok(AuthAnswer::Send(pkt)) => {
                            if self.sock_send(server_id, &pkt).is_err() {
                                self.disconnect_server(server_id, false, "server write failed");
                                return;
                            }
                        }
                        Err(err) => {
                            error!("S-{server_id:?}: {err}");
                            self.disconnect_server(server_id, false, "server login failed");
                            return;
                        }
                    }
                }
                b'S' => {
                    let Some((key, value)) = messages::parse_parameter_status(&payload) else {
                        self.disconnect_server(server_id, false, "broken ParameterStatus");
                        return;
                    };
                    if let Some(pool_id) = self.sockets.get(server_id).and_then(|s| s.pool) {
                        self.add_welcome_parameter(pool_id, &key, &value);
                    }
                    if let Some(server) = self.sockets.get_mut(server_id) {
                        let _ = server.vars.set(&key, &value);
                    }
                }
                b'K' => {
                    if let (Ok(key), Some(server)) = (
                        <[u8; 8]>::try_from(&payload[..]),
                        self.sockets.get_mut(server_id),
                    ) {
                        server.cancel_key = key;
                    }
                }
                b'E' => {
                    log_server_error("server login failed", &payload);
                    self.disconnect_server(server_id, false, "login failed");
                    return;
                }
                b'N' => {
                    // NoticeResponse: harmless chatter during login.
                }
                b'Z' => {
                    let Some(pool_id) = self.sockets.get(server_id).and_then(|s| s.pool) else {
                        return;
                    };
                    // Run connect_query once, before the server joins the
                    // pool; its results are swallowed below.
                    let connect_query = self
                        .pools
                        .get(pool_id)
                        .and_then(|p| self.databases.get(p.db))
                        .and_then(|db| db.connect_query.clone());
                    if let Some(query) = connect_query {
                        if !connect_query_running {
                            if let Some(server) = self.sockets.get_mut(server_id) {
                                server.connect_query_sent = true;
                            }
                            let pkt = messages::simple_query(&query);
                            if self.sock_send(server_id, &pkt).is_err() {
                                self.disconnect_server(server_id, false, "connect query failed");
                                return;
                            }
                            continue;
                        }
                    }
                    self.finish_welcome_msg(pool_id);
                    if let Some(server) = self.sockets.get_mut(server_id) {
                        server.ready = true;
                    }
                    self.release_server(server_id);
                    // The next scheduler pass hands it to a waiting client.
                }
                _ if connect_query_running => {
                    // Result rows of connect_query.
                }
                _ => {
                    warn!(
                        "S-{server_id:?}: unknown packet {} during login",
                        tag as char
                    );
                    self.disconnect_server(server_id, false, "unknown packet during login");
                    return;
                }
            }
        }
    }

    fn pool_credentials(&self, server_id: SocketId) -> (String, String) {
        self.sockets
            .get(server_id)
            .and_then(|s| s.pool)
            .and_then(|p| self.pools.get(p))
            .and_then(|pool| self.users.get(pool.user))
            .map(|user| (user.name.clone(), user.passwd.clone()))
            .unwrap_or_default()
    }

    /// Packets from a server linked to a client.
    fn handle_server_active(&mut self, server_id: SocketId) {
        loop {
            let Some(server) = self.sockets.get(server_id) else {
                return;
            };
            if server.state != SockState::SvActive {
                // Released inside this loop; anything further is dirt.
                if !server.recv.is_empty() {
                    if let Some(server) = self.sockets.get_mut(server_id) {
                        server.ready = false;
                    }
                }
                return;
            }
            if server.recv.is_empty() {
                return;
            }

            if server.setting_vars {
                if !self.swallow_setting_vars_reply(server_id) {
                    return;
                }
                continue;
            }

            let Some(client_id) = server.link else {
                if let Some(server) = self.sockets.get_mut(server_id) {
                    server.ready = false;
                }
                return;
            };

            // Stream the current packet through to the client.
            let fwd_remaining = server.fwd_remaining;
            if fwd_remaining > 0 {
                let chunk = {
                    let Some(server) = self.sockets.get_mut(server_id) else {
                        return;
                    };
                    let n = fwd_remaining.min(server.recv.len());
                    server.fwd_remaining -= n;
                    server.recv.split_to(n)
                };
                if self.sock_send(client_id, &chunk).is_err() {
                    self.disconnect_client(client_id, false, "client write failed");
                    return;
                }
                continue;
            }

            let parsed = messages::get_header(&server.recv[..])
                .map(|hdr| hdr.map(|h| (h.ptype, h.len, h.complete())));
            let (ptype, len, complete) = match parsed {
                Ok(None) => return,
                Ok(Some(parts)) => parts,
                Err(err) => {
                    warn!("S-{server_id:?}: {err}");
                    self.disconnect_server(server_id, true, "broken packet from server");
                    return;
                }
            };
            let PktType::Typed(tag) = ptype else {
                self.disconnect_server(server_id, true, "broken packet from server");
                return;
            };

            match tag {
                // ParameterStatus: record the session change, then pass it
                // through untouched.
                b'S' => {
                    if !complete {
                        return;
                    }
                    let payload = {
                        let Some(server) = self.sockets.get(server_id) else {
                            return;
                        };
                        server.recv[messages::NEW_HEADER_LEN..len].to_vec()
                    };
                    if let Some((key, value)) = messages::parse_parameter_status(&payload) {
                        if let Some(server) = self.sockets.get_mut(server_id) {
                            let _ = server.vars.set(&key, &value);
                        }
                    }
                    self.forward_packet(server_id, client_id, len);
                }
                // ReadyForQuery: the backend is between queries. Outside a
                // transaction the server goes back to the pool.
                b'Z' => {
                    if !complete {
                        return;
                    }
                    let status = {
                        let Some(server) = self.sockets.get(server_id) else {
                            return;
                        };
                        server.recv[messages::NEW_HEADER_LEN]
                    };
                    // An open transaction keeps the pair bound; only an
                    // idle backend is trustworthy for reuse.
                    if status == b'I' {
                        if let Some(server) = self.sockets.get_mut(server_id) {
                            server.ready = true;
                        }
                    }
                    self.forward_packet(server_id, client_id, len);
                    if status == b'I' {
                        self.release_server(server_id);
                        // Back to the loop top: bytes trailing the release
                        // mean the server went dirty.
                        continue;
                    }
                }
                b'E' => {
                    if complete {
                        let Some(server) = self.sockets.get(server_id) else {
                            return;
                        };
                        log_server_error(
                            "error from linked server",
                            &server.recv[messages::NEW_HEADER_LEN..len],
                        );
                    }
                    self.forward_packet(server_id, client_id, len);
                }
                _ => {
                    self.forward_packet(server_id, client_id, len);
                }
            }
        }
    }

    /// Commit one packet (or its buffered prefix) to the peer.
    fn forward_packet(&mut self, src_id: SocketId, dst_id: SocketId, len: usize) {
        let chunk = {
            let Some(src) = self.sockets.get_mut(src_id) else {
                return;
            };
            let n = len.min(src.recv.len());
            src.fwd_remaining = len - n;
            src.recv.split_to(n)
        };
        if self.sock_send(dst_id, &chunk).is_err() {
            self.disconnect_client(dst_id, false, "client write failed");
        }
    }

    /// Replies to the session-variable reconciliation query never reach
    /// the client; once ReadyForQuery lands, the held query goes out.
    /// Returns whether a whole packet was consumed.
    fn swallow_setting_vars_reply(&mut self, server_id: SocketId) -> bool {
        let (tag, payload) = match self.next_complete_packet(server_id) {
            Ok(Some(pkt)) => pkt,
            Ok(None) => return false,
            Err(()) => {
                self.disconnect_server(server_id, true, "broken packet from server");
                return false;
            }
        };
        match tag {
            b'Z' => {
                let client_vars = self
                    .sockets
                    .get(server_id)
                    .and_then(|s| s.link)
                    .and_then(|c| self.sockets.get(c))
                    .map(|c| c.vars.clone());
                let client_id = self.sockets.get(server_id).and_then(|s| s.link);
                if let Some(server) = self.sockets.get_mut(server_id) {
                    server.setting_vars = false;
                    server.ready = true;
                    // The session now carries the client's values.
                    if let Some(vars) = client_vars {
                        server.vars = vars;
                    }
                }
                if let Some(client_id) = client_id {
                    self.forward_pending(client_id, server_id);
                }
            }
            b'E' => {
                log_server_error("session variable apply failed", &payload);
            }
            b'S' => {
                if let Some((key, value)) = messages::parse_parameter_status(&payload) {
                    if let Some(server) = self.sockets.get_mut(server_id) {
                        let _ = server.vars.set(&key, &value);
                    }
                }
            }
            _ => {}
        }
        true
    }

    /// Packets from a server running the reset query.
    fn handle_server_tested(&mut self, server_id: SocketId) {
        loop {
            let Some(server) = self.sockets.get(server_id) else {
                return;
            };
            if server.state != SockState::SvTested || server.recv.is_empty() {
                return;
            }
            let (tag, payload) = match self.next_complete_packet(server_id) {
                Ok(Some(pkt)) => pkt,
                Ok(None) => return,
                Err(()) => {
                    self.disconnect_server(server_id, false, "bad packet from server");
                    return;
                }
            };
            match tag {
                b'Z' => {
                    // One ReadyForQuery ends the recheck; the server is
                    // immediately available again.
                    if let Some(server) = self.sockets.get_mut(server_id) {
                        server.ready = true;
                    }
                    self.release_server(server_id);
                    return;
                }
                b'E' => {
                    log_server_error("test query failed", &payload);
                    self.disconnect_server(server_id, false, "test query failed");
                    return;
                }
                _ => {
                    // Result rows of the check query.
                }
            }
        }
    }
}

fn log_server_error(note: &str, payload: &[u8]) {
    let (level, msg) = messages::parse_error_fields(payload);
    match (level, msg) {
        (Some(level), Some(msg)) => error!("{note}: {level}: {msg}"),
        _ => error!("{note}: partial error message, cannot log"),
    }
}
