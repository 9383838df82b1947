//! Periodic maintenance.
//!
//! Full maintenance runs three times a second: timeout enforcement,
//! idle/lifetime eviction, pool-size trimming, auto-database collection,
//! login cleanup, graceful-shutdown detection and the auth-file recheck.

use log::{info, warn};

use crate::config::{self, AuthType};
use crate::utils::clock::USEC;

use super::sched::SockList;
use super::{Bouncer, CoreEvent, DbId, PauseMode, PoolId, Shutdown, SockState, SocketId};

/// Full maintenance cadence: three times per second.
pub const FULL_MAINT_PERIOD: u64 = USEC / 3;

impl Bouncer {
    /// Full-scale maintenance, done only occasionally.
    pub fn do_full_maint(&mut self, now: u64) {
        for pool_id in self.pool_list.clone() {
            if !self.pools.contains(pool_id) {
                continue;
            }
            self.pool_server_maint(pool_id, now);
            self.pool_client_maint(pool_id, now);
            self.autodb_check_inactive(pool_id, now);
        }

        self.cleanup_inactive_autodatabases(now);
        self.cleanup_client_logins(now);

        if self.shutdown == Shutdown::Requested && self.get_active_server_count() == 0 {
            info!("server connections dropped, exiting");
            self.shutdown = Shutdown::Done;
            self.push_event(CoreEvent::LoopBreak);
            return;
        }

        if self.cf.auth_type != AuthType::Trust {
            config::users_check(self);
        }
    }

    /// Maintain servers in a pool.
    fn pool_server_maint(&mut self, pool_id: PoolId, now: u64) {
        // Find and disconnect unusable servers.
        self.check_unused_servers(pool_id, SockList::UsedServer, false, now);
        self.check_unused_servers(pool_id, SockList::TestedServer, false, now);
        self.check_unused_servers(pool_id, SockList::IdleServer, true, now);

        // Queries that did not get an answer in query_timeout.
        if self.cf.query_timeout > 0 {
            for server_id in self.list_snapshot(pool_id, SockList::ActiveServer) {
                let Some(server) = self.sockets.get(server_id) else {
                    continue;
                };
                debug_assert!(server.state == SockState::SvActive);
                if server.ready {
                    continue;
                }
                let Some(request_time) =
                    server.link.and_then(|c| self.sockets.get(c)).map(|c| c.request_time)
                else {
                    continue;
                };
                if now.saturating_sub(request_time) > self.cf.query_timeout {
                    self.disconnect_server(server_id, true, "statement timeout");
                }
            }
        }

        // Connections that got connect but could not log in.
        if self.cf.server_connect_timeout > 0 {
            for server_id in self.list_snapshot(pool_id, SockList::NewServer) {
                let Some(server) = self.sockets.get(server_id) else {
                    continue;
                };
                debug_assert!(server.state == SockState::SvLogin);
                if now.saturating_sub(server.connect_time) > self.cf.server_connect_timeout {
                    self.disconnect_server(server_id, true, "connect timeout");
                }
            }
        }

        self.check_pool_size(pool_id);
    }

    /// Walk one server list for recycling conditions. `idle_test` demotes
    /// long-idle servers so their next binding triggers the check query.
    fn check_unused_servers(
        &mut self,
        pool_id: PoolId,
        which: SockList,
        idle_test: bool,
        now: u64,
    ) {
        // Spread lifetime kills out so the pool does not expire together.
        let lifetime_kill_gap = {
            let pool_size = self
                .pools
                .get(pool_id)
                .and_then(|p| self.databases.get(p.db))
                .map(|db| db.pool_size)
                .unwrap_or(0);
            if pool_size > 0 {
                self.cf.server_lifetime / pool_size as u64
            } else {
                0
            }
        };

        for server_id in self.list_snapshot(pool_id, which) {
            let Some(server) = self.sockets.get(server_id) else {
                continue;
            };
            let age = now.saturating_sub(server.connect_time);
            let idle = now.saturating_sub(server.request_time);
            let state = server.state;
            let server_ready = server.ready;
            let close_needed = server.close_needed;

            if close_needed {
                self.disconnect_server(server_id, true, "database configuration changed");
            } else if state == SockState::SvIdle && !server_ready {
                self.disconnect_server(server_id, true, "SV_IDLE server got dirty");
            } else if state == SockState::SvUsed && !server_ready {
                self.disconnect_server(server_id, true, "SV_USED server got dirty");
            } else if self.cf.server_idle_timeout > 0 && idle > self.cf.server_idle_timeout {
                self.disconnect_server(server_id, true, "server idle timeout");
            } else if age >= self.cf.server_lifetime {
                let last = self
                    .pools
                    .get(pool_id)
                    .map(|p| p.last_lifetime_disconnect)
                    .unwrap_or(0);
                if last + lifetime_kill_gap <= now {
                    self.disconnect_server(server_id, true, "server lifetime over");
                    if let Some(pool) = self.pools.get_mut(pool_id) {
                        pool.last_lifetime_disconnect = now;
                    }
                }
            } else if self.pause_mode == PauseMode::Pause {
                self.disconnect_server(server_id, true, "pause mode");
            } else if idle_test && !self.cf.server_check_query.is_empty() {
                if idle > self.cf.server_check_delay {
                    self.change_server_state(server_id, SockState::SvUsed);
                }
            }
        }
    }

    /// Close connections beyond the configured pool size, so an admin
    /// shrink takes effect quickly. Dialing connections are excluded: a
    /// cancel packet may create one without counting against the pool.
    fn check_pool_size(&mut self, pool_id: PoolId) {
        let Some(pool) = self.pools.get(pool_id) else {
            return;
        };
        let cur = pool.active_server_list.len()
            + pool.idle_server_list.len()
            + pool.used_server_list.len()
            + pool.tested_server_list.len();

        let Some(db) = self.databases.get(pool.db) else {
            return;
        };
        if db.pool_size < 0 {
            return;
        }
        let mut many = cur as i32 - (db.pool_size + db.res_pool_size.max(0));

        while many > 0 {
            let server_id = {
                let Some(pool) = self.pools.get(pool_id) else {
                    return;
                };
                pool.used_server_list
                    .front()
                    .or(pool.idle_server_list.front())
                    .copied()
            };
            let Some(server_id) = server_id else {
                break;
            };
            self.disconnect_server(server_id, true, "too many servers in the pool");
            many -= 1;
        }
    }

    /// Maintain clients in a pool.
    fn pool_client_maint(&mut self, pool_id: PoolId, now: u64) {
        // Force client_idle_timeout.
        if self.cf.client_idle_timeout > 0 {
            for client_id in self.list_snapshot(pool_id, SockList::ActiveClient) {
                let Some(client) = self.sockets.get(client_id) else {
                    continue;
                };
                debug_assert!(client.state == SockState::ClActive);
                if client.link.is_some() {
                    continue;
                }
                if now.saturating_sub(client.request_time) > self.cf.client_idle_timeout {
                    self.disconnect_client(client_id, true, "client_idle_timeout");
                }
            }
        }

        // Force query_timeout on queued clients.
        if self.cf.query_timeout > 0 {
            for client_id in self.list_snapshot(pool_id, SockList::WaitingClient) {
                let Some(client) = self.sockets.get(client_id) else {
                    continue;
                };
                debug_assert!(client.state == SockState::ClWaiting);
                let age = if client.query_start == 0 {
                    now.saturating_sub(client.request_time)
                } else {
                    now.saturating_sub(client.query_start)
                };
                if age > self.cf.query_timeout {
                    self.disconnect_client(client_id, true, "query_timeout");
                }
            }
        }
    }

    /// Stamp an auto-database that lost its last client and server, and
    /// park it on the idle list. Appending keeps that list sorted by
    /// `inactive_time`.
    fn autodb_check_inactive(&mut self, pool_id: PoolId, now: u64) {
        let Some(db_id) = self.pools.get(pool_id).map(|p| p.db) else {
            return;
        };
        let Some(db) = self.databases.get(db_id) else {
            return;
        };
        if !db.db_auto || db.inactive_time != 0 {
            return;
        }
        let Some(pool) = self.pools.get(pool_id) else {
            return;
        };
        if pool.client_count() != 0 || pool.server_count() != 0 {
            return;
        }
        if let Some(db) = self.databases.get_mut(db_id) {
            db.inactive_time = now;
        }
        self.database_list.retain(|&id| id != db_id);
        self.autodatabase_idle_list.push_back(db_id);
    }

    /// Drop auto-databases idle past the timeout. The list is ordered by
    /// `inactive_time`, so the walk stops at the first young entry.
    fn cleanup_inactive_autodatabases(&mut self, now: u64) {
        if self.cf.autodb_idle_timeout == 0 {
            return;
        }
        loop {
            let Some(&db_id) = self.autodatabase_idle_list.front() else {
                break;
            };
            let Some(db) = self.databases.get(db_id) else {
                self.autodatabase_idle_list.pop_front();
                continue;
            };
            if now.saturating_sub(db.inactive_time) > self.cf.autodb_idle_timeout {
                self.kill_database(db_id);
            } else {
                break;
            }
        }
    }

    /// Drop clients that never finished logging in.
    fn cleanup_client_logins(&mut self, now: u64) {
        if self.cf.client_login_timeout == 0 {
            return;
        }
        let logins: Vec<SocketId> = self.login_client_list.iter().copied().collect();
        for client_id in logins {
            let Some(client) = self.sockets.get(client_id) else {
                continue;
            };
            if now.saturating_sub(client.connect_time) > self.cf.client_login_timeout {
                self.disconnect_client(client_id, true, "client_login_timeout");
            }
        }
    }

    /// Tear down one pool, closing every connection it owns.
    pub fn kill_pool(&mut self, pool_id: PoolId) {
        let reason = "database removed";

        self.close_client_list(pool_id, SockList::ActiveClient, reason);
        self.close_client_list(pool_id, SockList::WaitingClient, reason);
        self.close_client_list(pool_id, SockList::CancelReq, reason);

        self.close_server_list(pool_id, SockList::ActiveServer, reason);
        self.close_server_list(pool_id, SockList::IdleServer, reason);
        self.close_server_list(pool_id, SockList::UsedServer, reason);
        self.close_server_list(pool_id, SockList::TestedServer, reason);
        self.close_server_list(pool_id, SockList::NewServer, reason);

        self.pool_list.retain(|&id| id != pool_id);
        self.pools.free(pool_id);
    }

    /// Drop a database and all its pools.
    pub fn kill_database(&mut self, db_id: DbId) {
        if let Some(db) = self.databases.get(db_id) {
            warn!(
                "dropping database '{}' as it does not exist anymore or is an inactive auto-database",
                db.name
            );
        }

        for pool_id in self.pool_list.clone() {
            if self.pools.get(pool_id).map(|p| p.db) == Some(db_id) {
                self.kill_pool(pool_id);
            }
        }

        if let Some(forced) = self.databases.get(db_id).and_then(|db| db.forced_user) {
            self.users.free(forced);
        }
        let inactive = self
            .databases
            .get(db_id)
            .map(|db| db.inactive_time != 0)
            .unwrap_or(false);
        if inactive {
            if let Some(pos) = self.autodatabase_idle_list.iter().position(|&id| id == db_id) {
                self.autodatabase_idle_list.remove(pos);
            }
        } else {
            self.database_list.retain(|&id| id != db_id);
        }
        self.databases.free(db_id);
    }
}
