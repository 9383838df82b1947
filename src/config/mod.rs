//! Configuration: the settings struct, the INI-driven loader, and reload
//! handling for databases and users.

pub mod conninfo;
pub mod ini;
pub mod users;

#[cfg(test)]
mod tests;

use std::fs;

use bytes::{BufMut, BytesMut};
use log::{error, info, warn};

use crate::errors::{ConfigError, Error};
use crate::pool::{Bouncer, DbId, DbLocation};
use crate::utils::clock::USEC;

/// Name of the settings section in the config file.
pub const SETTINGS_SECTION: &str = "pg_usher";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Trust,
    Plain,
    Md5,
}

impl std::str::FromStr for AuthType {
    type Err = ();

    fn from_str(s: &str) -> Result<AuthType, ()> {
        match s {
            "trust" => Ok(AuthType::Trust),
            "plain" => Ok(AuthType::Plain),
            "md5" => Ok(AuthType::Md5),
            _ => Err(()),
        }
    }
}

/// Runtime settings. Every timeout is in microseconds; a zero timeout
/// disables the check.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub listen_port: u16,
    /// Directory for the Unix listening socket and for databases without a
    /// `host=`; empty disables Unix sockets.
    pub unix_socket_dir: String,
    pub auth_type: AuthType,
    pub auth_file: Option<String>,

    /// Process-wide cap on client connections.
    pub max_client_conn: i32,
    /// Per-database default cap, −1 for unlimited.
    pub default_max_client_conn: i32,
    pub default_pool_size: i32,
    pub res_pool_size: i32,

    pub server_check_query: String,
    pub server_check_delay: u64,
    pub server_idle_timeout: u64,
    pub server_lifetime: u64,
    pub server_connect_timeout: u64,
    pub query_timeout: u64,
    pub client_idle_timeout: u64,
    pub client_login_timeout: u64,
    pub autodb_idle_timeout: u64,
    pub suspend_timeout: u64,

    /// Template connstring from the `*` database entry.
    pub autodb_connstr: Option<String>,

    pub log_pooler_errors: bool,
    /// Keep a TraceBuf on every socket, dumped on abnormal close.
    pub trace_connections: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 6432,
            unix_socket_dir: String::new(),
            auth_type: AuthType::Md5,
            auth_file: None,
            max_client_conn: 100,
            default_max_client_conn: -1,
            default_pool_size: 20,
            res_pool_size: 0,
            server_check_query: "select 1".to_string(),
            server_check_delay: 30 * USEC,
            server_idle_timeout: 600 * USEC,
            server_lifetime: 3600 * USEC,
            server_connect_timeout: 15 * USEC,
            query_timeout: 0,
            client_idle_timeout: 0,
            client_login_timeout: 60 * USEC,
            autodb_idle_timeout: 3600 * USEC,
            suspend_timeout: 10 * USEC,
            autodb_connstr: None,
            log_pooler_errors: true,
            trace_connections: false,
        }
    }
}

impl Config {
    /// Apply one `key = value` from the settings section.
    pub fn set_param(&mut self, key: &str, value: &str) -> Result<(), Error> {
        let key_lc = key.to_ascii_lowercase();
        match key_lc.as_str() {
            "listen_addr" => self.listen_addr = value.to_string(),
            "listen_port" => self.listen_port = parse_num(key, value)?,
            "unix_socket_dir" => self.unix_socket_dir = value.to_string(),
            "auth_type" => {
                self.auth_type = value.parse().map_err(|_| bad_value(key, value))?
            }
            "auth_file" => self.auth_file = Some(value.to_string()),
            "max_client_conn" => self.max_client_conn = parse_limit(key, value)?,
            "default_max_client_conn" => {
                self.default_max_client_conn = parse_limit(key, value)?
            }
            "default_pool_size" => self.default_pool_size = parse_limit(key, value)?,
            "reserve_pool_size" => self.res_pool_size = parse_limit(key, value)?,
            "server_check_query" => self.server_check_query = value.to_string(),
            "server_check_delay" => self.server_check_delay = parse_time(key, value)?,
            "server_idle_timeout" => self.server_idle_timeout = parse_time(key, value)?,
            "server_lifetime" => self.server_lifetime = parse_time(key, value)?,
            "server_connect_timeout" => {
                self.server_connect_timeout = parse_time(key, value)?
            }
            "query_timeout" => self.query_timeout = parse_time(key, value)?,
            "client_idle_timeout" => self.client_idle_timeout = parse_time(key, value)?,
            "client_login_timeout" => {
                self.client_login_timeout = parse_time(key, value)?
            }
            "autodb_idle_timeout" => self.autodb_idle_timeout = parse_time(key, value)?,
            "suspend_timeout" => self.suspend_timeout = parse_time(key, value)?,
            "log_pooler_errors" => self.log_pooler_errors = parse_bool(key, value)?,
            "trace_connections" => self.trace_connections = parse_bool(key, value)?,
            _ => {
                return Err(Error::BadConfig(ConfigError::UnknownParameter(
                    key.to_string(),
                )))
            }
        }
        Ok(())
    }
}

fn bad_value(key: &str, value: &str) -> Error {
    Error::BadConfig(ConfigError::BadValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value.parse().map_err(|_| bad_value(key, value))
}

fn parse_limit(key: &str, value: &str) -> Result<i32, Error> {
    conninfo::parse_unlimited_int(value).ok_or_else(|| bad_value(key, value))
}

/// Times are whole seconds in the file, microseconds in memory.
fn parse_time(key: &str, value: &str) -> Result<u64, Error> {
    if !value.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(bad_value(key, value));
    }
    let secs: u64 = value.parse().map_err(|_| bad_value(key, value))?;
    Ok(secs * USEC)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(bad_value(key, value)),
    }
}

/// Load (or reload) the config file into the running context.
///
/// On reload, databases missing from the new file are killed and databases
/// whose connection settings changed get every server tagged for recycling.
/// Parameter errors on reload are logged but never abort the process.
pub fn load_config(bouncer: &mut Bouncer, path: &str, reload: bool) -> Result<(), Error> {
    let text = fs::read_to_string(path).map_err(|source| {
        Error::BadConfig(ConfigError::Unreadable {
            path: path.to_string(),
            source,
        })
    })?;
    let file = ini::parse_ini(path, &text)?;

    if reload {
        // Entries still dead after the parse are gone from the file.
        for db_id in bouncer.databases.ids() {
            if let Some(db) = bouncer.databases.get_mut(db_id) {
                if !db.db_auto {
                    db.db_dead = true;
                }
            }
        }
    }

    for section in &file.sections {
        if section.name.eq_ignore_ascii_case(SETTINGS_SECTION) {
            for (key, value) in &section.entries {
                match bouncer.cf.set_param(key, value) {
                    Ok(()) => {}
                    Err(Error::BadConfig(ConfigError::UnknownParameter(key))) => {
                        warn!("unknown parameter in config: {key}");
                    }
                    Err(err) if reload => error!("{err}"),
                    Err(err) => return Err(err),
                }
            }
        } else if section.name.eq_ignore_ascii_case("databases") {
            for (name, connstr) in &section.entries {
                parse_database(bouncer, name, connstr);
            }
        } else {
            warn!("unknown section in config: {}", section.name);
        }
    }

    config_postprocess(bouncer);
    Ok(())
}

/// Fill database defaults and drop entries that did not survive a reload.
pub fn config_postprocess(bouncer: &mut Bouncer) {
    let defaults = (
        bouncer.cf.default_max_client_conn,
        bouncer.cf.default_pool_size,
        bouncer.cf.res_pool_size,
    );
    for db_id in bouncer.databases.ids() {
        let Some(db) = bouncer.databases.get_mut(db_id) else {
            continue;
        };
        if db.db_dead {
            bouncer.kill_database(db_id);
            continue;
        }
        if db.max_client_conn < -1 {
            db.max_client_conn = defaults.0;
        }
        if db.pool_size < -1 {
            db.pool_size = defaults.1;
        }
        if db.res_pool_size < 0 {
            db.res_pool_size = defaults.2;
        }
    }
}

/// Fill a database from its connstring. Errors are logged and the entry is
/// skipped, leaving any previous definition in place.
pub fn parse_database(bouncer: &mut Bouncer, name: &str, connstr: &str) {
    if name == "*" {
        bouncer.cf.autodb_connstr = Some(connstr.to_string());
        return;
    }

    let pairs = match conninfo::scan_pairs(connstr) {
        Ok(pairs) => pairs,
        Err(_) => {
            error!("{name}: syntax error in connstring");
            return;
        }
    };

    let mut dbname = name.to_string();
    let mut host: Option<String> = None;
    let mut port_str = "5432".to_string();
    let mut username: Option<String> = None;
    let mut password = String::new();
    let mut client_encoding: Option<String> = None;
    let mut datestyle: Option<String> = None;
    let mut timezone: Option<String> = None;
    let mut connect_query: Option<String> = None;
    let mut max_client_conn: i32 = -2;
    let mut pool_size: i32 = -2;
    let mut res_pool_size: i32 = -1;

    for (key, value) in pairs {
        match key.as_str() {
            "dbname" => dbname = value,
            "host" => host = Some(value),
            "port" => port_str = value,
            "user" => username = Some(value),
            "password" => password = value,
            "client_encoding" => client_encoding = Some(value),
            "datestyle" => datestyle = Some(value),
            "timezone" => timezone = Some(value),
            "connect_query" => connect_query = Some(value),
            "max_client_conn" => match conninfo::parse_unlimited_int(&value) {
                Some(n) => max_client_conn = n,
                None => {
                    error!("skipping database {name} because of bad max_client_conn: {value}");
                    return;
                }
            },
            "pool_size" => match conninfo::parse_unlimited_int(&value) {
                Some(n) => pool_size = n,
                None => {
                    error!("skipping database {name} because of bad pool_size: {value}");
                    return;
                }
            },
            "reserve_pool" => match conninfo::parse_unlimited_int(&value) {
                Some(n) => res_pool_size = n,
                None => {
                    error!("skipping database {name} because of bad reserve_pool: {value}");
                    return;
                }
            },
            _ => {
                error!(
                    "skipping database {name} because of unknown parameter in connstring: {key}"
                );
                return;
            }
        }
    }

    let location = match &host {
        None => {
            if bouncer.cf.unix_socket_dir.is_empty() {
                error!("skipping database {name} because unix socket not configured");
                return;
            }
            // Empty dir means the configured default at dial time.
            DbLocation::Unix { dir: String::new() }
        }
        Some(h) => match conninfo::classify_host(h) {
            Ok(conninfo::HostSpec::UnixDir(dir)) => DbLocation::Unix { dir },
            Ok(conninfo::HostSpec::Ipv4(ip)) => DbLocation::Tcp { ip },
            Ok(conninfo::HostSpec::Name(dns_name)) => {
                match conninfo::resolve_ipv4(&dns_name, 0) {
                    Some(ip) => DbLocation::Tcp { ip },
                    None => {
                        error!("{name}: resolving host={dns_name} failed");
                        return;
                    }
                }
            }
            Err(_) => {
                error!("skipping database {name} because of bad host: {h}");
                return;
            }
        },
    };

    let port: u16 = match port_str.parse() {
        Ok(p) if p != 0 => p,
        _ => {
            error!("skipping database {name} because of bad port: {port_str}");
            return;
        }
    };

    let db_id = match bouncer.find_database_id(name) {
        Some(id) => id,
        None => bouncer.add_database(name),
    };

    // If updating an old db, check whether anything significant changed.
    let forced_user_name = bouncer
        .database(db_id)
        .forced_user
        .and_then(|u| bouncer.users.get(u))
        .map(|u| u.name.clone());
    {
        let db = bouncer.database(db_id);
        if !db.dbname.is_empty() {
            let changed = db.dbname != dbname
                || db.location != location
                || db.port != port
                || forced_user_name.as_deref() != username.as_deref()
                || db.connect_query.as_deref() != connect_query.as_deref();
            if changed {
                info!("database {name} changed, tagging old connections");
                tag_database_dirty(bouncer, db_id);
            }
        }
    }

    // Prebuild the StartupMessage key/value tail.
    let mut params = BytesMut::new();
    put_param(&mut params, "database", &dbname);
    if let Some(value) = &client_encoding {
        put_param(&mut params, "client_encoding", value);
    }
    if let Some(value) = &datestyle {
        put_param(&mut params, "datestyle", value);
    }
    if let Some(value) = &timezone {
        put_param(&mut params, "timezone", value);
    }

    {
        let Some(db) = bouncer.databases.get_mut(db_id) else {
            return;
        };
        db.db_dead = false;
        db.db_auto = false;
        db.inactive_time = 0;
        db.dbname = dbname;
        db.location = location;
        db.port = port;
        db.max_client_conn = max_client_conn;
        db.pool_size = pool_size;
        db.res_pool_size = res_pool_size;
        db.connect_query = connect_query;
        db.startup_params = params;
    }

    if let Some(username) = username {
        bouncer.force_user(db_id, &username, &password);
    } else if bouncer.database(db_id).forced_user.is_some() {
        warn!("losing forced user not supported, keeping old setting");
    }
}

fn put_param(buf: &mut BytesMut, key: &str, value: &str) {
    buf.put_slice(key.as_bytes());
    buf.put_u8(0);
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Materialize a database from the `*` template for an unknown name.
pub fn register_auto_database(bouncer: &mut Bouncer, name: &str) -> Option<DbId> {
    let template = bouncer.cf.autodb_connstr.clone()?;
    parse_database(bouncer, name, &template);
    let db_id = bouncer.find_database_id(name)?;
    config_postprocess(bouncer);
    if let Some(db) = bouncer.databases.get_mut(db_id) {
        db.db_auto = true;
    }
    Some(db_id)
}

/// Tag every server connection of the database's pools for recycling.
pub fn tag_database_dirty(bouncer: &mut Bouncer, db_id: DbId) {
    for pool_id in bouncer.pool_list.clone() {
        let Some(pool) = bouncer.pools.get(pool_id) else {
            continue;
        };
        if pool.db != db_id {
            continue;
        }
        let servers: Vec<_> = pool.all_servers();
        for server_id in servers {
            if let Some(server) = bouncer.sockets.get_mut(server_id) {
                server.close_needed = true;
            }
        }
    }
}

/// Reload the auth file if its stat signature changed.
pub fn users_check(bouncer: &mut Bouncer) -> bool {
    let Some(path) = bouncer.cf.auth_file.clone() else {
        return true;
    };
    let cur = users::stat_file(&path);
    if cur.is_some() && cur == bouncer.auth_stat {
        return true;
    }
    bouncer.auth_stat = cur;
    load_auth_file(bouncer, &path)
}

/// Replace the user list from the auth file. Users that vanished stay
/// behind with an empty password, which rejects them at login.
pub fn load_auth_file(bouncer: &mut Bouncer, path: &str) -> bool {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            error!("cannot read auth file {path}: {err}");
            bouncer.auth_stat = None;
            return false;
        }
    };

    bouncer.disable_users();
    for (user, password) in users::parse_auth_file(&text) {
        bouncer.add_user(&user, &password);
    }
    info!("auth file {path} loaded");
    true
}
