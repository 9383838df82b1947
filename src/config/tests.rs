//! Loader tests.

use std::io::Write;

use super::*;
use crate::pool::{Bouncer, DbLocation, PgSocket, SockState};
use crate::utils::clock::USEC;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn load(content: &str) -> Bouncer {
    let file = write_config(content);
    let mut bouncer = Bouncer::new(Config::default());
    load_config(&mut bouncer, file.path().to_str().unwrap(), false).unwrap();
    bouncer
}

#[test]
fn settings_and_databases_load_together() {
    let bouncer = load(
        "[pg_usher]\n\
         listen_port = 6000\n\
         auth_type = trust\n\
         query_timeout = 5\n\
         max_client_conn = unlimited\n\
         default_pool_size = 7\n\
         [databases]\n\
         db1 = host=127.0.0.1 port=6432 pool_size=10\n\
         alias = host=127.0.0.1 dbname=real connect_query='SET a=''b'''\n\
         * = host=127.0.0.1\n",
    );

    assert_eq!(bouncer.cf.listen_port, 6000);
    assert_eq!(bouncer.cf.auth_type, AuthType::Trust);
    assert_eq!(bouncer.cf.query_timeout, 5 * USEC);
    assert_eq!(bouncer.cf.max_client_conn, -1);
    assert_eq!(
        bouncer.cf.autodb_connstr.as_deref(),
        Some("host=127.0.0.1")
    );

    let db1 = bouncer.database(bouncer.find_database_id("db1").unwrap());
    assert_eq!(db1.port, 6432);
    assert_eq!(db1.pool_size, 10);
    assert_eq!(db1.dbname, "db1");
    assert_eq!(
        db1.location,
        DbLocation::Tcp {
            ip: "127.0.0.1".parse().unwrap()
        }
    );

    let alias = bouncer.database(bouncer.find_database_id("alias").unwrap());
    assert_eq!(alias.dbname, "real");
    assert_eq!(alias.connect_query.as_deref(), Some("SET a='b'"));
    // Defaults were filled in by postprocess.
    assert_eq!(alias.pool_size, 7);
    // The prebuilt startup tail names the backend database.
    assert!(alias
        .startup_params
        .windows(14)
        .any(|w| w == b"database\0real\0"));
}

#[test]
fn forced_user_is_created_from_connstring() {
    let bouncer = load(
        "[databases]\n\
         db1 = host=127.0.0.1 user=svc password=sekret\n",
    );
    let db = bouncer.database(bouncer.find_database_id("db1").unwrap());
    let forced = db.forced_user.expect("forced user");
    let user = bouncer.users.get(forced).unwrap();
    assert_eq!(user.name, "svc");
    assert_eq!(user.passwd, "sekret");
    // Forced users are not reachable through the auth-file lookup.
    assert!(bouncer.find_user_id("svc").is_none());
}

#[test]
fn hostless_database_needs_a_unix_socket_dir() {
    let bouncer = load("[databases]\ndb1 = port=5432\n");
    assert!(bouncer.find_database_id("db1").is_none());

    let bouncer = load(
        "[pg_usher]\n\
         unix_socket_dir = /tmp\n\
         [databases]\n\
         db1 = port=5432\n",
    );
    let db = bouncer.database(bouncer.find_database_id("db1").unwrap());
    assert_eq!(db.location, DbLocation::Unix { dir: String::new() });
}

#[test]
fn unknown_connstring_parameter_skips_the_entry() {
    let bouncer = load("[databases]\ndb1 = host=127.0.0.1 sslmode=lol\n");
    assert!(bouncer.find_database_id("db1").is_none());
}

#[test]
fn bad_setting_value_aborts_first_load() {
    let file = write_config("[pg_usher]\nquery_timeout = soon\n");
    let mut bouncer = Bouncer::new(Config::default());
    assert!(load_config(&mut bouncer, file.path().to_str().unwrap(), false).is_err());
}

#[test]
fn unknown_setting_key_is_tolerated() {
    let bouncer = load("[pg_usher]\nfancy_new_knob = 1\nlisten_port = 7000\n");
    assert_eq!(bouncer.cf.listen_port, 7000);
}

#[test]
fn reload_tags_changed_databases_and_kills_missing_ones() {
    let first = write_config(
        "[databases]\n\
         db1 = host=127.0.0.1 port=5432\n\
         db2 = host=127.0.0.1 port=5432\n",
    );
    let mut bouncer = Bouncer::new(Config::default());
    load_config(&mut bouncer, first.path().to_str().unwrap(), false).unwrap();

    let db1 = bouncer.find_database_id("db1").unwrap();
    let db2 = bouncer.find_database_id("db2").unwrap();

    // Give db1 a pool with one idle server.
    let user = bouncer.add_user("alice", "pw");
    let pool_id = bouncer.get_pool(db1, user);
    let mut server = PgSocket::new_server("127.0.0.1:5432".into(), 0, false);
    server.state = SockState::SvIdle;
    server.pool = Some(pool_id);
    server.ready = true;
    let server_id = bouncer.sockets.alloc(server);
    bouncer
        .pools
        .get_mut(pool_id)
        .unwrap()
        .idle_server_list
        .push_back(server_id);

    // Reload: db1 moves port, db2 disappears.
    let second = write_config("[databases]\ndb1 = host=127.0.0.1 port=6000\n");
    load_config(&mut bouncer, second.path().to_str().unwrap(), true).unwrap();

    assert!(bouncer.sockets.get(server_id).unwrap().close_needed);
    assert_eq!(bouncer.database(db1).port, 6000);
    assert!(bouncer.databases.get(db2).is_none());
    assert!(bouncer.find_database_id("db2").is_none());
}

#[test]
fn reload_without_changes_keeps_servers() {
    let file = write_config("[databases]\ndb1 = host=127.0.0.1 port=5432\n");
    let mut bouncer = Bouncer::new(Config::default());
    load_config(&mut bouncer, file.path().to_str().unwrap(), false).unwrap();

    let db1 = bouncer.find_database_id("db1").unwrap();
    let user = bouncer.add_user("alice", "pw");
    let pool_id = bouncer.get_pool(db1, user);
    let mut server = PgSocket::new_server("127.0.0.1:5432".into(), 0, false);
    server.state = SockState::SvIdle;
    server.pool = Some(pool_id);
    let server_id = bouncer.sockets.alloc(server);
    bouncer
        .pools
        .get_mut(pool_id)
        .unwrap()
        .idle_server_list
        .push_back(server_id);

    load_config(&mut bouncer, file.path().to_str().unwrap(), true).unwrap();
    assert!(!bouncer.sockets.get(server_id).unwrap().close_needed);
    assert!(bouncer.databases.get(db1).is_some());
}

#[test]
fn unreadable_config_fails() {
    let mut bouncer = Bouncer::new(Config::default());
    assert!(load_config(&mut bouncer, "/does/not/exist.ini", false).is_err());
}

#[test]
fn auth_file_reload_disables_vanished_users() {
    let mut auth = tempfile::NamedTempFile::new().unwrap();
    writeln!(auth, "\"alice\" \"pw1\"").unwrap();
    writeln!(auth, "\"bob\" \"pw2\"").unwrap();
    auth.flush().unwrap();

    let mut bouncer = Bouncer::new(Config::default());
    bouncer.cf.auth_file = Some(auth.path().to_str().unwrap().to_string());
    assert!(users_check(&mut bouncer));

    let alice = bouncer.find_user_id("alice").unwrap();
    assert_eq!(bouncer.users.get(alice).unwrap().passwd, "pw1");

    // Unchanged file: the stat cache short-circuits.
    assert!(users_check(&mut bouncer));

    // Rewrite without bob; he stays behind but disabled.
    std::thread::sleep(std::time::Duration::from_millis(20));
    let mut f = std::fs::File::create(auth.path()).unwrap();
    writeln!(f, "\"alice\" \"pw9\"").unwrap();
    f.flush().unwrap();
    assert!(users_check(&mut bouncer));

    assert_eq!(bouncer.users.get(alice).unwrap().passwd, "pw9");
    let bob = bouncer.find_user_id("bob").unwrap();
    assert!(bouncer.users.get(bob).unwrap().disabled());
}

#[test]
fn missing_auth_file_resets_the_cache() {
    let mut bouncer = Bouncer::new(Config::default());
    bouncer.cf.auth_file = Some("/does/not/exist.users".to_string());
    assert!(!users_check(&mut bouncer));
    assert!(bouncer.auth_stat.is_none());
}
