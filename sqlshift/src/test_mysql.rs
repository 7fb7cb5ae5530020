#![allow(dead_code)]

//! MySQL test infrastructure module.
//!
//! Starts one shared MySQL container per test binary and hands out a fresh, uniquely named database
//! to every test.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use mysql::prelude::*;
use mysql::{Conn, Opts, Pool};
use testcontainers::core::logs::LogFrame;
use testcontainers::runners::AsyncRunner;
use testcontainers::{GenericImage, ImageExt};
use uuid::Uuid;

const ROOT_PASSWORD: &str = "rootpw";
const BOOTSTRAP_DB: &str = "bootstrap";

/// Mapped port of the shared container, set once it has started.
static MYSQL_PORT: OnceLock<u16> = OnceLock::new();

fn mysql_port() -> u16 {
    *MYSQL_PORT.get_or_init(|| {
        let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
        let port = runtime.block_on(async {
            // the entrypoint starts a temporary server first; only the second "ready" line counts
            let temporary_server_started = Arc::new(AtomicBool::new(false));
            let mysql_ready = Arc::new(AtomicBool::new(false));
            let temp_clone = Arc::clone(&temporary_server_started);
            let ready_clone = Arc::clone(&mysql_ready);

            let log_consumer = move |log: &LogFrame| {
                let msg = format!("{:?}", log);
                if msg.contains("Temporary server started") {
                    temp_clone.store(true, Ordering::SeqCst);
                } else if temp_clone.load(Ordering::SeqCst)
                    && msg.contains("/usr/sbin/mysqld: ready for connections")
                {
                    ready_clone.store(true, Ordering::SeqCst);
                }
            };

            let image = GenericImage::new("mysql", "8.4")
                .with_log_consumer(log_consumer)
                .with_env_var("MYSQL_ROOT_PASSWORD", ROOT_PASSWORD)
                .with_env_var("MYSQL_DATABASE", BOOTSTRAP_DB);

            let container = image
                .start()
                .await
                .expect("failed to start mysql container");
            while !mysql_ready.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            let port = container
                .get_host_port_ipv4(3306)
                .await
                .expect("failed to get mysql port");
            // keep the container running for the rest of the test binary
            std::mem::forget(container);
            port
        });
        std::mem::forget(runtime);
        port
    })
}

/// Get a MySQL connection URL for a specific database.
fn url_with_db(db: &str) -> String {
    format!(
        "mysql://root:{}@127.0.0.1:{}/{}",
        ROOT_PASSWORD,
        mysql_port(),
        db
    )
}

/// Create a fresh MySQL database with a unique name for isolated testing.
///
/// Returns a Pool connected to the new database and the database name.
pub fn fresh_mysql_db() -> (Pool, String) {
    let admin_pool = Pool::new(Opts::from_url(&url_with_db(BOOTSTRAP_DB)).expect("parse admin url"))
        .expect("create admin pool");
    let mut admin = admin_pool.get_conn().expect("failed to get admin conn");

    let db_name = format!("test_{}", Uuid::new_v4().simple());
    admin
        .query_drop(format!(
            "CREATE DATABASE `{}` CHARACTER SET utf8mb4",
            db_name
        ))
        .expect("failed to create test database");

    let pool = Pool::new(Opts::from_url(&url_with_db(&db_name)).expect("parse test url"))
        .expect("create test pool");
    (pool, db_name)
}

/// A connection to a fresh, isolated database. The pool keeps it alive.
pub fn get_test_conn() -> (Pool, Conn) {
    let (pool, _db_name) = fresh_mysql_db();
    let conn = pool
        .get_conn()
        .expect("failed to get test conn")
        .unwrap();
    (pool, conn)
}
