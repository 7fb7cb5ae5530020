#![allow(dead_code)]

//! PostgreSQL test infrastructure module.
//!
//! Starts one shared PostgreSQL container per test binary and hands out a fresh, uniquely named
//! database to every test.

use std::sync::OnceLock;

use postgres::{Client, NoTls};
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Default credentials for testcontainers-modules postgres
const PG_USER: &str = "postgres";
const PG_PASSWORD: &str = "postgres";
const PG_DB: &str = "postgres";

/// Mapped port of the shared container, set once it has started.
static POSTGRES_PORT: OnceLock<u16> = OnceLock::new();

fn postgres_port() -> u16 {
    *POSTGRES_PORT.get_or_init(|| {
        let runtime = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
        let port = runtime.block_on(async {
            let container = Postgres::default()
                .start()
                .await
                .expect("failed to start postgres container");
            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get postgres port");
            // keep the container running for the rest of the test binary
            std::mem::forget(container);
            port
        });
        std::mem::forget(runtime);
        port
    })
}

/// Get a PostgreSQL connection URL for a specific database.
fn url_with_db(db: &str) -> String {
    format!(
        "postgres://{}:{}@127.0.0.1:{}/{}",
        PG_USER,
        PG_PASSWORD,
        postgres_port(),
        db
    )
}

/// Create a fresh PostgreSQL database with a unique name for isolated testing.
///
/// Returns a Client connected to the new database and the database name.
pub fn fresh_postgres_db() -> (Client, String) {
    let mut admin =
        Client::connect(&url_with_db(PG_DB), NoTls).expect("failed to connect as admin");

    let db_name = format!("test_{}", Uuid::new_v4().simple());
    admin
        .execute(&format!("CREATE DATABASE \"{}\"", db_name), &[])
        .expect("failed to create test database");
    drop(admin);

    let client =
        Client::connect(&url_with_db(&db_name), NoTls).expect("failed to connect to test database");
    (client, db_name)
}

/// A Client connected to a fresh, isolated database.
pub fn get_test_client() -> Client {
    let (client, _db_name) = fresh_postgres_db();
    client
}
