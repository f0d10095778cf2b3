//! Lease store connection settings, read from the environment.

use std::fmt;
use std::time::Duration;

use clap::{Args, ValueEnum};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{PgPool, SqlitePool};
use tracing::info;

use crate::error::Result;

const ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// SQLite database file used when `DB_DATABASE` is unset.
pub const DEFAULT_SQLITE_DATABASE: &str = "nextdhcp.db";

/// PostgreSQL database used when `DB_DATABASE` is unset.
pub const DEFAULT_POSTGRES_DATABASE: &str = "dhcp";

const SQLITE_IN_MEMORY: &str = ":memory:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Driver {
    /// Local SQLite file.
    Sqlite,
    /// PostgreSQL.
    Psql,
    /// CockroachDB over the PostgreSQL wire protocol.
    Cockdb,
    /// In-process store with an optional JSON snapshot file.
    Memory,
}

#[derive(Clone, Args)]
pub struct DatabaseConfig {
    #[arg(long = "db-driver", env = "DB_DRIVER", value_enum, default_value = "sqlite")]
    pub driver: Driver,

    #[arg(long = "db-host", env = "DB_HOST", default_value = "localhost")]
    pub host: String,

    #[arg(long = "db-port", env = "DB_PORT", default_value_t = 5432)]
    pub port: u16,

    #[arg(long = "db-username", env = "DB_USERNAME", default_value = "postgres")]
    pub username: String,

    #[arg(long = "db-password", env = "DB_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Database name, or the file path for `sqlite`.
    #[arg(long = "db-database", env = "DB_DATABASE")]
    pub database: Option<String>,

    #[arg(long = "db-max-connections", env = "DB_MAX_CONNECTIONS", default_value_t = 8)]
    pub max_connections: u32,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database_name())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: Driver::Memory,
            host: "localhost".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: None,
            database: None,
            max_connections: 8,
        }
    }
}

impl DatabaseConfig {
    /// `DB_DATABASE`, or the driver's default.
    pub fn database_name(&self) -> &str {
        match (&self.database, self.driver) {
            (Some(name), _) => name,
            (None, Driver::Sqlite) => DEFAULT_SQLITE_DATABASE,
            (None, _) => DEFAULT_POSTGRES_DATABASE,
        }
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .database(self.database_name())
            .application_name("nextdhcp");

        match &self.password {
            Some(password) => options.password(password),
            None => options,
        }
    }

    /// Opens a connection pool to the configured database.
    pub async fn connect(&self) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
            .connect_with(self.connect_options())
            .await?;

        info!(
            "Connected to {:?} lease database {} at {}:{}",
            self.driver,
            self.database_name(),
            self.host,
            self.port
        );

        Ok(pool)
    }

    pub fn sqlite_options(&self) -> SqliteConnectOptions {
        let name = self.database_name();
        let options = if name == SQLITE_IN_MEMORY {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::new()
                .filename(name)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
        };
        options.busy_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
    }

    /// Opens the SQLite database, creating the file if needed.
    ///
    /// The pool holds a single connection, so store transactions never
    /// interleave. `DB_MAX_CONNECTIONS` does not apply.
    pub async fn connect_sqlite(&self) -> Result<SqlitePool> {
        let pool = sqlite_pool_options()
            .connect_with(self.sqlite_options())
            .await?;

        info!("Opened SQLite lease database {}", self.database_name());

        Ok(pool)
    }
}

/// One long-lived connection. An in-memory database lives as long as it.
pub fn sqlite_pool_options() -> SqlitePoolOptions {
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        database: DatabaseConfig,
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = TestCli::parse_from([
            "test",
            "--db-driver",
            "cockdb",
            "--db-host",
            "db.internal",
            "--db-port",
            "26257",
            "--db-password",
            "hunter2",
        ]);
        assert_eq!(cli.database.driver, Driver::Cockdb);
        assert_eq!(cli.database.host, "db.internal");
        assert_eq!(cli.database.port, 26257);
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = DatabaseConfig {
            password: Some("hunter2".to_string()),
            ..DatabaseConfig::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_sqlite_is_the_default_driver() {
        let cli = TestCli::parse_from(["test"]);
        assert_eq!(cli.database.driver, Driver::Sqlite);
        assert_eq!(cli.database.database_name(), DEFAULT_SQLITE_DATABASE);

        let cli = TestCli::parse_from(["test", "--db-driver", "psql"]);
        assert_eq!(cli.database.database_name(), DEFAULT_POSTGRES_DATABASE);

        let cli = TestCli::parse_from(["test", "--db-database", "/var/lib/dhcp/leases.db"]);
        assert_eq!(cli.database.database_name(), "/var/lib/dhcp/leases.db");
    }
}
