//! Adapter between bb8 and the sqlx::Postgres driver.
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, default_provider::credentials::default_provider};
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_dsql::auth_token::{AuthTokenGenerator, Config};
use aws_types::SdkConfig;
use derive_builder::Builder;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgSslMode};
use sqlx::query::Query;
use sqlx::ConnectOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use super::connector::Connector;
use super::schema::{self, Placeholder};
use crate::config::{CONNECT_TIMEOUT, MAX_BIND_PARAMETERS, PING_TIMEOUT, TOKEN_VALIDITY_DURATION};
use crate::io::ChunkSource;
use crate::staging::{COLUMNS, Record};

pub type Bb8Connection<'a> = bb8::PooledConnection<'a, ConnectionManager>;

/// Inner pool variants
#[derive(Debug, Clone)]
enum PoolInner {
    Postgres(bb8::Pool<ConnectionManager>),
    #[cfg(test)]
    Sqlite(sqlx::SqlitePool),
}

/// Connection that can be either Postgres or SQLite
pub enum PoolConnection {
    Postgres(Bb8Connection<'static>),
    #[cfg(test)]
    Sqlite(sqlx::pool::PoolConnection<sqlx::Sqlite>),
}

/// Pooled database handle used by every worker unit.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: PoolInner,
    token_refresh: Option<AbortHandle>,
}

#[derive(Builder)]
pub struct PoolArgs {
    #[builder(setter(into))]
    endpoint: String,
    #[builder(default = "5432")]
    port: u16,
    #[builder(setter(into), default = "\"postgres\".to_string()")]
    database: String,
    #[builder(setter(into))]
    username: String,
    /// Static password. When absent a DSQL IAM token is generated for `region`.
    #[builder(setter(into, strip_option), default)]
    password: Option<String>,
    #[builder(setter(into, strip_option), default)]
    region: Option<Region>,
    #[builder(default = "true")]
    ssl: bool,
    #[builder(default)]
    min_idle: Option<u32>,
    #[builder(default = "100")]
    max_pool_size: u32,
}

pub async fn pool(args: PoolArgs) -> anyhow::Result<Pool> {
    let PoolArgs {
        endpoint,
        port,
        database,
        username,
        password,
        region,
        ssl,
        min_idle,
        max_pool_size,
    } = args;
    let ssl_mode = if ssl {
        PgSslMode::VerifyFull
    } else {
        PgSslMode::Disable
    };
    let connect_options = PgConnectOptions::new()
        .host(&endpoint)
        .port(port)
        .username(&username)
        .database(&database)
        .ssl_mode(ssl_mode)
        .to_owned();

    let connector = match (password, region) {
        (Some(password), _) => Postgres::with_password(connect_options.password(&password)),
        (None, Some(region)) => {
            let auth = DsqlIamDbAuthTokenProvider::new(
                &endpoint,
                region,
                TokenType::from(username.as_str()),
                SharedCredentialsProvider::new(default_provider().await),
            )
            .await
            .context("Failed to set up IAM authentication for DSQL cluster")?;
            Postgres::create_with_token_refresh(auth, connect_options).await?
        }
        (None, None) => {
            return Err(anyhow!(
                "Either a password or an AWS region for IAM authentication is required"
            ));
        }
    };

    let token_refresh = connector.spawn_token_refresh(endpoint);
    let conn_manager = ConnectionManager::new(connector);

    let bb8_pool = bb8::Builder::new()
        .min_idle(min_idle)
        .max_size(max_pool_size)
        .max_lifetime(Duration::from_secs(60 * 55))
        .build(conn_manager)
        .await
        .context("Failed to create connection pool")?;

    Ok(Pool {
        inner: PoolInner::Postgres(bb8_pool),
        token_refresh,
    })
}

impl Pool {
    /// Create an in-memory SQLite pool for testing
    #[cfg(test)]
    pub async fn sqlite_in_memory() -> Result<Self, sqlx::Error> {
        let sqlite_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Pool {
            inner: PoolInner::Sqlite(sqlite_pool),
            token_refresh: None,
        })
    }

    pub async fn acquire(&self) -> Result<PoolConnection, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let conn = pool.get_owned().await.map_err(|e| match e {
                    bb8::RunError::User(e) => e,
                    bb8::RunError::TimedOut => sqlx::Error::PoolTimedOut,
                })?;
                Ok(PoolConnection::Postgres(conn))
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => {
                let conn = pool.acquire().await?;
                Ok(PoolConnection::Sqlite(conn))
            }
        }
    }

    /// Execute a statement (for DDL like CREATE TABLE) - works for both Postgres and SQLite
    pub async fn execute_query(&self, sql: &str) -> Result<(), sqlx::Error> {
        match self.acquire().await? {
            PoolConnection::Postgres(mut conn) => {
                sqlx::query(sql).execute(&mut *conn).await?;
            }
            #[cfg(test)]
            PoolConnection::Sqlite(mut conn) => {
                sqlx::query(sql).execute(&mut *conn).await?;
            }
        }
        Ok(())
    }

    /// Bind one record's fields with their native types
    fn bind_record<'q>(
        query: Query<'q, sqlx::Postgres, PgArguments>,
        record: &'q Record,
    ) -> Query<'q, sqlx::Postgres, PgArguments> {
        query
            .bind(record.id)
            .bind(record.worker_id)
            .bind(record.connection_id)
            .bind(record.sequence_no)
            .bind(record.created_at)
            .bind(record.customer_id)
            .bind(record.product_id)
            .bind(record.order_id)
            .bind(record.category.as_str())
            .bind(record.status.as_str())
            .bind(record.is_active)
            .bind(record.is_priority)
            .bind(record.amount)
            .bind(record.description.as_str())
            .bind(record.payload.to_string())
    }

    /// Insert records into SQLite binding every field as text (for testing)
    #[cfg(test)]
    async fn insert_sqlite(
        conn: &mut sqlx::pool::PoolConnection<sqlx::Sqlite>,
        table: &str,
        records: &[Record],
    ) -> Result<u64> {
        const SQLITE_ROWS_PER_STATEMENT: usize = 500;

        let mut inserted = 0;
        for chunk in records.chunks(SQLITE_ROWS_PER_STATEMENT) {
            let sql = schema::insert_statement(table, chunk.len(), Placeholder::Positional);
            let mut query = sqlx::query(&sql);
            for record in chunk {
                for field in record.to_row() {
                    query = query.bind((!field.is_empty()).then_some(field));
                }
            }
            inserted += query.execute(&mut **conn).await?.rows_affected();
        }
        Ok(inserted)
    }
}

#[async_trait]
impl Connector for Pool {
    async fn check_connectivity(&self) -> Result<()> {
        let check = async {
            match self.acquire().await? {
                PoolConnection::Postgres(mut conn) => {
                    sqlx::query("SELECT 1").execute(&mut *conn).await?;
                }
                #[cfg(test)]
                PoolConnection::Sqlite(mut conn) => {
                    sqlx::query("SELECT 1").execute(&mut *conn).await?;
                }
            }
            Ok::<_, sqlx::Error>(())
        };

        tokio::time::timeout(PING_TIMEOUT, check)
            .await
            .map_err(|_| anyhow!("Timed out after {:?}", PING_TIMEOUT))?
            .context("Connectivity check failed")
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        self.execute_query(&schema::create_table_sql(table))
            .await
            .with_context(|| format!("Failed to create table {}", table))
    }

    async fn insert_batch(&self, table: &str, records: &[Record]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self
            .acquire()
            .await
            .context("Failed to acquire connection from pool")?;

        match &mut conn {
            PoolConnection::Postgres(pg) => {
                let rows_per_statement = MAX_BIND_PARAMETERS / COLUMNS.len();
                let mut inserted = 0;
                for chunk in records.chunks(rows_per_statement) {
                    let sql = schema::insert_statement(table, chunk.len(), Placeholder::Numbered);
                    let mut query = sqlx::query(&sql);
                    for record in chunk {
                        query = Self::bind_record(query, record);
                    }
                    inserted += query
                        .execute(&mut **pg)
                        .await
                        .context("Failed to execute batch insert")?
                        .rows_affected();
                }
                Ok(inserted)
            }
            #[cfg(test)]
            PoolConnection::Sqlite(sqlite_conn) => {
                Self::insert_sqlite(sqlite_conn, table, records).await
            }
        }
    }

    async fn copy_in(&self, table: &str, source: &mut dyn ChunkSource) -> Result<Option<u64>> {
        // Returned to the pool when dropped, whichever way this function exits
        let mut conn = self
            .acquire()
            .await
            .context("Failed to acquire connection for bulk load")?;

        match &mut conn {
            PoolConnection::Postgres(pg) => {
                let statement = schema::copy_statement(table);
                let mut copy = pg
                    .copy_in_raw(&statement)
                    .await
                    .context("Failed to start COPY")?;

                loop {
                    match source.next_chunk().await {
                        Ok(Some(chunk)) => {
                            debug!(bytes = chunk.len(), "streaming chunk");
                            copy.send(chunk).await.context("Failed to stream chunk")?;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = copy.abort(format!("{:#}", e)).await;
                            return Err(e);
                        }
                    }
                }

                let rows = copy.finish().await.context("Failed to complete COPY")?;
                Ok(Some(rows))
            }
            #[cfg(test)]
            PoolConnection::Sqlite(sqlite_conn) => {
                // SQLite has no COPY; parse the streamed artifact and insert its rows
                let bytes = crate::io::chunk_source::read_to_end(source).await?;
                let records = crate::staging::reader::parse_artifact(bytes.as_slice())?;
                let inserted = Self::insert_sqlite(sqlite_conn, table, &records).await?;
                Ok(Some(inserted))
            }
        }
    }

    async fn close(&self) {
        if let Some(handle) = &self.token_refresh {
            handle.abort();
        }
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let state = pool.state();
                info!(
                    connections = state.connections,
                    idle = state.idle_connections,
                    "releasing connection pool"
                );
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => pool.close().await,
        }
    }
}

// Wrap `Arc<Postgres>` so that we can implement the bb8::ManageConnection trait.
pub struct ConnectionManager {
    connector: Arc<Postgres>,
}

impl ConnectionManager {
    /// Create a new `ConnectionManager` with the specified connector.
    pub fn new(connector: Arc<Postgres>) -> Self {
        Self { connector }
    }
}

impl bb8::ManageConnection for ConnectionManager {
    type Connection = PgConnection;
    type Error = sqlx::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.connector.connect().await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        tokio::time::timeout(PING_TIMEOUT, sqlx::Connection::ping(conn))
            .await
            // Convert tokio timeouts into sqlx pool timeouts. bb8 will retry a different connection on ping failure.
            .map_err(|_| sqlx::Error::PoolTimedOut)
            // Make sure that we also look at the actual ping result
            .and_then(|result| result)?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        // sqlx::PgConnection provides no non-async way to check for closed/broken connections.
        false
    }
}

pub struct Postgres {
    iam_auth_token_provider: Option<DsqlIamDbAuthTokenProvider>,
    connect_options: RwLock<Arc<PgConnectOptions>>,
}

impl Postgres {
    pub fn with_password(connect_options: PgConnectOptions) -> Arc<Self> {
        Arc::new(Self {
            iam_auth_token_provider: None,
            connect_options: RwLock::new(Arc::new(connect_options)),
        })
    }

    // NOTE: `sqlx::PgConnectOptions` provides no way to update only the
    // password on every connection, so the options are swapped behind an
    // `RwLock` whenever a fresh token is generated.
    pub async fn create_with_token_refresh(
        iam_auth_token_provider: DsqlIamDbAuthTokenProvider,
        connect_options: PgConnectOptions,
    ) -> Result<Arc<Self>> {
        let token = iam_auth_token_provider.generate_token().await?;
        let base_connect_options = connect_options.password(&token);
        Ok(Arc::new(Self {
            iam_auth_token_provider: Some(iam_auth_token_provider),
            connect_options: RwLock::new(Arc::new(base_connect_options)),
        }))
    }

    async fn connect(&self) -> Result<PgConnection, sqlx::Error> {
        let connect_options = self
            .connect_options
            .read()
            .await
            // Clone the Arc so we don't hold the RwLockReadGuard across an async await point
            .clone();

        let conn = tokio::time::timeout(CONNECT_TIMEOUT, connect_options.connect())
            .await
            .map_err(|_| sqlx::Error::PoolTimedOut)??;

        Ok(conn)
    }

    /// Periodically regenerate the IAM token. No-op for password authentication.
    fn spawn_token_refresh(self: &Arc<Postgres>, endpoint: String) -> Option<AbortHandle> {
        self.iam_auth_token_provider.as_ref()?;
        tracing::info!(endpoint, "spawn token refresh task");

        let connector = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            tracing::info!(interval = ?interval.period(), "token refresh interval",);

            loop {
                interval.tick().await;
                tracing::debug!("refreshing credentials");

                if let Err(e) = connector.update_token().await {
                    tracing::warn!("token refresh failed: {:#}", e);
                }
            }
        });
        Some(handle.abort_handle())
    }

    async fn update_token(&self) -> Result<()> {
        let Some(provider) = &self.iam_auth_token_provider else {
            return Ok(());
        };
        let token = provider
            .generate_token()
            .await
            .map_err(|err| anyhow!("Failed to generate token: {err}"))?;
        let base = self.connect_options.read().await.clone();
        let base = Arc::unwrap_or_clone(base);
        let connect_options = base.password(token.as_str());
        let mut guard = self.connect_options.write().await;
        *guard = Arc::new(connect_options);
        Ok(())
    }
}

pub struct DsqlIamDbAuthTokenProvider {
    sdk_config: SdkConfig,
    signer: AuthTokenGenerator,
    token_type: TokenType,
}

pub enum TokenType {
    Admin,
    Regular,
}

impl From<&str> for TokenType {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().trim_ascii() {
            "admin" => Self::Admin,
            _ => Self::Regular,
        }
    }
}

impl DsqlIamDbAuthTokenProvider {
    pub async fn new(
        hostname: &str,
        region: Region,
        token_type: TokenType,
        credential_provider: SharedCredentialsProvider,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            sdk_config: aws_config::defaults(BehaviorVersion::latest())
                .credentials_provider(credential_provider.clone())
                .region(region.clone())
                .load()
                .await,
            signer: AuthTokenGenerator::new(
                Config::builder()
                    .expires_in(TOKEN_VALIDITY_DURATION.as_secs())
                    .hostname(hostname)
                    .region(region)
                    .build()
                    .map_err(|err| anyhow!(err))?,
            ),
            token_type,
        })
    }

    async fn generate_token(&self) -> anyhow::Result<String> {
        match self.token_type {
            TokenType::Admin => {
                self.signer
                    .db_connect_admin_auth_token(&self.sdk_config)
                    .await
            }
            TokenType::Regular => self.signer.db_connect_auth_token(&self.sdk_config).await,
        }
        .map(|token| token.to_string())
        .map_err(|err| anyhow!(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::{RecordGenerator, RecordSizeRange};

    async fn count_rows(pool: &Pool, table: &str) -> i64 {
        if let Ok(mut conn) = pool.acquire().await
            && let PoolConnection::Sqlite(ref mut sqlite_conn) = conn
        {
            let sql = format!("SELECT COUNT(*) FROM {}", schema::qualified_table_name(table));
            let (count,): (i64,) = sqlx::query_as(&sql)
                .fetch_one(&mut **sqlite_conn)
                .await
                .unwrap();
            return count;
        }
        0
    }

    #[test]
    fn test_token_type_from_username() {
        assert!(matches!(TokenType::from("admin"), TokenType::Admin));
        assert!(matches!(TokenType::from(" ADMIN "), TokenType::Admin));
        assert!(matches!(TokenType::from("loader"), TokenType::Regular));
    }

    #[test]
    fn test_pool_args_defaults() {
        let args = PoolArgsBuilder::default()
            .endpoint("localhost")
            .username("bench")
            .password("secret")
            .build()
            .unwrap();

        assert_eq!(args.port, 5432);
        assert_eq!(args.database, "postgres");
        assert!(args.ssl);
        assert!(args.region.is_none());
        assert_eq!(args.password.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_pool_requires_credentials() {
        let args = PoolArgsBuilder::default()
            .endpoint("localhost")
            .username("bench")
            .build()
            .unwrap();

        let err = pool(args).await.unwrap_err();
        assert!(err.to_string().contains("password or an AWS region"));
    }

    #[tokio::test]
    async fn test_sqlite_connectivity_and_insert() {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        pool.check_connectivity().await.unwrap();
        pool.ensure_table("bench_records").await.unwrap();
        // Idempotent
        pool.ensure_table("bench_records").await.unwrap();

        let mut generator = RecordGenerator::with_seed(0, 0, 8);
        let range = RecordSizeRange::new(512, 1024).unwrap();
        let records: Vec<Record> = (0..25).map(|_| generator.generate(range)).collect();

        let inserted = pool.insert_batch("bench_records", &records).await.unwrap();
        assert_eq!(inserted, 25);
        assert_eq!(count_rows(&pool, "bench_records").await, 25);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_insert_into_missing_table_fails() {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        let mut generator = RecordGenerator::with_seed(0, 0, 8);
        let record = generator.generate(RecordSizeRange::new(512, 512).unwrap());

        assert!(pool.insert_batch("missing", &[record]).await.is_err());
    }
}
