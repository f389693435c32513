//! RESP backend client pooled with deadpool
//!
//! One [`RespConnection`] serves one command at a time. [`RespStore`] checks a
//! connection out of the pool per command; a [`RespTransaction`] keeps its
//! connection checked out from `WATCH` until `EXEC` or `UNWATCH`, since the
//! watch is tied to the connection it was issued on.

use async_trait::async_trait;
use deadpool::managed;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, info};

use super::resp::{RespValue, encode_command, read_value};
use super::{
    BackendDescriptor, Connector, MemoryConnector, Store, StoreError, Transaction, TxOp,
    TxOutcome, ttl_secs,
};
use crate::constants::store::{COMMAND_TIMEOUT, POOL_MAX_SIZE, READ_BUFFER_SIZE};
use crate::stream::BackendStream;

/// A single RESP connection
#[derive(Debug)]
pub struct RespConnection {
    stream: BufReader<BackendStream>,
    timeout: Duration,
    /// Set after any connection-level failure; the pool discards it
    broken: bool,
    /// A WATCH is outstanding on this connection
    watching: bool,
}

impl RespConnection {
    /// Connect and select the configured database
    pub async fn open(
        descriptor: &BackendDescriptor,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let connect = async {
            match descriptor {
                BackendDescriptor::Tcp { host, port, .. } => {
                    BackendStream::connect_tcp(host, *port).await
                }
                #[cfg(unix)]
                BackendDescriptor::Unix { path } => BackendStream::connect_unix(path).await,
                #[cfg(not(unix))]
                BackendDescriptor::Unix { .. } => Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not supported on this platform",
                )),
                BackendDescriptor::Memory { name } => Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("memory://{name} has no network endpoint"),
                )),
            }
        };

        let stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        let mut conn = Self {
            stream: BufReader::with_capacity(READ_BUFFER_SIZE, stream),
            timeout,
            broken: false,
            watching: false,
        };

        if let BackendDescriptor::Tcp { db: Some(db), .. } = descriptor {
            let db = db.to_string();
            conn.expect_ok("SELECT", &[b"SELECT", db.as_bytes()]).await?;
        }

        Ok(conn)
    }

    /// Send one command and read its reply
    ///
    /// Error replies come back as [`StoreError::Server`]. A timeout or I/O
    /// failure marks the connection broken, since a reply may still be in
    /// flight and would desynchronize the next command.
    pub async fn command(&mut self, args: &[&[u8]]) -> Result<RespValue, StoreError> {
        let timeout = self.timeout;
        let result = match tokio::time::timeout(timeout, self.roundtrip(args)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        };
        if let Err(e) = &result
            && e.is_connection_error()
        {
            self.broken = true;
        }
        result
    }

    async fn roundtrip(&mut self, args: &[&[u8]]) -> Result<RespValue, StoreError> {
        let request = encode_command(args);
        let stream = self.stream.get_mut();
        stream.write_all(&request).await?;
        stream.flush().await?;
        read_value(&mut self.stream).await?.into_result()
    }

    async fn expect_ok(&mut self, command: &'static str, args: &[&[u8]]) -> Result<(), StoreError> {
        match self.command(args).await? {
            RespValue::Simple(s) if s == "OK" => Ok(()),
            other => Err(unexpected(command, &other)),
        }
    }

    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

fn unexpected(command: &'static str, reply: &RespValue) -> StoreError {
    StoreError::UnexpectedReply {
        command,
        reply: reply.kind().to_string(),
    }
}

fn expect_integer(command: &'static str, reply: RespValue) -> Result<i64, StoreError> {
    match reply {
        RespValue::Integer(n) => Ok(n),
        other => Err(unexpected(command, &other)),
    }
}

fn expect_bool(command: &'static str, reply: RespValue) -> Result<bool, StoreError> {
    Ok(expect_integer(command, reply)? > 0)
}

fn expect_bulk(command: &'static str, reply: RespValue) -> Result<Option<Vec<u8>>, StoreError> {
    match reply {
        RespValue::Bulk(value) => Ok(value),
        other => Err(unexpected(command, &other)),
    }
}

fn expect_array(command: &'static str, reply: RespValue) -> Result<Vec<RespValue>, StoreError> {
    match reply {
        RespValue::Array(Some(items)) => Ok(items),
        RespValue::Array(None) => Ok(Vec::new()),
        other => Err(unexpected(command, &other)),
    }
}

fn expect_strings(command: &'static str, reply: RespValue) -> Result<Vec<String>, StoreError> {
    expect_array(command, reply)?
        .into_iter()
        .map(|item| match item {
            RespValue::Bulk(Some(bytes)) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            RespValue::Simple(s) => Ok(s),
            other => Err(unexpected(command, &other)),
        })
        .collect()
}

fn parse_score(command: &'static str, raw: &[u8]) -> Result<f64, StoreError> {
    let text = std::str::from_utf8(raw).map_err(|_| StoreError::UnexpectedReply {
        command,
        reply: "non-utf8 score".into(),
    })?;
    match text {
        "inf" | "+inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        _ => text.parse::<f64>().map_err(|_| StoreError::UnexpectedReply {
            command,
            reply: format!("score {text:?}"),
        }),
    }
}

/// Deadpool manager creating [`RespConnection`]s for one backend
#[derive(Debug)]
pub struct RespManager {
    descriptor: BackendDescriptor,
    timeout: Duration,
}

impl RespManager {
    #[must_use]
    pub fn new(descriptor: BackendDescriptor, timeout: Duration) -> Self {
        Self {
            descriptor,
            timeout,
        }
    }
}

impl managed::Manager for RespManager {
    type Type = RespConnection;
    type Error = StoreError;

    async fn create(&self) -> Result<RespConnection, StoreError> {
        debug!("Opening connection to {}", self.descriptor);
        RespConnection::open(&self.descriptor, self.timeout).await
    }

    async fn recycle(
        &self,
        conn: &mut RespConnection,
        _: &managed::Metrics,
    ) -> managed::RecycleResult<StoreError> {
        if conn.broken {
            debug!("Discarding broken connection to {}", self.descriptor);
            return Err(managed::RecycleError::Message(
                "connection marked broken".into(),
            ));
        }
        if conn.watching {
            // A transaction was dropped mid-flight
            conn.command(&[b"UNWATCH"])
                .await
                .map_err(managed::RecycleError::Backend)?;
            conn.watching = false;
        }
        Ok(())
    }
}

type Pool = managed::Pool<RespManager>;

/// Store backed by a pool of RESP connections
#[derive(Debug, Clone)]
pub struct RespStore {
    pool: Pool,
    name: String,
}

impl RespStore {
    /// Build a pool for `descriptor`; no connection is opened yet
    pub fn new(
        descriptor: BackendDescriptor,
        max_size: usize,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let name = descriptor.to_string();
        let pool = Pool::builder(RespManager::new(descriptor, timeout))
            .max_size(max_size)
            .build()
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        info!(
            "Created connection pool for '{}' with max {} connections",
            name, max_size
        );
        Ok(Self { pool, name })
    }

    async fn connection(&self) -> Result<managed::Object<RespManager>, StoreError> {
        self.pool.get().await.map_err(|e| match e {
            managed::PoolError::Backend(e) => e,
            other => StoreError::Pool(other.to_string()),
        })
    }

    async fn command(&self, args: &[&[u8]]) -> Result<RespValue, StoreError> {
        let mut conn = self.connection().await?;
        conn.command(args).await
    }
}

#[async_trait]
impl Store for RespStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<(), StoreError> {
        match self.command(&[b"PING"]).await? {
            RespValue::Simple(s) if s == "PONG" => Ok(()),
            other => Err(unexpected("PING", &other)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        expect_bulk("GET", self.command(&[b"GET", key.as_bytes()]).await?)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        match self.command(&[b"SET", key.as_bytes(), value]).await? {
            RespValue::Simple(s) if s == "OK" => Ok(()),
            other => Err(unexpected("SET", &other)),
        }
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let secs = ttl_secs(ttl).to_string();
        match self
            .command(&[b"SET", key.as_bytes(), value, b"EX", secs.as_bytes()])
            .await?
        {
            RespValue::Simple(s) if s == "OK" => Ok(()),
            other => Err(unexpected("SET", &other)),
        }
    }

    async fn append(&self, key: &str, value: &[u8]) -> Result<u64, StoreError> {
        let reply = self.command(&[b"APPEND", key.as_bytes(), value]).await?;
        Ok(expect_integer("APPEND", reply)?.max(0) as u64)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let secs = ttl_secs(ttl).to_string();
        let reply = self
            .command(&[b"EXPIRE", key.as_bytes(), secs.as_bytes()])
            .await?;
        expect_bool("EXPIRE", reply)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        expect_bool("DEL", self.command(&[b"DEL", key.as_bytes()]).await?)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
        args.push(b"MGET");
        args.extend(keys.iter().map(|k| k.as_bytes()));

        let items = expect_array("MGET", self.command(&args).await?)?;
        if items.len() != keys.len() {
            return Err(StoreError::UnexpectedReply {
                command: "MGET",
                reply: format!("{} values for {} keys", items.len(), keys.len()),
            });
        }
        items
            .into_iter()
            .map(|item| expect_bulk("MGET", item))
            .collect()
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let reply = self
            .command(&[b"SADD", key.as_bytes(), member.as_bytes()])
            .await?;
        expect_bool("SADD", reply)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let reply = self
            .command(&[b"SREM", key.as_bytes(), member.as_bytes()])
            .await?;
        expect_bool("SREM", reply)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        expect_strings("SMEMBERS", self.command(&[b"SMEMBERS", key.as_bytes()]).await?)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<bool, StoreError> {
        let score = score.to_string();
        let reply = self
            .command(&[b"ZADD", key.as_bytes(), score.as_bytes(), member.as_bytes()])
            .await?;
        expect_bool("ZADD", reply)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        let reply = self
            .command(&[b"ZSCORE", key.as_bytes(), member.as_bytes()])
            .await?;
        expect_bulk("ZSCORE", reply)?
            .map(|raw| parse_score("ZSCORE", &raw))
            .transpose()
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<u64>, StoreError> {
        match self
            .command(&[b"ZRANK", key.as_bytes(), member.as_bytes()])
            .await?
        {
            RespValue::Integer(n) => Ok(Some(n.max(0) as u64)),
            RespValue::Bulk(None) => Ok(None),
            other => Err(unexpected("ZRANK", &other)),
        }
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let reply = self.command(&[b"ZCARD", key.as_bytes()]).await?;
        Ok(expect_integer("ZCARD", reply)?.max(0) as u64)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let start = start.to_string();
        let stop = stop.to_string();
        let reply = self
            .command(&[b"ZRANGE", key.as_bytes(), start.as_bytes(), stop.as_bytes()])
            .await?;
        expect_strings("ZRANGE", reply)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let reply = self
            .command(&[b"ZREM", key.as_bytes(), member.as_bytes()])
            .await?;
        expect_bool("ZREM", reply)
    }

    async fn watch(&self, key: &str) -> Result<Box<dyn Transaction>, StoreError> {
        let mut conn = self.connection().await?;
        conn.expect_ok("WATCH", &[b"WATCH", key.as_bytes()]).await?;
        conn.watching = true;
        Ok(Box::new(RespTransaction {
            conn,
            key: key.to_string(),
        }))
    }
}

/// WATCH / MULTI / EXEC on a checked-out connection
struct RespTransaction {
    conn: managed::Object<RespManager>,
    key: String,
}

#[async_trait]
impl Transaction for RespTransaction {
    fn key(&self) -> &str {
        &self.key
    }

    async fn get(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        let reply = self.conn.command(&[b"GET", self.key.as_bytes()]).await?;
        expect_bulk("GET", reply)
    }

    async fn execute(mut self: Box<Self>, op: TxOp) -> Result<TxOutcome, StoreError> {
        self.conn.expect_ok("MULTI", &[b"MULTI"]).await?;

        let queued = match &op {
            TxOp::Set(value) => {
                self.conn
                    .command(&[b"SET", self.key.as_bytes(), value])
                    .await
            }
            TxOp::Delete => self.conn.command(&[b"DEL", self.key.as_bytes()]).await,
        };
        if let Err(e) = queued {
            // Leave the connection clean for the pool
            if !self.conn.broken {
                self.conn.command(&[b"DISCARD"]).await.ok();
                self.conn.watching = false;
            }
            return Err(e);
        }

        let reply = self.conn.command(&[b"EXEC"]).await?;
        // EXEC clears the watch whatever the outcome
        self.conn.watching = false;
        match reply {
            RespValue::Array(None) => Ok(TxOutcome::Conflict),
            RespValue::Array(Some(results)) => {
                if let Some(RespValue::Error(message)) = results.into_iter().next() {
                    return Err(StoreError::Server(message));
                }
                Ok(TxOutcome::Committed)
            }
            other => Err(unexpected("EXEC", &other)),
        }
    }

    async fn discard(mut self: Box<Self>) -> Result<(), StoreError> {
        self.conn.expect_ok("UNWATCH", &[b"UNWATCH"]).await?;
        self.conn.watching = false;
        Ok(())
    }
}

/// Connector handling every descriptor kind
///
/// TCP and Unix descriptors get a pooled [`RespStore`]; `memory://`
/// descriptors are delegated to a shared [`MemoryConnector`] so in-process
/// backends survive reconnects.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    pool_size: usize,
    timeout: Duration,
    memory: MemoryConnector,
}

impl DefaultConnector {
    #[must_use]
    pub fn new(pool_size: usize, timeout: Duration) -> Self {
        Self {
            pool_size: pool_size.max(1),
            timeout,
            memory: MemoryConnector::default(),
        }
    }

    /// Backing in-memory connector, for seeding `memory://` backends
    #[must_use]
    pub fn memory(&self) -> &MemoryConnector {
        &self.memory
    }
}

impl Default for DefaultConnector {
    fn default() -> Self {
        Self::new(POOL_MAX_SIZE, COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, descriptor: &BackendDescriptor) -> Result<Arc<dyn Store>, StoreError> {
        if matches!(descriptor, BackendDescriptor::Memory { .. }) {
            return self.memory.connect(descriptor).await;
        }
        let store = RespStore::new(descriptor.clone(), self.pool_size, self.timeout)?;
        // Fail fast instead of adding an unreachable backend to the ring
        store.ping().await?;
        Ok(Arc::new(store))
    }
}
