use std::{collections::BTreeSet, time::Duration};

use bytes::{Buf as _, BytesMut};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
    sync::Mutex,
    time::timeout,
};
use tracing::{debug, info, warn};

use super::{BoxFuture, Medium, MediumError};

pub mod resp;

use resp::{Decoded, Reply};

pub const DEFAULT_ADDR: &str = "127.0.0.1:6379";

const SCAN_COUNT: &str = "100";

/// Upper bound on buffer growth ahead of a partially received reply.
const MAX_RESERVE: usize = 1 << 20;

/// How documents are written to and read from the cache.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentMode {
    /// `JSON.SET` / `JSON.GET`; needs the RedisJSON module.
    Json,
    /// Plain `SET` / `GET` of the serialized document.
    String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisOptions {
    pub addr: String,
    pub db: Option<u32>,
    pub mode: DocumentMode,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl RedisOptions {
    /// Accepts `host:port` or `redis://host[:port][/db]`.
    pub fn from_url(url: &str) -> Result<Self, MediumError> {
        let raw = url.trim();
        let rest = raw.strip_prefix("redis://").unwrap_or(raw);
        let (hostport, db) = match rest.split_once('/') {
            Some((hostport, "")) => (hostport, None),
            Some((hostport, db)) => {
                let db = db
                    .parse::<u32>()
                    .map_err(|_| MediumError::Unavailable(format!("invalid redis db: {db}")))?;
                (hostport, Some(db))
            }
            None => (rest, None),
        };
        if hostport.is_empty() {
            return Err(MediumError::Unavailable(format!(
                "invalid redis url: {url:?}"
            )));
        }
        let addr = if hostport.rsplit_once(':').is_some() {
            hostport.to_string()
        } else {
            format!("{hostport}:6379")
        };
        Ok(Self {
            addr,
            db,
            mode: DocumentMode::Json,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        })
    }
}

struct Connection {
    stream: TcpStream,
    buf: BytesMut,
}

impl Connection {
    async fn open(options: &RedisOptions) -> Result<Self, MediumError> {
        let stream = timeout(options.connect_timeout, TcpStream::connect(&options.addr))
            .await
            .map_err(|_| {
                MediumError::Unavailable(format!("connect to {} timed out", options.addr))
            })?
            .map_err(|e| MediumError::Unavailable(format!("connect to {}: {e}", options.addr)))?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            buf: BytesMut::with_capacity(4096),
        };
        if let Some(db) = options.db {
            let reply = timeout(
                options.request_timeout,
                conn.round_trip(&["SELECT".to_string(), db.to_string()]),
            )
            .await
            .map_err(|_| MediumError::Unavailable("SELECT timed out".to_string()))??;
            expect_ok(reply)?;
        }
        info!(addr = %options.addr, db = ?options.db, "connected to document cache");
        Ok(conn)
    }

    async fn round_trip<A: AsRef<[u8]> + Sync>(&mut self, args: &[A]) -> Result<Reply, MediumError> {
        let mut out = BytesMut::new();
        resp::encode_command(args, &mut out);
        self.stream.write_all(&out).await?;

        // Buffered length below which a retried decode cannot succeed.
        let mut need = 0;
        loop {
            if self.buf.len() >= need {
                match resp::decode_frame(&self.buf).map_err(MediumError::Protocol)? {
                    Decoded::Frame(reply, used) => {
                        self.buf.advance(used);
                        return Ok(reply);
                    }
                    Decoded::Incomplete(len) => {
                        need = len;
                        self.buf
                            .reserve(need.saturating_sub(self.buf.len()).min(MAX_RESERVE));
                    }
                }
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(MediumError::Unavailable(
                    "connection closed by document cache".to_string(),
                ));
            }
        }
    }
}

/// Document cache reached over RESP2.
///
/// Commands are serialized over one connection. A connection that fails at the
/// transport or framing level is dropped and reopened by the next call.
pub struct RedisMedium {
    options: RedisOptions,
    conn: Mutex<Option<Connection>>,
}

impl RedisMedium {
    /// Opens the connection and checks it with `PING`.
    pub async fn connect(options: RedisOptions) -> Result<Self, MediumError> {
        let conn = Connection::open(&options).await?;
        let medium = Self {
            options,
            conn: Mutex::new(Some(conn)),
        };
        medium.ping().await?;
        Ok(medium)
    }

    pub fn options(&self) -> &RedisOptions {
        &self.options
    }

    async fn call<A: AsRef<[u8]> + Sync>(&self, args: &[A]) -> Result<Reply, MediumError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(Connection::open(&self.options).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(MediumError::Unavailable("no connection".to_string()));
        };

        let result = timeout(self.options.request_timeout, conn.round_trip(args)).await;
        match result {
            Ok(Ok(Reply::Error(msg))) => Err(MediumError::Command(msg)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(err)) => {
                warn!(addr = %self.options.addr, error = %err, "dropping document cache connection");
                *guard = None;
                Err(err)
            }
            Err(_) => {
                warn!(addr = %self.options.addr, "document cache request timed out");
                *guard = None;
                Err(MediumError::Unavailable("request timed out".to_string()))
            }
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, MediumError> {
        let mut keys = BTreeSet::new();
        let mut cursor = "0".to_string();
        loop {
            let reply = self
                .call(&["SCAN", cursor.as_str(), "MATCH", pattern, "COUNT", SCAN_COUNT])
                .await?;
            let mut parts = match reply {
                Reply::Array(parts) => parts,
                other => return Err(unexpected("SCAN", &other)),
            };
            if parts.len() != 2 {
                return Err(MediumError::Protocol(format!(
                    "SCAN reply has {} elements",
                    parts.len()
                )));
            }
            let batch = parts.pop();
            let next = parts.pop();
            match (next, batch) {
                (Some(Reply::Bulk(next)), Some(Reply::Array(batch))) => {
                    for key in batch {
                        match key {
                            Reply::Bulk(k) => {
                                keys.insert(String::from_utf8_lossy(&k).into_owned());
                            }
                            other => return Err(unexpected("SCAN key", &other)),
                        }
                    }
                    cursor = String::from_utf8_lossy(&next).into_owned();
                }
                _ => return Err(MediumError::Protocol("malformed SCAN reply".to_string())),
            }
            if cursor == "0" {
                break;
            }
        }
        debug!(pattern, count = keys.len(), "scanned document cache keys");
        Ok(keys.into_iter().collect())
    }
}

impl Medium for RedisMedium {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn ping(&self) -> BoxFuture<'_, Result<(), MediumError>> {
        Box::pin(async move {
            match self.call(&["PING"]).await? {
                Reply::Simple(s) if s == "PONG" => Ok(()),
                other => Err(unexpected("PING", &other)),
            }
        })
    }

    fn put<'a>(&'a self, key: &'a str, document: String) -> BoxFuture<'a, Result<(), MediumError>> {
        Box::pin(async move {
            let reply = match self.options.mode {
                DocumentMode::Json => self.call(&["JSON.SET", key, "$", document.as_str()]).await?,
                DocumentMode::String => self.call(&["SET", key, document.as_str()]).await?,
            };
            expect_ok(reply)
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<String, MediumError>> {
        Box::pin(async move {
            let reply = match self.options.mode {
                DocumentMode::Json => self.call(&["JSON.GET", key]).await?,
                DocumentMode::String => self.call(&["GET", key]).await?,
            };
            match reply {
                Reply::Bulk(data) => String::from_utf8(data.to_vec())
                    .map_err(|e| MediumError::Protocol(format!("document at {key}: {e}"))),
                Reply::Nil => Err(MediumError::NotFound {
                    key: key.to_string(),
                }),
                other => Err(unexpected("GET", &other)),
            }
        })
    }

    fn delete_one<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), MediumError>> {
        Box::pin(async move {
            match expect_integer("DEL", self.call(&["DEL", key]).await?)? {
                0 => Err(MediumError::NotFound {
                    key: key.to_string(),
                }),
                _ => Ok(()),
            }
        })
    }

    fn delete_many<'a>(&'a self, keys: &'a [String]) -> BoxFuture<'a, Result<u64, MediumError>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(0);
            }
            let mut args = Vec::with_capacity(keys.len() + 1);
            args.push("DEL");
            args.extend(keys.iter().map(String::as_str));
            let removed = expect_integer("DEL", self.call(&args).await?)?;
            u64::try_from(removed)
                .map_err(|_| MediumError::Protocol(format!("negative DEL count: {removed}")))
        })
    }

    fn list_keys<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Vec<String>, MediumError>> {
        Box::pin(async move {
            let pattern = format!("{}*", glob_escape(prefix));
            self.scan(&pattern).await
        })
    }
}

fn expect_ok(reply: Reply) -> Result<(), MediumError> {
    match reply {
        Reply::Simple(s) if s == "OK" => Ok(()),
        other => Err(unexpected("write", &other)),
    }
}

fn expect_integer(command: &str, reply: Reply) -> Result<i64, MediumError> {
    match reply {
        Reply::Integer(n) => Ok(n),
        other => Err(unexpected(command, &other)),
    }
}

fn unexpected(command: &str, reply: &Reply) -> MediumError {
    MediumError::Protocol(format!("unexpected {command} reply: {reply:?}"))
}

/// Escapes glob metacharacters so `prefix` matches literally in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut out = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_plain_host_port() {
        let opts = RedisOptions::from_url("0.0.0.0:6379").unwrap();
        assert_eq!(opts.addr, "0.0.0.0:6379");
        assert_eq!(opts.db, None);
        assert_eq!(opts.mode, DocumentMode::Json);
    }

    #[test]
    fn parses_redis_url_with_db() {
        let opts = RedisOptions::from_url("redis://cache.internal:6380/2").unwrap();
        assert_eq!(opts.addr, "cache.internal:6380");
        assert_eq!(opts.db, Some(2));
    }

    #[test]
    fn url_without_port_uses_default_port() {
        let opts = RedisOptions::from_url("redis://cache/").unwrap();
        assert_eq!(opts.addr, "cache:6379");
        assert_eq!(opts.db, None);
    }

    #[test]
    fn rejects_bad_db_and_empty_host() {
        assert!(RedisOptions::from_url("redis://cache:6379/x").is_err());
        assert!(RedisOptions::from_url("redis://").is_err());
        assert!(RedisOptions::from_url("").is_err());
    }

    #[test]
    fn glob_escape_only_touches_metacharacters() {
        assert_eq!(glob_escape("voter:"), "voter:");
        assert_eq!(glob_escape("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut opts = RedisOptions::from_url(&addr.to_string()).unwrap();
        opts.connect_timeout = Duration::from_secs(1);
        let err = match RedisMedium::connect(opts).await {
            Ok(_) => panic!("expected connect failure"),
            Err(e) => e,
        };
        assert!(matches!(err, MediumError::Unavailable(_)));
    }
}
