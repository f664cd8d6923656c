//! RESP2 client for a Redis-protocol backing store.
//!
//! The lock manager only needs four commands (`SET ... NX PX`, `GET`, and two
//! conditional scripts via `EVAL`), so this client implements just enough of
//! the protocol: command arrays out, scalar and flat-array replies in. The
//! conditional delete/extend scripts are the canonical compare-then-act
//! forms, evaluated server-side so the comparison and the mutation are one
//! atomic step.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

use super::{BoxFuture, KvError, KvStore};

/// Deletes a key only while it still holds the caller's token.
const DEL_IF_EQUAL_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

/// Extends a key's expiry only while it still holds the caller's token.
const PEXPIRE_IF_EQUAL_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('pexpire', KEYS[1], ARGV[2]) else return 0 end";

/// A single parsed RESP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RespValue {
    Simple(String),
    Integer(i64),
    Bulk(Option<String>),
    Array(Vec<RespValue>),
}

struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Conn {
    async fn connect(addr: &str) -> Result<Self, KvError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Sends one command as a RESP array of bulk strings.
    async fn send(&mut self, args: &[&str]) -> Result<(), KvError> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
        for arg in args {
            buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            buf.extend_from_slice(arg.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, KvError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(KvError::Protocol("connection closed mid-reply".into()));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    async fn read_bulk_body(&mut self, len: usize) -> Result<String, KvError> {
        // Body plus trailing CRLF.
        let mut body = vec![0u8; len + 2];
        self.reader.read_exact(&mut body).await?;
        body.truncate(len);
        String::from_utf8(body).map_err(|_| KvError::Protocol("non-UTF-8 bulk string".into()))
    }

    /// Reads one reply. Error replies become [`KvError::Server`].
    async fn read_reply(&mut self) -> Result<RespValue, KvError> {
        let line = self.read_line().await?;
        let (prefix, rest) = line.split_at(1);
        match prefix {
            "+" => Ok(RespValue::Simple(rest.to_string())),
            "-" => Err(KvError::Server(rest.to_string())),
            ":" => rest
                .parse::<i64>()
                .map(RespValue::Integer)
                .map_err(|_| KvError::Protocol(format!("bad integer reply: {rest}"))),
            "$" => {
                let len: i64 = rest
                    .parse()
                    .map_err(|_| KvError::Protocol(format!("bad bulk length: {rest}")))?;
                if len < 0 {
                    return Ok(RespValue::Bulk(None));
                }
                #[allow(clippy::cast_sign_loss)]
                let body = self.read_bulk_body(len as usize).await?;
                Ok(RespValue::Bulk(Some(body)))
            },
            "*" => {
                let count: i64 = rest
                    .parse()
                    .map_err(|_| KvError::Protocol(format!("bad array length: {rest}")))?;
                if count < 0 {
                    return Ok(RespValue::Bulk(None));
                }
                // Flat arrays only; none of the commands this client issues
                // produce nested replies.
                #[allow(clippy::cast_sign_loss)]
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let line = self.read_line().await?;
                    let (p, r) = line.split_at(1);
                    let item = match p {
                        "+" => RespValue::Simple(r.to_string()),
                        ":" => r
                            .parse::<i64>()
                            .map(RespValue::Integer)
                            .map_err(|_| KvError::Protocol(format!("bad integer reply: {r}")))?,
                        "$" => {
                            let len: i64 = r.parse().map_err(|_| {
                                KvError::Protocol(format!("bad bulk length: {r}"))
                            })?;
                            if len < 0 {
                                RespValue::Bulk(None)
                            } else {
                                #[allow(clippy::cast_sign_loss)]
                                RespValue::Bulk(Some(self.read_bulk_body(len as usize).await?))
                            }
                        },
                        other => {
                            return Err(KvError::Protocol(format!(
                                "unsupported array element prefix: {other}"
                            )));
                        },
                    };
                    items.push(item);
                }
                Ok(RespValue::Array(items))
            },
            other => Err(KvError::Protocol(format!(
                "unexpected reply prefix: {other}"
            ))),
        }
    }
}

/// [`KvStore`] implementation speaking RESP2 over TCP.
///
/// The connection is established lazily on first use and re-established
/// after any I/O or protocol failure, so a store restart costs one failed
/// operation rather than a wedged client.
pub struct RespKvStore {
    addr: String,
    conn: Mutex<Option<Conn>>,
}

impl RespKvStore {
    /// Creates a client for the store at `addr` (`host:port`).
    ///
    /// No connection is made until the first operation.
    #[must_use]
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            conn: Mutex::new(None),
        }
    }

    /// Runs one command against the store, reconnecting if needed.
    async fn command(&self, args: &[&str]) -> Result<RespValue, KvError> {
        let mut slot = self.conn.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => {
                debug!(addr = %self.addr, "connecting to lock store");
                Conn::connect(&self.addr).await?
            },
        };
        let result = async {
            conn.send(args).await?;
            conn.read_reply().await
        }
        .await;
        // Server error replies leave the stream aligned; only transport and
        // framing failures force a reconnect.
        if !matches!(result, Err(KvError::Io(_) | KvError::Protocol(_))) {
            *slot = Some(conn);
        }
        result
    }
}

impl KvStore for RespKvStore {
    fn set_nx_px<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, KvError>> {
        Box::pin(async move {
            let ttl_ms = ttl.as_millis().max(1).to_string();
            let reply = self
                .command(&["SET", key, value, "NX", "PX", &ttl_ms])
                .await?;
            match reply {
                RespValue::Simple(s) if s == "OK" => Ok(true),
                RespValue::Bulk(None) => Ok(false),
                other => Err(KvError::Protocol(format!("unexpected SET reply: {other:?}"))),
            }
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, KvError>> {
        Box::pin(async move {
            match self.command(&["GET", key]).await? {
                RespValue::Bulk(value) => Ok(value),
                other => Err(KvError::Protocol(format!("unexpected GET reply: {other:?}"))),
            }
        })
    }

    fn del_if_equal<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> BoxFuture<'a, Result<bool, KvError>> {
        Box::pin(async move {
            let reply = self
                .command(&["EVAL", DEL_IF_EQUAL_SCRIPT, "1", key, expected])
                .await?;
            match reply {
                RespValue::Integer(n) => Ok(n > 0),
                other => Err(KvError::Protocol(format!(
                    "unexpected EVAL reply: {other:?}"
                ))),
            }
        })
    }

    fn pexpire_if_equal<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, KvError>> {
        Box::pin(async move {
            let ttl_ms = ttl.as_millis().max(1).to_string();
            let reply = self
                .command(&[
                    "EVAL",
                    PEXPIRE_IF_EQUAL_SCRIPT,
                    "1",
                    key,
                    expected,
                    &ttl_ms,
                ])
                .await?;
            match reply {
                RespValue::Integer(n) => Ok(n > 0),
                other => Err(KvError::Protocol(format!(
                    "unexpected EVAL reply: {other:?}"
                ))),
            }
        })
    }
}
