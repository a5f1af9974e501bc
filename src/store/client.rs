//! Connection facade over a set of Redis servers.
//!
//! The facade owns one cached connection per server and offers two
//! execution modes:
//!
//! - [`StoreClient::execute`]: run on the first healthy server of an ordered
//!   list, failing over to the next one on error.
//! - [`StoreClient::broadcast`]: run on every reachable server and report how
//!   many succeeded.
//!
//! Any error invalidates the server's cached connection so the next call
//! reconnects. Servers that fail to connect are skipped for a cool-down
//! window (see [`DownServers`]).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use redis::aio::MultiplexedConnection;
use redis::FromRedisValue;
use tracing::{debug, error};

use crate::config::ServerAddr;
use crate::error::StoreError;
use crate::stats::StatsClient;

use super::health::{DownServers, DOWN_COOLDOWN};

/// Bound on connecting and on any single command.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can be sent to a server.
#[derive(Clone, Copy)]
pub enum Request<'a> {
    /// A single command.
    Cmd(&'a redis::Cmd),
    /// A pipeline, atomic if built with `atomic()`.
    Pipeline(&'a redis::Pipeline),
    /// A server-side script invocation (EVALSHA, loading on NOSCRIPT).
    Script(&'a redis::ScriptInvocation<'a>),
}

impl<'a> From<&'a redis::Cmd> for Request<'a> {
    fn from(cmd: &'a redis::Cmd) -> Self {
        Request::Cmd(cmd)
    }
}

impl<'a> From<&'a redis::Pipeline> for Request<'a> {
    fn from(pipe: &'a redis::Pipeline) -> Self {
        Request::Pipeline(pipe)
    }
}

impl<'a> From<&'a redis::ScriptInvocation<'a>> for Request<'a> {
    fn from(invocation: &'a redis::ScriptInvocation<'a>) -> Self {
        Request::Script(invocation)
    }
}

/// Redis client facade with per-server connection caching and health
/// tracking.
pub struct StoreClient {
    password: Option<String>,
    conns: Mutex<HashMap<String, MultiplexedConnection>>,
    down: Mutex<DownServers>,
    stats: StatsClient,
    host: String,
    timeout: Duration,
}

impl StoreClient {
    /// Creates a client.
    ///
    /// # Arguments
    ///
    /// * `password` - Optional password sent to every server
    /// * `stats` - Counter sink for `redis-error.<host>`
    /// * `host` - Local host name used in counter names
    pub fn new(password: Option<String>, stats: StatsClient, host: impl Into<String>) -> Self {
        Self {
            password,
            conns: Mutex::new(HashMap::new()),
            down: Mutex::new(DownServers::new(DOWN_COOLDOWN)),
            stats,
            host: host.into(),
            timeout: READ_TIMEOUT,
        }
    }

    /// Overrides the connect/command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs `request` on the first server in `servers` that answers.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AllServersUnavailable` when every server errors
    /// or is marked down.
    pub async fn execute<'a, T: FromRedisValue>(
        &self,
        servers: &[String],
        request: impl Into<Request<'a>>,
    ) -> Result<T, StoreError> {
        let request = request.into();
        for server in servers {
            match self.execute_on(server, request).await {
                Ok(value) => return Ok(value),
                Err(e) => debug!(server = %server, error = %e, "Trying next server"),
            }
        }
        Err(StoreError::AllServersUnavailable)
    }

    /// Runs `request` on every server in `servers`.
    ///
    /// Returns the number of servers that succeeded.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::AllServersUnavailable` if none succeeded.
    pub async fn broadcast<'a>(
        &self,
        servers: &[String],
        request: impl Into<Request<'a>>,
    ) -> Result<usize, StoreError> {
        let request = request.into();
        let mut updated = 0;
        for server in servers {
            match self.execute_on::<redis::Value>(server, request).await {
                Ok(_) => updated += 1,
                Err(e) => debug!(server = %server, error = %e, "Broadcast failed on server"),
            }
        }
        if updated == 0 {
            return Err(StoreError::AllServersUnavailable);
        }
        Ok(updated)
    }

    /// Runs `request` on one specific server.
    pub async fn execute_on<'a, T: FromRedisValue>(
        &self,
        server: &str,
        request: impl Into<Request<'a>>,
    ) -> Result<T, StoreError> {
        let request = request.into();
        let mut conn = self.connection(server).await?;

        let call = async {
            match request {
                Request::Cmd(cmd) => cmd.query_async::<_, T>(&mut conn).await,
                Request::Pipeline(pipe) => pipe.query_async::<_, T>(&mut conn).await,
                Request::Script(invocation) => invocation.invoke_async::<_, T>(&mut conn).await,
            }
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.handle_error(server, &e.to_string());
                Err(StoreError::Redis(e))
            }
            Err(_) => {
                self.handle_error(server, "read timed out");
                Err(StoreError::Timeout {
                    server: server.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    /// Returns whether `server` is currently inside its cool-down window.
    pub fn is_marked_down(&self, server: &str) -> bool {
        self.down
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_down(server, Instant::now())
    }

    async fn connection(&self, server: &str) -> Result<MultiplexedConnection, StoreError> {
        if self.is_marked_down(server) {
            return Err(StoreError::ServerDown(server.to_string()));
        }

        if let Some(conn) = self
            .conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(server)
        {
            return Ok(conn.clone());
        }

        let addr =
            ServerAddr::parse(server).ok_or_else(|| StoreError::InvalidServer(server.to_string()))?;
        let client = redis::Client::open(addr.redis_url(self.password.as_deref()))?;

        let result = tokio::time::timeout(self.timeout, client.get_multiplexed_async_connection()).await;
        let failure = match result {
            Ok(Ok(conn)) => {
                self.conns
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(server.to_string(), conn.clone());
                return Ok(conn);
            }
            Ok(Err(e)) => StoreError::Redis(e),
            Err(_) => StoreError::Timeout {
                server: server.to_string(),
                timeout: self.timeout,
            },
        };

        error!(server = %server, error = %failure, "Could not connect to Redis server");
        // Mark server down for some time to avoid further timeouts
        self.down
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .mark_down(server, Instant::now());
        Err(failure)
    }

    fn handle_error(&self, server: &str, message: &str) {
        self.conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(server);
        error!(server = %server, "Redis error: {}", message);
        self.stats.incr(&format!("redis-error.{}", self.host), 1);
    }
}
