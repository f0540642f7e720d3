//! Redis-backed session store
//!
//! Each session is one JSON document under `{prefix}:session:{id}` with a
//! sliding TTL. Appends are a read-modify-write closed by a Lua
//! compare-and-set on the stored version: a write based on a stale version
//! is rejected with `VersionConflict` and never overwrites a newer history.
//! Ordering across gateways is decided by the session manager on retry.

use super::store::SessionStore;
use super::{SessionState, SessionUpdate};
use crate::config::SessionConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::debug;
use uuid::Uuid;

/// Replace the document only if its version is still ARGV[1].
/// Returns {1} on success, {0, actual} on conflict, {-1} if missing.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return {-1}
end
local version = tonumber(cjson.decode(current).version)
if version ~= tonumber(ARGV[1]) then
  return {0, version}
end
redis.call('SET', KEYS[1], ARGV[2], 'EX', tonumber(ARGV[3]))
return {1}
"#;

/// Redis session store
pub struct RedisSessionStore {
    connection: ConnectionManager,
    script: Script,
    key_prefix: String,
    ttl_secs: u64,
}

impl RedisSessionStore {
    /// Connect to Redis
    pub async fn new(config: &SessionConfig) -> Result<Self> {
        let url = config.redis_url.as_deref().ok_or_else(|| AppError::Configuration {
            message: "session.redis_url is required for the redis store".to_string(),
        })?;

        let client = Client::open(url).map_err(|e| AppError::Cache {
            message: format!("Failed to create Redis client: {}", e),
        })?;
        let connection = client.get_connection_manager().await.map_err(|e| AppError::Cache {
            message: format!("Failed to connect to Redis: {}", e),
        })?;

        Ok(Self {
            connection,
            script: Script::new(COMPARE_AND_SET),
            key_prefix: config.key_prefix.clone(),
            ttl_secs: config.ttl_secs,
        })
    }

    fn key(&self, id: Uuid) -> String {
        keys::session(&self.key_prefix, id)
    }

    async fn read(&self, id: Uuid) -> Result<Option<SessionState>> {
        let key = self.key(id);
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(&key).await.map_err(|e| AppError::Cache {
            message: format!("Failed to get key '{}': {}", key, e),
        })?;

        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| AppError::Cache {
                message: format!("Failed to parse session '{}': {}", id, e),
            })
        })
        .transpose()
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(&self) -> Result<SessionState> {
        let state = SessionState::new(Uuid::new_v4());
        let key = self.key(state.id);
        let json = serde_json::to_string(&state)?;

        let mut conn = self.connection.clone();
        let _: () = conn.set_ex(&key, json, self.ttl_secs).await.map_err(|e| AppError::Cache {
            message: format!("Failed to set key '{}': {}", key, e),
        })?;

        debug!(key = %key, ttl_secs = self.ttl_secs, "Session created");
        Ok(state)
    }

    async fn load(&self, id: Uuid) -> Result<SessionState> {
        self.read(id).await?.ok_or_else(|| AppError::SessionNotFound { id: id.to_string() })
    }

    async fn append(&self, id: Uuid, expected_version: u64, update: &SessionUpdate) -> Result<SessionState> {
        let mut state = self.load(id).await?;
        if state.version != expected_version {
            return Err(AppError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                actual: state.version,
            });
        }

        state.apply(update);
        state.version += 1;
        let json = serde_json::to_string(&state)?;

        let mut conn = self.connection.clone();
        let reply: Vec<i64> = self
            .script
            .key(self.key(id))
            .arg(expected_version)
            .arg(json)
            .arg(self.ttl_secs)
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [1] => {
                debug!(session_id = %id, version = state.version, "Session appended");
                Ok(state)
            }
            [0, actual] => Err(AppError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                actual: u64::try_from(*actual).unwrap_or_default(),
            }),
            [-1] => Err(AppError::SessionNotFound { id: id.to_string() }),
            other => Err(AppError::Cache {
                message: format!("Unexpected compare-and-set reply: {:?}", other),
            }),
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| AppError::Cache {
                message: format!("Redis ping failed: {}", e),
            })?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

/// Session key builders
pub mod keys {
    use uuid::Uuid;

    /// Key of one session document
    pub fn session(prefix: &str, id: Uuid) -> String {
        format!("{}:session:{}", prefix, id)
    }
}
