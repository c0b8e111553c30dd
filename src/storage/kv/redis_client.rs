//! [`KeyValueClient`] over a Redis server.
//!
//! WATCH is scoped to a connection while [`KeyValueClient::watch`] and
//! [`KeyValueClient::exec`] are separate calls, so the token is a fingerprint
//! of the hash contents. `exec` takes a connection, WATCHes the key, compares
//! the fingerprint and only then sends MULTI/EXEC: a change before the
//! comparison aborts on the fingerprint, a change after it aborts the EXEC.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

use ::redis::{Client, Connection, ErrorKind, RedisError};
use tracing::debug;

use crate::storage::kv::{ExecOutcome, HashOp, KeyValueClient, WatchToken};
use crate::storage::traits::StorageError;

/// Idle connections kept for reuse.
const MAX_IDLE: usize = 8;

fn redis_err(err: RedisError) -> StorageError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        StorageError::ConnectionError(err.to_string())
    } else if err.kind() == ErrorKind::TypeError {
        StorageError::SerializationError(err.to_string())
    } else {
        StorageError::BackendError(err.to_string())
    }
}

/// Order-independent digest of a hash's fields.
fn fingerprint(fields: &HashMap<String, String>) -> u64 {
    let mut entries: Vec<(&String, &String)> = fields.iter().collect();
    entries.sort_unstable();
    let mut hasher = DefaultHasher::new();
    entries.len().hash(&mut hasher);
    entries.hash(&mut hasher);
    hasher.finish()
}

/// Redis-backed key/value client with a small connection pool.
pub struct RedisKeyValueClient {
    client: Client,
    idle: Mutex<Vec<Connection>>,
}

impl std::fmt::Debug for RedisKeyValueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let idle = self.idle.lock().map_or(0, |idle| idle.len());
        f.debug_struct("RedisKeyValueClient")
            .field("idle", &idle)
            .finish_non_exhaustive()
    }
}

impl RedisKeyValueClient {
    /// Client for the server at `url` (`redis://host:port/db`). Connections
    /// are opened on first use.
    ///
    /// # Errors
    /// - `ConnectionError`: if `url` is not a valid Redis URL
    pub fn open(url: &str) -> Result<Self, StorageError> {
        let client = Client::open(url).map_err(|e| StorageError::ConnectionError(e.to_string()))?;
        Ok(Self {
            client,
            idle: Mutex::new(Vec::new()),
        })
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, RedisError>,
    ) -> Result<T, StorageError> {
        let pooled = self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let mut con = match pooled {
            Some(con) => con,
            None => self.client.get_connection().map_err(redis_err)?,
        };
        // A failed connection is dropped rather than returned to the pool.
        let out = f(&mut con).map_err(redis_err)?;
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE {
            idle.push(con);
        }
        Ok(out)
    }

    fn fields(con: &mut Connection, key: &str) -> Result<HashMap<String, String>, RedisError> {
        ::redis::cmd("HGETALL").arg(key).query(con)
    }
}

impl KeyValueClient for RedisKeyValueClient {
    fn hgetall(&self, key: &str) -> Result<Vec<(String, String)>, StorageError> {
        let fields = self.with_connection(|con| Self::fields(con, key))?;
        Ok(fields.into_iter().collect())
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        self.with_connection(|con| ::redis::cmd("HGET").arg(key).arg(field).query(con))
    }

    // Subject hashes are small; filtering one HGETALL beats a cursor walk.
    fn hscan(&self, key: &str, field_prefix: &str) -> Result<Vec<(String, String)>, StorageError> {
        Ok(self
            .hgetall(key)?
            .into_iter()
            .filter(|(field, _)| field.starts_with(field_prefix))
            .collect())
    }

    fn watch(&self, key: &str) -> Result<WatchToken, StorageError> {
        let fields = self.with_connection(|con| Self::fields(con, key))?;
        Ok(WatchToken(fingerprint(&fields)))
    }

    fn exec(
        &self,
        key: &str,
        watch: Option<WatchToken>,
        ops: &[HashOp],
    ) -> Result<ExecOutcome, StorageError> {
        self.with_connection(|con| {
            if let Some(WatchToken(seen)) = watch {
                ::redis::cmd("WATCH").arg(key).query::<()>(con)?;
                if fingerprint(&Self::fields(con, key)?) != seen {
                    ::redis::cmd("UNWATCH").query::<()>(con)?;
                    debug!(key, "hash changed since watch");
                    return Ok(ExecOutcome::Aborted);
                }
            }

            let mut pipe = ::redis::pipe();
            pipe.atomic();
            for op in ops {
                match op {
                    HashOp::Get { field } => {
                        pipe.cmd("HGET").arg(key).arg(field);
                    }
                    HashOp::Set { field, value } => {
                        pipe.cmd("HSET").arg(key).arg(field).arg(value).ignore();
                    }
                    HashOp::Del { field } => {
                        pipe.cmd("HDEL").arg(key).arg(field).ignore();
                    }
                }
            }
            // EXEC answers nil when the watched key changed.
            let Some(gets) = pipe.query::<Option<Vec<Option<String>>>>(con)? else {
                return Ok(ExecOutcome::Aborted);
            };

            let mut gets = gets.into_iter();
            let replies = ops
                .iter()
                .map(|op| match op {
                    HashOp::Get { .. } => gets.next().flatten(),
                    HashOp::Set { .. } | HashOp::Del { .. } => None,
                })
                .collect();
            Ok(ExecOutcome::Committed(replies))
        })
    }

    fn del(&self, key: &str) -> Result<(), StorageError> {
        self.with_connection(|con| ::redis::cmd("DEL").arg(key).query::<()>(con))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(f, v)| ((*f).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn fingerprint_tracks_contents_not_order() {
        let a = fields(&[("pa", "1"), ("eb", "\"x\"")]);
        let b = fields(&[("eb", "\"x\""), ("pa", "1")]);
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&fields(&[("pa", "2"), ("eb", "\"x\"")])));
        assert_ne!(fingerprint(&a), fingerprint(&fields(&[("pa", "1")])));
        assert_ne!(fingerprint(&HashMap::new()), fingerprint(&fields(&[("pa", "1")])));
    }

    #[test]
    fn malformed_url_is_rejected() {
        assert!(matches!(
            RedisKeyValueClient::open("not a redis url"),
            Err(StorageError::ConnectionError(_))
        ));
    }

    #[test]
    fn unreachable_server_is_a_connection_error() {
        let client = RedisKeyValueClient::open("redis://127.0.0.1:1/").unwrap();
        assert!(matches!(client.hget("s:x", "pa"), Err(StorageError::ConnectionError(_))));
        assert!(client.idle.lock().unwrap().is_empty());
    }
}
