//! Database Engine
//!
//! [`Db`] composes the storage primitives into the keyspace that commands
//! run against:
//!
//! ```text
//!                 ┌──────────────────────────────────────┐
//!  command line ─▶│ exec: auth, MULTI/EXEC, dispatch     │
//!                 └──────────────┬───────────────────────┘
//!                                │ versions bumped, batch lock taken
//!                 ┌──────────────▼───────────────────────┐
//!                 │ executor(&Db, args)                  │
//!                 │   data:     Dict<DataValue>          │
//!                 │   ttl:      Dict<SystemTime>         │──▶ TimeWheel
//!                 │   versions: Dict<u64>                │
//!                 └──────────────┬───────────────────────┘
//!                                │ frame on success
//!                                ▼
//!                               Aof
//! ```
//!
//! Executors assume the caller already holds the key locks they need. The
//! helpers here never take key locks themselves, except the expiration
//! callback which runs outside any command.

pub mod aof;
pub mod exec;
pub mod marshal;
pub mod multi;
pub mod registry;

pub use aof::{Aof, AofConfig, AofError, ReplayStats};
pub use multi::Session;
pub use registry::{Command, CommandTable};

use crate::protocol::CmdLine;
use crate::storage::timewheel::WheelConfig;
use crate::storage::{DataValue, Dict, LockTable, TimeWheel};
use bytes::Bytes;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Instant, SystemTime};
use tracing::{debug, info};

/// Sizes and optional subsystems of a [`Db`].
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Shards of the main keyspace (default: 65536)
    pub data_shards: usize,
    /// Shards of the TTL table (default: 1024)
    pub ttl_shards: usize,
    /// Shards of the version table (default: 1024)
    pub version_shards: usize,
    /// Slots in the key lock table (default: 1024)
    pub lock_slots: usize,
    /// Expiration wheel; `None` leaves expiry to lazy checks
    pub wheel: Option<WheelConfig>,
    /// Append-only log; `None` disables persistence
    pub aof: Option<AofConfig>,
    /// Password clients must send with `AUTH`
    pub requirepass: Option<String>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            data_shards: 1 << 16,
            ttl_shards: 1 << 10,
            version_shards: 1 << 10,
            lock_slots: 1024,
            wheel: Some(WheelConfig::default()),
            aof: None,
            requirepass: None,
        }
    }
}

impl DbOptions {
    /// Small tables and a fast wheel.
    pub fn for_tests() -> Self {
        Self {
            data_shards: 64,
            ttl_shards: 16,
            version_shards: 16,
            lock_slots: 64,
            wheel: Some(WheelConfig {
                interval: std::time::Duration::from_millis(10),
                slots: 64,
            }),
            aof: None,
            requirepass: None,
        }
    }
}

pub struct Db {
    me: Weak<Db>,
    data: Dict<DataValue>,
    ttl: Dict<SystemTime>,
    versions: Dict<u64>,
    locks: LockTable,
    wheel: Option<TimeWheel>,
    aof: OnceLock<Aof>,
    commands: Arc<CommandTable>,
    password: Option<String>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("keys", &self.data.len())
            .field("volatile", &self.ttl.len())
            .field("locks", &self.locks)
            .field("aof", &self.aof.get())
            .finish()
    }
}

impl Db {
    /// Builds the database, replays the log if persistence is on, then
    /// attaches the log writer.
    ///
    /// Must be called inside a Tokio runtime when `options.wheel` is set.
    pub fn open(options: DbOptions) -> Result<Arc<Self>, AofError> {
        let commands = Arc::new(CommandTable::builtin());
        let wheel = options.wheel.clone().map(TimeWheel::start);

        let db = Arc::new_cyclic(|me| Db {
            me: me.clone(),
            data: Dict::new(options.data_shards),
            ttl: Dict::new(options.ttl_shards),
            versions: Dict::new(options.version_shards),
            locks: LockTable::new(options.lock_slots),
            wheel,
            aof: OnceLock::new(),
            commands,
            password: options.requirepass.clone(),
        });

        if let Some(config) = &options.aof {
            let started = Instant::now();
            let stats = aof::load(&config.path, None, &db)?;
            info!(
                applied = stats.applied,
                skipped = stats.skipped,
                bytes = stats.bytes,
                keys = db.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Append only file loaded"
            );
            let _ = db.aof.set(Aof::open(config)?);
        }

        Ok(db)
    }

    /// A scratch database for replaying a log prefix: no wheel, no log,
    /// small tables.
    pub fn replica(commands: Arc<CommandTable>) -> Arc<Self> {
        Arc::new_cyclic(|me| Db {
            me: me.clone(),
            data: Dict::new(16),
            ttl: Dict::new(16),
            versions: Dict::new(16),
            locks: LockTable::new(16),
            wheel: None,
            aof: OnceLock::new(),
            commands,
            password: None,
        })
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub(crate) fn commands_arc(&self) -> Arc<CommandTable> {
        Arc::clone(&self.commands)
    }

    pub(crate) fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub(crate) fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub(crate) fn handle(&self) -> Option<Arc<Db>> {
        self.me.upgrade()
    }

    pub fn aof(&self) -> Option<&Aof> {
        self.aof.get()
    }

    /// Stops the wheel and flushes and closes the log.
    pub fn close(&self) {
        if let Some(wheel) = &self.wheel {
            wheel.stop();
        }
        if let Some(aof) = self.aof.get() {
            aof.close();
        }
    }

    // ========================================================================
    // Keyspace
    // ========================================================================

    /// Reads a live value in place.
    pub fn with_entity<R>(&self, key: &[u8], f: impl FnOnce(&DataValue) -> R) -> Option<R> {
        if self.is_expired(key) {
            return None;
        }
        self.data.with(key, f)
    }

    /// Mutates a live value in place.
    pub fn with_entity_mut<R>(
        &self,
        key: &[u8],
        f: impl FnOnce(&mut DataValue) -> R,
    ) -> Option<R> {
        if self.is_expired(key) {
            return None;
        }
        self.data.with_mut(key, f)
    }

    pub fn get_entity(&self, key: &[u8]) -> Option<DataValue> {
        self.with_entity(key, DataValue::clone)
    }

    pub fn get_string(&self, key: &[u8]) -> Option<Bytes> {
        self.with_entity(key, |value| match value {
            DataValue::String(data) => Some(data.clone()),
            _ => None,
        })
        .flatten()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        !self.is_expired(key) && self.data.contains(key)
    }

    /// Returns 1 if the key was created, 0 if replaced.
    pub fn put_entity(&self, key: Bytes, value: DataValue) -> usize {
        self.data.put(key, value)
    }

    pub fn put_if_absent(&self, key: Bytes, value: DataValue) -> usize {
        self.is_expired(&key);
        self.data.put_if_absent(key, value)
    }

    pub fn put_if_exists(&self, key: Bytes, value: DataValue) -> usize {
        if self.is_expired(&key) {
            return 0;
        }
        self.data.put_if_exists(key, value)
    }

    /// Removes the value together with its TTL and pending expiration.
    pub fn remove(&self, key: &[u8]) -> bool {
        let removed = self.data.remove(key).is_some();
        if self.ttl.remove(key).is_some() {
            if let Some(wheel) = &self.wheel {
                wheel.cancel(key);
            }
        }
        removed
    }

    pub fn removes(&self, keys: &[Bytes]) -> usize {
        keys.iter()
            .filter(|key| !self.is_expired(key) && self.remove(key))
            .count()
    }

    /// Number of stored keys. Keys that expired but were not yet collected
    /// are included.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Live keys.
    pub fn keys(&self) -> Vec<Bytes> {
        let mut keys = self.data.keys();
        keys.retain(|key| !self.is_expired(key));
        keys
    }

    /// Visits every stored value with its expiry. Not an atomic snapshot.
    pub fn for_each_entity(&self, mut visit: impl FnMut(&Bytes, &DataValue, Option<SystemTime>) -> bool) {
        self.data
            .for_each(|key, value| visit(key, value, self.ttl.get(key)));
    }

    /// Drops every key. Keys present before the flush get a version bump so
    /// watchers notice.
    pub fn flush(&self) {
        let keys = self.data.keys();
        self.add_version(&keys);
        self.data.clear();
        self.ttl.clear();
    }

    // ========================================================================
    // Expiration
    // ========================================================================

    /// Sets the absolute expiry of `key` and schedules its removal.
    pub fn expire(&self, key: &Bytes, at: SystemTime) {
        self.ttl.put(key.clone(), at);
        self.schedule_expiry(key, at);
    }

    /// Makes `key` persistent. Returns whether it had a TTL.
    pub fn persist(&self, key: &[u8]) -> bool {
        let had_ttl = self.ttl.remove(key).is_some();
        if let Some(wheel) = &self.wheel {
            wheel.cancel(key);
        }
        had_ttl
    }

    pub fn ttl_at(&self, key: &[u8]) -> Option<SystemTime> {
        self.ttl.get(key)
    }

    /// Removes `key` if its TTL has passed. The wheel only fires near the
    /// deadline, so every access checks here first.
    pub fn is_expired(&self, key: &[u8]) -> bool {
        match self.ttl.get(key) {
            Some(at) if at <= SystemTime::now() => {
                self.remove(key);
                true
            }
            _ => false,
        }
    }

    fn schedule_expiry(&self, key: &Bytes, at: SystemTime) {
        let Some(wheel) = &self.wheel else {
            return;
        };
        let me = self.me.clone();
        let target = key.clone();
        wheel.at(
            key.clone(),
            at,
            Box::new(move || {
                if let Some(db) = me.upgrade() {
                    db.on_expire(&target);
                }
            }),
        );
    }

    // The TTL may have moved while the job waited, so re-check under the
    // key's lock.
    fn on_expire(&self, key: &Bytes) {
        let _guard = self.locks.lock(key);
        match self.ttl.get(key) {
            None => {}
            Some(at) if at <= SystemTime::now() => {
                debug!(key = %String::from_utf8_lossy(key), "Key expired");
                self.remove(key);
            }
            Some(at) => self.schedule_expiry(key, at),
        }
    }

    // ========================================================================
    // Versions and logging
    // ========================================================================

    pub fn add_version(&self, keys: &[Bytes]) {
        for key in keys {
            self.versions
                .upsert(key.clone(), |v| v.map_or(1, |v| v.wrapping_add(1)));
        }
    }

    pub fn get_version(&self, key: &[u8]) -> u64 {
        self.versions.get(key).unwrap_or(0)
    }

    /// Hands a frame to the log writer, if persistence is on.
    pub fn add_aof(&self, line: CmdLine) {
        if let Some(aof) = self.aof.get() {
            aof.append(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn replica() -> Arc<Db> {
        Db::replica(Arc::new(CommandTable::builtin()))
    }

    fn string(s: &str) -> DataValue {
        DataValue::String(Bytes::from(s.to_string()))
    }

    #[test]
    fn test_put_get_remove() {
        let db = replica();
        assert_eq!(db.put_entity(Bytes::from("k"), string("v")), 1);
        assert_eq!(db.get_entity(b"k"), Some(string("v")));
        assert_eq!(db.put_entity(Bytes::from("k"), string("w")), 0);
        assert!(db.remove(b"k"));
        assert!(!db.remove(b"k"));
        assert!(db.get_entity(b"k").is_none());
    }

    #[test]
    fn test_len_after_removals() {
        let db = replica();
        for i in 0..100 {
            db.put_entity(Bytes::from(format!("k{}", i)), string("v"));
        }
        let gone: Vec<Bytes> = (0..30).map(|i| Bytes::from(format!("k{}", i))).collect();
        assert_eq!(db.removes(&gone), 30);
        assert_eq!(db.len(), 70);
    }

    #[test]
    fn test_lazy_expiry_on_read() {
        let db = replica();
        let key = Bytes::from("k");
        db.put_entity(key.clone(), string("v"));
        db.expire(&key, SystemTime::now() - Duration::from_secs(1));
        assert!(db.get_entity(b"k").is_none());
        assert!(db.ttl_at(b"k").is_none());
        assert_eq!(db.len(), 0);
    }

    #[test]
    fn test_persist_clears_ttl() {
        let db = replica();
        let key = Bytes::from("k");
        db.put_entity(key.clone(), string("v"));
        db.expire(&key, SystemTime::now() + Duration::from_secs(60));
        assert!(db.persist(b"k"));
        assert!(!db.persist(b"k"));
        assert!(db.ttl_at(b"k").is_none());
    }

    #[test]
    fn test_versions_increase() {
        let db = replica();
        assert_eq!(db.get_version(b"k"), 0);
        db.add_version(&[Bytes::from("k"), Bytes::from("j")]);
        db.add_version(&[Bytes::from("k")]);
        assert_eq!(db.get_version(b"k"), 2);
        assert_eq!(db.get_version(b"j"), 1);
    }

    #[test]
    fn test_flush_bumps_versions() {
        let db = replica();
        db.put_entity(Bytes::from("k"), string("v"));
        db.flush();
        assert!(db.is_empty());
        assert_eq!(db.get_version(b"k"), 1);
    }

    #[tokio::test]
    async fn test_wheel_expires_key() {
        let db = Db::open(DbOptions::for_tests()).unwrap();
        let key = Bytes::from("k");
        db.put_entity(key.clone(), string("v"));
        db.expire(&key, SystemTime::now() + Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(300)).await;
        // Checked through the raw table so lazy expiry cannot hide a miss.
        assert!(!db.data.contains(b"k"));
        assert!(db.ttl_at(b"k").is_none());
    }

    #[tokio::test]
    async fn test_persist_before_fire_keeps_key() {
        let db = Db::open(DbOptions::for_tests()).unwrap();
        let key = Bytes::from("k");
        db.put_entity(key.clone(), string("v"));
        db.expire(&key, SystemTime::now() + Duration::from_millis(80));
        db.persist(b"k");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(db.get_entity(b"k"), Some(string("v")));
    }

    #[tokio::test]
    async fn test_rescheduled_expiry_uses_latest_deadline() {
        let db = Db::open(DbOptions::for_tests()).unwrap();
        let key = Bytes::from("k");
        db.put_entity(key.clone(), string("v"));
        db.expire(&key, SystemTime::now() + Duration::from_millis(40));
        db.expire(&key, SystemTime::now() + Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(db.data.contains(b"k"));
    }
}
