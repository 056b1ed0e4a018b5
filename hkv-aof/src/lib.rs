//! # AOF Writer
//!
//! Purpose: durable append-only log of every write command the engine
//! executes, with three fsync policies, startup replay, and a
//! lock-minimising three-phase background rewrite.
//!
//! ## Design Principles
//! 1. **One File, One Owner**: `last_db_index` and the open handle live
//!    behind one mutex; `always` writes take that mutex directly on the
//!    caller's thread, `every-second`/`no` hand the record to a background
//!    consumer thread instead so the caller never blocks on I/O.
//! 2. **Replay Never Re-enters The AOF**: `load` and the rewrite builder
//!    both drive commands through `Engine::replay`, which bypasses
//!    `AofSink` entirely — there's no flag to thread through, the
//!    non-re-entrant path is simply a different engine method.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use hkv_common::{encode_command, ConnectionState, RespParser};
use hkv_engine::engine::AofSink;
use hkv_engine::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    Always,
    EverySecond,
    No,
}

struct Inner {
    file: File,
    last_db_index: i64,
}

impl Inner {
    fn write_record(&mut self, db_index: usize, command: &[Vec<u8>]) -> std::io::Result<()> {
        if self.last_db_index != db_index as i64 {
            self.file.write_all(&encode_command(&[b"SELECT".to_vec(), db_index.to_string().into_bytes()]))?;
            self.last_db_index = db_index as i64;
        }
        self.file.write_all(&encode_command(command))
    }
}

enum QueuedRecord {
    Write { db_index: usize, command: Vec<Vec<u8>> },
    Shutdown,
}

/// Append-only file writer; one instance per running server.
pub struct AofWriter {
    path: PathBuf,
    policy: FsyncPolicy,
    inner: Arc<Mutex<Inner>>,
    queue_tx: Option<SyncSender<QueuedRecord>>,
    consumer: Option<JoinHandle<()>>,
    fsync_ticker: Option<JoinHandle<()>>,
    atomic_close: Arc<std::sync::atomic::AtomicBool>,
    rewrite_epoch: AtomicUsize,
}

impl AofWriter {
    pub fn open(path: impl AsRef<Path>, policy: FsyncPolicy) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let inner = Arc::new(Mutex::new(Inner { file, last_db_index: -1 }));
        let atomic_close = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let (queue_tx, consumer, fsync_ticker) = match policy {
            FsyncPolicy::Always => (None, None, None),
            FsyncPolicy::EverySecond | FsyncPolicy::No => {
                let (tx, rx): (SyncSender<QueuedRecord>, Receiver<QueuedRecord>) = sync_channel(4096);
                let consumer_inner = Arc::clone(&inner);
                let consumer = std::thread::Builder::new()
                    .name("aof-writer".to_string())
                    .spawn(move || run_consumer(rx, consumer_inner))
                    .expect("failed to spawn aof writer thread");

                let fsync_ticker = if policy == FsyncPolicy::EverySecond {
                    let ticker_inner = Arc::clone(&inner);
                    Some(
                        std::thread::Builder::new()
                            .name("aof-fsync".to_string())
                            .spawn(move || run_fsync_ticker(ticker_inner))
                            .expect("failed to spawn aof fsync thread"),
                    )
                } else {
                    None
                };
                (Some(tx), Some(consumer), fsync_ticker)
            }
        };

        Ok(AofWriter { path, policy, inner, queue_tx, consumer, fsync_ticker, atomic_close, rewrite_epoch: AtomicUsize::new(0) })
    }

    /// Replays every record in the file (optionally capped at `byte_limit`
    /// bytes) through `engine`'s virtual-connection path. Used both at
    /// startup and by the rewrite builder, which replays the pre-rewrite
    /// portion of the live file into a fresh auxiliary engine.
    pub fn load(path: impl AsRef<Path>, byte_limit: Option<u64>, engine: &Engine) -> std::io::Result<()> {
        let mut file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let cap = byte_limit.unwrap_or(u64::MAX);
        let mut remaining = cap;
        let mut buf = Vec::new();
        let mut read_buf = [0u8; 64 * 1024];
        let mut parser = RespParser::new();
        let mut conn = ConnectionState::new();

        loop {
            if remaining == 0 {
                break;
            }
            let to_read = (read_buf.len() as u64).min(remaining) as usize;
            let n = file.read(&mut read_buf[..to_read])?;
            if n == 0 {
                break;
            }
            remaining -= n as u64;
            buf.extend_from_slice(&read_buf[..n]);
            while let Some(args) = parser.parse(&mut buf).map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed AOF record"))? {
                if args.is_empty() {
                    continue;
                }
                let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
                engine.replay(&mut conn, &name, &args[1..]);
            }
        }
        Ok(())
    }

    /// Runs `BGREWRITEAOF`: builds a compacted snapshot in a temp file, then
    /// splices the tail of writes that happened during the build into it
    /// before swapping it in.
    pub fn rewrite_file(&self, engine: &Engine) -> std::io::Result<()> {
        // Phase 1: Start.
        let (snapshot_len, snapshot_db_index) = {
            let mut inner = self.inner.lock().unwrap();
            inner.file.flush()?;
            inner.file.sync_all()?;
            let len = inner.file.metadata()?.len();
            (len, inner.last_db_index)
        };

        let temp_path = self.path.with_extension("rewrite.tmp");

        // Phase 2: Build, against a disposable auxiliary engine so the live
        // engine is never touched by the rewrite.
        {
            let aux_config = hkv_engine::EngineConfig {
                database_count: engine.database_count(),
                shard_count: 16,
                tick_interval: Duration::from_secs(1),
                slot_count: 64,
                password: None,
            };
            let aux_engine = Engine::new(aux_config);
            Self::load(&self.path, Some(snapshot_len), &aux_engine)?;

            let mut temp_file = OpenOptions::new().create(true).write(true).truncate(true).open(&temp_path)?;
            for db_index in 0..aux_engine.database_count() {
                let Some(db) = aux_engine.database(db_index) else { continue };
                temp_file.write_all(&encode_command(&[b"SELECT".to_vec(), db_index.to_string().into_bytes()]))?;
                write_database_snapshot(&mut temp_file, db)?;
            }
            temp_file.flush()?;
        }

        // Phase 3: Finish — splice the tail written since the snapshot was
        // taken, then swap the temp file in under the file lock.
        {
            let mut inner = self.inner.lock().unwrap();
            inner.file.flush()?;
            inner.file.sync_all()?;

            let mut tail = Vec::new();
            {
                let mut reader = File::open(&self.path)?;
                reader.seek(SeekFrom::Start(snapshot_len))?;
                reader.read_to_end(&mut tail)?;
            }

            let mut temp_file = OpenOptions::new().append(true).open(&temp_path)?;
            if !tail.is_empty() {
                temp_file.write_all(&encode_command(&[b"SELECT".to_vec(), snapshot_db_index.max(0).to_string().into_bytes()]))?;
                temp_file.write_all(&tail)?;
            }
            temp_file.flush()?;
            temp_file.sync_all()?;
            drop(temp_file);

            std::fs::rename(&temp_path, &self.path)?;
            let live_db_index = inner.last_db_index;
            inner.file = OpenOptions::new().append(true).open(&self.path)?;
            inner.file.write_all(&encode_command(&[b"SELECT".to_vec(), live_db_index.max(0).to_string().into_bytes()]))?;
            inner.last_db_index = live_db_index;
        }

        self.rewrite_epoch.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn rewrite_count(&self) -> usize {
        self.rewrite_epoch.load(Ordering::Relaxed)
    }

    pub fn shutdown(&mut self) {
        self.atomic_close.store(true, Ordering::SeqCst);
        if let Some(tx) = self.queue_tx.take() {
            let _ = tx.send(QueuedRecord::Shutdown);
        }
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.fsync_ticker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AofWriter {
    fn drop(&mut self) {
        self.atomic_close.store(true, Ordering::SeqCst);
        if let Some(tx) = self.queue_tx.take() {
            let _ = tx.send(QueuedRecord::Shutdown);
        }
    }
}

impl AofSink for AofWriter {
    fn append(&self, db_index: usize, command: &[Vec<u8>]) {
        if self.atomic_close.load(Ordering::SeqCst) {
            return;
        }
        match self.policy {
            FsyncPolicy::Always => {
                let mut inner = self.inner.lock().unwrap();
                if inner.write_record(db_index, command).is_ok() {
                    let _ = inner.file.sync_all();
                }
            }
            FsyncPolicy::EverySecond | FsyncPolicy::No => {
                if let Some(tx) = &self.queue_tx {
                    let _ = tx.try_send(QueuedRecord::Write { db_index, command: command.to_vec() });
                }
            }
        }
    }

    fn rewrite(&self, engine: &Engine) {
        if let Err(e) = self.rewrite_file(engine) {
            tracing::warn!(error = %e, "append-only file rewrite failed");
        }
    }
}

fn run_consumer(rx: Receiver<QueuedRecord>, inner: Arc<Mutex<Inner>>) {
    while let Ok(record) = rx.recv() {
        match record {
            QueuedRecord::Shutdown => break,
            QueuedRecord::Write { db_index, command } => {
                let mut guard = inner.lock().unwrap();
                let _ = guard.write_record(db_index, &command);
            }
        }
    }
}

fn run_fsync_ticker(inner: Arc<Mutex<Inner>>) {
    loop {
        std::thread::sleep(Duration::from_secs(1));
        let guard = inner.lock().unwrap();
        if guard.file.sync_all().is_err() {
            break;
        }
    }
}

/// Writes every live key in `db` as the command that recreates it, followed
/// by a `PEXPIREAT` when it carries a TTL.
fn write_database_snapshot(out: &mut File, db: &hkv_engine::Database) -> std::io::Result<()> {
    let mut entries = Vec::new();
    db.data.for_each(|key, entity| {
        entries.push((key.to_vec(), entity.clone()));
        true
    });
    for (key, entity) in entries {
        match entity {
            hkv_engine::DataEntity::Bytes(value) => {
                out.write_all(&encode_command(&[b"SET".to_vec(), key.clone(), value]))?;
            }
            hkv_engine::DataEntity::SortedSet(set) => {
                let mut command = vec![b"ZADD".to_vec(), key.clone()];
                set.for_each(|member, score| {
                    command.push(format_score(score).into_bytes());
                    command.push(member.to_vec());
                });
                if command.len() > 2 {
                    out.write_all(&encode_command(&command))?;
                }
            }
        }
        if let Some(expire_at_ms) = db.expire_at_millis(&key) {
            out.write_all(&encode_command(&[b"PEXPIREAT".to_vec(), key, expire_at_ms.to_string().into_bytes()]))?;
        }
    }
    Ok(())
}

fn format_score(score: f64) -> String {
    if score.fract() == 0.0 && score.is_finite() {
        format!("{}", score as i64)
    } else {
        format!("{score}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hkv_engine::EngineConfig;

    fn test_engine() -> Engine {
        Engine::new(EngineConfig { database_count: 2, shard_count: 4, tick_interval: Duration::from_millis(20), slot_count: 32, password: None })
    }

    #[test]
    fn append_then_load_reconstructs_state() {
        let dir = std::env::temp_dir().join(format!("hkv-aof-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("append_then_load.aof");
        let _ = std::fs::remove_file(&path);

        {
            let mut writer = AofWriter::open(&path, FsyncPolicy::Always).unwrap();
            writer.append(0, &[b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
            writer.append(1, &[b"SET".to_vec(), b"k2".to_vec(), b"v2".to_vec()]);
            writer.shutdown();
        }

        let engine = test_engine();
        AofWriter::load(&path, None, &engine).unwrap();
        let mut conn = ConnectionState::new();
        assert_eq!(engine.dispatch(&mut conn, 1, "GET", &[b"k".to_vec()]), hkv_common::Reply::bulk(b"v".to_vec()));
        conn.set_db_index(1);
        assert_eq!(engine.dispatch(&mut conn, 1, "GET", &[b"k2".to_vec()]), hkv_common::Reply::bulk(b"v2".to_vec()));
    }

    #[test]
    fn rewrite_preserves_replayable_state() {
        let dir = std::env::temp_dir().join(format!("hkv-aof-test-rw-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("rewrite.aof");
        let _ = std::fs::remove_file(&path);

        let engine = test_engine();
        let mut writer = AofWriter::open(&path, FsyncPolicy::Always).unwrap();
        writer.append(0, &[b"SET".to_vec(), b"a".to_vec(), b"1".to_vec()]);
        writer.append(0, &[b"SET".to_vec(), b"b".to_vec(), b"2".to_vec()]);

        let mut conn = ConnectionState::new();
        engine.dispatch(&mut conn, 1, "SET", &[b"a".to_vec(), b"1".to_vec()]);
        engine.dispatch(&mut conn, 1, "SET", &[b"b".to_vec(), b"2".to_vec()]);

        writer.rewrite_file(&engine).unwrap();
        writer.append(0, &[b"SET".to_vec(), b"c".to_vec(), b"3".to_vec()]);
        writer.shutdown();

        let replayed = test_engine();
        AofWriter::load(&path, None, &replayed).unwrap();
        let mut replay_conn = ConnectionState::new();
        assert_eq!(replayed.dispatch(&mut replay_conn, 1, "GET", &[b"a".to_vec()]), hkv_common::Reply::bulk(b"1".to_vec()));
        assert_eq!(replayed.dispatch(&mut replay_conn, 1, "GET", &[b"c".to_vec()]), hkv_common::Reply::bulk(b"3".to_vec()));
    }

    #[test]
    fn bgrewriteaof_command_triggers_rewrite_through_the_sink() {
        let dir = std::env::temp_dir().join(format!("hkv-aof-test-bgr-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bgrewriteaof.aof");
        let _ = std::fs::remove_file(&path);

        let mut engine = test_engine();
        let writer = Arc::new(AofWriter::open(&path, FsyncPolicy::Always).unwrap());
        engine.set_aof_sink(writer.clone());

        let mut conn = ConnectionState::new();
        engine.dispatch(&mut conn, 1, "SET", &[b"a".to_vec(), b"1".to_vec()]);
        assert_eq!(writer.rewrite_count(), 0);
        engine.dispatch(&mut conn, 1, "BGREWRITEAOF", &[]);
        assert_eq!(writer.rewrite_count(), 1);

        let replayed = test_engine();
        AofWriter::load(&path, None, &replayed).unwrap();
        let mut replay_conn = ConnectionState::new();
        assert_eq!(replayed.dispatch(&mut replay_conn, 1, "GET", &[b"a".to_vec()]), hkv_common::Reply::bulk(b"1".to_vec()));
    }
}
