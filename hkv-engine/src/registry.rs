//! # Command Registry
//!
//! Purpose: name → (executor, key-extractor, arity, undo-generator). Both
//! the single-command dispatch path and the `EXEC` batch path go through
//! the same registry so key extraction and locking stay in one place.
//!
//! ## Design Principles
//! 1. **Shared Lock Object**: `exec` takes an already-acquired
//!    [`MultiKeyLock`] rather than acquiring its own; `dispatch_one` locks
//!    for a single command, `dispatch_batch` locks once for an entire
//!    `EXEC` queue and reuses it across every queued command.

use std::collections::HashMap;

use hkv_common::Reply;

use crate::database::Database;
use crate::entity::DataEntity;
use crate::sharded_map::MultiKeyLock;

/// How to pull read/write keys out of a command's argument list (args[0] is
/// the first token after the verb).
#[derive(Debug, Clone, Copy)]
pub enum KeySpec {
    None,
    ReadFirst,
    WriteFirst,
    ReadAll,
    WriteAll,
    /// Keys occur at stride `step` starting at index 0 (e.g. `MSET k v k v`
    /// has `step = 2`).
    WriteAlternating(usize),
}

pub type Executor = fn(&std::sync::Arc<Database>, &mut MultiKeyLock<'_, DataEntity>, &[Vec<u8>]) -> Reply;
/// Reads whatever prior state it needs through the same lock the batch
/// already holds — never through a `Database` method that locks on its own.
pub type UndoGenerator = fn(&std::sync::Arc<Database>, &MultiKeyLock<'_, DataEntity>, &[Vec<u8>]) -> Vec<Vec<Vec<u8>>>;

#[derive(Clone)]
pub struct CommandSpec {
    pub name: &'static str,
    /// Positive N: exactly N tokens including the verb. Negative -N: at
    /// least N tokens.
    pub arity: i32,
    pub key_spec: KeySpec,
    pub exec: Executor,
    pub undo: Option<UndoGenerator>,
}

impl CommandSpec {
    pub fn check_arity(&self, argc: usize) -> bool {
        if self.arity >= 0 {
            argc == self.arity as usize
        } else {
            argc >= (-self.arity) as usize
        }
    }
}

/// Extracts (read_keys, write_keys) from a command's args (verb excluded).
pub fn extract_keys<'a>(spec: &KeySpec, args: &'a [Vec<u8>]) -> (Vec<&'a [u8]>, Vec<&'a [u8]>) {
    match spec {
        KeySpec::None => (Vec::new(), Vec::new()),
        KeySpec::ReadFirst => (args.first().map(|k| k.as_slice()).into_iter().collect(), Vec::new()),
        KeySpec::WriteFirst => (Vec::new(), args.first().map(|k| k.as_slice()).into_iter().collect()),
        KeySpec::ReadAll => (args.iter().map(|k| k.as_slice()).collect(), Vec::new()),
        KeySpec::WriteAll => (Vec::new(), args.iter().map(|k| k.as_slice()).collect()),
        KeySpec::WriteAlternating(step) => {
            let step = (*step).max(1);
            (Vec::new(), args.iter().step_by(step).map(|k| k.as_slice()).collect())
        }
    }
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandSpec>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        CommandRegistry { commands: HashMap::new() }
    }

    pub fn register(&mut self, spec: CommandSpec) {
        self.commands.insert(spec.name.to_ascii_uppercase(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(&name.to_ascii_uppercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(&name.to_ascii_uppercase())
    }

    /// Builds the registry with every string/sorted-set/key-management
    /// command wired to its executor. Base commands (PING/AUTH/SELECT/...)
    /// and transaction verbs (MULTI/EXEC/...) are handled by the dispatcher
    /// directly since they operate on connection state, not a `Database`.
    pub fn with_builtin_commands() -> Self {
        let mut reg = CommandRegistry::new();
        crate::commands::register_all(&mut reg);
        reg
    }

    /// Runs one command, acquiring a fresh multi-key lock scoped to its own
    /// keys, then bumps the version counter for every key it wrote.
    pub fn dispatch_one(&self, db: &std::sync::Arc<Database>, name: &str, args: &[Vec<u8>]) -> Reply {
        let Some(spec) = self.get(name) else {
            return Reply::Error(format!("ERR unknown command '{name}'"));
        };
        let argc = args.len() + 1;
        if !spec.check_arity(argc) {
            return Reply::Error(format!("ERR wrong number of arguments for '{name}' command"));
        }
        let (reads, writes) = extract_keys(&spec.key_spec, args);
        let mut lock = db.data.lock_many(&reads, &writes);
        let reply = (spec.exec)(db, &mut lock, args);
        drop(lock);
        if !reply.is_error() {
            for key in &writes {
                db.bump_version(key);
            }
        }
        reply
    }

    /// Generates `name(args)`'s undo log (if it has one) by locking just its
    /// own keys, separate from its eventual execution — used by the cluster
    /// TCC participant, which cannot hold a lock across the network
    /// round-trip between `Prepare` and `Commit`/`Rollback`.
    pub fn snapshot_undo_for(&self, db: &std::sync::Arc<Database>, name: &str, args: &[Vec<u8>]) -> Vec<Vec<Vec<u8>>> {
        let Some(spec) = self.get(name) else { return Vec::new() };
        let Some(undo_gen) = spec.undo else { return Vec::new() };
        let (reads, writes) = extract_keys(&spec.key_spec, args);
        let lock = db.data.lock_many(&reads, &writes);
        undo_gen(db, &lock, args)
    }

    /// Runs an `EXEC`-queued batch of commands under one combined lock
    /// spanning every key any queued command touches (§4.7).
    pub fn dispatch_batch(&self, db: &std::sync::Arc<Database>, commands: &[(String, Vec<Vec<u8>>)]) -> Vec<Reply> {
        let mut all_reads: Vec<&[u8]> = Vec::new();
        let mut all_writes: Vec<&[u8]> = Vec::new();
        let mut per_command_writes = Vec::with_capacity(commands.len());
        let mut specs = Vec::with_capacity(commands.len());
        for (name, args) in commands {
            let spec = self.get(name);
            if let Some(spec) = spec {
                let (mut reads, writes) = extract_keys(&spec.key_spec, args);
                all_reads.append(&mut reads);
                all_writes.extend_from_slice(&writes);
                per_command_writes.push(writes);
            } else {
                per_command_writes.push(Vec::new());
            }
            specs.push(spec);
        }

        let mut lock = db.data.lock_many(&all_reads, &all_writes);
        let mut replies = Vec::with_capacity(commands.len());
        let mut bumped: Vec<&[u8]> = Vec::new();
        for (((name, args), spec), writes) in commands.iter().zip(specs.iter()).zip(per_command_writes.iter()) {
            let reply = match spec {
                Some(spec) => (spec.exec)(db, &mut lock, args),
                None => Reply::Error(format!("ERR unknown command '{name}'")),
            };
            if !reply.is_error() {
                bumped.extend_from_slice(writes);
            }
            replies.push(reply);
        }
        drop(lock);

        for key in &bumped {
            db.bump_version(key);
        }
        replies
    }

    /// Runs an `EXEC RB`-queued batch under one combined lock spanning every
    /// key any queued command touches: each command's undo is generated from
    /// that same held lock before it runs, and on the first error (or
    /// unknown command) the stacked undo is unwound in reverse — still under
    /// the held lock — before the lock is released (§4.7, §8). Versions are
    /// only bumped when the whole batch commits; an aborted batch leaves
    /// every key's version exactly where it was.
    pub fn dispatch_batch_with_rollback(&self, db: &std::sync::Arc<Database>, commands: &[(String, Vec<Vec<u8>>)]) -> RollbackOutcome {
        let mut all_reads: Vec<&[u8]> = Vec::new();
        let mut all_writes: Vec<&[u8]> = Vec::new();
        let mut per_command_writes = Vec::with_capacity(commands.len());
        let mut specs = Vec::with_capacity(commands.len());
        for (name, args) in commands {
            let spec = self.get(name);
            if let Some(spec) = spec {
                let (mut reads, writes) = extract_keys(&spec.key_spec, args);
                all_reads.append(&mut reads);
                all_writes.extend_from_slice(&writes);
                per_command_writes.push(writes);
            } else {
                per_command_writes.push(Vec::new());
            }
            specs.push(spec);
        }

        let mut lock = db.data.lock_many(&all_reads, &all_writes);
        let mut replies = Vec::with_capacity(commands.len());
        let mut undo_stack: Vec<Vec<Vec<u8>>> = Vec::new();
        let mut aborted = false;

        for ((_name, args), spec) in commands.iter().zip(specs.iter()) {
            let Some(spec) = spec else {
                aborted = true;
                break;
            };
            if let Some(undo_gen) = spec.undo {
                undo_stack.extend(undo_gen(db, &lock, args));
            }
            let reply = (spec.exec)(db, &mut lock, args);
            if reply.is_error() {
                aborted = true;
                break;
            }
            replies.push(reply);
        }

        if aborted {
            for undo_command in undo_stack.into_iter().rev() {
                if let Some((name, rest)) = undo_command.split_first() {
                    let name = String::from_utf8_lossy(name).to_ascii_uppercase();
                    if let Some(undo_spec) = self.get(&name) {
                        (undo_spec.exec)(db, &mut lock, rest);
                    }
                }
            }
            drop(lock);
            return RollbackOutcome::Aborted;
        }

        drop(lock);
        for writes in &per_command_writes {
            for key in writes {
                db.bump_version(key);
            }
        }
        RollbackOutcome::Committed(replies)
    }
}

/// Outcome of [`CommandRegistry::dispatch_batch_with_rollback`].
pub enum RollbackOutcome {
    Committed(Vec<Reply>),
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_positive_requires_exact_count() {
        let spec = CommandSpec { name: "GET", arity: 2, key_spec: KeySpec::ReadFirst, exec: |_, _, _| Reply::ok(), undo: None };
        assert!(spec.check_arity(2));
        assert!(!spec.check_arity(1));
        assert!(!spec.check_arity(3));
    }

    #[test]
    fn arity_negative_requires_minimum_count() {
        let spec = CommandSpec { name: "MSET", arity: -3, key_spec: KeySpec::WriteAlternating(2), exec: |_, _, _| Reply::ok(), undo: None };
        assert!(spec.check_arity(3));
        assert!(spec.check_arity(5));
        assert!(!spec.check_arity(2));
    }

    #[test]
    fn write_alternating_picks_every_other_key() {
        let args: Vec<Vec<u8>> = vec![b"k1".to_vec(), b"v1".to_vec(), b"k2".to_vec(), b"v2".to_vec()];
        let (reads, writes) = extract_keys(&KeySpec::WriteAlternating(2), &args);
        assert!(reads.is_empty());
        assert_eq!(writes, vec![b"k1".as_slice(), b"k2".as_slice()]);
    }
}
