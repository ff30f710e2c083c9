//! Durable state behind the core.
//!
//! The core only talks to the [`Store`] trait. [`MemoryStore`] keeps everything in
//! process. [`FileStore`] keeps current state (balances, positions, claimed deposit
//! signatures) in a JSON snapshot and appends history (settlements, liquidation
//! records) to JSON-lines journals next to it, so a commit costs the size of the
//! current state, never the size of the history.

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::ledger::{AgentBalance, Settlement};
use crate::liquidation::LiquidationRecord;
use crate::position::Position;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store io failure: {0}")]
    Io(String),
    #[error("store snapshot corrupt: {0}")]
    Corrupt(String),
}

pub trait Store: Send + Sync {
    /// Persist balances and an optional settlement together. Either all land or none do.
    fn commit(&self, balances: &[AgentBalance], settlement: Option<&Settlement>) -> Result<(), StoreError>;
    fn load_balances(&self) -> Result<Vec<AgentBalance>, StoreError>;
    fn load_settlements(&self) -> Result<Vec<Settlement>, StoreError>;

    fn save_position(&self, position: &Position) -> Result<(), StoreError>;
    fn load_positions(&self) -> Result<Vec<Position>, StoreError>;

    fn append_liquidation(&self, record: &LiquidationRecord) -> Result<(), StoreError>;
    fn load_liquidations(&self) -> Result<Vec<LiquidationRecord>, StoreError>;

    /// Atomically claim a deposit signature. `Ok(false)` if it was already claimed.
    fn claim_signature(&self, signature: &str) -> Result<bool, StoreError>;
    /// Give a claim back after the deposit it guarded turned out invalid.
    fn release_signature(&self, signature: &str) -> Result<(), StoreError>;
    fn is_claimed(&self, signature: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    balances: BTreeMap<String, AgentBalance>,
    positions: BTreeMap<String, Position>,
    claimed_signatures: BTreeSet<String>,
}

impl Snapshot {
    fn apply_balances(&mut self, balances: &[AgentBalance]) {
        for balance in balances {
            self.balances.insert(balance.agent.0.clone(), balance.clone());
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<Snapshot>,
    settlements: RwLock<Vec<Settlement>>,
    liquidations: RwLock<Vec<LiquidationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn commit(&self, balances: &[AgentBalance], settlement: Option<&Settlement>) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(s) = settlement {
            self.settlements.write().push(s.clone());
        }
        state.apply_balances(balances);
        Ok(())
    }

    fn load_balances(&self) -> Result<Vec<AgentBalance>, StoreError> {
        Ok(self.state.read().balances.values().cloned().collect())
    }

    fn load_settlements(&self) -> Result<Vec<Settlement>, StoreError> {
        Ok(self.settlements.read().clone())
    }

    fn save_position(&self, position: &Position) -> Result<(), StoreError> {
        self.state
            .write()
            .positions
            .insert(position.id.to_string(), position.clone());
        Ok(())
    }

    fn load_positions(&self) -> Result<Vec<Position>, StoreError> {
        Ok(self.state.read().positions.values().cloned().collect())
    }

    fn append_liquidation(&self, record: &LiquidationRecord) -> Result<(), StoreError> {
        self.liquidations.write().push(record.clone());
        Ok(())
    }

    fn load_liquidations(&self) -> Result<Vec<LiquidationRecord>, StoreError> {
        Ok(self.liquidations.read().clone())
    }

    fn claim_signature(&self, signature: &str) -> Result<bool, StoreError> {
        Ok(self.state.write().claimed_signatures.insert(signature.to_string()))
    }

    fn release_signature(&self, signature: &str) -> Result<(), StoreError> {
        self.state.write().claimed_signatures.remove(signature);
        Ok(())
    }

    fn is_claimed(&self, signature: &str) -> Result<bool, StoreError> {
        Ok(self.state.read().claimed_signatures.contains(signature))
    }
}

/// JSON snapshot plus two JSON-lines journals on disk.
///
/// The snapshot is rewritten through a temp file + rename under the write lock, so a
/// crash leaves either the old or the new one. A commit appends its settlement
/// before the snapshot moves; a crash in between leaves a journaled settlement whose
/// balance change never landed, never the reverse. A torn last journal line is
/// skipped on load.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    settlements_path: PathBuf,
    liquidations_path: PathBuf,
    state: RwLock<Snapshot>,
    // appends that do not go through the snapshot lock
    journal: Mutex<()>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| StoreError::Io(e.to_string()))?;
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(e.to_string()))?
        } else {
            Snapshot::default()
        };
        Ok(Self {
            settlements_path: path.with_extension("settlements.jsonl"),
            liquidations_path: path.with_extension("liquidations.jsonl"),
            path,
            state: RwLock::new(state),
            journal: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settlements_path(&self) -> &Path {
        &self.settlements_path
    }

    pub fn liquidations_path(&self) -> &Path {
        &self.liquidations_path
    }

    // apply `f` to a copy, persist it, then swap it in
    fn write_with<R>(&self, f: impl FnOnce(&mut Snapshot) -> R) -> Result<R, StoreError> {
        let mut guard = self.state.write();
        let mut next = guard.clone();
        let out = f(&mut next);
        self.persist(&next)?;
        *guard = next;
        Ok(out)
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let raw = serde_json::to_string(snapshot).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, raw).map_err(|e| StoreError::Io(e.to_string()))?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }
}

fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let mut line = serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::Io(e.to_string()))?;
    file.write_all(line.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| StoreError::Io(e.to_string()))
}

fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
    let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut out = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(value) => out.push(value),
            // only the tail can be half written
            Err(e) if i + 1 == lines.len() && !raw.ends_with('\n') => {
                warn!(path = %path.display(), error = %e, "torn journal line skipped");
            }
            Err(e) => return Err(StoreError::Corrupt(format!("{} line {}: {}", path.display(), i + 1, e))),
        }
    }
    Ok(out)
}

impl Store for FileStore {
    fn commit(&self, balances: &[AgentBalance], settlement: Option<&Settlement>) -> Result<(), StoreError> {
        let mut guard = self.state.write();
        if let Some(s) = settlement {
            let _journal = self.journal.lock();
            append_line(&self.settlements_path, s)?;
        }
        let mut next = guard.clone();
        next.apply_balances(balances);
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }

    fn load_balances(&self) -> Result<Vec<AgentBalance>, StoreError> {
        Ok(self.state.read().balances.values().cloned().collect())
    }

    fn load_settlements(&self) -> Result<Vec<Settlement>, StoreError> {
        let _journal = self.journal.lock();
        read_lines(&self.settlements_path)
    }

    fn save_position(&self, position: &Position) -> Result<(), StoreError> {
        self.write_with(|s| {
            s.positions.insert(position.id.to_string(), position.clone());
        })
    }

    fn load_positions(&self) -> Result<Vec<Position>, StoreError> {
        Ok(self.state.read().positions.values().cloned().collect())
    }

    fn append_liquidation(&self, record: &LiquidationRecord) -> Result<(), StoreError> {
        let _journal = self.journal.lock();
        append_line(&self.liquidations_path, record)
    }

    fn load_liquidations(&self) -> Result<Vec<LiquidationRecord>, StoreError> {
        let _journal = self.journal.lock();
        read_lines(&self.liquidations_path)
    }

    fn claim_signature(&self, signature: &str) -> Result<bool, StoreError> {
        self.write_with(|s| s.claimed_signatures.insert(signature.to_string()))
    }

    fn release_signature(&self, signature: &str) -> Result<(), StoreError> {
        self.write_with(|s| {
            s.claimed_signatures.remove(signature);
        })
    }

    fn is_claimed(&self, signature: &str) -> Result<bool, StoreError> {
        Ok(self.state.read().claimed_signatures.contains(signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::SettlementKind;
    use crate::types::{AgentId, Quote, Timestamp};
    use rust_decimal_macros::dec;

    fn deposit(agent: &str, amount: i64) -> Settlement {
        Settlement::new(
            SettlementKind::OnchainDeposit,
            None,
            Some(AgentId::new(agent)),
            Quote::new(rust_decimal::Decimal::from(amount)),
            "deposit",
            Timestamp::from_millis(amount),
        )
    }

    fn balance(agent: &str, total: rust_decimal::Decimal) -> AgentBalance {
        let mut b = AgentBalance::new(AgentId::new(agent), Timestamp::from_millis(0));
        b.total = Quote::new(total);
        b
    }

    #[test]
    fn signature_claimed_once() {
        let store = MemoryStore::new();
        assert!(store.claim_signature("sig-1").unwrap());
        assert!(!store.claim_signature("sig-1").unwrap());
        assert!(store.is_claimed("sig-1").unwrap());

        store.release_signature("sig-1").unwrap();
        assert!(store.claim_signature("sig-1").unwrap());
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = FileStore::open(&path).unwrap();
            store.commit(&[balance("a", dec!(10))], None).unwrap();
            assert!(store.claim_signature("sig-9").unwrap());
        }

        let store = FileStore::open(&path).unwrap();
        let balances = store.load_balances().unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].total, Quote::new(dec!(10)));
        assert!(!store.claim_signature("sig-9").unwrap());
    }

    #[test]
    fn settlements_append_to_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = FileStore::open(&path).unwrap();
            for i in 1..=50 {
                store
                    .commit(&[balance("a", rust_decimal::Decimal::from(i))], Some(&deposit("a", i)))
                    .unwrap();
            }
            // history lives in the journal only; the snapshot holds current state
            let snapshot = std::fs::read_to_string(store.path()).unwrap();
            assert!(!snapshot.contains("settlements"));
            let journal = std::fs::read_to_string(store.settlements_path()).unwrap();
            assert_eq!(journal.lines().count(), 50);
        }

        let store = FileStore::open(&path).unwrap();
        let settlements = store.load_settlements().unwrap();
        assert_eq!(settlements.len(), 50);
        assert_eq!(settlements[49].amount, Quote::new(dec!(50)));
        assert_eq!(store.load_balances().unwrap()[0].total, Quote::new(dec!(50)));
    }

    #[test]
    fn torn_journal_tail_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStore::open(&path).unwrap();
        store.commit(&[balance("a", dec!(1))], Some(&deposit("a", 1))).unwrap();

        let mut raw = std::fs::read_to_string(store.settlements_path()).unwrap();
        raw.push_str("{\"id\":");
        std::fs::write(store.settlements_path(), &raw).unwrap();
        assert_eq!(store.load_settlements().unwrap().len(), 1);

        // a bad line that is not the tail is corruption
        raw.push_str("\n{}\n");
        std::fs::write(store.settlements_path(), &raw).unwrap();
        assert!(matches!(store.load_settlements(), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn corrupt_snapshot_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(FileStore::open(&path), Err(StoreError::Corrupt(_))));
    }
}
