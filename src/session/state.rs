use std::collections::HashMap;

use crate::protocol::LazyTxn;

/// Transaction isolation levels understood by the storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ-UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ-COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE-READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    pub fn sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => {
                "set session transaction isolation level read uncommitted"
            }
            IsolationLevel::ReadCommitted => {
                "set session transaction isolation level read committed"
            }
            IsolationLevel::RepeatableRead => {
                "set session transaction isolation level repeatable read"
            }
            IsolationLevel::Serializable => {
                "set session transaction isolation level serializable"
            }
        }
    }
}

/// Derived transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    AutoCommit,
    Explicit,
    /// Begin metadata is pending, to be piggy-backed on the next statement
    LazyPrepared,
}

/// Client-tracked protocol state of one session.
///
/// Variables reflect only values the driver has set; untracked server-side
/// changes are not reconciled.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Last auto-commit value the server acknowledged
    pub auto_commit: bool,
    /// Cached isolation level; None until the driver sets one
    pub isolation: Option<IsolationLevel>,
    /// Default schema stamped onto outbound requests
    pub schema: Option<String>,
    /// Session variables the driver has set
    pub variables: HashMap<String, String>,
    /// Server-side transaction open (driver-inferred or notice-driven)
    pub in_transaction: bool,
    /// Pending transaction envelope for the next user request
    lazy: LazyTxn,
    stashed: Option<LazyTxn>,
    /// Side-effect statements batched for the next flush
    pub pending_ignorable: Vec<String>,
}

impl SessionState {
    pub fn new(schema: Option<String>) -> Self {
        Self {
            auto_commit: true,
            schema,
            ..Default::default()
        }
    }

    pub fn txn_state(&self) -> TxnState {
        if !self.lazy.is_empty() {
            TxnState::LazyPrepared
        } else if self.in_transaction || !self.auto_commit {
            TxnState::Explicit
        } else {
            TxnState::AutoCommit
        }
    }

    pub fn set_lazy_cts(&mut self) {
        self.lazy.cts = true;
    }

    pub fn set_lazy_snapshot_seq(&mut self, seq: u64) {
        self.lazy.snapshot_seq = Some(seq);
    }

    pub fn set_lazy_commit_seq(&mut self, seq: u64) {
        self.lazy.commit_seq = Some(seq);
    }

    /// Consume the pending envelope for the request being encoded. The
    /// envelope is cleared atomically under the state lock.
    pub fn take_lazy(&mut self) -> Option<LazyTxn> {
        if self.lazy.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.lazy))
    }

    /// Park the pending envelope so an interleaved internal statement does
    /// not consume it. Returns true when something was stashed.
    pub fn stash_transaction_sequence(&mut self) -> bool {
        if self.lazy.is_empty() {
            return false;
        }
        self.stashed = Some(std::mem::take(&mut self.lazy));
        true
    }

    pub fn unstash_transaction_sequence(&mut self) {
        if let Some(stashed) = self.stashed.take() {
            self.lazy = stashed;
        }
    }

    /// Queue `SET` statements for variables that differ from the tracked
    /// values. Returns the number of assignments queued.
    pub fn queue_session_variables(&mut self, vars: &HashMap<String, String>) -> usize {
        let mut assignments = Vec::new();
        for (name, value) in vars {
            let name = name.to_lowercase();
            if self.variables.get(&name) == Some(value) {
                continue;
            }
            assignments.push(format!("`{name}`={value}"));
            self.variables.insert(name, value.clone());
        }
        if assignments.is_empty() {
            return 0;
        }
        let count = assignments.len();
        self.pending_ignorable
            .push(format!("SET {}", assignments.join(", ")));
        count
    }

    /// Queue global variable assignments. Globals are not tracked.
    pub fn queue_global_variables(&mut self, vars: &HashMap<String, String>) -> usize {
        let mut assignments: Vec<String> = vars
            .iter()
            .map(|(name, value)| format!("GLOBAL `{}`={}", name.to_lowercase(), value))
            .collect();
        if assignments.is_empty() {
            return 0;
        }
        assignments.sort();
        let count = assignments.len();
        self.pending_ignorable
            .push(format!("SET {}", assignments.join(", ")));
        count
    }

    /// Forget client-tracked state when the session goes back to the pool.
    pub fn reset_for_reuse(&mut self) {
        self.auto_commit = true;
        self.isolation = None;
        self.variables.clear();
        self.in_transaction = false;
        self.lazy = LazyTxn::default();
        self.stashed = None;
        self.pending_ignorable.clear();
    }
}
