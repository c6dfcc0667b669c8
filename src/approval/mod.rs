//! Approval gate for side-effecting tool calls
//!
//! Every tool that requires approval goes through [`ApprovalGate::request`].
//! Remembered rules answer immediately; everything else waits in a pending
//! table until a human (CLI prompt or HTTP bridge) resolves it.
//!
//! ```text
//! ToolExecutor ──request──▶ rules match? ──yes──▶ Approved
//!                               │ no
//!                               ▼
//!                     pending table + broadcast ──▶ CLI / bridge
//!                               │
//!                     approve / deny / timeout ──▶ oneshot ──▶ caller
//! ```

pub mod bridge;
pub mod rule;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::{APPROVALS_PENDING, APPROVAL_DECISIONS};
use crate::store::Store;
use crate::tools::ToolCategory;

pub use rule::ApprovalRule;

/// Number of resolved requests kept in history
pub const HISTORY_LIMIT: usize = 100;

/// A tool call waiting for permission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub tool_id: String,
    pub tool_name: String,
    pub category: ToolCategory,
    pub args: Value,
    pub working_directory: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        category: ToolCategory,
        args: Value,
        working_directory: PathBuf,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            tool_id: tool_id.into(),
            tool_name: tool_name.into(),
            category,
            args,
            working_directory,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of an approval request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    Approved { remember: bool },
    Denied { reason: String },
}

impl Decision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Decision::Approved { .. })
    }
}

/// Who resolved a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Rule,
    User,
    Timeout,
    /// The requester went away before anyone answered
    Dropped,
}

impl Resolution {
    fn as_str(&self) -> &'static str {
        match self {
            Resolution::Rule => "rule",
            Resolution::User => "user",
            Resolution::Timeout => "timeout",
            Resolution::Dropped => "dropped",
        }
    }
}

/// A resolved request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub request: ApprovalRequest,
    pub decision: Decision,
    pub resolved_by: Resolution,
    pub resolved_at: DateTime<Utc>,
}

/// Error type for gate operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("no pending approval request with id {0}")]
    UnknownRequest(Uuid),
    #[error("approval request timed out after {0:?}")]
    TimedOut(Duration),
}

/// Approval settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Listen address of the HTTP bridge
    pub bridge_addr: String,
    /// How long a bridge or CLI request waits for a human
    pub request_timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            bridge_addr: "127.0.0.1:7878".to_string(),
            request_timeout_secs: 300,
        }
    }
}

struct PendingEntry {
    request: ApprovalRequest,
    responder: oneshot::Sender<Decision>,
}

#[derive(Default)]
struct GateState {
    rules: Vec<ApprovalRule>,
    pending: HashMap<Uuid, PendingEntry>,
    /// Insertion order of pending ids, so listings and bulk ops are FIFO
    order: Vec<Uuid>,
    history: VecDeque<HistoryEntry>,
}

impl GateState {
    fn take_pending(&mut self, id: Uuid) -> Option<PendingEntry> {
        let entry = self.pending.remove(&id)?;
        self.order.retain(|p| *p != id);
        APPROVALS_PENDING.set(self.pending.len() as f64);
        Some(entry)
    }

    fn record(&mut self, request: ApprovalRequest, decision: Decision, resolved_by: Resolution) {
        let result = if decision.is_approved() { "approved" } else { "denied" };
        APPROVAL_DECISIONS
            .with_label_values(&[resolved_by.as_str(), result])
            .inc();
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry {
            request,
            decision,
            resolved_by,
            resolved_at: Utc::now(),
        });
    }
}

/// Removes a still-pending entry when the waiting caller is cancelled
struct PendingGuard<'a> {
    gate: &'a ApprovalGate,
    id: Uuid,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.expire(self.id, Resolution::Dropped, "request abandoned".into());
        }
    }
}

/// Decides whether tool calls may proceed
pub struct ApprovalGate {
    state: Mutex<GateState>,
    events: broadcast::Sender<ApprovalRequest>,
    rule_store: Option<Box<dyn Store<Vec<ApprovalRule>>>>,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalGate {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(GateState::default()),
            events,
            rule_store: None,
        }
    }

    /// Gate whose rules are loaded from and saved to `store`
    pub fn with_store(store: Box<dyn Store<Vec<ApprovalRule>>>) -> Self {
        let mut gate = Self::new();
        match store.load() {
            Ok(Some(rules)) => {
                info!(count = rules.len(), "Loaded approval rules");
                gate.lock().rules = rules;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load approval rules, starting empty"),
        }
        gate.rule_store = Some(store);
        gate
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to newly pending requests
    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.events.subscribe()
    }

    /// Ask for permission; suspends until a rule, a human or a drop resolves it
    pub async fn request(&self, request: ApprovalRequest) -> Decision {
        let (id, rx) = match self.register(request) {
            Ok(decision) => return decision,
            Err(registered) => registered,
        };
        let mut guard = PendingGuard {
            gate: self,
            id,
            armed: true,
        };
        let decision = rx.await.unwrap_or_else(|_| Decision::Denied {
            reason: "approval gate closed".into(),
        });
        guard.armed = false;
        decision
    }

    /// Like [`request`](Self::request) but denies after `timeout`
    pub async fn request_with_timeout(
        &self,
        request: ApprovalRequest,
        timeout: Duration,
    ) -> Result<Decision, ApprovalError> {
        let (id, mut rx) = match self.register(request) {
            Ok(decision) => return Ok(decision),
            Err(registered) => registered,
        };
        let mut guard = PendingGuard {
            gate: self,
            id,
            armed: true,
        };
        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(decision) => Ok(decision.unwrap_or_else(|_| Decision::Denied {
                reason: "approval gate closed".into(),
            })),
            Err(_) => {
                if self.expire(id, Resolution::Timeout, "approval timed out".into()) {
                    debug!(request_id = %id, "Approval request timed out");
                    Err(ApprovalError::TimedOut(timeout))
                } else {
                    // Resolved between the deadline and the expiry; the answer is in flight
                    Ok(rx.await.unwrap_or_else(|_| Decision::Denied {
                        reason: "approval gate closed".into(),
                    }))
                }
            }
        };
        guard.armed = false;
        outcome
    }

    /// Match rules or park the request; `Err` carries the receiver to await
    fn register(
        &self,
        request: ApprovalRequest,
    ) -> Result<Decision, (Uuid, oneshot::Receiver<Decision>)> {
        let mut state = self.lock();
        if state.rules.iter().any(|rule| rule.matches(&request)) {
            debug!(tool = %request.tool_id, "Approved by rule");
            let decision = Decision::Approved { remember: false };
            state.record(request, decision.clone(), Resolution::Rule);
            return Ok(decision);
        }

        let (tx, rx) = oneshot::channel();
        let id = request.id;
        state.order.push(id);
        state.pending.insert(
            id,
            PendingEntry {
                request: request.clone(),
                responder: tx,
            },
        );
        APPROVALS_PENDING.set(state.pending.len() as f64);
        drop(state);

        info!(request_id = %id, tool = %request.tool_id, "Approval requested");
        // No subscribers is fine: the request stays pending until resolved
        let _ = self.events.send(request);
        Err((id, rx))
    }

    /// Resolve a pending entry as denied without a human; false if already gone
    fn expire(&self, id: Uuid, resolved_by: Resolution, reason: String) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.take_pending(id) else {
            return false;
        };
        let decision = Decision::Denied { reason };
        state.record(entry.request, decision.clone(), resolved_by);
        let _ = entry.responder.send(decision);
        true
    }

    /// Approve a pending request, optionally remembering a rule for it
    pub fn approve(&self, id: Uuid, remember: bool) -> Result<(), ApprovalError> {
        let rule_added = {
            let mut state = self.lock();
            let entry = state
                .take_pending(id)
                .ok_or(ApprovalError::UnknownRequest(id))?;
            let decision = Decision::Approved { remember };
            let rule = remember.then(|| ApprovalRule::remembered(&entry.request));
            if let Some(rule) = &rule {
                info!(tool = %rule.tool_id, pattern = ?rule.pattern, "Remembering approval rule");
                state.rules.push(rule.clone());
            }
            state.record(entry.request, decision.clone(), Resolution::User);
            let _ = entry.responder.send(decision);
            rule.is_some()
        };
        if rule_added {
            self.persist_rules();
        }
        Ok(())
    }

    /// Deny a pending request
    pub fn deny(&self, id: Uuid, reason: impl Into<String>) -> Result<(), ApprovalError> {
        let mut state = self.lock();
        let entry = state
            .take_pending(id)
            .ok_or(ApprovalError::UnknownRequest(id))?;
        let decision = Decision::Denied {
            reason: reason.into(),
        };
        state.record(entry.request, decision.clone(), Resolution::User);
        let _ = entry.responder.send(decision);
        Ok(())
    }

    /// Approve every pending request; returns how many were resolved
    pub fn approve_all(&self, remember: bool) -> usize {
        let ids = self.lock().order.clone();
        ids.into_iter()
            .filter(|id| self.approve(*id, remember).is_ok())
            .count()
    }

    /// Deny every pending request; returns how many were resolved
    pub fn deny_all(&self, reason: impl Into<String>) -> usize {
        let reason = reason.into();
        let ids = self.lock().order.clone();
        ids.into_iter()
            .filter(|id| self.deny(*id, reason.clone()).is_ok())
            .count()
    }

    /// Pending requests, oldest first
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.pending.get(id).map(|e| e.request.clone()))
            .collect()
    }

    /// Resolved requests, oldest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn rules(&self) -> Vec<ApprovalRule> {
        self.lock().rules.clone()
    }

    pub fn add_rule(&self, rule: ApprovalRule) {
        self.lock().rules.push(rule);
        self.persist_rules();
    }

    /// Remove a rule by id; false if it did not exist
    pub fn remove_rule(&self, id: Uuid) -> bool {
        let removed = {
            let mut state = self.lock();
            let before = state.rules.len();
            state.rules.retain(|r| r.id != id);
            state.rules.len() != before
        };
        if removed {
            self.persist_rules();
        }
        removed
    }

    fn persist_rules(&self) {
        let Some(store) = &self.rule_store else {
            return;
        };
        let rules = self.rules();
        if let Err(e) = store.save(&rules) {
            warn!(error = %e, "Failed to persist approval rules");
        }
    }
}
