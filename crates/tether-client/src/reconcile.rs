//! Optimistic message reconciliation.
//!
//! Sent messages show up immediately as pending entries. When the server's
//! copy arrives it replaces the pending entry, matched by the temp id echoed
//! back as `client_ref` or, failing that, by resource + role + content
//! within a short window. Every server id appears at most once in the view
//! no matter how often it is delivered.

use crate::config::ReconcileConfig;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tether_core::{ConfirmedMessage, MessageId, ResourceId, Role, TempId};
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    Pending,
    Confirmed,
    TimedOut,
}

/// A locally sent message waiting for the server's copy.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub temp_id: TempId,
    pub resource_id: ResourceId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub status: PendingStatus,
    inserted: Instant,
}

impl PendingMessage {
    fn new(resource_id: ResourceId, content: String, role: Role) -> Self {
        Self {
            temp_id: TempId::generate(),
            resource_id,
            role,
            content,
            created_at: Utc::now(),
            status: PendingStatus::Pending,
            inserted: Instant::now(),
        }
    }

    /// Time since the entry was (re)queued.
    pub fn age(&self) -> std::time::Duration {
        self.inserted.elapsed()
    }
}

/// One entry of the merged view.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewMessage {
    Confirmed(ConfirmedMessage),
    Pending(PendingMessage),
}

impl ViewMessage {
    pub fn content(&self) -> &str {
        match self {
            ViewMessage::Confirmed(m) => &m.content,
            ViewMessage::Pending(m) => &m.content,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            ViewMessage::Confirmed(m) => m.role,
            ViewMessage::Pending(m) => m.role,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ViewMessage::Confirmed(m) => m.sent_at,
            ViewMessage::Pending(m) => m.created_at,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ViewMessage::Pending(_))
    }

    pub fn server_id(&self) -> Option<&MessageId> {
        match self {
            ViewMessage::Confirmed(m) => Some(&m.id),
            ViewMessage::Pending(_) => None,
        }
    }
}

/// What `process_confirmation` did with a server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// Replaced the pending entry with this temp id.
    Matched { temp_id: TempId },
    /// No pending counterpart; added as a new entry.
    Inserted,
    /// Already in the view; ignored.
    Duplicate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub pending: usize,
    pub confirmed: usize,
    pub timed_out: usize,
    pub duplicates_ignored: u64,
}

/// Result of a cleanup sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub timed_out: Vec<TempId>,
    pub evicted: usize,
}

struct Slot {
    seq: u64,
    message: ConfirmedMessage,
}

/// Confirmed messages of one resource, plus their ids for duplicate checks.
#[derive(Default)]
struct View {
    slots: Vec<Slot>,
    ids: HashSet<MessageId>,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    /// Pending entries with their ordering sequence, oldest first.
    pending: Vec<(u64, PendingMessage)>,
    timed_out: Vec<PendingMessage>,
    views: HashMap<ResourceId, View>,
    /// Confirmed ids seen recently: id -> (resource, when).
    index: HashMap<MessageId, (ResourceId, Instant)>,
    duplicates_ignored: u64,
}

impl State {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn is_known(&self, message: &ConfirmedMessage) -> bool {
        self.index.contains_key(&message.id)
            || self
                .views
                .get(&message.resource_id)
                .is_some_and(|view| view.ids.contains(&message.id))
    }

    fn take_by_temp_id(&mut self, temp_id: &TempId) -> Option<(u64, PendingMessage)> {
        if let Some(pos) = self.pending.iter().position(|(_, p)| &p.temp_id == temp_id) {
            return Some(self.pending.remove(pos));
        }
        // A late confirmation rescues a send already reported as timed out.
        let pos = self.timed_out.iter().position(|p| &p.temp_id == temp_id)?;
        let entry = self.timed_out.remove(pos);
        let seq = self.seq();
        Some((seq, entry))
    }

    fn take_by_content(
        &mut self,
        message: &ConfirmedMessage,
        window: std::time::Duration,
    ) -> Option<(u64, PendingMessage)> {
        let pos = self.pending.iter().position(|(_, p)| {
            p.resource_id == message.resource_id
                && p.role == message.role
                && p.content == message.content
                && p.age() <= window
        })?;
        Some(self.pending.remove(pos))
    }

    fn insert_confirmed(&mut self, seq: u64, message: ConfirmedMessage) {
        self.index
            .insert(message.id.clone(), (message.resource_id.clone(), Instant::now()));
        let view = self.views.entry(message.resource_id.clone()).or_default();
        view.ids.insert(message.id.clone());
        view.slots.push(Slot { seq, message });
    }
}

/// Cheap to clone; clones share the same view.
#[derive(Clone)]
pub struct Reconciler {
    config: ReconcileConfig,
    state: Arc<Mutex<State>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Reconciler {
    pub fn new(config: ReconcileConfig) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            config,
            state: Arc::new(Mutex::new(State::default())),
            revision: Arc::new(revision),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Revision counter bumped on every change to the view.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Add a pending entry for a message about to be sent.
    pub fn add_optimistic_message(
        &self,
        resource_id: ResourceId,
        content: impl Into<String>,
        role: Role,
    ) -> PendingMessage {
        let pending = PendingMessage::new(resource_id, content.into(), role);
        {
            let mut state = self.state();
            let seq = state.seq();
            state.pending.push((seq, pending.clone()));
        }
        tracing::debug!(component = "reconcile", temp_id = %pending.temp_id, resource_id = %pending.resource_id, "optimistic insert");
        self.bump();
        pending
    }

    /// Fold a server message into the view.
    pub fn process_confirmation(&self, message: ConfirmedMessage) -> Reconciliation {
        let outcome = {
            let mut state = self.state();
            if state.is_known(&message) {
                state.duplicates_ignored += 1;
                tracing::debug!(component = "reconcile", id = %message.id, "duplicate confirmation ignored");
                return Reconciliation::Duplicate;
            }

            let matched = match &message.client_ref {
                Some(temp_id) => state.take_by_temp_id(temp_id),
                None => state.take_by_content(&message, self.config.match_window()),
            };

            match matched {
                Some((seq, pending)) => {
                    tracing::debug!(component = "reconcile", id = %message.id, temp_id = %pending.temp_id, "pending message confirmed");
                    state.insert_confirmed(seq, message);
                    Reconciliation::Matched {
                        temp_id: pending.temp_id,
                    }
                }
                None => {
                    let seq = state.seq();
                    state.insert_confirmed(seq, message);
                    Reconciliation::Inserted
                }
            }
        };
        self.bump();
        outcome
    }

    /// Confirmed plus pending entries for a resource, oldest first.
    pub fn ordered_messages(&self, resource_id: &ResourceId) -> Vec<ViewMessage> {
        let state = self.state();
        let mut merged: Vec<(DateTime<Utc>, u64, ViewMessage)> = Vec::new();
        if let Some(view) = state.views.get(resource_id) {
            merged.extend(view.slots.iter().map(|s| {
                (s.message.sent_at, s.seq, ViewMessage::Confirmed(s.message.clone()))
            }));
        }
        merged.extend(
            state
                .pending
                .iter()
                .filter(|(_, p)| &p.resource_id == resource_id)
                .map(|(seq, p)| (p.created_at, *seq, ViewMessage::Pending(p.clone()))),
        );
        merged.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        merged.into_iter().map(|(_, _, m)| m).collect()
    }

    /// Sends that were never confirmed, for a resource.
    pub fn timed_out(&self, resource_id: &ResourceId) -> Vec<PendingMessage> {
        self.state()
            .timed_out
            .iter()
            .filter(|p| &p.resource_id == resource_id)
            .cloned()
            .collect()
    }

    /// Move a timed-out entry back to pending so it can be sent again.
    pub fn retry_timed_out(&self, temp_id: &TempId) -> Option<PendingMessage> {
        let retried = {
            let mut state = self.state();
            let pos = state.timed_out.iter().position(|p| &p.temp_id == temp_id)?;
            let mut entry = state.timed_out.remove(pos);
            entry.status = PendingStatus::Pending;
            entry.created_at = Utc::now();
            entry.inserted = Instant::now();
            let seq = state.seq();
            state.pending.push((seq, entry.clone()));
            entry
        };
        tracing::info!(component = "reconcile", temp_id = %temp_id, "retrying timed-out send");
        self.bump();
        Some(retried)
    }

    /// Mark stale pending entries as timed out and trim the duplicate index.
    pub fn cleanup(&self) -> CleanupReport {
        let timeout = self.config.pending_timeout();
        let retention = self.config.confirmed_retention();
        let mut report = CleanupReport::default();
        {
            let mut state = self.state();

            let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|(_, p)| p.age() >= timeout);
            state.pending = kept;
            for (_, mut entry) in expired {
                entry.status = PendingStatus::TimedOut;
                report.timed_out.push(entry.temp_id.clone());
                state.timed_out.push(entry);
            }

            let before = state.index.len();
            state.index.retain(|_, (_, at)| at.elapsed() < retention);
            report.evicted = before - state.index.len();

            state.timed_out.retain(|p| p.age() < retention);
        }
        if !report.timed_out.is_empty() {
            tracing::info!(component = "reconcile", count = report.timed_out.len(), "pending messages timed out");
        }
        if !report.timed_out.is_empty() || report.evicted > 0 {
            self.bump();
        }
        report
    }

    /// Replace a resource's confirmed view with freshly loaded history.
    pub fn seed(&self, resource_id: &ResourceId, messages: Vec<ConfirmedMessage>) {
        {
            let mut state = self.state();
            state.views.remove(resource_id);
            state.index.retain(|_, (resource, _)| resource != resource_id);
        }
        let mut inserted = 0;
        for message in messages.into_iter().filter(|m| &m.resource_id == resource_id) {
            if self.process_confirmation(message) != Reconciliation::Duplicate {
                inserted += 1;
            }
        }
        tracing::debug!(component = "reconcile", %resource_id, inserted, "view seeded");
        self.bump();
    }

    /// Drop every view and pending entry.
    pub fn clear(&self) {
        {
            let mut state = self.state();
            let duplicates_ignored = state.duplicates_ignored;
            *state = State {
                duplicates_ignored,
                ..State::default()
            };
        }
        self.bump();
    }

    pub fn stats(&self) -> ReconcileStats {
        let state = self.state();
        ReconcileStats {
            pending: state.pending.len(),
            confirmed: state.views.values().map(|v| v.slots.len()).sum(),
            timed_out: state.timed_out.len(),
            duplicates_ignored: state.duplicates_ignored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn confirmed(id: &str, resource: &str, content: &str, client_ref: Option<&TempId>) -> ConfirmedMessage {
        ConfirmedMessage {
            id: MessageId::new(id),
            resource_id: ResourceId::from(resource),
            role: Role::User,
            content: content.to_string(),
            sent_at: Utc::now(),
            client_ref: client_ref.cloned(),
        }
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(ReconcileConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn echoed_temp_id_replaces_pending_entry() {
        let r = reconciler();
        let t1 = ResourceId::from("t1");
        let pending = r.add_optimistic_message(t1.clone(), "hello", Role::User);
        assert_eq!(pending.status, PendingStatus::Pending);
        assert!(r.ordered_messages(&t1)[0].is_pending());

        let outcome = r.process_confirmation(confirmed("m1", "t1", "hello", Some(&pending.temp_id)));
        assert_eq!(outcome, Reconciliation::Matched { temp_id: pending.temp_id });

        let view = r.ordered_messages(&t1);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].server_id().map(MessageId::as_str), Some("m1"));
        assert_eq!(r.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_delivery_yields_one_entry() {
        let r = reconciler();
        let t1 = ResourceId::from("t1");
        let msg = confirmed("m1", "t1", "from server", None);

        assert_eq!(r.process_confirmation(msg.clone()), Reconciliation::Inserted);
        assert_eq!(r.process_confirmation(msg.clone()), Reconciliation::Duplicate);
        assert_eq!(r.process_confirmation(msg), Reconciliation::Duplicate);

        assert_eq!(r.ordered_messages(&t1).len(), 1);
        assert_eq!(r.stats().duplicates_ignored, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn content_fallback_respects_window() {
        let r = reconciler();
        let t1 = ResourceId::from("t1");
        r.add_optimistic_message(t1.clone(), "same text", Role::User);

        tokio::time::advance(Duration::from_secs(20)).await;
        // Too old for the heuristic: treated as a different message.
        assert_eq!(
            r.process_confirmation(confirmed("m1", "t1", "same text", None)),
            Reconciliation::Inserted
        );

        let fresh = r.add_optimistic_message(t1.clone(), "same text", Role::User);
        assert_eq!(
            r.process_confirmation(confirmed("m2", "t1", "same text", None)),
            Reconciliation::Matched { temp_id: fresh.temp_id }
        );
        assert_eq!(r.stats().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_client_ref_is_not_matched_by_content() {
        let r = reconciler();
        let t1 = ResourceId::from("t1");
        r.add_optimistic_message(t1.clone(), "hi", Role::User);
        let other_tab = TempId::from("tmp-elsewhere");
        assert_eq!(
            r.process_confirmation(confirmed("m1", "t1", "hi", Some(&other_tab))),
            Reconciliation::Inserted
        );
        assert_eq!(r.stats().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn view_is_time_ordered_and_scoped() {
        let r = reconciler();
        let t1 = ResourceId::from("t1");
        let mut early = confirmed("m1", "t1", "first", None);
        early.sent_at = Utc::now() - chrono::Duration::seconds(60);
        r.process_confirmation(confirmed("m2", "t1", "second", None));
        r.process_confirmation(early);
        r.process_confirmation(confirmed("x1", "t2", "elsewhere", None));
        r.add_optimistic_message(t1.clone(), "third", Role::User);

        let contents: Vec<_> = r
            .ordered_messages(&t1)
            .iter()
            .map(|m| m.content().to_string())
            .collect();
        assert_eq!(contents, ["first", "second", "third"]);
        // Reading twice gives the same answer.
        assert_eq!(r.ordered_messages(&t1).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_times_out_and_retry_requeues() {
        let r = reconciler();
        let t1 = ResourceId::from("t1");
        let pending = r.add_optimistic_message(t1.clone(), "lost", Role::User);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(r.cleanup().timed_out.is_empty());

        tokio::time::advance(Duration::from_secs(25)).await;
        let report = r.cleanup();
        assert_eq!(report.timed_out, vec![pending.temp_id.clone()]);
        assert!(r.ordered_messages(&t1).is_empty());
        assert_eq!(r.timed_out(&t1)[0].status, PendingStatus::TimedOut);
        assert_eq!(r.stats().timed_out, 1);

        let retried = r.retry_timed_out(&pending.temp_id).unwrap();
        assert_eq!(retried.status, PendingStatus::Pending);
        assert_eq!(r.stats().timed_out, 0);
        assert_eq!(r.stats().pending, 1);
        assert!(r.retry_timed_out(&pending.temp_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn late_confirmation_rescues_timed_out_send() {
        let r = reconciler();
        let t1 = ResourceId::from("t1");
        let pending = r.add_optimistic_message(t1.clone(), "slow", Role::User);
        tokio::time::advance(Duration::from_secs(31)).await;
        r.cleanup();

        let outcome = r.process_confirmation(confirmed("m1", "t1", "slow", Some(&pending.temp_id)));
        assert_eq!(outcome, Reconciliation::Matched { temp_id: pending.temp_id });
        assert_eq!(r.stats().timed_out, 0);
        assert_eq!(r.ordered_messages(&t1).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn index_eviction_keeps_view_deduplicated() {
        let r = reconciler();
        let t1 = ResourceId::from("t1");
        let msg = confirmed("m1", "t1", "old", None);
        r.process_confirmation(msg.clone());

        tokio::time::advance(Duration::from_secs(601)).await;
        assert_eq!(r.cleanup().evicted, 1);
        assert_eq!(r.process_confirmation(msg), Reconciliation::Duplicate);
        assert_eq!(r.ordered_messages(&t1).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn seed_replaces_view_and_confirms_pending() {
        let r = reconciler();
        let t1 = ResourceId::from("t1");
        r.process_confirmation(confirmed("stale", "t1", "gone", None));
        let pending = r.add_optimistic_message(t1.clone(), "mine", Role::User);

        let mut first = confirmed("m1", "t1", "hello", None);
        first.sent_at = Utc::now() - chrono::Duration::seconds(30);
        r.seed(
            &t1,
            vec![
                first.clone(),
                confirmed("m2", "t1", "mine", Some(&pending.temp_id)),
                first,
            ],
        );

        let ids: Vec<_> = r
            .ordered_messages(&t1)
            .iter()
            .filter_map(|m| m.server_id().map(|id| id.as_str().to_string()))
            .collect();
        assert_eq!(ids, ["m1", "m2"]);
        assert_eq!(r.stats().pending, 0);

        r.clear();
        assert!(r.ordered_messages(&t1).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reseeding_forgets_ids_of_that_resource_only() {
        let r = reconciler();
        let t1 = ResourceId::from("t1");
        let t2 = ResourceId::from("t2");
        r.process_confirmation(confirmed("m1", "t1", "one", None));
        r.process_confirmation(confirmed("m2", "t2", "two", None));

        r.seed(&t1, vec![]);
        assert!(r.ordered_messages(&t1).is_empty());
        assert_eq!(
            r.process_confirmation(confirmed("m1", "t1", "one", None)),
            Reconciliation::Inserted
        );
        assert_eq!(
            r.process_confirmation(confirmed("m2", "t2", "two", None)),
            Reconciliation::Duplicate
        );
        assert_eq!(r.stats().confirmed, 2);
    }
}
