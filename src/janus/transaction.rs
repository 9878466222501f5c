//! Transaction correlation table.
//!
//! Every outbound envelope gets a fresh id. Ids are a random 8-hex-char
//! prefix (per table) plus a monotonically increasing counter, so they are
//! unguessable across sessions and never repeat within one.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::SignalError;

/// Default per-request deadline.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal outcome of a transaction: the `data` / plugin payload, or why it failed.
pub type Reply = Result<Value, SignalError>;

/// Waiter notified when a transaction reaches its terminal reply.
pub type Resolver = oneshot::Sender<Reply>;

/// Fail a verb, letting its awaiting caller know as well.
pub(crate) fn refuse(resolver: Option<Resolver>, error: SignalError) -> Result<(), SignalError> {
    if let Some(tx) = resolver {
        let _ = tx.send(Err(error.clone()));
    }
    Err(error)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for TransactionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the outbound request was, so replies can be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Create,
    Attach,
    Register,
    Call,
    Accept,
    Hangup,
    List,
    Set,
    Trickle,
    Keepalive,
    Detach,
    Destroy,
}

impl TransactionKind {
    /// Janus answers these with a bare `ack`; for everything else an ack
    /// only means "still working on it".
    pub fn ack_is_terminal(self) -> bool {
        matches!(self, Self::Trickle | Self::Keepalive)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One outstanding request.
#[derive(Debug)]
pub struct PendingTransaction {
    pub kind: TransactionKind,
    pub sent_at: Instant,
    pub deadline: Instant,
    resolver: Option<Resolver>,
}

impl PendingTransaction {
    fn resolve(mut self, reply: Reply) {
        if let Some(tx) = self.resolver.take() {
            // The waiter may have given up; nothing to do then.
            let _ = tx.send(reply);
        }
    }
}

/// Result of feeding an `ack` into the table.
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// Request still in flight; deadline pushed back.
    Extended(TransactionKind),
    /// The ack was the terminal reply for this kind of request.
    Completed(TransactionKind),
    Unknown,
}

#[derive(Debug)]
pub struct TransactionTable {
    pending: HashMap<TransactionId, PendingTransaction>,
    timeout: Duration,
    prefix: String,
    seq: u64,
}

impl TransactionTable {
    pub fn new(timeout: Duration) -> Self {
        let prefix = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            pending: HashMap::new(),
            timeout,
            prefix,
            seq: 0,
        }
    }

    fn next_id(&mut self) -> TransactionId {
        self.seq += 1;
        TransactionId(format!("{}{:04x}", self.prefix, self.seq))
    }

    /// Register a new outbound request and return its id.
    pub fn begin(
        &mut self,
        kind: TransactionKind,
        now: Instant,
        resolver: Option<Resolver>,
    ) -> TransactionId {
        let id = self.next_id();
        self.pending.insert(
            id.clone(),
            PendingTransaction {
                kind,
                sent_at: now,
                deadline: now + self.timeout,
                resolver,
            },
        );
        id
    }

    pub fn kind_of(&self, id: &str) -> Option<TransactionKind> {
        self.pending.get(id).map(|p| p.kind)
    }

    pub fn ack(&mut self, id: &str, now: Instant) -> AckOutcome {
        let kind = match self.pending.get_mut(id) {
            Some(p) if p.kind.ack_is_terminal() => p.kind,
            Some(p) => {
                p.deadline = now + self.timeout;
                return AckOutcome::Extended(p.kind);
            }
            None => return AckOutcome::Unknown,
        };
        if let Some(p) = self.pending.remove(id) {
            p.resolve(Ok(Value::Null));
        }
        AckOutcome::Completed(kind)
    }

    /// Resolve a pending transaction. Returns its kind, or `None` if the id
    /// is unknown (already resolved, expired, or never ours).
    pub fn resolve(&mut self, id: &str, reply: Reply) -> Option<TransactionKind> {
        let pending = self.pending.remove(id)?;
        let kind = pending.kind;
        let waited = pending.sent_at.elapsed();
        tracing::debug!("Transaction {} ({}) resolved after {:?}", id, kind, waited);
        pending.resolve(reply);
        Some(kind)
    }

    /// Resolve every transaction whose deadline has passed with `GatewayTimeout`.
    pub fn expire(&mut self, now: Instant) -> Vec<(TransactionId, TransactionKind)> {
        let expired: Vec<TransactionId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(p) = self.pending.remove(&id) {
                tracing::warn!("Transaction {} ({}) timed out", id, p.kind);
                let kind = p.kind;
                p.resolve(Err(SignalError::GatewayTimeout));
                out.push((id, kind));
            }
        }
        out
    }

    /// Resolve everything outstanding with `err`.
    pub fn cancel_all(&mut self, err: SignalError) -> usize {
        let n = self.pending.len();
        for (_, p) in self.pending.drain() {
            p.resolve(Err(err.clone()));
        }
        n
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique_and_long_enough() {
        let mut table = TransactionTable::new(DEFAULT_TRANSACTION_TIMEOUT);
        let now = Instant::now();
        let mut seen = HashSet::new();
        for _ in 0..2000 {
            let id = table.begin(TransactionKind::Trickle, now, None);
            assert!(id.as_str().len() >= 12);
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_resolve_is_at_most_once() {
        let mut table = TransactionTable::new(DEFAULT_TRANSACTION_TIMEOUT);
        let (tx, mut rx) = oneshot::channel();
        let id = table.begin(TransactionKind::List, Instant::now(), Some(tx));

        assert_eq!(
            table.resolve(id.as_str(), Ok(Value::from(1))),
            Some(TransactionKind::List)
        );
        assert_eq!(table.resolve(id.as_str(), Ok(Value::from(2))), None);
        assert_eq!(rx.try_recv().unwrap(), Ok(Value::from(1)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_ack_extends_deadline_for_messages() {
        let mut table = TransactionTable::new(Duration::from_secs(10));
        let t0 = Instant::now();
        let id = table.begin(TransactionKind::Register, t0, None);

        let t8 = t0 + Duration::from_secs(8);
        assert_eq!(
            table.ack(id.as_str(), t8),
            AckOutcome::Extended(TransactionKind::Register)
        );
        assert!(table.expire(t0 + Duration::from_secs(12)).is_empty());
        assert_eq!(table.next_deadline(), Some(t8 + Duration::from_secs(10)));
    }

    #[test]
    fn test_ack_completes_trickle_and_keepalive() {
        let mut table = TransactionTable::new(DEFAULT_TRANSACTION_TIMEOUT);
        let (tx, mut rx) = oneshot::channel();
        let id = table.begin(TransactionKind::Keepalive, Instant::now(), Some(tx));
        assert_eq!(
            table.ack(id.as_str(), Instant::now()),
            AckOutcome::Completed(TransactionKind::Keepalive)
        );
        assert_eq!(rx.try_recv().unwrap(), Ok(Value::Null));
        assert_eq!(table.ack("nope", Instant::now()), AckOutcome::Unknown);
    }

    #[test]
    fn test_expire_resolves_with_timeout() {
        let mut table = TransactionTable::new(Duration::from_secs(10));
        let t0 = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        let id = table.begin(TransactionKind::Register, t0, Some(tx));
        table.begin(TransactionKind::List, t0 + Duration::from_secs(5), None);

        let expired = table.expire(t0 + Duration::from_secs(10));
        assert_eq!(expired, vec![(id, TransactionKind::Register)]);
        assert_eq!(rx.try_recv().unwrap(), Err(SignalError::GatewayTimeout));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_cancel_all() {
        let mut table = TransactionTable::new(DEFAULT_TRANSACTION_TIMEOUT);
        let (tx, mut rx) = oneshot::channel();
        table.begin(TransactionKind::Call, Instant::now(), Some(tx));
        table.begin(TransactionKind::Trickle, Instant::now(), None);
        assert_eq!(table.cancel_all(SignalError::Cancelled), 2);
        assert_eq!(rx.try_recv().unwrap(), Err(SignalError::Cancelled));
        assert_eq!(table.next_deadline(), None);
    }
}
