//! Append-only event ledger.
//!
//! Every notable engine event (fills, order transitions, risk state
//! changes, lifecycle markers) is recorded with a monotonic per-process
//! sequence number and drained in batches to the store. The sequence
//! gives post-hoc analysis a total order and makes missing ranges
//! detectable.

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use quoter_common::LedgerRow;

/// Soft cap on the in-memory buffer; beyond it the oldest entries are
/// dropped (and counted) rather than growing without bound.
const MAX_BUFFERED: usize = 10_000;

/// Event kinds recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    Lifecycle,
    Fill,
    Order,
    RiskState,
    Quote,
    Reconcile,
}

impl LedgerKind {
    fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Lifecycle => "lifecycle",
            LedgerKind::Fill => "fill",
            LedgerKind::Order => "order",
            LedgerKind::RiskState => "risk_state",
            LedgerKind::Quote => "quote",
            LedgerKind::Reconcile => "reconcile",
        }
    }
}

/// Buffered append-only ledger.
pub struct EventLedger {
    session_id: String,
    next_seq: u64,
    buffer: Vec<LedgerRow>,
    dropped: u64,
}

impl EventLedger {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            next_seq: 1,
            buffer: Vec::new(),
            dropped: 0,
        }
    }

    /// Append an event. `token_id` is empty for global events.
    pub fn record(&mut self, kind: LedgerKind, token_id: &str, payload: serde_json::Value) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.buffer.push(LedgerRow {
            seq,
            session_id: self.session_id.clone(),
            ts: Utc::now(),
            kind: kind.as_str().to_string(),
            token_id: token_id.to_string(),
            payload: payload.to_string(),
        });

        if self.buffer.len() > MAX_BUFFERED {
            let overflow = self.buffer.len() - MAX_BUFFERED;
            self.buffer.drain(..overflow);
            self.dropped += overflow as u64;
            warn!(dropped = self.dropped, "Ledger buffer overflow, oldest events dropped");
        }

        seq
    }

    /// Convenience for simple message payloads.
    pub fn note(&mut self, kind: LedgerKind, token_id: &str, message: &str) -> u64 {
        self.record(kind, token_id, json!({ "message": message }))
    }

    /// Take the buffered rows for a batch write.
    pub fn drain(&mut self) -> Vec<LedgerRow> {
        std::mem::take(&mut self.buffer)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Sequence the next event will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Events dropped to the overflow cap.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_monotonic() {
        let mut ledger = EventLedger::new("session-1");

        let a = ledger.note(LedgerKind::Lifecycle, "", "startup");
        let b = ledger.note(LedgerKind::Fill, "token1", "fill recorded");
        let c = ledger.record(LedgerKind::RiskState, "", json!({"state": "HALTED"}));

        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(ledger.next_seq(), 4);
    }

    #[test]
    fn test_drain_empties_buffer_and_keeps_sequence() {
        let mut ledger = EventLedger::new("session-1");
        ledger.note(LedgerKind::Lifecycle, "", "startup");
        ledger.note(LedgerKind::Order, "token1", "placed");

        let rows = ledger.drain();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].seq, 1);
        assert_eq!(rows[1].seq, 2);
        assert_eq!(ledger.buffered(), 0);

        // Sequence continues across drains
        let seq = ledger.note(LedgerKind::Lifecycle, "", "shutdown");
        assert_eq!(seq, 3);
    }

    #[test]
    fn test_rows_carry_session_and_kind() {
        let mut ledger = EventLedger::new("session-9");
        ledger.record(LedgerKind::Fill, "token1", json!({"size": "10"}));

        let rows = ledger.drain();
        assert_eq!(rows[0].session_id, "session-9");
        assert_eq!(rows[0].kind, "fill");
        assert_eq!(rows[0].token_id, "token1");
        assert!(rows[0].payload.contains("\"size\""));
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut ledger = EventLedger::new("session-1");
        for i in 0..(MAX_BUFFERED + 10) {
            ledger.note(LedgerKind::Quote, "token1", &format!("event {}", i));
        }

        assert_eq!(ledger.buffered(), MAX_BUFFERED);
        assert_eq!(ledger.dropped(), 10);

        let rows = ledger.drain();
        // The oldest sequences are gone
        assert_eq!(rows[0].seq, 11);
    }
}
