//! Reactive relay of contract "transfer" events into operator-funded
//! transfers.
//!
//! The contract cannot move native assets itself, so it emits a transfer
//! event naming source, destination and amount; the relay decodes the event
//! and queues a directive which the service loop settles with a real
//! wallet-funded transfer. By default only committed executions are relayed;
//! relaying dry-run events is an explicit opt-in for test networks.

use tokio::sync::mpsc;

use crate::chain::{Address, ChainError, NotificationEvent};

/// Event kind the relay reacts to. All other kinds are dropped.
pub const TRANSFER_EVENT: &str = "transfer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPolicy {
    /// Relay only events observed in committed on-chain executions.
    CommittedOnly,
    /// Also relay events surfaced by dry runs. Every dry run of a
    /// transfer-emitting method then triggers a payout, so this is only safe
    /// where the operator accepts that cost.
    IncludeDryRuns,
}

/// A decoded transfer the operator wallet should carry out.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferDirective {
    pub asset: String,
    pub from: Address,
    pub to: Address,
    pub amount: u64,
}

#[derive(Clone)]
pub struct NotificationRelay {
    policy: RelayPolicy,
    transfer_asset: String,
    directives: mpsc::UnboundedSender<TransferDirective>,
}

impl NotificationRelay {
    /// Builds the relay and the directive receiver the service loop drains.
    pub fn channel(
        policy: RelayPolicy,
        transfer_asset: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<TransferDirective>) {
        let (directives, rx) = mpsc::unbounded_channel();
        (
            NotificationRelay {
                policy,
                transfer_asset: transfer_asset.into(),
                directives,
            },
            rx,
        )
    }

    /// Inspects one contract event and queues a transfer directive when it is
    /// an actionable transfer event. Malformed events are logged and dropped;
    /// they must not fail the invocation that surfaced them.
    pub fn handle(&self, event: &NotificationEvent) {
        if event.dry_run && self.policy == RelayPolicy::CommittedOnly {
            tracing::debug!(kind = %event.kind, "ignoring dry-run event");
            return;
        }
        if event.kind != TRANSFER_EVENT {
            tracing::debug!(kind = %event.kind, "ignoring contract event");
            return;
        }
        match self.decode_transfer(event) {
            Ok(directive) => {
                tracing::info!(
                    from = %directive.from,
                    to = %directive.to,
                    amount = directive.amount,
                    "relaying transfer event"
                );
                // the receiver lives as long as the service; a closed channel
                // only happens during shutdown
                let _ = self.directives.send(directive);
            }
            Err(error) => {
                tracing::warn!(%error, "dropping malformed transfer event");
            }
        }
    }

    fn decode_transfer(&self, event: &NotificationEvent) -> Result<TransferDirective, ChainError> {
        let [from, to, amount] = event.payload.as_slice() else {
            return Err(ChainError::InvalidValue {
                what: "transfer event payload",
                value: format!("{} elements", event.payload.len()),
            });
        };
        Ok(TransferDirective {
            asset: self.transfer_asset.clone(),
            from: Address::from_script_bytes(from)?,
            to: Address::from_script_bytes(to)?,
            amount: decode_amount(amount)?,
        })
    }
}

/// Contract integers arrive as minimal little-endian byte strings.
fn decode_amount(bytes: &[u8]) -> Result<u64, ChainError> {
    if bytes.len() > 8 {
        return Err(ChainError::InvalidValue {
            what: "transfer amount",
            value: format!("{} bytes", bytes.len()),
        });
    }
    let mut padded = [0u8; 8];
    padded[..bytes.len()].copy_from_slice(bytes);
    Ok(u64::from_le_bytes(padded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ScriptHash;

    fn script_bytes(seed: u8) -> Vec<u8> {
        vec![seed; 20]
    }

    fn transfer_event(dry_run: bool) -> NotificationEvent {
        NotificationEvent {
            kind: TRANSFER_EVENT.into(),
            payload: vec![script_bytes(1), script_bytes(2), vec![0x10, 0x27]],
            dry_run,
        }
    }

    #[test]
    fn committed_transfer_produces_directive() {
        let (relay, mut rx) = NotificationRelay::channel(RelayPolicy::CommittedOnly, "neo");
        relay.handle(&transfer_event(false));

        let directive = rx.try_recv().unwrap();
        assert_eq!(directive.asset, "neo");
        assert_eq!(directive.amount, 10_000);
        assert_eq!(
            directive.from,
            ScriptHash::from_bytes(&script_bytes(1)).unwrap().to_address()
        );
        assert_eq!(
            directive.to,
            ScriptHash::from_bytes(&script_bytes(2)).unwrap().to_address()
        );
    }

    #[test]
    fn dry_run_events_are_skipped_by_default() {
        let (relay, mut rx) = NotificationRelay::channel(RelayPolicy::CommittedOnly, "neo");
        relay.handle(&transfer_event(true));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dry_run_events_relayed_when_opted_in() {
        let (relay, mut rx) = NotificationRelay::channel(RelayPolicy::IncludeDryRuns, "neo");
        relay.handle(&transfer_event(true));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn unknown_event_kinds_are_dropped() {
        let (relay, mut rx) = NotificationRelay::channel(RelayPolicy::IncludeDryRuns, "neo");
        relay.handle(&NotificationEvent {
            kind: "recordCreated".into(),
            payload: vec![script_bytes(1)],
            dry_run: false,
        });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_payloads_are_dropped_not_fatal() {
        let (relay, mut rx) = NotificationRelay::channel(RelayPolicy::CommittedOnly, "neo");
        // wrong arity
        relay.handle(&NotificationEvent {
            kind: TRANSFER_EVENT.into(),
            payload: vec![script_bytes(1), script_bytes(2)],
            dry_run: false,
        });
        // bad script hash length
        relay.handle(&NotificationEvent {
            kind: TRANSFER_EVENT.into(),
            payload: vec![vec![1; 3], script_bytes(2), vec![1]],
            dry_run: false,
        });
        // oversized amount
        relay.handle(&NotificationEvent {
            kind: TRANSFER_EVENT.into(),
            payload: vec![script_bytes(1), script_bytes(2), vec![1; 9]],
            dry_run: false,
        });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn amount_decoding_is_little_endian() {
        assert_eq!(decode_amount(&[]).unwrap(), 0);
        assert_eq!(decode_amount(&[1]).unwrap(), 1);
        assert_eq!(decode_amount(&[0, 1]).unwrap(), 256);
        assert_eq!(decode_amount(&[0xff; 8]).unwrap(), u64::MAX);
    }
}
