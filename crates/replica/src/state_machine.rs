//! Replica role/transaction state machine.
//!
//! States track the replica role together with transaction activity so
//! that role changes and close defer until the last active transaction
//! finishes (primary side) or the pump drains (secondary side).
//!
//! ```text
//!          | Open   | ToPrimary | ToSecondary | +Tx    | -Tx        | NullOp   | Close
//! Created  | Opened | x         | x           | error  | x          | x        | Closed
//! Opened   | x      | 1Passive  | 2Active     | error  | x          | x        | Closed
//! 1Passive | x      | noop      | 2Active     | 1Active| x          | x        | Closed
//! 1Active  | x      | noop      | 1AChange    | 1Active| 1Passive*  | x        | 1AClose
//! 1AChange | x      | x         | x           | error  | 2Active*   | x        | 1AClose
//! 1AClose  | x      | x         | x           | error  | Closed*    | x        | 1AClose
//! 2Passive | x      | 1Passive  | 2Active     | error  | x          | x        | Closed
//! 2Active  | x      | 2AChange  | noop        | error  | x          | 2Passive | 2AClose
//! 2AChange | x      | x         | x           | error  | x          | 1Passive | 2AClose
//! 2AClose  | x      | x         | x           | error  | x          | Closed   | 2AClose
//! Closed   | error  | error     | error       | error  | x          | x        | Closed
//! ```
//!
//! `*`: only when the internal transaction count reaches zero; otherwise
//! the state is unchanged and the pending role change or close stays
//! deferred.

use parking_lot::Mutex;
use tracing::{debug, info};

use replikv_primitives::errors::{StoreError, StoreResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreState {
    Created,
    Opened,
    PrimaryPassive,
    PrimaryActive,
    PrimaryActiveChange,
    PrimaryActiveClose,
    SecondaryPassive,
    SecondaryActive,
    SecondaryActiveChange,
    SecondaryActiveClose,
    Closed,
}

impl StoreState {
    pub fn is_primary(&self) -> bool {
        matches!(
            self,
            StoreState::PrimaryPassive | StoreState::PrimaryActive
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StoreState::Closed)
    }
}

type DeferredCallback = Box<dyn FnOnce(StoreResult<StoreState>) + Send>;

enum Deferred {
    RoleChange(DeferredCallback),
    Close(DeferredCallback),
}

struct Inner {
    state: StoreState,
    tx_count: i64,
    deferred: Vec<Deferred>,
    close_notified: bool,
}

pub struct StateMachine {
    inner: Mutex<Inner>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: StoreState::Created,
                tx_count: 0,
                deferred: Vec::new(),
                close_notified: false,
            }),
        }
    }

    pub fn state(&self) -> StoreState {
        self.inner.lock().state
    }

    pub fn transaction_count(&self) -> i64 {
        self.inner.lock().tx_count
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().state.is_closed()
    }

    pub fn open(&self) -> StoreResult<StoreState> {
        let mut inner = self.inner.lock();
        match inner.state {
            StoreState::Created => {
                inner.state = StoreState::Opened;
                info!("store opened");
                Ok(inner.state)
            }
            StoreState::Closed => Err(StoreError::ObjectClosed),
            other => Err(invalid(other, "Open")),
        }
    }

    /// Role change to primary.  Completes inline unless the secondary pump
    /// is still active, in which case the callback fires on the pump-null
    /// event.
    pub fn change_to_primary(
        &self,
        callback: impl FnOnce(StoreResult<StoreState>) + Send + 'static,
    ) {
        let mut inner = self.inner.lock();
        let result = match inner.state {
            StoreState::Opened | StoreState::SecondaryPassive => {
                inner.state = StoreState::PrimaryPassive;
                Ok(inner.state)
            }
            // Same-role change is a no-op.
            StoreState::PrimaryPassive | StoreState::PrimaryActive => Ok(inner.state),
            StoreState::SecondaryActive => {
                inner.state = StoreState::SecondaryActiveChange;
                inner
                    .deferred
                    .push(Deferred::RoleChange(Box::new(callback)));
                return;
            }
            StoreState::Closed => Err(StoreError::ObjectClosed),
            other => Err(invalid(other, "ChangeToPrimary")),
        };
        drop(inner);
        callback(result);
    }

    /// Role change to secondary.  On an active primary the change defers
    /// until the transaction count drains to zero.
    pub fn change_to_secondary(
        &self,
        callback: impl FnOnce(StoreResult<StoreState>) + Send + 'static,
    ) {
        let mut inner = self.inner.lock();
        let result = match inner.state {
            StoreState::Opened | StoreState::PrimaryPassive | StoreState::SecondaryPassive => {
                inner.state = StoreState::SecondaryActive;
                Ok(inner.state)
            }
            StoreState::SecondaryActive => Ok(inner.state),
            StoreState::PrimaryActive => {
                inner.state = StoreState::PrimaryActiveChange;
                inner
                    .deferred
                    .push(Deferred::RoleChange(Box::new(callback)));
                return;
            }
            StoreState::Closed => Err(StoreError::ObjectClosed),
            other => Err(invalid(other, "ChangeToSecondary")),
        };
        drop(inner);
        callback(result);
    }

    /// Transaction admission; only primary states accept.
    pub fn start_transaction(&self) -> StoreResult<StoreState> {
        let mut inner = self.inner.lock();
        match inner.state {
            StoreState::PrimaryPassive | StoreState::PrimaryActive => {
                inner.state = StoreState::PrimaryActive;
                inner.tx_count += 1;
                Ok(inner.state)
            }
            StoreState::PrimaryActiveChange => Err(StoreError::ReconfigurationPending),
            StoreState::PrimaryActiveClose | StoreState::Closed => Err(StoreError::ObjectClosed),
            StoreState::Created
            | StoreState::Opened
            | StoreState::SecondaryPassive
            | StoreState::SecondaryActive
            | StoreState::SecondaryActiveChange
            | StoreState::SecondaryActiveClose => Err(StoreError::NotPrimary),
        }
    }

    /// Transaction completion; fires deferred role changes and closes when
    /// the count drains.
    pub fn finish_transaction(&self) {
        let mut to_fire = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.tx_count -= 1;
            debug_assert!(inner.tx_count >= 0, "transaction count underflow");
            if inner.tx_count > 0 {
                return;
            }
            match inner.state {
                StoreState::PrimaryActive => inner.state = StoreState::PrimaryPassive,
                StoreState::PrimaryActiveChange => {
                    inner.state = StoreState::SecondaryActive;
                    to_fire = take_deferred(&mut inner, false);
                }
                StoreState::PrimaryActiveClose => {
                    inner.state = StoreState::Closed;
                    to_fire = take_deferred(&mut inner, true);
                }
                _ => {}
            }
            debug!(state = ?inner.state, "transaction count drained");
        }
        fire(to_fire, self.state());
    }

    /// Secondary pump drained its stream (null operation observed).
    pub fn secondary_pump_closed(&self) {
        let mut to_fire = Vec::new();
        {
            let mut inner = self.inner.lock();
            match inner.state {
                StoreState::SecondaryActive => inner.state = StoreState::SecondaryPassive,
                StoreState::SecondaryActiveChange => {
                    inner.state = StoreState::PrimaryPassive;
                    to_fire = take_deferred(&mut inner, false);
                }
                StoreState::SecondaryActiveClose => {
                    inner.state = StoreState::Closed;
                    to_fire = take_deferred(&mut inner, true);
                }
                _ => {}
            }
        }
        fire(to_fire, self.state());
    }

    /// Close is idempotent; repeat closes complete immediately but waiters
    /// are only notified once.
    pub fn close(&self, callback: impl FnOnce(StoreResult<StoreState>) + Send + 'static) {
        let mut inner = self.inner.lock();
        let result = match inner.state {
            StoreState::Created
            | StoreState::Opened
            | StoreState::PrimaryPassive
            | StoreState::SecondaryPassive => {
                inner.state = StoreState::Closed;
                inner.close_notified = true;
                Ok(StoreState::Closed)
            }
            StoreState::PrimaryActive | StoreState::PrimaryActiveChange => {
                inner.state = StoreState::PrimaryActiveClose;
                inner.deferred.push(Deferred::Close(Box::new(callback)));
                return;
            }
            StoreState::SecondaryActive | StoreState::SecondaryActiveChange => {
                inner.state = StoreState::SecondaryActiveClose;
                inner.deferred.push(Deferred::Close(Box::new(callback)));
                return;
            }
            StoreState::PrimaryActiveClose | StoreState::SecondaryActiveClose => {
                if inner.close_notified {
                    Ok(inner.state)
                } else {
                    inner.deferred.push(Deferred::Close(Box::new(callback)));
                    return;
                }
            }
            StoreState::Closed => Ok(StoreState::Closed),
        };
        drop(inner);
        callback(result);
    }

    /// Unconditional teardown.
    pub fn abort(&self) {
        let to_fire = {
            let mut inner = self.inner.lock();
            inner.state = StoreState::Closed;
            take_deferred(&mut inner, true)
        };
        fire(to_fire, StoreState::Closed);
    }
}

fn invalid(state: StoreState, event: &str) -> StoreError {
    StoreError::InvalidOperation(format!("invalid state change: {state:?} on {event}"))
}

fn take_deferred(inner: &mut Inner, closing: bool) -> Vec<Deferred> {
    if closing {
        inner.close_notified = true;
    }
    std::mem::take(&mut inner.deferred)
}

fn fire(deferred: Vec<Deferred>, state: StoreState) {
    for d in deferred {
        match d {
            Deferred::RoleChange(cb) | Deferred::Close(cb) => cb(Ok(state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn opened() -> StateMachine {
        let sm = StateMachine::new();
        sm.open().unwrap();
        sm
    }

    fn primary() -> StateMachine {
        let sm = opened();
        sm.change_to_primary(|r| {
            r.unwrap();
        });
        sm
    }

    #[test]
    fn open_then_primary_accepts_transactions() {
        let sm = primary();
        assert_eq!(sm.state(), StoreState::PrimaryPassive);
        assert_eq!(sm.start_transaction().unwrap(), StoreState::PrimaryActive);
        assert_eq!(sm.start_transaction().unwrap(), StoreState::PrimaryActive);
        sm.finish_transaction();
        assert_eq!(sm.state(), StoreState::PrimaryActive);
        sm.finish_transaction();
        assert_eq!(sm.state(), StoreState::PrimaryPassive);
    }

    #[test]
    fn transactions_rejected_off_primary() {
        let sm = opened();
        assert_eq!(sm.start_transaction().unwrap_err(), StoreError::NotPrimary);
        sm.change_to_secondary(|r| {
            r.unwrap();
        });
        assert_eq!(sm.start_transaction().unwrap_err(), StoreError::NotPrimary);
    }

    #[test]
    fn role_change_defers_until_drain() {
        let sm = primary();
        sm.start_transaction().unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        sm.change_to_secondary(move |r| {
            assert_eq!(r.unwrap(), StoreState::SecondaryActive);
            fired2.store(true, Ordering::SeqCst);
        });
        assert_eq!(sm.state(), StoreState::PrimaryActiveChange);
        assert!(!fired.load(Ordering::SeqCst));

        // New transactions are rejected while the change is pending.
        assert_eq!(
            sm.start_transaction().unwrap_err(),
            StoreError::ReconfigurationPending
        );

        sm.finish_transaction();
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(sm.state(), StoreState::SecondaryActive);
    }

    #[test]
    fn close_defers_until_drain() {
        let sm = primary();
        sm.start_transaction().unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        sm.close(move |r| {
            assert_eq!(r.unwrap(), StoreState::Closed);
            fired2.store(true, Ordering::SeqCst);
        });
        assert_eq!(sm.state(), StoreState::PrimaryActiveClose);
        assert_eq!(sm.start_transaction().unwrap_err(), StoreError::ObjectClosed);

        sm.finish_transaction();
        assert!(fired.load(Ordering::SeqCst));
        assert!(sm.is_closed());
    }

    #[test]
    fn pump_null_completes_secondary_transitions() {
        let sm = opened();
        sm.change_to_secondary(|r| {
            r.unwrap();
        });
        assert_eq!(sm.state(), StoreState::SecondaryActive);

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        sm.change_to_primary(move |r| {
            assert_eq!(r.unwrap(), StoreState::PrimaryPassive);
            fired2.store(true, Ordering::SeqCst);
        });
        assert_eq!(sm.state(), StoreState::SecondaryActiveChange);
        sm.secondary_pump_closed();
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(sm.state(), StoreState::PrimaryPassive);
    }

    #[test]
    fn close_is_idempotent() {
        let sm = opened();
        sm.close(|r| {
            r.unwrap();
        });
        assert!(sm.is_closed());
        sm.close(|r| {
            assert_eq!(r.unwrap(), StoreState::Closed);
        });
    }

    #[test]
    fn same_role_change_is_noop() {
        let sm = primary();
        sm.change_to_primary(|r| {
            assert_eq!(r.unwrap(), StoreState::PrimaryPassive);
        });
        assert_eq!(sm.state(), StoreState::PrimaryPassive);
    }
}
