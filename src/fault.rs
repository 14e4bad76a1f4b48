//! Deterministic fault injection for protocol testing.
//!
//! A [`FaultInjector`] turns a byte-string seed into a fixed script of
//! faults which the association task consults before each outbound PDU.
//! Fuzz harnesses install one for the provider and/or the user side;
//! when none is installed, the hooks cost one atomic load and do nothing.
//!
//! The injector handles are the only process-wide mutable state
//! in this crate.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// One scripted step of a fault injector.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultAction {
    /// let the PDU through untouched
    PassThrough,
    /// silently drop the next outbound PDU
    DropPdu,
    /// delay the next outbound PDU
    Delay(Duration),
    /// abort the association instead of sending the next PDU
    Abort,
}

/// A deterministic, seed-scripted source of fault actions.
#[derive(Debug)]
pub struct FaultInjector {
    script: Vec<FaultAction>,
    cursor: Mutex<usize>,
}

impl FaultInjector {
    /// Derive a fault script from a seed.
    ///
    /// The same seed always produces the same script;
    /// most byte values pass PDUs through untouched,
    /// so that fuzzed sequences still make protocol progress.
    pub fn from_seed(seed: &[u8]) -> Self {
        let script = seed
            .iter()
            .map(|byte| match byte % 16 {
                0 => FaultAction::DropPdu,
                1 => FaultAction::Abort,
                2 | 3 => FaultAction::Delay(Duration::from_millis(u64::from(byte >> 4))),
                _ => FaultAction::PassThrough,
            })
            .collect();
        FaultInjector {
            script,
            cursor: Mutex::new(0),
        }
    }

    /// The action for the next outbound PDU.
    /// Past the end of the script, everything passes through.
    pub(crate) fn next_action(&self) -> FaultAction {
        let mut cursor = self
            .cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let action = self
            .script
            .get(*cursor)
            .copied()
            .unwrap_or(FaultAction::PassThrough);
        *cursor += 1;
        action
    }
}

static PROVIDER_FAULTS: Mutex<Option<Arc<FaultInjector>>> = Mutex::new(None);
static USER_FAULTS: Mutex<Option<Arc<FaultInjector>>> = Mutex::new(None);

/// Install (or clear) the fault injector applied to acceptor-side
/// associations. Intended to be called once at test startup.
pub fn set_provider_injector(injector: Option<Arc<FaultInjector>>) {
    *PROVIDER_FAULTS
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = injector;
}

/// Install (or clear) the fault injector applied to requestor-side
/// associations. Intended to be called once at test startup.
pub fn set_user_injector(injector: Option<Arc<FaultInjector>>) {
    *USER_FAULTS.lock().unwrap_or_else(PoisonError::into_inner) = injector;
}

pub(crate) fn provider_injector() -> Option<Arc<FaultInjector>> {
    PROVIDER_FAULTS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub(crate) fn user_injector() -> Option<Arc<FaultInjector>> {
    USER_FAULTS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_script() {
        let a = FaultInjector::from_seed(b"deterministic");
        let b = FaultInjector::from_seed(b"deterministic");
        for _ in 0..20 {
            assert_eq!(a.next_action(), b.next_action());
        }
    }

    #[test]
    fn empty_seed_passes_everything_through() {
        let injector = FaultInjector::from_seed(&[]);
        for _ in 0..5 {
            assert_eq!(injector.next_action(), FaultAction::PassThrough);
        }
    }

    #[test]
    fn byte_values_cover_all_actions() {
        let injector = FaultInjector::from_seed(&[0x00, 0x01, 0x22, 0x0F]);
        assert_eq!(injector.next_action(), FaultAction::DropPdu);
        assert_eq!(injector.next_action(), FaultAction::Abort);
        assert_eq!(
            injector.next_action(),
            FaultAction::Delay(Duration::from_millis(2))
        );
        assert_eq!(injector.next_action(), FaultAction::PassThrough);
    }
}
