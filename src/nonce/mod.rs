//! Per-chain, per-account nonce sequencing
//!
//! The chain is queried for the account nonce only at initialization and
//! recovery; during steady-state operation the counter advances locally so
//! concurrent submitters never race each other through the RPC. Released
//! slots (reservations that were never broadcast) are reissued lowest first,
//! keeping the sequence the chain sees contiguous and gap-free.

use crate::error::{RelayError, RelayResult};

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

struct AccountNonces {
    /// Next nonce to hand out when no released slot is pending.
    next: u64,
    /// Reserved-then-released values below `next`, reissued lowest first.
    released: BTreeSet<u64>,
}

/// Monotonic nonce allocator keyed by (chain, sending account).
///
/// Unrelated keys proceed fully in parallel; each key serializes through its
/// own mutex.
pub struct NonceSequencer {
    accounts: DashMap<(u64, Address), Arc<Mutex<AccountNonces>>>,
}

impl NonceSequencer {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
        }
    }

    /// Seed the counter for a (chain, account). `on_chain_nonce` is the
    /// chain's view; `max_bound_nonce` is the highest nonce already bound to
    /// an in-flight or completed transfer in the ledger. Taking the larger of
    /// on-chain and bound+1 avoids reissuing a nonce whose transaction is
    /// still propagating.
    pub fn initialize(
        &self,
        chain_id: u64,
        account: Address,
        on_chain_nonce: u64,
        max_bound_nonce: Option<u64>,
    ) {
        let next = on_chain_nonce.max(max_bound_nonce.map_or(0, |n| n + 1));
        self.accounts.insert(
            (chain_id, account),
            Arc::new(Mutex::new(AccountNonces {
                next,
                released: BTreeSet::new(),
            })),
        );
        info!(
            "Nonce sequencer for chain {} account {:?} seeded at {} (on-chain {}, max bound {:?})",
            chain_id, account, next, on_chain_nonce, max_bound_nonce
        );
    }

    fn state(&self, chain_id: u64, account: Address) -> RelayResult<Arc<Mutex<AccountNonces>>> {
        self.accounts
            .get(&(chain_id, account))
            .map(|entry| entry.value().clone())
            .ok_or(RelayError::Nonce {
                chain_id,
                message: format!("Account {:?} not initialized", account),
            })
    }

    /// Reserve the next nonce for a (chain, account).
    pub async fn reserve(&self, chain_id: u64, account: Address) -> RelayResult<u64> {
        let state = self.state(chain_id, account)?;
        let mut state = state.lock().await;

        let nonce = if let Some(lowest) = state.released.pop_first() {
            lowest
        } else {
            let nonce = state.next;
            state.next += 1;
            nonce
        };

        debug!("Reserved nonce {} for chain {}", nonce, chain_id);
        Ok(nonce)
    }

    /// Return a reservation whose transaction was never broadcast. The slot
    /// is the next one handed out. Once a transaction has been broadcast its
    /// nonce is permanently bound and must not be released here.
    pub async fn release(&self, chain_id: u64, account: Address, nonce: u64) -> RelayResult<()> {
        let state = self.state(chain_id, account)?;
        let mut state = state.lock().await;

        if nonce >= state.next {
            return Err(RelayError::Nonce {
                chain_id,
                message: format!("Released nonce {} was never reserved", nonce),
            });
        }
        state.released.insert(nonce);

        // Collapse a released tail back into the counter.
        while state.next > 0 {
            let prev = state.next - 1;
            if !state.released.remove(&prev) {
                break;
            }
            state.next = prev;
        }

        debug!("Released nonce {} for chain {}", nonce, chain_id);
        Ok(())
    }

    pub fn is_initialized(&self, chain_id: u64, account: Address) -> bool {
        self.accounts.contains_key(&(chain_id, account))
    }
}

impl Default for NonceSequencer {
    fn default() -> Self {
        Self::new()
    }
}
