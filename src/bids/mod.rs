//! Bid registry: priced, signed offers to relay transfers per route
//!
//! Holds the current signed bid per (source chain, destination chain, token)
//! and refreshes it on a timer. Reads always observe a whole bid: the
//! "current" pointer is an `Arc` swapped atomically per key, never a bid
//! mutated in place. Superseded bids stay addressable by id until their
//! validity window plus the configured grace period lapses, so requests that
//! referenced them keep validating.

use crate::config::{BidConfig, BidRoute};
use crate::error::{RelayError, RelayResult};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Signature, H256, U256};
use ethers::utils::keccak256;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Route key: exactly one current bid exists per key at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BidKey {
    pub source_chain: u64,
    pub dest_chain: u64,
    pub token: Address,
}

/// A signed, priced offer to relay transfers on one route. Immutable once
/// signed.
#[derive(Debug, Clone)]
pub struct Bid {
    /// keccak256 of the signing payload; doubles as the bid reference id.
    pub id: [u8; 32],
    pub source_chain: u64,
    pub dest_chain: u64,
    pub token: Address,
    pub fee: U256,
    pub max_amount: U256,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub signature: Signature,
}

impl Bid {
    pub fn key(&self) -> BidKey {
        BidKey {
            source_chain: self.source_chain,
            dest_chain: self.dest_chain,
            token: self.token,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_from && now <= self.valid_until
    }

    pub fn within_grace(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        now >= self.valid_from && now <= self.valid_until + grace
    }

    /// Canonical byte encoding signed by the relay node and hashed into the
    /// bid id.
    pub fn signing_payload(
        source_chain: u64,
        dest_chain: u64,
        token: Address,
        fee: U256,
        max_amount: U256,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8 + 8 + 20 + 32 + 32 + 8 + 8);
        payload.extend_from_slice(&source_chain.to_be_bytes());
        payload.extend_from_slice(&dest_chain.to_be_bytes());
        payload.extend_from_slice(token.as_bytes());
        let mut word = [0u8; 32];
        fee.to_big_endian(&mut word);
        payload.extend_from_slice(&word);
        let mut word = [0u8; 32];
        max_amount.to_big_endian(&mut word);
        payload.extend_from_slice(&word);
        payload.extend_from_slice(&valid_from.timestamp().to_be_bytes());
        payload.extend_from_slice(&valid_until.timestamp().to_be_bytes());
        payload
    }
}

/// Fee quote for one route at refresh time.
#[derive(Debug, Clone, Copy)]
pub struct FeeQuote {
    pub fee: U256,
    pub max_amount: U256,
}

/// Pricing policy consumed as an external input; the registry never decides
/// economics itself.
pub trait FeePolicy: Send + Sync {
    fn quote(&self, source_chain: u64, dest_chain: u64, token: Address) -> RelayResult<FeeQuote>;
}

/// Flat per-route fees straight from configuration.
pub struct ConfiguredFeePolicy {
    quotes: DashMap<BidKey, FeeQuote>,
}

impl ConfiguredFeePolicy {
    pub fn from_routes(routes: &[BidRoute]) -> RelayResult<Self> {
        let quotes = DashMap::new();
        for route in routes {
            let key = BidKey {
                source_chain: route.source_chain,
                dest_chain: route.dest_chain,
                token: parse_address(&route.token)?,
            };
            let quote = FeeQuote {
                fee: parse_amount(&route.fee)?,
                max_amount: parse_amount(&route.max_amount)?,
            };
            quotes.insert(key, quote);
        }
        Ok(Self { quotes })
    }
}

impl FeePolicy for ConfiguredFeePolicy {
    fn quote(&self, source_chain: u64, dest_chain: u64, token: Address) -> RelayResult<FeeQuote> {
        let key = BidKey {
            source_chain,
            dest_chain,
            token,
        };
        self.quotes
            .get(&key)
            .map(|q| *q.value())
            .ok_or_else(|| RelayError::Internal(format!("No fee quote for route {:?}", key)))
    }
}

/// Signing capability for bids. Kept behind a trait so key custody stays
/// pluggable.
pub trait BidSigner: Send + Sync {
    fn sign_digest(&self, digest: H256) -> RelayResult<Signature>;
    fn address(&self) -> Address;
}

pub struct WalletBidSigner {
    wallet: LocalWallet,
}

impl WalletBidSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }
}

impl BidSigner for WalletBidSigner {
    fn sign_digest(&self, digest: H256) -> RelayResult<Signature> {
        self.wallet
            .sign_hash(digest)
            .map_err(|e| RelayError::Signer(e.to_string()))
    }

    fn address(&self) -> Address {
        self.wallet.address()
    }
}

/// Registry of current and recently superseded bids.
pub struct BidRegistry {
    current: DashMap<BidKey, Arc<Bid>>,
    by_id: DashMap<[u8; 32], Arc<Bid>>,
    routes: Vec<BidKey>,
    policy: Arc<dyn FeePolicy>,
    signer: Arc<dyn BidSigner>,
    validity: Duration,
    grace: Duration,
}

impl BidRegistry {
    pub fn new(
        config: &BidConfig,
        policy: Arc<dyn FeePolicy>,
        signer: Arc<dyn BidSigner>,
    ) -> RelayResult<Self> {
        let mut routes = Vec::with_capacity(config.routes.len());
        for route in &config.routes {
            routes.push(BidKey {
                source_chain: route.source_chain,
                dest_chain: route.dest_chain,
                token: parse_address(&route.token)?,
            });
        }

        Ok(Self {
            current: DashMap::new(),
            by_id: DashMap::new(),
            routes,
            policy,
            signer,
            validity: Duration::seconds(config.validity_secs as i64),
            grace: Duration::seconds(config.grace_secs as i64),
        })
    }

    /// The current bid for a route, if one exists and is still valid.
    pub fn current_bid(
        &self,
        source_chain: u64,
        dest_chain: u64,
        token: Address,
    ) -> Option<Arc<Bid>> {
        let key = BidKey {
            source_chain,
            dest_chain,
            token,
        };
        self.current
            .get(&key)
            .map(|entry| entry.value().clone())
            .filter(|bid| bid.is_valid_at(Utc::now()))
    }

    /// Look up a bid by id, current or superseded. Expiry and grace are the
    /// caller's concern; refresh purges ids once the grace period lapses.
    pub fn bid_by_id(&self, bid_id: &[u8; 32]) -> Option<Arc<Bid>> {
        self.by_id.get(bid_id).map(|entry| entry.value().clone())
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    /// Recompute and sign a fresh bid for every tracked route, replacing the
    /// current pointer per key. A route that fails to price or sign keeps its
    /// previous bid and is reported, not fatal. Returns the number of routes
    /// refreshed.
    pub fn refresh(&self) -> usize {
        let now = Utc::now();
        let mut refreshed = 0;

        for key in &self.routes {
            match self.build_bid(*key, now) {
                Ok(bid) => {
                    let bid = Arc::new(bid);
                    self.by_id.insert(bid.id, bid.clone());
                    self.current.insert(*key, bid.clone());
                    debug!(
                        "Refreshed bid {} for route {} -> {} token {:?}",
                        hex::encode(bid.id),
                        key.source_chain,
                        key.dest_chain,
                        key.token
                    );
                    refreshed += 1;
                }
                Err(e) => {
                    warn!(
                        "Bid refresh failed for route {} -> {} token {:?}: {}",
                        key.source_chain, key.dest_chain, key.token, e
                    );
                }
            }
        }

        self.purge_expired(now);
        info!("Bid refresh complete: {}/{} routes", refreshed, self.routes.len());
        refreshed
    }

    /// Bids newly created by the latest refresh, for persistence.
    pub fn current_bids(&self) -> Vec<Arc<Bid>> {
        self.current
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn build_bid(&self, key: BidKey, now: DateTime<Utc>) -> RelayResult<Bid> {
        let quote = self
            .policy
            .quote(key.source_chain, key.dest_chain, key.token)?;
        let valid_from = now;
        let valid_until = now + self.validity;

        let payload = Bid::signing_payload(
            key.source_chain,
            key.dest_chain,
            key.token,
            quote.fee,
            quote.max_amount,
            valid_from,
            valid_until,
        );
        let digest = H256::from(keccak256(&payload));
        let signature = self.signer.sign_digest(digest)?;

        Ok(Bid {
            id: digest.0,
            source_chain: key.source_chain,
            dest_chain: key.dest_chain,
            token: key.token,
            fee: quote.fee,
            max_amount: quote.max_amount,
            valid_from,
            valid_until,
            signature,
        })
    }

    /// Drop superseded bids whose grace period has lapsed. Requests can no
    /// longer reference them, so keeping them would only leak.
    fn purge_expired(&self, now: DateTime<Utc>) {
        let grace = self.grace;
        self.by_id
            .retain(|_, bid| bid.within_grace(now, grace));
    }
}

fn parse_address(s: &str) -> RelayResult<Address> {
    s.parse::<Address>()
        .map_err(|e| RelayError::Config(format!("Invalid address {}: {}", s, e)))
}

fn parse_amount(s: &str) -> RelayResult<U256> {
    U256::from_dec_str(s).map_err(|e| RelayError::Config(format!("Invalid amount {}: {}", s, e)))
}
