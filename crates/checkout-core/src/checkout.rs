//! # Checkout Orchestration
//!
//! Sequences cart snapshot, payment, order persistence and cart clearing.
//!
//! ```text
//! Start ─► Snapshotted ─► PaymentInitiated ─► OrderPersisted ─► CartCleared ─► Done
//!   │           │                │                  │
//!   └───────────┴────────────────┴──────────────────┴──► Failed(reason)
//! ```
//!
//! Two payment flows are supported:
//!
//! - **Hosted session**: a provider session is opened and returned; the order
//!   is persisted only when the success callback (or a verified webhook)
//!   confirms payment, using the cart as it exists at that moment. It is
//!   marked paid only if the collected amount matches that cart.
//! - **Direct charge**: the order is persisted as `Pending` first, then the
//!   token is charged with the order id in the charge metadata. A declined
//!   charge marks the order failed and leaves the cart untouched. A gateway
//!   outage leaves the order pending; resubmitting the same cart reuses it
//!   and its provider idempotency key.
//!
//! Runs for the same user are serialized. A cart that could not be cleared
//! after a successful order is queued for retry and remembered by
//! fingerprint, so resubmitting the stale cart returns the existing order.
//! Sessions and idempotency keys are forgotten after a retention window.

use crate::assembler::OrderAssembler;
use crate::cart::SharedCartStore;
use crate::catalog::SharedCatalog;
use crate::error::{ShopError, ShopResult};
use crate::gateway::PaymentGatewayAdapter;
use crate::ids::{Identity, OrderId, UserId};
use crate::order::{PaymentState, SharedOrderStore};
use crate::payment::{CheckoutSession, CheckoutUrls, PaymentToken, SessionStatus};
use crate::snapshot::CartSnapshot;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, instrument, warn};

/// Checkout pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStage {
    Start,
    Snapshotted,
    PaymentInitiated,
    OrderPersisted,
    CartCleared,
    Done,
}

impl std::fmt::Display for CheckoutStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CheckoutStage::Start => "start",
            CheckoutStage::Snapshotted => "snapshotted",
            CheckoutStage::PaymentInitiated => "payment_initiated",
            CheckoutStage::OrderPersisted => "order_persisted",
            CheckoutStage::CartCleared => "cart_cleared",
            CheckoutStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// A checkout that produced (or re-found) an order
#[derive(Debug, Clone, Serialize)]
pub struct CompletedCheckout {
    pub order_id: OrderId,
    /// The order already existed; nothing new was persisted or charged
    pub duplicate: bool,
    /// False when the cart clear failed and was queued for retry
    pub cart_cleared: bool,
}

/// How a checkout run ended
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    /// Nothing in the cart; no order, no charge
    Empty,
    /// Hosted session opened; redirect the customer
    AwaitingPayment { session: CheckoutSession },
    /// Order persisted
    Completed(CompletedCheckout),
}

/// Outcome plus the stages the run passed through
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutReport {
    pub outcome: CheckoutOutcome,
    pub stages: Vec<CheckoutStage>,
}

impl CheckoutReport {
    /// The completed checkout, if the run produced one
    pub fn completed(&self) -> Option<&CompletedCheckout> {
        match &self.outcome {
            CheckoutOutcome::Completed(done) => Some(done),
            _ => None,
        }
    }
}

/// Terminal `Failed` state of a checkout run
#[derive(Debug, Error)]
#[error("checkout failed after {stage}: {error}")]
pub struct CheckoutFailure {
    /// Last stage reached before the failure
    pub stage: CheckoutStage,
    /// Set when an order was persisted before the failure
    pub order_id: Option<OrderId>,
    #[source]
    pub error: ShopError,
}

impl CheckoutFailure {
    /// True when the customer has a pending order rather than nothing
    pub fn has_pending_order(&self) -> bool {
        self.order_id.is_some()
    }
}

pub type CheckoutResult = Result<CheckoutReport, CheckoutFailure>;

// =============================================================================
// Internal bookkeeping
// =============================================================================

/// Tracks one run's stage transitions
struct CheckoutRun {
    flow: &'static str,
    user_id: UserId,
    stage: CheckoutStage,
    stages: Vec<CheckoutStage>,
}

impl CheckoutRun {
    fn new(flow: &'static str, user_id: &UserId) -> Self {
        Self {
            flow,
            user_id: user_id.clone(),
            stage: CheckoutStage::Start,
            stages: vec![CheckoutStage::Start],
        }
    }

    fn advance(&mut self, next: CheckoutStage) {
        debug!(
            flow = self.flow,
            user_id = %self.user_id,
            "Checkout transition {} -> {}",
            self.stage,
            next
        );
        self.stage = next;
        self.stages.push(next);
    }

    fn fail(&self, error: ShopError, order_id: Option<OrderId>) -> CheckoutFailure {
        if error.is_retryable() {
            warn!(flow = self.flow, user_id = %self.user_id, "Checkout failed after {}: {}", self.stage, error);
        } else {
            error!(flow = self.flow, user_id = %self.user_id, "Checkout failed after {}: {}", self.stage, error);
        }
        CheckoutFailure {
            stage: self.stage,
            order_id,
            error,
        }
    }

    fn finish(mut self, outcome: CheckoutOutcome) -> CheckoutReport {
        if !matches!(outcome, CheckoutOutcome::AwaitingPayment { .. }) {
            self.advance(CheckoutStage::Done);
        }
        info!(flow = self.flow, user_id = %self.user_id, "Checkout finished: {:?}", self.stages);
        CheckoutReport {
            outcome,
            stages: self.stages,
        }
    }
}

/// Per-user async guards serializing checkout runs
#[derive(Default)]
struct UserLocks {
    locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLocks {
    async fn acquire(&self, user_id: &UserId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = lock_map(&self.locks);
            // Drop guards nobody holds or waits on.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(user_id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone)]
enum SessionState {
    Open { amount_total: i64 },
    /// `settled` is false when the collected amount did not match the order
    Completed { order_id: OrderId, settled: bool },
}

#[derive(Debug, Clone)]
struct SessionRecord {
    identity: Identity,
    state: SessionState,
    retain_until: DateTime<Utc>,
}

/// A successful order whose cart could not be cleared
#[derive(Debug, Clone)]
struct PendingClear {
    order_id: OrderId,
    fingerprint: String,
}

/// A pending order whose charge hit a transient gateway failure
#[derive(Debug, Clone)]
struct PendingCharge {
    order_id: OrderId,
    fingerprint: String,
    /// Provider idempotency key of the first attempt
    charge_key: String,
    recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct IdempotencyRecord {
    order_id: OrderId,
    recorded_at: DateTime<Utc>,
}

fn amount_mismatch(session_id: &str, collected: i64, expected: i64) -> ShopError {
    ShopError::PaymentDeclined {
        reason: format!(
            "session {} collected {} but the order totals {}; order held for review",
            session_id, collected, expected
        ),
    }
}

fn lock_map<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs checkouts against the catalog, cart store, order store and gateway
pub struct CheckoutOrchestrator {
    catalog: SharedCatalog,
    carts: SharedCartStore,
    orders: SharedOrderStore,
    assembler: OrderAssembler,
    gateway: PaymentGatewayAdapter,
    user_locks: UserLocks,
    sessions: Mutex<HashMap<String, SessionRecord>>,
    pending_clears: Mutex<HashMap<UserId, PendingClear>>,
    pending_charges: Mutex<HashMap<UserId, PendingCharge>>,
    idempotency_keys: Mutex<HashMap<(UserId, String), IdempotencyRecord>>,
    retention: Duration,
}

impl CheckoutOrchestrator {
    pub fn new(
        catalog: SharedCatalog,
        carts: SharedCartStore,
        orders: SharedOrderStore,
        gateway: PaymentGatewayAdapter,
    ) -> Self {
        Self {
            catalog,
            carts,
            assembler: OrderAssembler::new(orders.clone()),
            orders,
            gateway,
            user_locks: UserLocks::default(),
            sessions: Mutex::new(HashMap::new()),
            pending_clears: Mutex::new(HashMap::new()),
            pending_charges: Mutex::new(HashMap::new()),
            idempotency_keys: Mutex::new(HashMap::new()),
            retention: Duration::hours(24),
        }
    }

    /// How long sessions, idempotency keys and stalled charges are remembered
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn gateway(&self) -> &PaymentGatewayAdapter {
        &self.gateway
    }

    /// Price the user's cart without starting a checkout
    pub async fn preview(&self, identity: &Identity) -> ShopResult<CartSnapshot> {
        CartSnapshot::take(
            self.catalog.as_ref(),
            self.carts.as_ref(),
            &identity.user_id,
            self.gateway.currency(),
        )
        .await
    }

    /// Session-first flow, step one: open a hosted payment session.
    ///
    /// Nothing is persisted; the order is created by
    /// [`confirm_hosted_checkout`](Self::confirm_hosted_checkout).
    #[instrument(skip(self, identity, urls), fields(user_id = %identity.user_id))]
    pub async fn begin_hosted_checkout(&self, identity: &Identity, urls: &CheckoutUrls) -> CheckoutResult {
        let _guard = self.user_locks.acquire(&identity.user_id).await;
        let mut run = CheckoutRun::new("hosted", &identity.user_id);

        let snapshot = self.snapshot(&mut run, identity).await?;

        if let Some(done) = self.replay_stale_cart(identity, &snapshot).await {
            return Ok(run.finish(CheckoutOutcome::Completed(done)));
        }
        if snapshot.is_empty() {
            return Ok(run.finish(CheckoutOutcome::Empty));
        }
        if snapshot.total.is_zero() {
            return self.complete_without_payment(run, identity, &snapshot).await;
        }

        let request = self
            .gateway
            .charge_request(&snapshot)
            .map_err(|e| run.fail(e, None))?
            .with_customer_email(identity.email.as_str())
            .with_metadata("user_id", identity.user_id.as_str());

        let session = self
            .gateway
            .open_session(&request, urls)
            .await
            .map_err(|e| run.fail(e, None))?;
        run.advance(CheckoutStage::PaymentInitiated);

        let retain_until = session
            .expires_at
            .unwrap_or(session.created_at + self.retention);
        lock_map(&self.sessions).insert(
            session.session_id.clone(),
            SessionRecord {
                identity: identity.clone(),
                state: SessionState::Open {
                    amount_total: request.amount,
                },
                retain_until,
            },
        );

        info!(
            "Opened {} session {} for {}",
            self.gateway.provider_name(),
            session.session_id,
            request.amount
        );
        Ok(run.finish(CheckoutOutcome::AwaitingPayment { session }))
    }

    /// Session-first flow, step two: the customer returned from the
    /// provider's success page.
    ///
    /// The session must belong to `identity`. Confirming an already
    /// confirmed session returns the existing order.
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    pub async fn confirm_hosted_checkout(&self, identity: &Identity, session_id: &str) -> CheckoutResult {
        let run = CheckoutRun::new("hosted_confirm", &identity.user_id);
        let record = self.session_record(session_id).map_err(|e| run.fail(e, None))?;
        if record.identity.user_id != identity.user_id {
            return Err(run.fail(
                ShopError::Unauthorized {
                    entity: "checkout session",
                },
                None,
            ));
        }
        self.finish_session(run, identity, session_id).await
    }

    /// Session-first flow, step two, driven by a verified provider webhook
    #[instrument(skip(self))]
    pub async fn confirm_session_from_provider(&self, session_id: &str) -> CheckoutResult {
        let record = self.session_record(session_id).map_err(|error| {
            warn!("Webhook for untracked session {}: {}", session_id, error);
            CheckoutFailure {
                stage: CheckoutStage::Start,
                order_id: None,
                error,
            }
        })?;
        let run = CheckoutRun::new("hosted_webhook", &record.identity.user_id);
        self.finish_session(run, &record.identity, session_id).await
    }

    /// Charge-first flow: persist the order, then charge the token.
    ///
    /// An `idempotency_key` repeated by the same user returns the order the
    /// first submission created.
    #[instrument(skip(self, identity, token, idempotency_key), fields(user_id = %identity.user_id))]
    pub async fn checkout_with_token(
        &self,
        identity: &Identity,
        token: &PaymentToken,
        idempotency_key: Option<&str>,
    ) -> CheckoutResult {
        let _guard = self.user_locks.acquire(&identity.user_id).await;
        let mut run = CheckoutRun::new("direct", &identity.user_id);

        if let Some(key) = idempotency_key {
            let existing = lock_map(&self.idempotency_keys)
                .get(&(identity.user_id.clone(), key.to_string()))
                .cloned();
            if let Some(IdempotencyRecord { order_id, .. }) = existing {
                info!("Idempotency key replay, returning order {}", order_id);
                let cart_cleared = !lock_map(&self.pending_clears).contains_key(&identity.user_id);
                return Ok(run.finish(CheckoutOutcome::Completed(CompletedCheckout {
                    order_id,
                    duplicate: true,
                    cart_cleared,
                })));
            }
        }

        let snapshot = self.snapshot(&mut run, identity).await?;

        if let Some(done) = self.replay_stale_cart(identity, &snapshot).await {
            return Ok(run.finish(CheckoutOutcome::Completed(done)));
        }
        if snapshot.is_empty() {
            return Ok(run.finish(CheckoutOutcome::Empty));
        }
        if snapshot.total.is_zero() {
            return self.complete_without_payment(run, identity, &snapshot).await;
        }

        // Validate before anything is persisted.
        let request = self
            .gateway
            .charge_request(&snapshot)
            .map_err(|e| run.fail(e, None))?;

        let (order_id, charge_key) = match self.take_pending_charge(identity, &snapshot) {
            Some(pending) => {
                info!("Resuming pending order {} after a gateway failure", pending.order_id);
                (pending.order_id, pending.charge_key)
            }
            None => {
                let order = self
                    .assembler
                    .assemble(identity, &snapshot, PaymentState::Pending)
                    .await
                    .map_err(|e| run.fail(e, None))?;
                let charge_key = idempotency_key.unwrap_or(order.id.as_str()).to_string();
                (order.id, charge_key)
            }
        };
        run.advance(CheckoutStage::OrderPersisted);

        let request = request
            .with_customer_email(identity.email.as_str())
            .with_idempotency_key(charge_key.as_str())
            .with_metadata("order_id", order_id.as_str())
            .with_metadata("user_id", identity.user_id.as_str());

        let confirmation = match self.gateway.charge(&request, token).await {
            Ok(confirmation) => confirmation,
            // The provider may have charged; keep the order pending and
            // reuse it, with the same provider key, on the next attempt.
            Err(e) if e.is_retryable() => {
                warn!("Charge for order {} unconfirmed, order left pending: {}", order_id, e);
                lock_map(&self.pending_charges).insert(
                    identity.user_id.clone(),
                    PendingCharge {
                        order_id: order_id.clone(),
                        fingerprint: snapshot.fingerprint(),
                        charge_key,
                        recorded_at: Utc::now(),
                    },
                );
                return Err(run.fail(e, Some(order_id)));
            }
            Err(e) => {
                let failed = PaymentState::Failed {
                    reason: e.to_string(),
                };
                if let Err(record_err) = self.orders.record_payment(&order_id, failed).await {
                    error!("Could not mark order {} as failed: {}", order_id, record_err);
                }
                return Err(run.fail(e, Some(order_id)));
            }
        };
        run.advance(CheckoutStage::PaymentInitiated);

        let paid = PaymentState::Paid {
            reference: confirmation.charge_id.clone(),
        };
        if let Err(e) = self.orders.record_payment(&order_id, paid).await {
            // Money moved; the order stays pending until reconciled.
            error!(
                "Charge {} succeeded but order {} could not be marked paid: {}",
                confirmation.charge_id, order_id, e
            );
        }

        if let Some(key) = idempotency_key {
            lock_map(&self.idempotency_keys).insert(
                (identity.user_id.clone(), key.to_string()),
                IdempotencyRecord {
                    order_id: order_id.clone(),
                    recorded_at: Utc::now(),
                },
            );
        }

        let cart_cleared = self.clear_cart(&mut run, identity, &snapshot, &order_id).await;
        Ok(run.finish(CheckoutOutcome::Completed(CompletedCheckout {
            order_id,
            duplicate: false,
            cart_cleared,
        })))
    }

    /// Retry cart clears that failed after a successful order.
    ///
    /// A cart is only cleared while it still holds exactly the lines that
    /// were ordered. Returns the number of carts cleared.
    pub async fn retry_pending_cart_clears(&self) -> usize {
        self.prune_expired(Utc::now());

        let pending: Vec<(UserId, PendingClear)> = lock_map(&self.pending_clears)
            .iter()
            .map(|(user, p)| (user.clone(), p.clone()))
            .collect();

        let mut cleared = 0;
        for (user_id, entry) in pending {
            let _guard = self.user_locks.acquire(&user_id).await;

            let snapshot = match CartSnapshot::take(
                self.catalog.as_ref(),
                self.carts.as_ref(),
                &user_id,
                self.gateway.currency(),
            )
            .await
            {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Cart clear retry for {} deferred: {}", user_id, e);
                    continue;
                }
            };

            if snapshot.is_empty() || snapshot.fingerprint() != entry.fingerprint {
                debug!("Cart for {} changed since order {}, dropping retry", user_id, entry.order_id);
                self.forget_pending_clear(&user_id, &entry.order_id);
                continue;
            }

            match self.carts.clear(&user_id).await {
                Ok(()) => {
                    info!("Cleared stale cart for {} (order {})", user_id, entry.order_id);
                    self.forget_pending_clear(&user_id, &entry.order_id);
                    cleared += 1;
                }
                Err(e) => warn!("Cart clear retry for {} failed: {}", user_id, e),
            }
        }
        cleared
    }

    /// Number of carts waiting for a clear retry
    pub fn pending_cart_clears(&self) -> usize {
        lock_map(&self.pending_clears).len()
    }

    /// Drop sessions past their expiry and bookkeeping older than the
    /// retention window. Returns the number of entries removed.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;

        let mut sessions = lock_map(&self.sessions);
        let before = sessions.len();
        sessions.retain(|_, record| record.retain_until > now);
        let mut removed = before - sessions.len();
        drop(sessions);

        let mut keys = lock_map(&self.idempotency_keys);
        let before = keys.len();
        keys.retain(|_, record| record.recorded_at > cutoff);
        removed += before - keys.len();
        drop(keys);

        let mut charges = lock_map(&self.pending_charges);
        let before = charges.len();
        charges.retain(|user_id, pending| {
            let keep = pending.recorded_at > cutoff;
            if !keep {
                warn!(
                    "Order {} for {} still pending after charge retries expired",
                    pending.order_id, user_id
                );
            }
            keep
        });
        removed += before - charges.len();
        drop(charges);

        if removed > 0 {
            debug!("Pruned {} expired checkout entries", removed);
        }
        removed
    }

    // =========================================================================
    // Steps
    // =========================================================================

    async fn snapshot(&self, run: &mut CheckoutRun, identity: &Identity) -> Result<CartSnapshot, CheckoutFailure> {
        let snapshot = self.preview(identity).await.map_err(|e| run.fail(e, None))?;
        run.advance(CheckoutStage::Snapshotted);
        Ok(snapshot)
    }

    async fn finish_session(&self, mut run: CheckoutRun, identity: &Identity, session_id: &str) -> CheckoutResult {
        let _guard = self.user_locks.acquire(&identity.user_id).await;

        // Re-read under the user guard; a concurrent confirmation may have won.
        let record = self.session_record(session_id).map_err(|e| run.fail(e, None))?;
        let amount_total = match record.state {
            SessionState::Completed { order_id, settled: false } => {
                warn!("Session {} is held for review as order {}", session_id, order_id);
                return Err(run.fail(
                    ShopError::PaymentDeclined {
                        reason: "the amount collected does not match the order; order held for review"
                            .to_string(),
                    },
                    Some(order_id),
                ));
            }
            SessionState::Completed { order_id, settled: true } => {
                info!("Session {} already confirmed as order {}", session_id, order_id);
                let cart_cleared = !lock_map(&self.pending_clears).contains_key(&identity.user_id);
                return Ok(run.finish(CheckoutOutcome::Completed(CompletedCheckout {
                    order_id,
                    duplicate: true,
                    cart_cleared,
                })));
            }
            SessionState::Open { amount_total } => amount_total,
        };

        let snapshot = self.snapshot(&mut run, identity).await?;

        let collected = match self
            .gateway
            .session_status(session_id)
            .await
            .map_err(|e| run.fail(e, None))?
        {
            SessionStatus::Paid {
                amount_total: paid,
                payment_intent_id,
            } => {
                if let Some(intent) = payment_intent_id {
                    debug!("Session {} settled by {}", session_id, intent);
                }
                paid.unwrap_or(amount_total)
            }
            SessionStatus::Open => {
                return Err(run.fail(
                    ShopError::PaymentDeclined {
                        reason: "payment for this checkout has not completed".to_string(),
                    },
                    None,
                ));
            }
            SessionStatus::Expired => {
                lock_map(&self.sessions).remove(session_id);
                return Err(run.fail(
                    ShopError::PaymentDeclined {
                        reason: "checkout session expired".to_string(),
                    },
                    None,
                ));
            }
        };
        run.advance(CheckoutStage::PaymentInitiated);

        if snapshot.is_empty() {
            error!("Session {} was paid but the cart for {} is empty", session_id, identity.user_id);
            return Err(run.fail(
                ShopError::Internal(format!("paid session {} has no cart to order", session_id)),
                None,
            ));
        }

        // The order is priced from the cart now; it is only paid if that is
        // what the provider collected.
        let expected = self
            .gateway
            .charge_request(&snapshot)
            .map_err(|e| run.fail(e, None))?
            .amount;
        let settled = collected == expected;
        let payment = if settled {
            PaymentState::Paid {
                reference: session_id.to_string(),
            }
        } else {
            error!(
                "Session {} collected {} but the cart for {} now totals {}",
                session_id, collected, identity.user_id, expected
            );
            PaymentState::Pending
        };

        let order = self
            .assembler
            .assemble(identity, &snapshot, payment)
            .await
            .map_err(|e| run.fail(e, None))?;
        run.advance(CheckoutStage::OrderPersisted);

        if let Some(record) = lock_map(&self.sessions).get_mut(session_id) {
            record.state = SessionState::Completed {
                order_id: order.id.clone(),
                settled,
            };
            record.retain_until = Utc::now() + self.retention;
        }

        if !settled {
            return Err(run.fail(amount_mismatch(session_id, collected, expected), Some(order.id)));
        }

        let cart_cleared = self.clear_cart(&mut run, identity, &snapshot, &order.id).await;
        Ok(run.finish(CheckoutOutcome::Completed(CompletedCheckout {
            order_id: order.id,
            duplicate: false,
            cart_cleared,
        })))
    }

    async fn complete_without_payment(
        &self,
        mut run: CheckoutRun,
        identity: &Identity,
        snapshot: &CartSnapshot,
    ) -> CheckoutResult {
        info!("Cart total is zero, skipping payment");
        let order = self
            .assembler
            .assemble(identity, snapshot, PaymentState::NotRequired)
            .await
            .map_err(|e| run.fail(e, None))?;
        run.advance(CheckoutStage::OrderPersisted);

        let cart_cleared = self.clear_cart(&mut run, identity, snapshot, &order.id).await;
        Ok(run.finish(CheckoutOutcome::Completed(CompletedCheckout {
            order_id: order.id,
            duplicate: false,
            cart_cleared,
        })))
    }

    /// Clear the cart after an order. Failure is queued, never fatal.
    async fn clear_cart(
        &self,
        run: &mut CheckoutRun,
        identity: &Identity,
        snapshot: &CartSnapshot,
        order_id: &OrderId,
    ) -> bool {
        match self.carts.clear(&identity.user_id).await {
            Ok(()) => {
                lock_map(&self.pending_clears).remove(&identity.user_id);
                run.advance(CheckoutStage::CartCleared);
                true
            }
            Err(e) => {
                warn!(
                    "Order {} persisted but cart clear failed, queued for retry: {}",
                    order_id, e
                );
                lock_map(&self.pending_clears).insert(
                    identity.user_id.clone(),
                    PendingClear {
                        order_id: order_id.clone(),
                        fingerprint: snapshot.fingerprint(),
                    },
                );
                false
            }
        }
    }

    /// If this snapshot is a cart we already ordered but failed to clear,
    /// return that order instead of creating another.
    async fn replay_stale_cart(&self, identity: &Identity, snapshot: &CartSnapshot) -> Option<CompletedCheckout> {
        let entry = lock_map(&self.pending_clears).get(&identity.user_id).cloned()?;

        if snapshot.fingerprint() != entry.fingerprint {
            debug!("Cart for {} changed since order {}", identity.user_id, entry.order_id);
            self.forget_pending_clear(&identity.user_id, &entry.order_id);
            return None;
        }

        warn!(
            "Stale cart resubmitted by {}, returning order {}",
            identity.user_id, entry.order_id
        );
        let cart_cleared = match self.carts.clear(&identity.user_id).await {
            Ok(()) => {
                self.forget_pending_clear(&identity.user_id, &entry.order_id);
                true
            }
            Err(e) => {
                warn!("Cart clear retry for {} failed: {}", identity.user_id, e);
                false
            }
        };

        Some(CompletedCheckout {
            order_id: entry.order_id,
            duplicate: true,
            cart_cleared,
        })
    }

    /// Take the stalled charge for this exact cart, if any. A changed cart
    /// leaves the earlier order pending for reconciliation.
    fn take_pending_charge(&self, identity: &Identity, snapshot: &CartSnapshot) -> Option<PendingCharge> {
        let pending = lock_map(&self.pending_charges).remove(&identity.user_id)?;
        if pending.fingerprint == snapshot.fingerprint() {
            return Some(pending);
        }
        warn!(
            "Cart for {} changed after a failed charge; order {} stays pending",
            identity.user_id, pending.order_id
        );
        None
    }

    fn forget_pending_clear(&self, user_id: &UserId, order_id: &OrderId) {
        let mut pending = lock_map(&self.pending_clears);
        if pending.get(user_id).is_some_and(|p| &p.order_id == order_id) {
            pending.remove(user_id);
        }
    }

    fn session_record(&self, session_id: &str) -> ShopResult<SessionRecord> {
        lock_map(&self.sessions)
            .get(session_id)
            .cloned()
            .ok_or_else(|| ShopError::NotFound {
                entity: "checkout session",
                id: session_id.to_string(),
            })
    }
}
