//! The fleet-wide refund estimate job, and its on-demand per-user variant.
//!
//! The job aggregates refund exposure across every user by running the quote
//! algorithm fleet-wide. It is single-flight: the mutex-guarded
//! [`EstimateState`] is the source of truth for both readers and the worker,
//! and a start request while one is running is a no-op. Card-charge listing
//! is the expensive part and is parallelized with a fixed pool of workers
//! striding the customer list; per-customer failures increment counters and
//! never fail the job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use refundry_api::error::ApiError;
use refundry_core::charge::CardCharge;
use refundry_core::ids::UserId;
use refundry_core::money::Cents;
use refundry_core::user::User;
use refundry_providers::ChargeSource as _;
use refundry_store::{AuditStore as _, BusinessStore as _};
use refundry_tokio::NamedTask;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::quote::{self, PlanView, QuoteError};
use crate::EngineDeps;

/// Width of the card-listing worker pool.
const CARD_WORKERS: usize = 5;
/// Cap on the on-demand variant's id list.
pub const MAX_ON_DEMAND_USERS: usize = 1500;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimateStatus {
    Idle,
    Running,
    Ready,
    Error,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimatePhase {
    Loading,
    Card,
    Finalizing,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EstimateProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<EstimatePhase>,
    pub users_total: u64,
    pub card_customers_total: u64,
    pub card_customers_done: u64,
    pub card_customers_failed: u64,
    pub card_customers_multi_currency: u64,
    pub card_customers_non_cny: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EstimateTotals {
    pub total_cents: Cents,
    pub card_cents: Cents,
    pub aggregator_cents: Cents,
    pub total_yuan: String,
    pub card_yuan: String,
    pub aggregator_yuan: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct EstimateCounts {
    pub users_total: u64,
    pub paying_users: u64,
    pub refundable_users: u64,
    pub users_with_card_customer: u64,
    pub card_customers_total: u64,
    pub card_customers_failed: u64,
    pub card_customers_multi_currency: u64,
    pub card_customers_non_cny: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EstimateResult {
    pub totals: EstimateTotals,
    pub counts: EstimateCounts,
    pub computed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// The process-wide estimate record. Single writer: the running job.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EstimateState {
    pub status: EstimateStatusField,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EstimateResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<EstimateResult>,
    pub progress: EstimateProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Newtype so `Default` can be `idle`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EstimateStatusField(pub EstimateStatus);

impl Default for EstimateStatusField {
    fn default() -> Self {
        Self(EstimateStatus::Idle)
    }
}

/// The single-flight estimate job handle. Cheap to clone; all clones share
/// the state.
#[derive(Clone)]
pub struct EstimateJob {
    state: Arc<Mutex<EstimateState>>,
    deps: EngineDeps,
}

/// What the card phase learned about one customer.
enum CardOutcome {
    Charges(Vec<CardCharge>),
    Failed,
    MultiCurrency,
    NonCny,
}

impl EstimateJob {
    pub fn new(deps: EngineDeps) -> Self {
        Self {
            state: Arc::new(Mutex::new(EstimateState::default())),
            deps,
        }
    }

    /// A snapshot of the current state.
    pub fn snapshot(&self) -> EstimateState {
        self.state.lock().expect("estimate state poisoned").clone()
    }

    /// Start a computation unless one is already running. Returns whether a
    /// new computation was started. `last_result` is preserved across
    /// starts.
    pub fn start(&self) -> bool {
        {
            let mut state =
                self.state.lock().expect("estimate state poisoned");
            if state.status.0 == EstimateStatus::Running {
                return false;
            }
            state.status = EstimateStatusField(EstimateStatus::Running);
            state.started_at = Some(Utc::now());
            state.result = None;
            state.error = None;
            state.progress = EstimateProgress {
                phase: Some(EstimatePhase::Loading),
                ..EstimateProgress::default()
            };
        }

        let job = self.clone();
        NamedTask::spawn("refund-estimate", async move {
            job.run().await;
        })
        .detach();
        true
    }

    #[instrument(skip(self), name = "(refund-estimate)")]
    async fn run(&self) {
        let started = Instant::now();
        let outcome = self.compute(started).await;
        let mut state = self.state.lock().expect("estimate state poisoned");
        state.progress.phase = None;
        match outcome {
            Ok(result) => {
                info!(
                    "estimate done in {}ms: total {}",
                    result.duration_ms, result.totals.total_yuan,
                );
                state.status = EstimateStatusField(EstimateStatus::Ready);
                state.result = Some(result.clone());
                state.last_result = Some(result);
            }
            Err(message) => {
                warn!("estimate failed: {message}");
                state.status = EstimateStatusField(EstimateStatus::Error);
                state.error = Some(message);
            }
        }
    }

    fn set_phase(&self, phase: EstimatePhase) {
        let mut state = self.state.lock().expect("estimate state poisoned");
        state.progress.phase = Some(phase);
    }

    async fn compute(
        &self,
        started: Instant,
    ) -> Result<EstimateResult, String> {
        // --- Phase: loading --- //
        self.set_phase(EstimatePhase::Loading);
        let users = self
            .deps
            .business
            .all_users()
            .await
            .map_err(|e| format!("couldn't load users: {e}"))?;

        let card_customers: Vec<(UserId, String)> = users
            .iter()
            .filter_map(|u| {
                u.card_customer_id
                    .clone()
                    .map(|customer| (u.id, customer))
            })
            .collect();
        {
            let mut state =
                self.state.lock().expect("estimate state poisoned");
            state.progress.users_total = users.len() as u64;
            state.progress.card_customers_total =
                card_customers.len() as u64;
        }

        // --- Phase: card --- //
        self.set_phase(EstimatePhase::Card);
        let card_outcomes = self.list_all_charges(&card_customers).await;

        // --- Phase: finalizing --- //
        self.set_phase(EstimatePhase::Finalizing);
        let mut totals = EstimateTotals::default();
        let mut counts = EstimateCounts {
            users_total: users.len() as u64,
            users_with_card_customer: card_customers.len() as u64,
            card_customers_total: card_customers.len() as u64,
            ..EstimateCounts::default()
        };

        for user in &users {
            let card_outcome = user
                .card_customer_id
                .as_ref()
                .and_then(|_| card_outcomes.get(&user.id.as_i64()));
            let charges: &[CardCharge] = match card_outcome {
                Some(CardOutcome::Charges(charges)) => charges,
                Some(CardOutcome::Failed) => {
                    counts.card_customers_failed += 1;
                    // The card ledger is unreachable; estimate the
                    // aggregator side only.
                    &[]
                }
                Some(CardOutcome::MultiCurrency) => {
                    counts.card_customers_multi_currency += 1;
                    continue;
                }
                Some(CardOutcome::NonCny) => {
                    counts.card_customers_non_cny += 1;
                    continue;
                }
                None => &[],
            };

            match self.estimate_user(user, charges).await {
                Ok(Some((due, plan))) => {
                    counts.paying_users += 1;
                    if due.is_positive() {
                        counts.refundable_users += 1;
                    }
                    totals.total_cents = totals
                        .total_cents
                        .checked_add(due)
                        .unwrap_or(totals.total_cents);
                    totals.card_cents = totals
                        .card_cents
                        .checked_add(plan.card_cents)
                        .unwrap_or(totals.card_cents);
                    totals.aggregator_cents = totals
                        .aggregator_cents
                        .checked_add(plan.aggregator_cents)
                        .unwrap_or(totals.aggregator_cents);
                }
                Ok(None) => {}
                Err(message) => return Err(message),
            }
        }

        totals.total_yuan = totals.total_cents.to_yuan_string();
        totals.card_yuan = totals.card_cents.to_yuan_string();
        totals.aggregator_yuan = totals.aggregator_cents.to_yuan_string();

        Ok(EstimateResult {
            totals,
            counts,
            computed_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// List charges for every card customer with [`CARD_WORKERS`] workers,
    /// worker `w` taking customers `w, w + CARD_WORKERS, ...`.
    async fn list_all_charges(
        &self,
        customers: &[(UserId, String)],
    ) -> HashMap<i64, CardOutcome> {
        let outcomes: Mutex<HashMap<i64, CardOutcome>> =
            Mutex::new(HashMap::with_capacity(customers.len()));

        let workers = (0..CARD_WORKERS).map(|w| {
            let outcomes = &outcomes;
            async move {
                for (user_id, customer) in
                    customers.iter().skip(w).step_by(CARD_WORKERS)
                {
                    let outcome = match self
                        .deps
                        .charges
                        .list_customer_charges(customer)
                        .await
                    {
                        Ok(charges) => classify_charges(charges),
                        Err(e) => {
                            warn!(
                                "charge listing failed for {customer}: {e}"
                            );
                            CardOutcome::Failed
                        }
                    };
                    let mut state = self
                        .state
                        .lock()
                        .expect("estimate state poisoned");
                    state.progress.card_customers_done += 1;
                    match &outcome {
                        CardOutcome::Failed =>
                            state.progress.card_customers_failed += 1,
                        CardOutcome::MultiCurrency =>
                            state.progress.card_customers_multi_currency +=
                                1,
                        CardOutcome::NonCny =>
                            state.progress.card_customers_non_cny += 1,
                        CardOutcome::Charges(_) => {}
                    }
                    drop(state);

                    outcomes
                        .lock()
                        .expect("outcomes poisoned")
                        .insert(user_id.as_i64(), outcome);
                }
            }
        });
        join_all(workers).await;

        outcomes.into_inner().expect("outcomes poisoned")
    }

    /// Quote one user for the fleet totals. `Ok(None)` means the user has
    /// no paying history at all.
    async fn estimate_user(
        &self,
        user: &User,
        charges: &[CardCharge],
    ) -> Result<Option<(Cents, PlanView)>, String> {
        let topups = self
            .deps
            .business
            .user_topups(user.id)
            .await
            .map_err(|e| format!("couldn't load topups: {e}"))?;
        if topups.is_empty() && charges.is_empty() {
            return Ok(None);
        }

        let totals = self
            .deps
            .audit
            .user_refund_totals(user.id)
            .await
            .map_err(|e| format!("couldn't load refund totals: {e}"))?;

        match quote::assemble(user, &topups, &totals, charges) {
            Ok(ctx) =>
                Ok(Some((ctx.quote.due_cents, ctx.quote.plan.clone()))),
            // The currency guard already ran per-customer in the card
            // phase; reaching it here means a data race with the card
            // processor. Skip the user.
            Err(QuoteError::MultipleCurrencies | QuoteError::NonCny(_)) =>
                Ok(None),
            Err(QuoteError::Money(e)) =>
                Err(format!("quote overflow for user {}: {e}", user.id)),
        }
    }
}

/// Currency-classify a customer's settled charges.
fn classify_charges(charges: Vec<CardCharge>) -> CardOutcome {
    let mut currency: Option<&str> = None;
    for charge in charges.iter().filter(|c| c.is_settled()) {
        match currency {
            None => currency = Some(&charge.currency),
            Some(seen) if seen != charge.currency =>
                return CardOutcome::MultiCurrency,
            Some(_) => {}
        }
    }
    if let Some(seen) = currency {
        if seen != quote::SETTLEMENT_CURRENCY {
            return CardOutcome::NonCny;
        }
    }
    CardOutcome::Charges(charges)
}

// --- On-demand per-user estimate --- //

/// Request body for `POST /api/refund-estimate/users`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct UserEstimateRequest {
    #[serde(default)]
    pub user_ids: Vec<serde_json::Value>,
    #[serde(default)]
    pub user_ids_text: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct UserEstimateItem {
    pub user_id: UserId,
    pub due_yuan: String,
    pub plan: PlanView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct UserEstimateReport {
    pub items: Vec<UserEstimateItem>,
    pub totals: EstimateTotals,
    pub requested: usize,
    pub estimated: usize,
    pub refundable_users: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invalid_user_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub duplicate_user_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub user_ids_not_found: Vec<i64>,
}

/// Split the freeform id text on commas and whitespace.
pub fn parse_user_ids_text(text: &str) -> Vec<String> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Normalize the request into tokens: the JSON array (numbers or strings)
/// followed by the freeform text.
pub fn collect_id_tokens(request: &UserEstimateRequest) -> Vec<String> {
    let mut tokens = Vec::new();
    for value in &request.user_ids {
        match value {
            serde_json::Value::Number(n) => tokens.push(n.to_string()),
            serde_json::Value::String(s) => tokens.push(s.clone()),
            other => tokens.push(other.to_string()),
        }
    }
    if let Some(text) = &request.user_ids_text {
        tokens.extend(parse_user_ids_text(text));
    }
    tokens
}

/// Estimate an explicit list of users with the same quote algorithm.
#[instrument(skip(deps, request), name = "(estimate-users)")]
pub async fn estimate_users(
    deps: &EngineDeps,
    request: &UserEstimateRequest,
) -> Result<UserEstimateReport, ApiError> {
    let tokens = collect_id_tokens(request);

    let mut report = UserEstimateReport {
        requested: tokens.len(),
        ..UserEstimateReport::default()
    };

    let mut ids: Vec<i64> = Vec::new();
    for token in &tokens {
        match token.parse::<i64>() {
            Ok(id) if id > 0 =>
                if ids.contains(&id) {
                    if !report.duplicate_user_ids.contains(&id) {
                        report.duplicate_user_ids.push(id);
                    }
                } else {
                    ids.push(id);
                },
            _ => report.invalid_user_ids.push(token.clone()),
        }
    }
    if !report.invalid_user_ids.is_empty() {
        return Err(ApiError::validation(
            "invalid_user_ids",
            "some user ids are not positive integers",
        )
        .with_details(serde_json::json!({
            "invalid_user_ids": report.invalid_user_ids,
        })));
    }
    if ids.len() > MAX_ON_DEMAND_USERS {
        return Err(ApiError::validation(
            "too_many_user_ids",
            format!(
                "{} ids exceed the {MAX_ON_DEMAND_USERS} cap",
                ids.len()
            ),
        ));
    }

    for id in ids {
        let user_id = UserId::new(id);
        match quote::build(deps, user_id).await {
            Ok(ctx) => {
                let due = ctx.quote.due_cents;
                if due.is_positive() {
                    report.refundable_users += 1;
                }
                report.totals.total_cents = report
                    .totals
                    .total_cents
                    .checked_add(due)
                    .unwrap_or(report.totals.total_cents);
                report.totals.card_cents = report
                    .totals
                    .card_cents
                    .checked_add(ctx.quote.plan.card_cents)
                    .unwrap_or(report.totals.card_cents);
                report.totals.aggregator_cents = report
                    .totals
                    .aggregator_cents
                    .checked_add(ctx.quote.plan.aggregator_cents)
                    .unwrap_or(report.totals.aggregator_cents);
                report.estimated += 1;
                report.items.push(UserEstimateItem {
                    user_id,
                    due_yuan: ctx.quote.due_yuan.clone(),
                    plan: ctx.quote.plan.clone(),
                    warning: None,
                });
            }
            Err(err) if err.code == "user_not_found" =>
                report.user_ids_not_found.push(id),
            Err(err)
                if err.code == "stripe_multiple_currencies"
                    || err.code == "stripe_non_cny_currency"
                    || err.code == "provider_error" =>
            {
                let warning = match err.code.as_ref() {
                    "stripe_multiple_currencies" => "multi_currency",
                    "stripe_non_cny_currency" => "non_cny",
                    _ => "charge_listing_failed",
                };
                report.items.push(UserEstimateItem {
                    user_id,
                    due_yuan: Cents::ZERO.to_yuan_string(),
                    plan: PlanView::default(),
                    warning: Some(warning.to_owned()),
                });
            }
            Err(err) => return Err(err),
        }
    }

    report.totals.total_yuan = report.totals.total_cents.to_yuan_string();
    report.totals.card_yuan = report.totals.card_cents.to_yuan_string();
    report.totals.aggregator_yuan =
        report.totals.aggregator_cents.to_yuan_string();

    Ok(report)
}
