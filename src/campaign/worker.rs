//! Per-recipient worker.
//!
//! Steps run strictly in order and short-circuit: cancellation, quota,
//! unsubscribe, suppression, render, dry-run, reserve and send. Every
//! branch except cancellation ends in exactly one persisted outcome.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::campaign::controller::CampaignController;
use crate::campaign::dispatcher::DispatchDeps;
use crate::campaign::model::{DeliveryOutcome, Recipient, reason};
use crate::delivery::OutboundEmail;
use crate::error::{CampaignError, DatabaseError};
use crate::stats::StatsAggregator;

/// Everything a worker shares with the other workers of its run.
pub(crate) struct RunContext {
    pub run_id: Uuid,
    pub template_id: String,
    pub subject: String,
    pub dry_run: bool,
    pub deps: Arc<DispatchDeps>,
    pub semaphore: Arc<Semaphore>,
    pub controller: CampaignController,
    pub stats: Arc<StatsAggregator>,
}

/// Run one recipient to completion.
///
/// # Errors
///
/// Only `CampaignError::Cancelled`; every other fault becomes a failed outcome.
pub(crate) async fn run_worker(
    ctx: Arc<RunContext>,
    recipient: Recipient,
) -> Result<DeliveryOutcome, CampaignError> {
    let _permit = ctx
        .semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| CampaignError::Cancelled)?;

    if ctx.controller.is_cancelled() {
        return Err(CampaignError::Cancelled);
    }

    let outcome = evaluate(&ctx, &recipient).await;

    if let Err(e) = ctx.deps.store.record_delivery(Some(ctx.run_id), &outcome).await {
        warn!(email = %outcome.email, error = %e, "Failed to persist delivery outcome");
    }
    ctx.stats.add(&outcome);

    debug!(
        email = %outcome.email,
        success = outcome.success,
        status = outcome.status_code,
        "Recipient done"
    );
    Ok(outcome)
}

async fn evaluate(ctx: &RunContext, recipient: &Recipient) -> DeliveryOutcome {
    let deps = &ctx.deps;
    let provider_name = deps.provider.name();
    let email = recipient.email.as_str();

    if !ctx.dry_run {
        // A failed lookup refuses the send but is recorded as a fault, never
        // as a policy rejection.
        match deps.quota.can_send(1).await {
            Ok(true) => {}
            Ok(false) => return DeliveryOutcome::rejected(email, provider_name, reason::DAILY_LIMIT),
            Err(e) => return check_failed(email, provider_name, "quota", &e),
        }
        match deps.suppressions.is_unsubscribed(email).await {
            Ok(false) => {}
            Ok(true) => return DeliveryOutcome::rejected(email, provider_name, reason::UNSUBSCRIBED),
            Err(e) => return check_failed(email, provider_name, "unsubscribe", &e),
        }
        match deps.suppressions.is_suppressed(email).await {
            Ok(false) => {}
            Ok(true) => return DeliveryOutcome::rejected(email, provider_name, reason::SUPPRESSED),
            Err(e) => return check_failed(email, provider_name, "suppression", &e),
        }
    }

    let rendered = match deps
        .renderer
        .render(&ctx.template_id, &ctx.subject, &recipient.template_vars())
    {
        Ok(rendered) => rendered,
        Err(e) => return DeliveryOutcome::failed(email, provider_name, 0, e.to_string()),
    };

    if ctx.dry_run {
        return DeliveryOutcome::dry_run(email);
    }

    // Capacity is reserved before the call and kept even if the send fails.
    match deps.quota.try_reserve(1).await {
        Ok(true) => {}
        Ok(false) => return DeliveryOutcome::rejected(email, provider_name, reason::DAILY_LIMIT),
        Err(e) => return check_failed(email, provider_name, "quota", &e),
    }

    let message = OutboundEmail {
        to: recipient.email.clone(),
        subject: rendered.subject,
        html: rendered.html,
        text: rendered.text,
    };

    let limiter = &deps.limiter;
    let provider = &deps.provider;
    let message = &message;
    let result = deps
        .retry
        .run(|| async move {
            limiter.acquire().await;
            provider.send(message).await
        })
        .await;

    match result {
        Ok(receipt) => {
            DeliveryOutcome::sent(email, provider_name, receipt.status_code, receipt.message_id)
        }
        Err(e) => {
            warn!(email, error = %e, retriable = e.retriable, "Send failed");
            DeliveryOutcome::failed(email, provider_name, e.status_code.unwrap_or(0), e.message)
        }
    }
}

fn check_failed(email: &str, provider: &str, check: &str, e: &DatabaseError) -> DeliveryOutcome {
    warn!(email, check, error = %e, "Pre-send check failed");
    DeliveryOutcome::failed(email, provider, 0, format!("{check} check failed: {e}"))
}
