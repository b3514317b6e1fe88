//! Campaign dispatch engine.
//!
//! `Dispatcher::run` returns a lazy event stream. Nothing happens until the
//! stream is first polled; then one worker task is spawned per recipient
//! and a counting semaphore keeps at most `concurrency` of them past the
//! gate at any time. Completions are reported in the order they finish.
//!
//! ```text
//! run() ──poll──▶ spawn workers ──▶ progress, progress, ... ──▶ finished
//!                                         │
//!                       cancel flag raised └──▶ detach rest ──▶ error
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, info, warn};
use uuid::Uuid;

use crate::campaign::controller::CampaignController;
use crate::campaign::model::{AbortReason, CampaignEvent, DeliveryOutcome, Recipient};
use crate::campaign::worker::{RunContext, run_worker};
use crate::config::DispatchConfig;
use crate::delivery::{EmailProvider, RateLimiter, RetryPolicy};
use crate::error::CampaignError;
use crate::quota::DailyQuota;
use crate::stats::StatsAggregator;
use crate::store::Database;
use crate::suppression::{SuppressionList, normalize_email};
use crate::templates::TemplateRenderer;

/// Collaborators shared by every run of a dispatcher.
pub struct DispatchDeps {
    pub store: Arc<dyn Database>,
    pub provider: Arc<dyn EmailProvider>,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub quota: Arc<DailyQuota>,
    pub suppressions: SuppressionList,
    pub limiter: Arc<RateLimiter>,
    pub retry: RetryPolicy,
}

/// One campaign invocation.
#[derive(Debug, Clone)]
pub struct CampaignRequest {
    pub recipients: Vec<Recipient>,
    pub template_id: String,
    pub subject: String,
    /// Values below 1 are treated as 1.
    pub concurrency: usize,
    pub dry_run: bool,
    pub controller: Option<CampaignController>,
}

impl CampaignRequest {
    pub fn new(
        recipients: Vec<Recipient>,
        template_id: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            recipients,
            template_id: template_id.into(),
            subject: subject.into(),
            concurrency: 1,
            dry_run: false,
            controller: None,
        }
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn controller(mut self, controller: CampaignController) -> Self {
        self.controller = Some(controller);
        self
    }
}

/// Turns recipient lists into delivery event streams.
#[derive(Clone)]
pub struct Dispatcher {
    deps: Arc<DispatchDeps>,
}

impl Dispatcher {
    pub fn new(deps: DispatchDeps) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    /// Wire up quota, suppression, limiter and retry from configuration.
    pub fn from_config(
        config: &DispatchConfig,
        store: Arc<dyn Database>,
        provider: Arc<dyn EmailProvider>,
        renderer: Arc<dyn TemplateRenderer>,
    ) -> Self {
        Self::new(DispatchDeps {
            quota: Arc::new(DailyQuota::new(store.clone(), config.daily_limit)),
            suppressions: SuppressionList::new(store.clone()),
            limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            retry: config.retry.clone(),
            store,
            provider,
            renderer,
        })
    }

    pub fn deps(&self) -> &DispatchDeps {
        &self.deps
    }

    /// Start a campaign. Each call is an independent run.
    pub fn run(&self, request: CampaignRequest) -> BoxStream<'static, CampaignEvent> {
        let state = RunState::Pending(PendingRun {
            deps: self.deps.clone(),
            request,
        });
        stream::unfold(state, RunState::advance).boxed()
    }
}

struct PendingRun {
    deps: Arc<DispatchDeps>,
    request: CampaignRequest,
}

struct ActiveRun {
    ctx: Arc<RunContext>,
    tasks: JoinSet<Result<DeliveryOutcome, CampaignError>>,
}

enum RunState {
    Pending(PendingRun),
    Running(ActiveRun),
    Done,
}

impl RunState {
    async fn advance(self) -> Option<(CampaignEvent, RunState)> {
        match self {
            RunState::Pending(pending) => pending.start().next_event().await,
            RunState::Running(active) => active.next_event().await,
            RunState::Done => None,
        }
    }
}

impl PendingRun {
    fn start(self) -> ActiveRun {
        let PendingRun { deps, request } = self;
        let run_id = Uuid::new_v4();
        let concurrency = request.concurrency.max(1);

        let ctx = Arc::new(RunContext {
            run_id,
            template_id: request.template_id,
            subject: request.subject,
            dry_run: request.dry_run,
            deps,
            semaphore: Arc::new(Semaphore::new(concurrency)),
            controller: request.controller.unwrap_or_default(),
            stats: Arc::new(StatsAggregator::new()),
        });

        let span = tracing::info_span!("campaign", %run_id);
        let mut seen = HashSet::new();
        let mut tasks = JoinSet::new();
        for recipient in request.recipients {
            if !seen.insert(normalize_email(&recipient.email)) {
                warn!(parent: &span, email = %recipient.email, "Duplicate recipient skipped");
                continue;
            }
            tasks.spawn(run_worker(ctx.clone(), recipient).instrument(span.clone()));
        }

        info!(
            parent: &span,
            recipients = tasks.len(),
            concurrency,
            dry_run = ctx.dry_run,
            template = %ctx.template_id,
            "Campaign started"
        );
        ActiveRun { ctx, tasks }
    }
}

impl ActiveRun {
    async fn next_event(mut self) -> Option<(CampaignEvent, RunState)> {
        if self.tasks.is_empty() {
            return Some(self.finish());
        }
        if self.ctx.controller.is_cancelled() {
            return Some(self.abort(AbortReason::Cancelled, None));
        }

        let joined = tokio::select! {
            biased;
            _ = self.ctx.controller.cancelled() => None,
            joined = self.tasks.join_next() => Some(joined),
        };
        let Some(joined) = joined else {
            return Some(self.abort(AbortReason::Cancelled, None));
        };

        match joined {
            None => Some(self.finish()),
            Some(Ok(Ok(outcome))) => {
                let stats = self.ctx.stats.snapshot();
                Some((CampaignEvent::Progress { outcome, stats }, RunState::Running(self)))
            }
            Some(Ok(Err(CampaignError::Cancelled))) => {
                Some(self.abort(AbortReason::Cancelled, None))
            }
            Some(Err(e)) => Some(self.join_failed(e)),
        }
    }

    fn join_failed(self, e: JoinError) -> (CampaignEvent, RunState) {
        if e.is_cancelled() {
            self.abort(AbortReason::Cancelled, None)
        } else {
            self.abort(AbortReason::Fatal, Some(format!("worker task failed: {e}")))
        }
    }

    fn finish(self) -> (CampaignEvent, RunState) {
        let stats = self.ctx.stats.snapshot();
        info!(
            run_id = %self.ctx.run_id,
            total = stats.total,
            success = stats.success,
            failed = stats.failed,
            elapsed_secs = stats.elapsed_secs,
            "Campaign finished"
        );
        (CampaignEvent::Finished { stats }, RunState::Done)
    }

    /// Stop consuming completions. Queued workers see the raised flag at
    /// their checkpoint and exit; workers already sending run to completion
    /// and still persist their outcome.
    fn abort(mut self, reason: AbortReason, message: Option<String>) -> (CampaignEvent, RunState) {
        self.ctx.controller.cancel();
        let outstanding = self.tasks.len();
        self.tasks.detach_all();
        let stats = self.ctx.stats.snapshot();
        warn!(
            run_id = %self.ctx.run_id,
            ?reason,
            message = message.as_deref().unwrap_or(""),
            outstanding,
            completed = stats.total,
            "Campaign aborted"
        );
        (
            CampaignEvent::Error {
                reason,
                message,
                stats,
            },
            RunState::Done,
        )
    }
}
