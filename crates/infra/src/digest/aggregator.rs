use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chorus_ai::{generate_bounded, Generator, Prompt};
use chorus_observability::metrics;

use crate::scheduler::{TaskError, TaskOutcome, TickTask};

use super::{
    top_highlights, ActivityStore, Digest, DigestKind, DigestPeriod, DigestSource,
    DigestStats, Highlight,
};

/// What one refresh attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refresh {
    /// Every subject is fresh for the current period.
    Fresh,
    Written {
        subject: Uuid,
        source: DigestSource,
    },
    /// Generation failed transiently; the subject stays stale and moves to
    /// the back of the queue.
    Deferred { subject: Uuid, reason: String },
}

/// Refreshes at most one stale digest of one kind per tick.
pub struct DigestAggregator {
    kind: DigestKind,
    store: Arc<dyn ActivityStore>,
    generator: Arc<dyn Generator>,
    utc_offset: FixedOffset,
    activity_limit: usize,
    top_k: usize,
    generation_timeout: Duration,
}

impl DigestAggregator {
    pub fn new(
        kind: DigestKind,
        store: Arc<dyn ActivityStore>,
        generator: Arc<dyn Generator>,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            kind,
            store,
            generator,
            utc_offset,
            activity_limit: 200,
            top_k: 5,
            generation_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_activity_limit(mut self, limit: usize) -> Self {
        self.activity_limit = limit;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn kind(&self) -> DigestKind {
        self.kind
    }

    pub async fn refresh_at(&self, now: DateTime<Utc>) -> Result<Refresh, TaskError> {
        let started = Instant::now();
        let period = DigestPeriod::containing(self.kind, now, self.utc_offset);
        let Some(subject) = self.store.next_stale_subject(self.kind, &period).await? else {
            return Ok(Refresh::Fresh);
        };

        // Counted before loading: a row landing in between leaves the digest
        // stale rather than silently covered.
        let activity_count = self.store.count_activity(self.kind, subject, &period).await?;
        let items = self
            .store
            .load_activity(self.kind, subject, &period, self.activity_limit)
            .await?;
        let stats = DigestStats::compute(&items);
        let highlights = top_highlights(&items, self.top_k);

        let (summary, source) = if items.is_empty() {
            (fallback_summary(self.kind, &stats, &highlights), DigestSource::Fallback)
        } else {
            let prompt = self.prompt(&stats, &highlights);
            let result =
                generate_bounded(self.generator.as_ref(), &prompt, self.generation_timeout).await;
            match result {
                Ok(generated) => (generated.text.trim().to_string(), DigestSource::Generated),
                Err(e) if e.kind().is_retryable() => {
                    let kind = self.kind.as_str();
                    warn!(kind, %subject, error = %e, "digest summary deferred");
                    self.store
                        .record_deferral(self.kind, subject, period.key, now)
                        .await?;
                    return Ok(Refresh::Deferred {
                        subject,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    let kind = self.kind.as_str();
                    warn!(kind, %subject, error = %e, "digest summary fell back");
                    (fallback_summary(self.kind, &stats, &highlights), DigestSource::Fallback)
                }
            }
        };

        let digest = Digest {
            kind: self.kind,
            subject_id: subject,
            period_key: period.key,
            last_activity_at: items.iter().map(|i| i.occurred_at).max(),
            activity_count,
            stats,
            highlights,
            summary,
            source,
            updated_at: now,
        };
        self.store.upsert_digest(&digest).await?;

        metrics::digest_refreshed(self.kind.as_str(), source.as_str(), started.elapsed());
        info!(
            kind = self.kind.as_str(),
            %subject,
            period = %period.key,
            items = digest.stats.total,
            source = source.as_str(),
            "digest refreshed"
        );
        Ok(Refresh::Written { subject, source })
    }

    fn prompt(&self, stats: &DigestStats, highlights: &[Highlight]) -> Prompt {
        let audience = match self.kind {
            DigestKind::PersonaDaily => "a persona's activity today",
            DigestKind::UserWeekly => "the replies a user's posts received this week",
        };
        let mut facts = format!("{} items in total.", stats.total);
        for (kind, count) in &stats.by_kind {
            facts.push_str(&format!("\n{kind}: {count}"));
        }
        facts.push_str("\nHighlights:");
        for highlight in highlights {
            facts.push_str(&format!("\n- {}", excerpt(&highlight.excerpt)));
        }

        Prompt::new(format!(
            "Summarise {audience} in two friendly sentences. Use only the facts given."
        ))
        .user(facts)
        .with_max_tokens(200)
        .with_temperature(0.5)
    }
}

const EXCERPT_CHARS: usize = 140;

fn excerpt(text: &str) -> String {
    match text.char_indices().nth(EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Deterministic summary used when there is nothing (usable) to generate from.
fn fallback_summary(kind: DigestKind, stats: &DigestStats, highlights: &[Highlight]) -> String {
    if stats.total == 0 {
        return match kind {
            DigestKind::PersonaDaily => "No activity today.".to_string(),
            DigestKind::UserWeekly => "No replies this week.".to_string(),
        };
    }
    let counts: Vec<String> = stats
        .by_kind
        .iter()
        .map(|(kind, count)| format!("{count} {kind}"))
        .collect();
    let mut summary = format!("{} items ({}).", stats.total, counts.join(", "));
    if let Some(top) = highlights.first() {
        summary.push_str(&format!(" Top: \"{}\"", excerpt(&top.excerpt)));
    }
    summary
}

#[async_trait]
impl TickTask for DigestAggregator {
    fn name(&self) -> &'static str {
        match self.kind {
            DigestKind::PersonaDaily => "persona_daily_digest",
            DigestKind::UserWeekly => "user_weekly_digest",
        }
    }

    async fn run_once(&self) -> Result<TaskOutcome, TaskError> {
        match self.refresh_at(Utc::now()).await? {
            Refresh::Fresh => Ok(TaskOutcome::Idle),
            Refresh::Written { .. } => Ok(TaskOutcome::Progressed),
            Refresh::Deferred { subject, .. } => {
                debug!(kind = self.kind.as_str(), %subject, "digest left stale");
                Ok(TaskOutcome::Idle)
            }
        }
    }
}
