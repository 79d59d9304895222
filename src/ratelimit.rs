//! Rate-limit detection, countdown, and single-shot retry.
//!
//! Detection accepts either a structured rate-limit error subtype or
//! free text matching the usual provider phrasings ("rate limit",
//! "quota", "429", "overloaded"), with an optional
//! "retry in N seconds/minutes/hours" extraction. While a countdown
//! runs, the orchestrator rewrites the in-flight message with a
//! human-readable notice on every tick; at zero the stored request is
//! re-issued exactly once.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::session::PromptOptions;

/// A detected rate-limit signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSignal {
    /// Parsed retry-after hint, when the text carried one.
    pub retry_after: Option<Duration>,
}

/// The request to re-issue once the countdown expires.
#[derive(Debug, Clone)]
pub struct PendingRetry {
    /// Session the retry belongs to.
    pub session_id: Uuid,
    /// The original prompt text.
    pub prompt: String,
    /// The original prompt options.
    pub options: PromptOptions,
}

/// Events emitted by an active countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownEvent {
    /// One second elapsed; `remaining_secs` until retry.
    Tick {
        session_id: Uuid,
        remaining_secs: u64,
    },
    /// Countdown reached zero; the pending request should be resent.
    Expired { session_id: Uuid },
}

fn rate_limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)rate.?limit|too many requests|quota|\b429\b|overloaded")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

fn retry_after_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)retry\s+(?:in|after)\s+(\d+)\s*(seconds?|secs?|minutes?|mins?|hours?|hrs?|[smh])\b")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

/// Detect a rate limit in free-text error output.
///
/// Returns `None` when the text does not look like a rate limit, and
/// the parsed retry-after otherwise.
#[must_use]
pub fn detect(text: &str) -> Option<RateLimitSignal> {
    if !rate_limit_re().is_match(text) {
        return None;
    }
    Some(RateLimitSignal {
        retry_after: parse_retry_after(text),
    })
}

/// Extract a "retry in N seconds/minutes/hours" duration.
#[must_use]
pub fn parse_retry_after(text: &str) -> Option<Duration> {
    let caps = retry_after_re().captures(text)?;
    let amount: u64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_lowercase();
    let secs = match unit.chars().next()? {
        'h' => amount.saturating_mul(3600),
        'm' => amount.saturating_mul(60),
        _ => amount,
    };
    Some(Duration::from_secs(secs))
}

/// The countdown notice written into the in-flight message each tick.
#[must_use]
pub fn notice(remaining_secs: u64) -> String {
    let (value, unit) = if remaining_secs >= 120 {
        (remaining_secs / 60, "minutes")
    } else {
        (remaining_secs, "seconds")
    };
    format!("Rate limited. Retrying in {value} {unit}...")
}

struct ActiveCountdown {
    session_id: Uuid,
    cancel: CancellationToken,
}

/// Manages one rate-limit countdown and the stored retry request.
///
/// Stateless apart from the active countdown: a new signal while
/// counting down restarts the timer with the new duration.
#[derive(Default)]
pub struct RateLimitManager {
    pending: Option<PendingRetry>,
    active: Option<ActiveCountdown>,
}

impl RateLimitManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a countdown is currently running.
    #[must_use]
    pub fn is_counting(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !a.cancel.is_cancelled())
    }

    /// Session the active countdown belongs to, if any.
    #[must_use]
    pub fn counting_session(&self) -> Option<Uuid> {
        self.active.as_ref().map(|a| a.session_id)
    }

    /// Store the retry request and start (or restart) the countdown.
    ///
    /// Ticks and the final expiry are delivered through `events` at one
    /// second intervals.
    pub fn begin(
        &mut self,
        retry: PendingRetry,
        retry_after: Duration,
        events: mpsc::UnboundedSender<CountdownEvent>,
    ) {
        self.stop_countdown();

        let session_id = retry.session_id;
        self.pending = Some(retry);

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        self.active = Some(ActiveCountdown { session_id, cancel });

        let total_secs = retry_after.as_secs().max(1);
        tracing::info!(%session_id, total_secs, "rate limit countdown started");

        tokio::spawn(async move {
            let mut remaining = total_secs;
            let _ = events.send(CountdownEvent::Tick {
                session_id,
                remaining_secs: remaining,
            });
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => return,
                    () = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    let _ = events.send(CountdownEvent::Expired { session_id });
                    return;
                }
                let _ = events.send(CountdownEvent::Tick {
                    session_id,
                    remaining_secs: remaining,
                });
            }
        });
    }

    /// Take the stored request for the single automatic resend.
    pub fn take_pending(&mut self) -> Option<PendingRetry> {
        self.active = None;
        self.pending.take()
    }

    /// Manual cancellation: discard the pending request and stop ticking.
    pub fn cancel(&mut self) {
        self.stop_countdown();
        if self.pending.take().is_some() {
            tracing::info!("rate limit retry cancelled");
        }
    }

    fn stop_countdown(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_phrasings() {
        for text in [
            "Error: rate limit exceeded",
            "HTTP 429 from provider",
            "quota exhausted for this window",
            "model is overloaded",
            "Rate-limited, slow down",
        ] {
            assert!(detect(text).is_some(), "should detect: {text}");
        }
        assert!(detect("file not found").is_none());
        assert!(detect("permission denied").is_none());
    }

    #[test]
    fn parses_retry_after_units() {
        assert_eq!(
            parse_retry_after("retry in 45 seconds"),
            Some(Duration::from_secs(45))
        );
        assert_eq!(
            parse_retry_after("please retry after 2 minutes"),
            Some(Duration::from_secs(120))
        );
        assert_eq!(
            parse_retry_after("retry in 1 hour"),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(parse_retry_after("rate limit exceeded"), None);
    }

    #[test]
    fn notice_formats_units() {
        assert_eq!(notice(45), "Rate limited. Retrying in 45 seconds...");
        assert_eq!(notice(300), "Rate limited. Retrying in 5 minutes...");
    }

    fn retry_for(session_id: Uuid) -> PendingRetry {
        PendingRetry {
            session_id,
            prompt: "original".to_string(),
            options: PromptOptions::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_ticks_to_zero_then_expires() {
        let mut manager = RateLimitManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4();
        manager.begin(retry_for(session_id), Duration::from_secs(3), tx);

        let mut ticks = 0;
        loop {
            tokio::time::advance(Duration::from_secs(1)).await;
            match rx.recv().await.unwrap() {
                CountdownEvent::Tick { .. } => ticks += 1,
                CountdownEvent::Expired { session_id: sid } => {
                    assert_eq!(sid, session_id);
                    break;
                }
            }
        }
        // Initial tick plus one per remaining second above zero.
        assert_eq!(ticks, 3);
        assert!(manager.take_pending().is_some());
        assert!(manager.take_pending().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_countdown_prevents_resend() {
        let mut manager = RateLimitManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.begin(retry_for(Uuid::new_v4()), Duration::from_secs(30), tx);
        assert!(manager.is_counting());

        manager.cancel();
        assert!(!manager.is_counting());
        assert!(manager.take_pending().is_none());

        // Drain anything already queued; no Expired may ever arrive.
        tokio::time::advance(Duration::from_secs(60)).await;
        while let Ok(event) = rx.try_recv() {
            assert!(matches!(event, CountdownEvent::Tick { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn new_signal_restarts_countdown() {
        let mut manager = RateLimitManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4();
        manager.begin(retry_for(session_id), Duration::from_secs(100), tx.clone());

        let second = PendingRetry {
            session_id,
            prompt: "replacement".to_string(),
            options: PromptOptions::default(),
        };
        manager.begin(second, Duration::from_secs(2), tx);

        loop {
            tokio::time::advance(Duration::from_secs(1)).await;
            if let Some(CountdownEvent::Expired { .. }) = rx.recv().await {
                break;
            }
        }
        assert_eq!(manager.take_pending().unwrap().prompt, "replacement");
    }
}
