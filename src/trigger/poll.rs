use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::image::Reference;
use crate::metrics;
use crate::models::{Event, Repository, TrackedImage, TriggerKind};
use crate::policy::Policy;
use crate::provider::Providers;
use crate::registry::{CredentialsChain, RegistryClient};
use crate::version;

/// How often the manager re-reads the tracked image set
const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Fallback watcher interval when a schedule cannot be parsed at all
const FALLBACK_INTERVAL: Duration = Duration::from_secs(60);

/// Parse an `@every <duration>` schedule into an interval.
pub fn parse_schedule(schedule: &str, default: &str) -> Duration {
    fn parse(schedule: &str) -> Option<Duration> {
        let spec = schedule.trim().strip_prefix("@every ")?;
        humantime::parse_duration(spec.trim()).ok()
    }

    if let Some(interval) = parse(schedule) {
        return interval;
    }
    warn!(
        "unsupported poll schedule {:?}, using default {:?}",
        schedule, default
    );
    parse(default).unwrap_or(FALLBACK_INTERVAL)
}

/// Watchers are keyed by image and schedule; a schedule change recreates
/// the watcher
pub fn watcher_key(image: &Reference, schedule: &str) -> String {
    format!("{}:{}|{}", image.remote(), image.tag(), schedule)
}

/// Diff the desired watcher set against the live one
pub fn diff_watchers(
    desired: &HashSet<String>,
    live: &HashSet<String>,
) -> (Vec<String>, Vec<String>) {
    let added = desired.difference(live).cloned().collect();
    let removed = live.difference(desired).cloned().collect();
    (added, removed)
}

/// Pick the best tag the policy allows from the current position.
/// Semver policies pick the highest allowed version; glob and regexp
/// order matches lexicographically.
pub fn best_candidate(policy: &Policy, current: &str, tags: &[String]) -> Option<String> {
    let mut best: Option<String> = None;

    for tag in tags {
        if !matches!(policy.should_update(current, tag), Ok(true)) {
            continue;
        }
        // Pattern policies match in both directions; only ever move
        // forward from the current position
        if !is_better(policy, current, tag) {
            continue;
        }

        best = Some(match best {
            None => tag.clone(),
            Some(candidate) => {
                if is_better(policy, &candidate, tag) {
                    tag.clone()
                } else {
                    candidate
                }
            },
        });
    }

    best
}

fn is_better(policy: &Policy, best: &str, candidate: &str) -> bool {
    match policy {
        Policy::Semver { .. } => matches!(
            version::compare(
                &version::Version::parse(best),
                &version::Version::parse(candidate)
            ),
            Some(std::cmp::Ordering::Less)
        ),
        _ => candidate > best,
    }
}

struct WatcherHandle {
    token: CancellationToken,
}

/// Reconciles the tracked image set against a set of per-image registry
/// watchers. Each watcher runs on its own schedule and submits an event
/// when the registry state changes.
pub struct PollManager {
    providers: Providers,
    registry: Arc<RegistryClient>,
    credentials: Arc<CredentialsChain>,
    default_schedule: String,
    watchers: Mutex<HashMap<String, WatcherHandle>>,
}

impl PollManager {
    pub fn new(
        providers: Providers,
        registry: Arc<RegistryClient>,
        credentials: Arc<CredentialsChain>,
        default_schedule: String,
    ) -> Self {
        Self {
            providers,
            registry,
            credentials,
            default_schedule,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("poll manager started");
            let mut tick = tokio::time::interval(SCAN_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("poll manager stopping");
                        self.stop_all().await;
                        return;
                    },
                    _ = tick.tick() => self.scan(&token).await,
                }
            }
        })
    }

    async fn stop_all(&self) {
        let mut watchers = self.watchers.lock().await;
        for (_, handle) in watchers.drain() {
            handle.token.cancel();
        }
    }

    /// One reconcile pass: diff tracked images against live watchers,
    /// start the missing ones and stop the stale ones.
    pub async fn scan(&self, token: &CancellationToken) {
        metrics::POLL_SCANS_TOTAL.inc();

        let tracked = self.providers.tracked_images().await;
        let mut desired: HashMap<String, TrackedImage> = HashMap::new();
        for image in tracked {
            if image.trigger != TriggerKind::Poll {
                continue;
            }
            if matches!(image.policy, Policy::None) {
                continue;
            }
            desired.insert(watcher_key(&image.image, &image.poll_schedule), image);
        }

        let mut watchers = self.watchers.lock().await;
        let desired_keys: HashSet<String> = desired.keys().cloned().collect();
        let live_keys: HashSet<String> = watchers.keys().cloned().collect();
        let (added, removed) = diff_watchers(&desired_keys, &live_keys);

        for key in removed {
            if let Some(handle) = watchers.remove(&key) {
                debug!("stopping watcher {}", key);
                handle.token.cancel();
            }
        }

        for key in added {
            let tracked = desired.remove(&key).expect("added key is desired");
            let child = token.child_token();
            info!(
                "starting watcher for {} (schedule {:?})",
                tracked.image, tracked.poll_schedule
            );

            let ctx = WatcherContext {
                providers: self.providers.clone(),
                registry: self.registry.clone(),
                credentials: self.credentials.clone(),
            };
            let interval = parse_schedule(&tracked.poll_schedule, &self.default_schedule);
            let watcher_token = child.clone();
            tokio::spawn(async move {
                run_watcher(ctx, tracked, interval, watcher_token).await;
            });

            watchers.insert(key, WatcherHandle { token: child });
        }

        metrics::POLL_WATCHERS.set(watchers.len() as i64);
    }
}

struct WatcherContext {
    providers: Providers,
    registry: Arc<RegistryClient>,
    credentials: Arc<CredentialsChain>,
}

/// A single repository watcher. Semver, glob and regexp policies
/// enumerate tags; everything else watches the pinned tag's digest.
async fn run_watcher(
    ctx: WatcherContext,
    tracked: TrackedImage,
    interval: Duration,
    token: CancellationToken,
) {
    let watch_tags = matches!(
        tracked.policy,
        Policy::Semver { .. } | Policy::Glob { .. } | Policy::Regexp { .. }
    );

    let mut last_tag = tracked.image.tag().to_string();
    let mut last_digest: Option<String> = None;

    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately and primes the digest baseline
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("watcher for {} stopped", tracked.image);
                return;
            },
            _ = tick.tick() => {},
        }

        let auth = ctx.credentials.resolve(&tracked).await;

        if watch_tags {
            let tags = match ctx.registry.tags(&tracked.image, &auth).await {
                Ok(tags) => tags,
                Err(e) => {
                    error!("failed to list tags for {}: {}", tracked.image, e);
                    continue;
                },
            };

            if let Some(best) = best_candidate(&tracked.policy, &last_tag, &tags) {
                info!(
                    "new tag for {}: {} -> {}",
                    tracked.image.remote(),
                    last_tag,
                    best
                );
                let event = Event::new(
                    Repository {
                        host: tracked.image.registry().to_string(),
                        name: tracked.image.repository().to_string(),
                        tag: best.clone(),
                        digest: None,
                    },
                    "poll",
                );
                ctx.providers.submit_all(event).await;
                metrics::POLL_EVENTS_TOTAL.inc();
                last_tag = best;
            }
        } else {
            let digest = match ctx.registry.digest(&tracked.image, &auth).await {
                Ok(digest) => digest,
                Err(e) => {
                    error!("failed to fetch digest for {}: {}", tracked.image, e);
                    continue;
                },
            };

            match &last_digest {
                Some(seen) if seen != &digest => {
                    info!(
                        "digest change for {}: {} -> {}",
                        tracked.image, seen, digest
                    );
                    let event = Event::new(
                        Repository {
                            host: tracked.image.registry().to_string(),
                            name: tracked.image.repository().to_string(),
                            tag: last_tag.clone(),
                            digest: Some(digest.clone()),
                        },
                        "poll",
                    );
                    ctx.providers.submit_all(event).await;
                    metrics::POLL_EVENTS_TOTAL.inc();
                    last_digest = Some(digest);
                },
                Some(_) => {},
                None => {
                    debug!("first digest observation for {}: {}", tracked.image, digest);
                    last_digest = Some(digest);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schedule() {
        assert_eq!(
            parse_schedule("@every 1m", "@every 1m"),
            Duration::from_secs(60)
        );
        assert_eq!(
            parse_schedule("@every 2h", "@every 1m"),
            Duration::from_secs(7200)
        );
        assert_eq!(
            parse_schedule("@every 30s", "@every 1m"),
            Duration::from_secs(30)
        );

        // Cron expressions are not supported; the default applies
        assert_eq!(
            parse_schedule("*/5 * * * *", "@every 10m"),
            Duration::from_secs(600)
        );
        assert_eq!(
            parse_schedule("garbage", "also garbage"),
            FALLBACK_INTERVAL
        );
    }

    #[test]
    fn test_watcher_key_includes_schedule() {
        let image = Reference::parse("gcr.io/project/app:1.2.3").unwrap();
        let one = watcher_key(&image, "@every 1m");
        let two = watcher_key(&image, "@every 5m");
        assert_ne!(one, two);
        assert!(one.starts_with("gcr.io/project/app:1.2.3"));
    }

    #[test]
    fn test_diff_watchers() {
        let desired: HashSet<String> =
            ["a".to_string(), "b".to_string()].into_iter().collect();
        let live: HashSet<String> = ["b".to_string(), "c".to_string()].into_iter().collect();

        let (mut added, mut removed) = diff_watchers(&desired, &live);
        added.sort();
        removed.sort();
        assert_eq!(added, vec!["a".to_string()]);
        assert_eq!(removed, vec!["c".to_string()]);
    }

    #[test]
    fn test_best_candidate_semver_picks_highest() {
        let policy = Policy::parse("all", false, true).unwrap();
        let tags = vec![
            "1.2.4".to_string(),
            "1.4.0".to_string(),
            "1.3.0".to_string(),
            "0.9.0".to_string(),
            "latest".to_string(),
        ];

        assert_eq!(
            best_candidate(&policy, "1.2.3", &tags).as_deref(),
            Some("1.4.0")
        );
    }

    #[test]
    fn test_best_candidate_respects_level() {
        let policy = Policy::parse("patch", false, true).unwrap();
        let tags = vec!["1.2.4".to_string(), "1.3.0".to_string(), "2.0.0".to_string()];

        assert_eq!(
            best_candidate(&policy, "1.2.3", &tags).as_deref(),
            Some("1.2.4")
        );
    }

    #[test]
    fn test_best_candidate_glob_is_lexicographic() {
        let policy = Policy::parse("glob:release-*", false, true).unwrap();
        let tags = vec![
            "release-1".to_string(),
            "release-2".to_string(),
            "feature-x".to_string(),
        ];

        assert_eq!(
            best_candidate(&policy, "release-1", &tags).as_deref(),
            Some("release-2")
        );

        // Quiescent once the best match is current
        assert_eq!(best_candidate(&policy, "release-2", &tags), None);
    }

    #[test]
    fn test_best_candidate_none_when_no_match() {
        let policy = Policy::parse("minor", false, true).unwrap();
        let tags = vec!["2.0.0".to_string(), "latest".to_string()];
        assert_eq!(best_candidate(&policy, "1.2.3", &tags), None);
    }
}
