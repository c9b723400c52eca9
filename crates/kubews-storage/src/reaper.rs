//! Periodic removal of idle users' async storage pods
//!
//! A storage pod only needs to run while its user works in an ephemeral
//! workspace. Once a user has been idle longer than the shutdown timeout the
//! pod is removed. Removal here does not wait for the deletion to be observed;
//! a start racing with the sweep is covered by the pre-start interceptor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use kubews_common::{DeleteOutcome, NamespaceOps, Result, ASYNC_STORAGE};
use kubews_environment::stores::{
    all_users, INFRASTRUCTURE_NAMESPACE_PREFERENCE, LAST_ACTIVITY_TIME_PREFERENCE,
};
use kubews_environment::{PreferenceStore, User, UserDirectory, WorkspaceRuntimes};

use crate::config::ReaperConfig;
use crate::legacy::delete_legacy_pod;

/// What one sweep did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Users looked at
    pub checked: usize,
    /// Users whose storage pod was removed
    pub reaped: usize,
    /// Users skipped because a workspace operation was in progress
    pub in_progress: usize,
    /// Users whose lookup failed
    pub failed: usize,
}

enum UserOutcome {
    Active,
    InProgress,
    Unknown,
    Reaped,
}

/// Deletes async storage of users idle past the shutdown timeout
pub struct AsyncStoragePodReaper {
    config: ReaperConfig,
    ops: Arc<dyn NamespaceOps>,
    users: Arc<dyn UserDirectory>,
    preferences: Arc<dyn PreferenceStore>,
    runtimes: Arc<dyn WorkspaceRuntimes>,
}

/// Whether a user last active at `last_activity` (Unix seconds) is idle at `now`
pub fn is_idle(last_activity: i64, timeout_secs: i64, now: i64) -> bool {
    now > last_activity.saturating_add(timeout_secs)
}

impl AsyncStoragePodReaper {
    /// Reaper over the given stores
    pub fn new(
        config: ReaperConfig,
        ops: Arc<dyn NamespaceOps>,
        users: Arc<dyn UserDirectory>,
        preferences: Arc<dyn PreferenceStore>,
        runtimes: Arc<dyn WorkspaceRuntimes>,
    ) -> Self {
        Self {
            config,
            ops,
            users,
            preferences,
            runtimes,
        }
    }

    /// Whether the configuration allows reaping
    pub fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    async fn check_user(&self, user: &User, now: DateTime<Utc>) -> Result<UserOutcome> {
        if self.runtimes.has_in_progress(&user.id).await? {
            return Ok(UserOutcome::InProgress);
        }

        let prefs = self.preferences.find(&user.id).await?;
        let namespace = prefs
            .get(INFRASTRUCTURE_NAMESPACE_PREFERENCE)
            .filter(|ns| !ns.is_empty());
        let last_activity = prefs
            .get(LAST_ACTIVITY_TIME_PREFERENCE)
            .and_then(|t| t.trim().parse::<i64>().ok());
        let (Some(namespace), Some(last_activity)) = (namespace, last_activity) else {
            return Ok(UserOutcome::Unknown);
        };

        let timeout = i64::try_from(self.config.shutdown_timeout.as_secs()).unwrap_or(i64::MAX);
        if !is_idle(last_activity, timeout, now.timestamp()) {
            return Ok(UserOutcome::Active);
        }

        delete_legacy_pod(self.ops.as_ref(), namespace).await;
        match self.ops.delete_deployment(namespace, ASYNC_STORAGE).await? {
            DeleteOutcome::Deleted => {
                info!(user_id = %user.id, namespace = %namespace, "idle async storage removed");
                Ok(UserOutcome::Reaped)
            }
            DeleteOutcome::NotFound => Ok(UserOutcome::Active),
        }
    }

    /// Run one pass over every user
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut users = all_users(self.users.as_ref(), self.config.page_size);

        while let Some(user) = users.next().await {
            let user = match user {
                Ok(user) => user,
                Err(e) => {
                    warn!(error = %e, "user listing failed, ending sweep");
                    report.failed += 1;
                    break;
                }
            };
            report.checked += 1;
            match self.check_user(&user, now).await {
                Ok(UserOutcome::Reaped) => report.reaped += 1,
                Ok(UserOutcome::InProgress) => report.in_progress += 1,
                Ok(UserOutcome::Active | UserOutcome::Unknown) => {}
                Err(e) => {
                    warn!(user_id = %user.id, error = %e, "async storage check failed");
                    report.failed += 1;
                }
            }
        }

        debug!(
            checked = report.checked,
            reaped = report.reaped,
            in_progress = report.in_progress,
            failed = report.failed,
            "async storage sweep finished"
        );
        report
    }

    /// Sweep on a fixed delay until the task is aborted, the first sweep one
    /// period after start
    ///
    /// Returns `None` without spawning when the configuration disables reaping.
    pub fn start(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            info!("async storage reaper disabled by configuration");
            return None;
        }
        let period = self.config.period;
        info!(period_secs = period.as_secs(), "starting async storage reaper");
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.sweep(Utc::now()).await;
            }
        }))
    }
}
