//! Periodic sync scheduler
//!
//! The catch-all trigger: every `interval_minutes` it sends
//! [`SyncTrigger::PeriodicTick`] to the coordinator, so work left behind by a
//! missed mutation or connectivity signal still gets synced. The schedule is
//! persisted in the settings table and survives restarts.

use super::coordinator::SyncSignal;
use super::models::SyncTrigger;
use crate::config::{MAX_INTERVAL_MINUTES, MIN_INTERVAL_MINUTES};
use crate::db::{Database, DbError};
use chrono::Utc;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const SETTINGS_KEY: &str = "sync_schedule";

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u32,
    /// RFC 3339 time of the last tick
    pub last_run: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 15,
            last_run: None,
        }
    }
}

struct Ticker {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Sends periodic ticks to the sync coordinator
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    config: Arc<RwLock<SchedulerConfig>>,
    ticker: Arc<StdMutex<Option<Ticker>>>,
}

impl BackgroundScheduler {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_config(db, SchedulerConfig::default())
    }

    pub fn with_config(db: Arc<Database>, config: SchedulerConfig) -> Self {
        Self {
            db,
            config: Arc::new(RwLock::new(config)),
            ticker: Arc::new(StdMutex::new(None)),
        }
    }

    /// Replace the in-memory schedule with the persisted one, if any
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        if let Some(saved) = self.db.get_setting::<SchedulerConfig>(SETTINGS_KEY)? {
            log::debug!("Loaded sync schedule: every {} minutes", saved.interval_minutes);
            *self.config.write().await = saved;
        }
        Ok(())
    }

    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let snapshot = self.get_config().await;
        self.db.set_setting(SETTINGS_KEY, &snapshot)?;
        Ok(())
    }

    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|ticker| !ticker.handle.is_finished())
    }

    /// Begin ticking `signal` at the configured interval
    pub async fn start(&self, signal: SyncSignal) -> Result<(), SchedulerError> {
        let interval_minutes = self.config.read().await.interval_minutes;
        check_interval(interval_minutes)?;

        let mut slot = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|ticker| !ticker.handle.is_finished()) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let stop = CancellationToken::new();
        let period = Duration::from_secs(60 * u64::from(interval_minutes));
        let handle = tokio::spawn(tick_loop(
            Arc::clone(&self.db),
            Arc::clone(&self.config),
            signal,
            period,
            stop.clone(),
        ));
        *slot = Some(Ticker { stop, handle });

        log::info!("Periodic sync every {} minutes", interval_minutes);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SchedulerError::NotRunning)?;

        ticker.stop.cancel();
        if let Err(e) = ticker.handle.await {
            log::warn!("Periodic sync task ended abnormally: {}", e);
        }

        log::info!("Periodic sync stopped");
        Ok(())
    }

    /// Persist a new schedule and apply it: restarts the ticker when enabled,
    /// leaves it stopped otherwise
    pub async fn update_config(
        &self,
        enabled: bool,
        interval_minutes: u32,
        signal: SyncSignal,
    ) -> Result<(), SchedulerError> {
        check_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }
        self.save_config().await?;

        if self.is_running() {
            self.stop().await?;
        }
        if enabled {
            self.start(signal).await?;
        }

        log::info!(
            "Sync schedule changed: enabled={}, every {} minutes",
            enabled,
            interval_minutes
        );
        Ok(())
    }
}

fn check_interval(interval_minutes: u32) -> Result<(), SchedulerError> {
    if (MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
        return Ok(());
    }
    Err(SchedulerError::InvalidInterval(format!(
        "expected {}-{} minutes, got {}",
        MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES, interval_minutes
    )))
}

async fn tick_loop(
    db: Arc<Database>,
    config: Arc<RwLock<SchedulerConfig>>,
    signal: SyncSignal,
    period: Duration,
    stop: CancellationToken,
) {
    // First tick is due one full period from now; startup sync is separate
    let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticks.tick() => {}
        }

        log::debug!("Periodic sync tick");
        signal.notify(SyncTrigger::PeriodicTick);

        let snapshot = {
            let mut current = config.write().await;
            current.last_run = Some(Utc::now().to_rfc3339());
            current.clone()
        };
        if let Err(e) = db.set_setting(SETTINGS_KEY, &snapshot) {
            log::warn!("Could not record last periodic sync: {}", e);
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Settings error: {0}")]
    Settings(#[from] DbError),

    #[error("Periodic sync already running")]
    AlreadyRunning,

    #[error("Periodic sync not running")]
    NotRunning,

    #[error("Invalid sync interval: {0}")]
    InvalidInterval(String),
}

// ============================================================================
// Tests
// ============================================================================
