//! Background loops: periodic refresh and periodic persist.
//!
//! Both loops run until the shared [`Shutdown`] signal fires. The first tick
//! of each loop happens one full interval after start.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use super::{Engine, PersistOutcome};
use crate::storage::{PersistError, StateStore};

/// Default refresh interval (12 hours).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Default persist interval.
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(15);

/// Sending half of the stop signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving half of the stop signal; clone one per loop.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires or the trigger is dropped.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

/// Refresh every source each `every`, until shutdown.
///
/// A pass in progress is abandoned when shutdown fires; merges already
/// applied stay applied.
pub async fn run_refresh_loop<S: StateStore>(
    engine: Arc<Engine<S>>,
    every: Duration,
    mut shutdown: Shutdown,
) {
    tracing::info!(interval_secs = every.as_secs(), "Refresh loop started");
    let mut timer = interval_at(Instant::now() + every, every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = timer.tick() => {
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    _ = engine.refresh_all() => {}
                }
            }
        }
    }
    tracing::info!("Refresh loop stopped");
}

/// Persist the state each `every` when dirty, until shutdown.
///
/// # Arguments
///
/// * `engine` - Engine whose state is written through its store
/// * `every` - Period between persist cycles; the first cycle runs one period after start
/// * `shutdown` - Stop signal shared with the refresh loop
///
/// # Returns
///
/// `Ok(())` once shutdown fired and the final persist was attempted.
///
/// # Errors
///
/// Returns [`PersistError::Encode`] as soon as the state cannot be
/// serialized. Write failures never end the loop: they are logged and the
/// still-dirty state is retried on the next tick.
pub async fn run_persist_loop<S: StateStore>(
    engine: Arc<Engine<S>>,
    every: Duration,
    mut shutdown: Shutdown,
) -> Result<(), PersistError> {
    tracing::info!(interval_secs = every.as_secs(), "Persist loop started");
    let mut timer = interval_at(Instant::now() + every, every);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = timer.tick() => persist_once(&engine).await?,
        }
    }

    persist_once(&engine).await?;
    tracing::info!("Persist loop stopped");
    Ok(())
}

async fn persist_once<S: StateStore>(engine: &Engine<S>) -> Result<(), PersistError> {
    match engine.persist().await {
        Ok(PersistOutcome::Clean) => {}
        Ok(outcome) => tracing::info!(?outcome, "Writing state"),
        Err(e) if e.is_retryable() => {
            tracing::warn!(error = %e, "Failed to persist state, will retry");
        }
        Err(e) => {
            tracing::error!(error = %e, "Cannot encode state");
            return Err(e);
        }
    }
    Ok(())
}

/// Handles of the two spawned loops.
pub struct Scheduler {
    pub refresh: JoinHandle<()>,
    pub persist: JoinHandle<Result<(), PersistError>>,
}

impl Scheduler {
    /// Spawn both loops on the current runtime.
    pub fn spawn<S: StateStore>(
        engine: Arc<Engine<S>>,
        refresh_every: Duration,
        persist_every: Duration,
        shutdown: Shutdown,
    ) -> Self {
        let refresh = tokio::spawn(run_refresh_loop(
            Arc::clone(&engine),
            refresh_every,
            shutdown.clone(),
        ));
        let persist = tokio::spawn(run_persist_loop(engine, persist_every, shutdown));
        Self { refresh, persist }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::feed::{FetchPolicy, Fetcher};
    use crate::storage::{MemoryStore, State};

    fn engine() -> Arc<Engine<MemoryStore>> {
        Arc::new(Engine::new(
            State::default(),
            Arc::new(MemoryStore::new()),
            Fetcher::new(FetchPolicy::default()).unwrap(),
            EngineOptions::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_loop_writes_only_when_dirty() {
        let engine = engine();
        let (trigger, shutdown) = shutdown_channel();
        let every = Duration::from_secs(15);
        let handle = tokio::spawn(run_persist_loop(Arc::clone(&engine), every, shutdown));

        engine.mark_read("http://example.com/1").await;
        tokio::time::sleep(every + Duration::from_secs(1)).await;
        assert_eq!(engine.store().write_count(), 1);
        assert!(!engine.shared().is_dirty().await);

        // No mutation: later cycles write nothing
        tokio::time::sleep(every * 4).await;
        assert_eq!(engine.store().write_count(), 1);

        trigger.trigger();
        handle.await.unwrap().unwrap();
        assert_eq!(engine.store().write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_loop_retries_failed_write() {
        let engine = engine();
        let (trigger, shutdown) = shutdown_channel();
        let every = Duration::from_secs(15);
        let handle = tokio::spawn(run_persist_loop(Arc::clone(&engine), every, shutdown));

        engine.store().set_fail_writes(true);
        engine.mark_read("http://example.com/1").await;
        tokio::time::sleep(every * 2 + Duration::from_secs(1)).await;
        assert_eq!(engine.store().write_count(), 0);
        assert!(engine.shared().is_dirty().await);

        engine.store().set_fail_writes(false);
        tokio::time::sleep(every).await;
        assert_eq!(engine.store().write_count(), 1);
        assert!(!engine.shared().is_dirty().await);

        trigger.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_loop_flushes_on_shutdown() {
        let engine = engine();
        let (trigger, shutdown) = shutdown_channel();
        let handle = tokio::spawn(run_persist_loop(
            Arc::clone(&engine),
            Duration::from_secs(3600),
            shutdown,
        ));

        engine.mark_read("http://example.com/1").await;
        trigger.trigger();
        handle.await.unwrap().unwrap();
        assert_eq!(engine.store().write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_marks_dirty_after_pass() {
        let engine = engine();
        let (trigger, shutdown) = shutdown_channel();
        let every = Duration::from_secs(60);
        let handle = tokio::spawn(run_refresh_loop(Arc::clone(&engine), every, shutdown));

        assert!(!engine.shared().is_dirty().await);
        tokio::time::sleep(every + Duration::from_secs(1)).await;
        // Empty state: the pass finds nothing but still marks dirty
        assert!(engine.shared().is_dirty().await);

        trigger.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let (trigger, mut shutdown) = shutdown_channel();
        assert!(!shutdown.is_triggered());
        trigger.trigger();
        shutdown.wait().await;
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_trigger_releases_waiters() {
        let (trigger, mut shutdown) = shutdown_channel();
        drop(trigger);
        shutdown.wait().await;
    }
}
