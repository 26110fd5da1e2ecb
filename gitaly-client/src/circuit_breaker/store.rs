//! Sliding-window circuit state kept in a moka cache.
//!
//! Every breaker for the same key shares one window. Idle windows expire
//! after `time_window + sleep_window`, which also resets circuits nobody
//! calls anymore.

use super::{CircuitKey, CircuitOptions, CircuitState, CircuitStore, StateChange, StoreError};
use async_trait::async_trait;
use moka::sync::Cache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const MAX_CIRCUITS: u64 = 10_000;

#[derive(Debug)]
struct Window {
    started_at: Instant,
    opened_at: Option<Instant>,
    failures: u32,
    successes: u32,
}

impl Window {
    fn new(now: Instant) -> Self {
        Window {
            started_at: now,
            opened_at: None,
            failures: 0,
            successes: 0,
        }
    }

    fn state(&self) -> CircuitState {
        if self.opened_at.is_some() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Closes the circuit once the sleep window has passed and starts a new
    /// window once the time window has passed.
    fn refresh(&mut self, now: Instant, options: &CircuitOptions) {
        match self.opened_at {
            Some(opened_at) if now >= opened_at + options.sleep_window => {
                tracing::debug!("circuit sleep window elapsed");
                *self = Window::new(now);
            }
            Some(_) => {}
            None if now >= self.started_at + options.time_window => {
                *self = Window::new(now);
            }
            None => {}
        }
    }

    fn should_trip(&self, options: &CircuitOptions) -> bool {
        let total = self.failures + self.successes;
        if total < options.volume_threshold {
            return false;
        }

        u64::from(self.failures) * 100
            >= u64::from(options.error_threshold_percentage) * u64::from(total)
    }
}

pub struct MemoryCircuitStore {
    windows: Cache<CircuitKey, Arc<Mutex<Window>>>,
}

impl MemoryCircuitStore {
    pub fn new(options: &CircuitOptions) -> Self {
        let windows = Cache::builder()
            .max_capacity(MAX_CIRCUITS)
            .time_to_idle(idle_ttl(options))
            .build();

        MemoryCircuitStore { windows }
    }

    fn window(&self, key: &CircuitKey) -> Arc<Mutex<Window>> {
        self.windows
            .get_with(key.clone(), || Arc::new(Mutex::new(Window::new(Instant::now()))))
    }

    fn update<F>(&self, key: &CircuitKey, options: &CircuitOptions, f: F) -> StateChange
    where
        F: FnOnce(&mut Window, Instant),
    {
        let window = self.window(key);
        let mut window = window.lock();
        let now = Instant::now();

        window.refresh(now, options);
        let before = window.state();
        f(&mut window, now);

        StateChange {
            before,
            after: window.state(),
        }
    }
}

fn idle_ttl(options: &CircuitOptions) -> Duration {
    options.time_window + options.sleep_window
}

#[async_trait]
impl CircuitStore for MemoryCircuitStore {
    async fn state(
        &self,
        key: &CircuitKey,
        options: &CircuitOptions,
    ) -> Result<CircuitState, StoreError> {
        let Some(window) = self.windows.get(key) else {
            return Ok(CircuitState::Closed);
        };

        let mut window = window.lock();
        window.refresh(Instant::now(), options);
        Ok(window.state())
    }

    async fn record_success(
        &self,
        key: &CircuitKey,
        options: &CircuitOptions,
    ) -> Result<StateChange, StoreError> {
        Ok(self.update(key, options, |window, _| {
            if window.opened_at.is_none() {
                window.successes += 1;
            }
        }))
    }

    async fn record_failure(
        &self,
        key: &CircuitKey,
        options: &CircuitOptions,
    ) -> Result<StateChange, StoreError> {
        Ok(self.update(key, options, |window, now| {
            if window.opened_at.is_some() {
                return;
            }

            window.failures += 1;
            if window.should_trip(options) {
                window.opened_at = Some(now);
            }
        }))
    }
}
