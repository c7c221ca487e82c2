//! Event sinks for assertions.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use txgate_core::{Event, EventSink};

/// Records every delivered event, optionally after a fixed delay.
pub struct RecordingSink<Ev> {
    events: Mutex<Vec<Ev>>,
    delay: Option<Duration>,
}

impl<Ev: Event> RecordingSink<Ev> {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Sleep for `delay` before recording each event.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            delay: Some(delay),
        }
    }

    pub fn events(&self) -> Vec<Ev> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<Ev: Event> Default for RecordingSink<Ev> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<Ev: Event> EventSink<Ev> for RecordingSink<Ev> {
    async fn deliver(&self, event: Ev) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}

/// Rejects every event, counting attempts.
pub struct FailingSink<Ev> {
    attempts: AtomicUsize,
    _event: PhantomData<fn(Ev)>,
}

impl<Ev: Event> FailingSink<Ev> {
    pub fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            _event: PhantomData,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl<Ev: Event> Default for FailingSink<Ev> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<Ev: Event> EventSink<Ev> for FailingSink<Ev> {
    async fn deliver(&self, event: Ev) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("mail server unavailable, dropped {event:?}"))
    }
}
