// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Named one-shot and periodic tasks for the event loops in this crate.
///
/// `start_timer`/`stop_timer` may be called from any thread; each timer runs
/// as its own tokio task, so the closure typically just posts a tick command
/// onto the owning actor's channel. Ids are handed out from 1; 0 means "no
/// timer" and is never allocated.
pub struct TimerService {
    timers: Arc<DashMap<u32, CancellationToken>>,
    cur_timer_id: AtomicU32,
}

impl TimerService {
    pub fn new() -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            cur_timer_id: AtomicU32::new(0),
        }
    }

    /// Schedule `task` after `delay_seconds`, then every `interval_seconds`.
    /// An interval of 0 makes the timer one-shot.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_timer(
        &self,
        task: impl Fn() + Send + Sync + 'static,
        delay_seconds: u32,
        interval_seconds: u32,
    ) -> u32 {
        let timer_id = self
            .cur_timer_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);

        let token = CancellationToken::new();
        self.timers.insert(timer_id, token.clone());

        let timers = Arc::clone(&self.timers);
        tokio::spawn(async move {
            let mut wait = delay_seconds;
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep(Duration::from_secs(u64::from(wait))) => {}
                }

                task();

                if interval_seconds == 0 {
                    timers.remove(&timer_id);
                    return;
                }
                wait = interval_seconds;
            }
        });

        timer_id
    }

    /// Cancel a timer. Unknown ids (including already-fired one-shots) are a
    /// no-op.
    pub fn stop_timer(&self, timer_id: u32) {
        if let Some((_, token)) = self.timers.remove(&timer_id) {
            token.cancel();
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}
