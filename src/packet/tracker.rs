// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashSet;

use tokio::time::Instant;

const WINDOW_SECONDS: u64 = 60;

/// Sliding 60-second memory of `(cmd, seq)` pairs, used to drop re-delivered
/// frames on the receiving side.
///
/// One `Vec` bucket per second plus a single hash set gives an O(1)
/// membership test; expired buckets are flushed lazily on the next
/// observation. Not safe for concurrent mutation — each owner drives it from
/// its own event loop.
pub struct RecentPacketTracker {
    seen: HashSet<u64>,
    buckets: [Vec<u64>; WINDOW_SECONDS as usize],
    first_tick: u64,
    first_index: usize,
    anchored: bool,
    epoch: Instant,
}

impl RecentPacketTracker {
    pub fn new() -> Self {
        Self {
            seen: HashSet::new(),
            buckets: std::array::from_fn(|_| Vec::new()),
            first_tick: 0,
            first_index: 0,
            anchored: false,
            epoch: Instant::now(),
        }
    }

    /// Record an arrival at the current instant. Returns `true` when the pair
    /// was already observed within the window.
    pub fn observe(&mut self, cmd: u32, seq: u32) -> bool {
        let now = self.epoch.elapsed().as_secs();
        self.observe_at(cmd, seq, now)
    }

    /// Clock-injected core of [`observe`](Self::observe); `now` is a monotone
    /// seconds counter supplied by the caller.
    pub fn observe_at(&mut self, cmd: u32, seq: u32, now: u64) -> bool {
        if !self.anchored {
            self.first_tick = now;
            self.anchored = true;
        }

        // Flush buckets that fell out of the window before testing membership.
        let mut offset = now.saturating_sub(self.first_tick);
        if offset >= WINDOW_SECONDS {
            let span = offset + 1 - WINDOW_SECONDS;
            for i in 0..span.min(WINDOW_SECONDS) {
                let index = (self.first_index + i as usize) % WINDOW_SECONDS as usize;
                for id in self.buckets[index].drain(..) {
                    self.seen.remove(&id);
                }
            }
            self.first_index = (self.first_index + (span % WINDOW_SECONDS) as usize)
                % WINDOW_SECONDS as usize;
            self.first_tick = now - (WINDOW_SECONDS - 1);
            offset = WINDOW_SECONDS - 1;
        }

        let id = Self::packet_id(cmd, seq);
        if !self.seen.insert(id) {
            // duplicate; its expiry stays anchored to the first sighting
            return true;
        }

        self.buckets[(self.first_index + offset as usize) % WINDOW_SECONDS as usize]
            .push(id);
        false
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.first_tick = 0;
        self.first_index = 0;
        self.anchored = false;
    }

    fn packet_id(cmd: u32, seq: u32) -> u64 {
        (u64::from(cmd) << 32) | u64::from(seq)
    }
}

impl Default for RecentPacketTracker {
    fn default() -> Self {
        Self::new()
    }
}
