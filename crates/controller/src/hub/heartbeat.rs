//! Heartbeat bookkeeping.
//!
//! Every period the hub publishes the current beat number on the ping socket
//! and engines echo it back on the pong ROUTER. A heart that misses
//! `max_missed` consecutive beats is reported as failed and forgotten.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

/// How a pong was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pong {
    /// First pong from this ident.
    New,
    Beat,
    /// Echo of a beat older than the previous one, or garbage.
    Stale,
}

#[derive(Debug)]
pub struct HeartMonitor {
    max_missed: u32,
    beat: u64,
    missed: HashMap<Vec<u8>, u32>,
    responded: HashSet<Vec<u8>>,
}

impl HeartMonitor {
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed: max_missed.max(1),
            beat: 0,
            missed: HashMap::new(),
            responded: HashSet::new(),
        }
    }

    pub fn current_beat(&self) -> u64 {
        self.beat
    }

    pub fn heart_count(&self) -> usize {
        self.missed.len()
    }

    pub fn is_beating(&self, ident: &[u8]) -> bool {
        self.missed.contains_key(ident)
    }

    /// Close the current round and start the next one.
    ///
    /// Returns the ping payload to publish and the hearts that just failed.
    pub fn beat(&mut self) -> (Vec<u8>, Vec<Vec<u8>>) {
        let mut failed = Vec::new();
        for (ident, missed) in self.missed.iter_mut() {
            if self.responded.contains(ident) {
                *missed = 0;
            } else {
                *missed += 1;
                if *missed >= self.max_missed {
                    failed.push(ident.clone());
                }
            }
        }
        for ident in &failed {
            warn!(ident = %String::from_utf8_lossy(ident), missed = self.max_missed, "heart failed");
            self.missed.remove(ident);
        }
        self.responded.clear();
        self.beat += 1;
        (encode_beat(self.beat), failed)
    }

    /// Record a pong; the current and the previous beat both count.
    pub fn pong(&mut self, ident: &[u8], payload: &[u8]) -> Pong {
        let Some(beat) = decode_beat(payload) else {
            return Pong::Stale;
        };
        if beat != self.beat && beat + 1 != self.beat {
            debug!(ident = %String::from_utf8_lossy(ident), beat, current = self.beat, "stale pong");
            return Pong::Stale;
        }
        self.responded.insert(ident.to_vec());
        if self.missed.contains_key(ident) {
            Pong::Beat
        } else {
            self.missed.insert(ident.to_vec(), 0);
            Pong::New
        }
    }

    /// Stop tracking a heart, e.g. after an explicit unregistration.
    pub fn forget(&mut self, ident: &[u8]) {
        self.missed.remove(ident);
        self.responded.remove(ident);
    }
}

pub fn encode_beat(beat: u64) -> Vec<u8> {
    beat.to_string().into_bytes()
}

pub fn decode_beat(payload: &[u8]) -> Option<u64> {
    std::str::from_utf8(payload).ok()?.trim().parse().ok()
}
