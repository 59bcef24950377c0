//! PID subscription filtering
//!
//! There is no central routing table. Every output stream carries its own
//! [`PidFilter`] and the ingest path asks each one whether it wants a packet,
//! so routing stays O(1) per packet per stream with no shared lock.

use crate::packet::{packet_pid, PidMap, PAT_PID};

/// Subscription set for one output stream
#[derive(Debug, Clone, Default)]
pub struct PidFilter {
    pids: PidMap,
}

impl PidFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a filter subscribed to `pids`
    pub fn with_pids(pids: &PidMap) -> Self {
        Self { pids: pids.clone() }
    }

    /// Routing decision for one packet
    ///
    /// The PAT is always wanted: every consumer needs it to find programs.
    pub fn want(&self, packet: &[u8]) -> bool {
        match packet_pid(packet) {
            Some(PAT_PID) => true,
            Some(pid) => self.pids.contains_key(&pid),
            None => false,
        }
    }

    /// Merge `pids` into the subscription set
    pub fn set_pids(&mut self, pids: &PidMap) {
        for (&pid, &kind) in pids {
            self.pids.insert(pid, kind);
        }
    }

    /// Drop every subscription (the PAT still passes)
    pub fn reset_pids(&mut self) {
        self.pids.clear();
    }

    /// Merge this filter's subscriptions into `out`
    pub fn get_pids(&self, out: &mut PidMap) {
        for (&pid, &kind) in &self.pids {
            out.insert(pid, kind);
        }
    }

    pub fn pids(&self) -> &PidMap {
        &self.pids
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}
