//! Puffer für zu früh eintreffende ICE Candidates
//!
//! Candidates der Gegenseite entstehen, sobald dort die Local Description
//! gesetzt ist, und können das Offer/Answer überholen. Bis die Remote
//! Description angewendet ist, werden sie hier in Ankunftsreihenfolge
//! gesammelt.

use crate::signaling::IceCandidate;

#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push(candidate);
    }

    /// Gibt alle gepufferten Candidates in Ankunftsreihenfolge zurück, sobald
    /// eine Remote Description existiert; sonst nichts.
    pub fn drain_if_ready(&mut self, has_remote_description: bool) -> Vec<IceCandidate> {
        if !has_remote_description {
            return Vec::new();
        }
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
