//! Sticky initiator voting (C7, §4.7): keeps the elected initiator stable
//! across ordering differences in membership observation.

use std::collections::HashMap;
use std::time::Duration;

/// How often a node re-broadcasts its pick, independent of membership churn (§4.7).
pub const SYNC_INTERVAL: Duration = Duration::from_secs(10);

pub struct InitiatorVoter {
    own_node_id: String,
    reported: HashMap<String, String>,
    adopted: Option<String>,
}

impl InitiatorVoter {
    pub fn new(own_node_id: String) -> Self {
        Self {
            own_node_id,
            reported: HashMap::new(),
            adopted: None,
        }
    }

    pub fn current_pick(&self) -> Option<&str> {
        self.adopted.as_deref()
    }

    /// Record a report from `reporter` naming `pick` as its initiator choice (§4.7).
    pub fn record_report(&mut self, reporter: String, pick: String) {
        self.reported.insert(reporter, pick);
    }

    /// If the previously adopted initiator departs, clear the local pick to
    /// force re-election (§4.7).
    pub fn on_node_unavailable(&mut self, node_id: &str) {
        self.reported.remove(node_id);
        if self.adopted.as_deref() == Some(node_id) {
            self.adopted = None;
        }
    }

    /// Re-derive the adopted initiator from the current tally: the most
    /// popular reported value, if it names a currently-known node; otherwise
    /// the lexicographically smallest known node id. Ties in popularity are
    /// broken by smaller node id (§4.7).
    pub fn re_elect(&mut self, known_node_ids: &[String]) -> String {
        let mut own_reports = self.reported.clone();
        own_reports.insert(self.own_node_id.clone(), self.own_node_id.clone());

        let mut tally: HashMap<&str, usize> = HashMap::new();
        for pick in own_reports.values() {
            *tally.entry(pick.as_str()).or_insert(0) += 1;
        }

        let mut ranked: Vec<(&str, usize)> = tally.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let winner = ranked
            .into_iter()
            .find(|(candidate, _)| known_node_ids.iter().any(|id| id == candidate))
            .map(|(candidate, _)| candidate.to_string())
            .unwrap_or_else(|| {
                let mut known = known_node_ids.to_vec();
                known.sort();
                known.first().cloned().unwrap_or_else(|| self.own_node_id.clone())
            });

        self.adopted = Some(winner.clone());
        winner
    }

    pub fn is_initiator(&self) -> bool {
        self.adopted.as_deref() == Some(self.own_node_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adopts_most_popular_report() {
        let mut voter = InitiatorVoter::new("a".into());
        voter.record_report("b".into(), "c".into());
        voter.record_report("c".into(), "c".into());
        let winner = voter.re_elect(&["a".into(), "b".into(), "c".into()]);
        assert_eq!(winner, "c");
    }

    #[test]
    fn ties_break_lexicographically() {
        let mut voter = InitiatorVoter::new("z".into());
        voter.record_report("a".into(), "a".into());
        voter.record_report("b".into(), "b".into());
        let winner = voter.re_elect(&["a".into(), "b".into(), "z".into()]);
        // tally: z->1 (self), a->1, b->1; smallest wins the tie.
        assert_eq!(winner, "a");
    }

    #[test]
    fn falls_back_to_smallest_known_id_when_pick_unknown() {
        let mut voter = InitiatorVoter::new("a".into());
        voter.record_report("b".into(), "ghost".into());
        let winner = voter.re_elect(&["a".into(), "b".into()]);
        assert_eq!(winner, "a");
    }

    #[test]
    fn departure_of_adopted_initiator_clears_pick() {
        let mut voter = InitiatorVoter::new("a".into());
        voter.record_report("b".into(), "b".into());
        voter.record_report("c".into(), "b".into());
        assert_eq!(voter.re_elect(&["a".into(), "b".into(), "c".into()]), "b");
        voter.on_node_unavailable("b");
        assert!(voter.current_pick().is_none());
    }
}
