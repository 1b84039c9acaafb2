//! Per-agent process lineages rebuilt from the event log.

use crate::trace::event::{EventType, KernelEvent};
use std::collections::{BTreeMap, HashMap};

/// Agent id -> pids in join order. A pid belongs to at most one agent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessGenealogy {
    lineages: BTreeMap<u32, Vec<u32>>,
    owners: HashMap<u32, u32>,
}

impl ProcessGenealogy {
    /// Seed with `(agent id, root pid)` and grow from Exec events.
    ///
    /// Events are streamed in log order; passes repeat until nothing new
    /// joins, so a child logged before its parent is still placed.
    pub fn build(roots: &[(u32, u32)], events: &[KernelEvent]) -> Self {
        let mut genealogy = Self::default();
        for &(agent, pid) in roots {
            genealogy.lineages.entry(agent).or_default();
            genealogy.join(agent, pid);
        }

        let execs: Vec<&KernelEvent> = events
            .iter()
            .filter(|e| e.event_type == EventType::Exec)
            .collect();
        loop {
            let mut grew = false;
            for event in &execs {
                if genealogy.owners.contains_key(&event.pid) {
                    continue;
                }
                if let Some(&agent) = genealogy.owners.get(&event.ppid) {
                    genealogy.join(agent, event.pid);
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        genealogy
    }

    fn join(&mut self, agent: u32, pid: u32) {
        if self.owners.contains_key(&pid) {
            return;
        }
        self.owners.insert(pid, agent);
        self.lineages.entry(agent).or_default().push(pid);
    }

    pub fn pids(&self, agent: u32) -> &[u32] {
        self.lineages.get(&agent).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn owner_of(&self, pid: u32) -> Option<u32> {
        self.owners.get(&pid).copied()
    }

    pub fn agents(&self) -> impl Iterator<Item = u32> + '_ {
        self.lineages.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(pid: u32, ppid: u32) -> KernelEvent {
        KernelEvent::exec("t".into(), pid, ppid, 1000, "python3")
    }

    #[test]
    fn descendants_join_through_any_depth() {
        let events = vec![exec(101, 100), exec(102, 101), exec(201, 200), exec(103, 102)];
        let g = ProcessGenealogy::build(&[(0, 100), (1, 200)], &events);
        assert_eq!(g.pids(0), &[100, 101, 102, 103]);
        assert_eq!(g.pids(1), &[200, 201]);
        assert_eq!(g.owner_of(103), Some(0));
        assert_eq!(g.owner_of(999), None);
    }

    #[test]
    fn re_exec_does_not_duplicate_and_first_writer_wins() {
        // 101 execs twice (sh then python). 300 claims parent 101 then 201.
        let events = vec![exec(101, 100), exec(101, 100), exec(201, 200), exec(300, 101), exec(300, 201)];
        let g = ProcessGenealogy::build(&[(0, 100), (1, 200)], &events);
        assert_eq!(g.pids(0), &[100, 101, 300]);
        assert_eq!(g.pids(1), &[200, 201]);
    }

    #[test]
    fn child_logged_before_parent_is_still_placed() {
        let events = vec![exec(102, 101), exec(101, 100)];
        let g = ProcessGenealogy::build(&[(0, 100)], &events);
        assert_eq!(g.pids(0), &[100, 101, 102]);
    }

    #[test]
    fn non_exec_events_are_ignored() {
        let events = vec![
            KernelEvent::exit("t".into(), 101, 100, 1000, "sh"),
            KernelEvent::kill("t".into(), 101, 100, 1000, "sh", 200, Some(9)),
        ];
        let g = ProcessGenealogy::build(&[(0, 100)], &events);
        assert_eq!(g.pids(0), &[100]);
        assert_eq!(g.agents().collect::<Vec<_>>(), vec![0]);
    }
}
