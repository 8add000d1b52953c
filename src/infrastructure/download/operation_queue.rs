//! Admission control for download operations.

use std::collections::VecDeque;

/// Identifier of one download operation.
pub type OperationId = u64;

/// Waiting lane of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Requests someone is waiting on.
    Normal,
    /// Speculative requests; only admitted when the normal lane is empty.
    Preload,
}

/// Bounds how many operations run at once. Operations over the bound wait in
/// one of two FIFO lanes; a freed slot goes to the normal lane first.
#[derive(Debug)]
pub struct OperationQueue {
    max_running: usize,
    running: usize,
    normal: VecDeque<OperationId>,
    preload: VecDeque<OperationId>,
}

impl OperationQueue {
    /// Creates a queue admitting up to `max_running` operations.
    #[must_use]
    pub fn new(max_running: usize) -> Self {
        Self {
            max_running: max_running.max(1),
            running: 0,
            normal: VecDeque::new(),
            preload: VecDeque::new(),
        }
    }

    /// Offers `id`. Returns true if it may start now; otherwise it waits in `lane`.
    pub fn add(&mut self, id: OperationId, lane: Lane) -> bool {
        if self.running < self.max_running {
            self.running += 1;
            return true;
        }
        match lane {
            Lane::Normal => self.normal.push_back(id),
            Lane::Preload => self.preload.push_back(id),
        }
        false
    }

    /// Retires `id`. A waiting operation just leaves its lane. A running one
    /// frees its slot, which passes to the next waiting operation, if any;
    /// that operation's id is returned and it must be started by the caller.
    pub fn remove(&mut self, id: OperationId) -> Option<OperationId> {
        if Self::take(&mut self.normal, id) || Self::take(&mut self.preload, id) {
            return None;
        }
        self.running = self.running.saturating_sub(1);
        self.admit_one()
    }

    /// Moves a waiting preload operation to the back of the normal lane.
    /// Returns false if `id` was not waiting in the preload lane.
    pub fn upgrade_preload(&mut self, id: OperationId) -> bool {
        if Self::take(&mut self.preload, id) {
            self.normal.push_back(id);
            true
        } else {
            false
        }
    }

    /// Changes the bound and returns the operations admitted by raising it.
    pub fn set_max_running(&mut self, max_running: usize) -> Vec<OperationId> {
        self.max_running = max_running.max(1);
        let mut admitted = Vec::new();
        while self.running < self.max_running {
            match self.admit_one() {
                Some(id) => admitted.push(id),
                None => break,
            }
        }
        admitted
    }

    /// Current bound.
    #[must_use]
    pub const fn max_running(&self) -> usize {
        self.max_running
    }

    /// Operations holding a slot.
    #[must_use]
    pub const fn running_count(&self) -> usize {
        self.running
    }

    /// Operations waiting in either lane.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.normal.len() + self.preload.len()
    }

    /// Returns the lane `id` is waiting in.
    #[must_use]
    pub fn waiting_lane(&self, id: OperationId) -> Option<Lane> {
        if self.normal.contains(&id) {
            Some(Lane::Normal)
        } else if self.preload.contains(&id) {
            Some(Lane::Preload)
        } else {
            None
        }
    }

    fn admit_one(&mut self) -> Option<OperationId> {
        let next = self.normal.pop_front().or_else(|| self.preload.pop_front())?;
        self.running += 1;
        Some(next)
    }

    fn take(lane: &mut VecDeque<OperationId>, id: OperationId) -> bool {
        match lane.iter().position(|queued| *queued == id) {
            Some(index) => {
                lane.remove(index);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn full_queue() -> OperationQueue {
        let mut queue = OperationQueue::new(1);
        assert!(queue.add(1, Lane::Normal));
        assert!(!queue.add(2, Lane::Preload));
        assert!(!queue.add(3, Lane::Normal));
        assert!(!queue.add(4, Lane::Preload));
        queue
    }

    #[test]
    fn test_admits_up_to_bound() {
        let mut queue = OperationQueue::new(2);
        assert!(queue.add(1, Lane::Preload));
        assert!(queue.add(2, Lane::Normal));
        assert!(!queue.add(3, Lane::Normal));
        assert_eq!(queue.running_count(), 2);
        assert_eq!(queue.waiting_count(), 1);
    }

    #[test]
    fn test_normal_lane_drains_first() {
        let mut queue = full_queue();
        assert_eq!(queue.remove(1), Some(3));
        assert_eq!(queue.remove(3), Some(2));
        assert_eq!(queue.remove(2), Some(4));
        assert_eq!(queue.remove(4), None);
        assert_eq!(queue.running_count(), 0);
    }

    #[test_case(2, Some(Lane::Preload) ; "preload_waiter")]
    #[test_case(3, Some(Lane::Normal) ; "normal_waiter")]
    #[test_case(1, None ; "running")]
    fn test_waiting_lane(id: OperationId, lane: Option<Lane>) {
        assert_eq!(full_queue().waiting_lane(id), lane);
    }

    #[test]
    fn test_removing_waiter_keeps_slot() {
        let mut queue = full_queue();
        assert_eq!(queue.remove(3), None);
        assert_eq!(queue.running_count(), 1);
        assert_eq!(queue.waiting_count(), 2);
        assert_eq!(queue.remove(1), Some(2));
    }

    #[test]
    fn test_upgrade_moves_preload_behind_normal() {
        let mut queue = full_queue();
        assert!(queue.upgrade_preload(4));
        assert!(!queue.upgrade_preload(4));
        assert!(!queue.upgrade_preload(1));
        assert_eq!(queue.waiting_lane(4), Some(Lane::Normal));

        assert_eq!(queue.remove(1), Some(3));
        assert_eq!(queue.remove(3), Some(4));
        assert_eq!(queue.remove(4), Some(2));
    }

    #[test]
    fn test_raising_bound_admits_waiters() {
        let mut queue = full_queue();
        assert_eq!(queue.set_max_running(3), vec![3, 2]);
        assert_eq!(queue.running_count(), 3);

        assert!(queue.set_max_running(0).is_empty());
        assert_eq!(queue.max_running(), 1);
    }
}
