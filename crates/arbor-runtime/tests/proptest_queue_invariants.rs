//! Property-based invariants for task queue ordering and lifecycle.
//!
//! Random workloads must preserve:
//!
//! 1. Execution order is priority order (lower number first), FIFO within a
//!    bucket, regardless of insertion interleaving.
//! 2. Pause/resume interleavings never lose or duplicate a task: once the
//!    queue is resumed and drained, every task ran exactly once.

use std::cell::RefCell;
use std::rc::Rc;

use arbor_runtime::{LabClock, QueueOptions, Scheduler};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn tasks_drain_in_priority_then_fifo_order(priorities in proptest::collection::vec(0i32..4, 1..40)) {
        let clock = LabClock::new();
        let sched = Scheduler::lab(&clock);
        let queue = sched.create_queue("work", QueueOptions::default());
        let log: Rc<RefCell<Vec<(i32, usize)>>> = Rc::new(RefCell::new(Vec::new()));

        for (seq, &priority) in priorities.iter().enumerate() {
            let log = Rc::clone(&log);
            queue
                .add_with_priority(
                    move |_| {
                        log.borrow_mut().push((priority, seq));
                        Ok(())
                    },
                    priority,
                )
                .unwrap();
        }
        sched.run_until_idle();

        let ran = log.borrow();
        prop_assert_eq!(ran.len(), priorities.len());
        let mut expected: Vec<(i32, usize)> = ran.clone();
        expected.sort_by_key(|&(priority, seq)| (priority, seq));
        prop_assert_eq!(&*ran, &expected);
    }

    #[test]
    fn pause_resume_never_loses_or_duplicates(ops in proptest::collection::vec(0u8..4, 1..60)) {
        let clock = LabClock::new();
        let sched = Scheduler::lab(&clock);
        let queue = sched.create_queue("work", QueueOptions::default());
        let ran: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
        let mut added = 0usize;

        for op in ops {
            match op {
                0 | 1 => {
                    let ran = Rc::clone(&ran);
                    let seq = added;
                    queue
                        .add(move |_| {
                            ran.borrow_mut().push(seq);
                            Ok(())
                        })
                        .unwrap();
                    added += 1;
                }
                2 => queue.pause(),
                _ => {
                    queue.resume();
                    sched.tick();
                }
            }
        }
        queue.resume();
        sched.run_until_idle();

        let ran = ran.borrow();
        prop_assert_eq!(ran.len(), added, "every task runs exactly once");
        let mut sorted = ran.clone();
        sorted.sort_unstable();
        sorted.dedup();
        prop_assert_eq!(sorted.len(), added, "no duplicates");
    }
}
