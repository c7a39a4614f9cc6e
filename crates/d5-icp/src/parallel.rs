//! The parallel branch-and-prune engine.
//!
//! A fixed pool of workers (the calling thread plus `number_of_jobs - 1`
//! spawned ones) shares a LIFO stack of boxes. `number_of_boxes` counts
//! the work in flight (stacked plus currently processed boxes): it is
//! incremented with Relaxed ordering on push, decremented with AcqRel
//! when a box dies, and read with Acquire in the loop test, so it reaches
//! zero exactly when the search space is exhausted. The first worker to
//! find a δ-box publishes its id in `found_delta_sat` (Release store,
//! Acquire load); every other worker observes it on its next loop check
//! and exits.
//!
//! Workers keep one bisection child and push the other, alternating
//! sides, so each worker explores depth-first while the shared stack
//! feeds idle workers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;

use parking_lot::Mutex;
use tracing::debug;

use d5_interval::IntervalBox;

use d5_contractor::{Config, Contractor, ContractorStatus};

use crate::branch::find_max_diam;
use crate::icp::{evaluate_box, IcpError, IcpResult, IcpStats};
use crate::evaluator::FormulaEvaluator;
use crate::interrupt;

// Shared LIFO of boxes. Pushes and pops are tiny compared to a prune.
struct GlobalStack {
    boxes: Mutex<Vec<IntervalBox>>,
}

impl GlobalStack {
    fn new() -> GlobalStack {
        GlobalStack {
            boxes: Mutex::new(Vec::new()),
        }
    }

    fn push(&self, b: IntervalBox) {
        self.boxes.lock().push(b);
    }

    fn pop(&self) -> Option<IntervalBox> {
        self.boxes.lock().pop()
    }
}

// One bisection round: the first boxes split at their widest dimension,
// as many as fit into the target count; the rest pass through unchanged.
fn double_up(boxes: Vec<IntervalBox>, n: usize) -> Vec<IntervalBox> {
    debug_assert!(boxes.len() <= n);
    let split_budget = n - boxes.len();
    let mut ret = Vec::with_capacity(n);
    for (i, b) in boxes.into_iter().enumerate() {
        if i < split_budget {
            match b.max_diam_dimension().and_then(|(d, _)| b.bisect(d)) {
                Some((l, r)) => {
                    ret.push(l);
                    ret.push(r);
                }
                None => ret.push(b),
            }
        } else {
            ret.push(b);
        }
    }
    ret
}

// Grows {b} to `n` boxes by repeated doubling.
fn fill_up(b: IntervalBox, n: usize) -> Vec<IntervalBox> {
    let mut ret = vec![b];
    while ret.len() < n {
        let before = ret.len();
        ret = double_up(ret, n);
        if ret.len() == before {
            break;
        }
    }
    ret
}

#[allow(clippy::too_many_arguments)]
fn worker(
    contractor: &Contractor,
    config: &Config,
    evaluators: &[FormulaEvaluator],
    id: usize,
    stack: &GlobalStack,
    cs: &mut ContractorStatus,
    found_delta_sat: &AtomicI64,
    number_of_boxes: &AtomicI64,
) -> IcpResult<IcpStats> {
    let mut stats = IcpStats::default();
    let mut stack_left_box_first = config.stack_left_box_first;
    let mut need_to_pop = true;

    while found_delta_sat.load(Ordering::Acquire) == -1
        && number_of_boxes.load(Ordering::Acquire) > 0
    {
        if interrupt::is_interrupted() {
            return Err(IcpError::Cancelled);
        }

        // Get a box from the shared stack unless the last branching left
        // one in hand; spin when the stack is momentarily empty (another
        // worker may still push).
        if need_to_pop {
            match stack.pop() {
                Some(b) => *cs.current_mut() = b,
                None => {
                    thread::yield_now();
                    continue;
                }
            }
        }
        need_to_pop = true;

        contractor.prune(cs);
        stats.num_prune += 1;
        if cs.current().is_empty() {
            number_of_boxes.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        let Some(candidates) = evaluate_box(evaluators, config.precision, cs) else {
            number_of_boxes.fetch_sub(1, Ordering::AcqRel);
            continue;
        };
        if candidates.is_empty() {
            debug!(worker = id, "found a delta-box");
            found_delta_sat.store(id as i64, Ordering::Release);
            return Ok(stats);
        }

        stats.num_branch += 1;
        let branched = find_max_diam(cs.current(), &candidates)
            .and_then(|dim| cs.current().bisect(dim));
        let Some((left, right)) = branched else {
            // Undecided but non-bisectable: a degenerate δ-SAT box.
            debug!(worker = id, "non-bisectable undecided box");
            found_delta_sat.store(id as i64, Ordering::Release);
            return Ok(stats);
        };

        // Push one child, keep the other as the next iteration's box.
        number_of_boxes.fetch_add(1, Ordering::Relaxed);
        if stack_left_box_first {
            stack.push(left);
            *cs.current_mut() = right;
        } else {
            stack.push(right);
            *cs.current_mut() = left;
        }
        stack_left_box_first = !stack_left_box_first;
        need_to_pop = false;
    }
    Ok(stats)
}

/// The parallel ICP engine: a δ-SAT race between workers over a shared
/// box stack.
#[derive(Debug)]
pub struct IcpParallel {
    config: Config,
    stats: IcpStats,
}

impl IcpParallel {
    /// New engine with the given options.
    pub fn new(config: Config) -> IcpParallel {
        IcpParallel {
            config,
            stats: IcpStats::default(),
        }
    }

    /// The engine options.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Counters accumulated across checks, summed over workers.
    pub fn stats(&self) -> IcpStats {
        self.stats
    }

    /// Decide δ-satisfiability of the constraints on the box in `cs`.
    pub fn check_sat(
        &mut self,
        contractor: &Contractor,
        evaluators: &[FormulaEvaluator],
        cs: &mut ContractorStatus,
    ) -> IcpResult<bool> {
        let n_jobs = self.config.number_of_jobs.max(1);
        debug!(jobs = n_jobs, "parallel check_sat");

        // Initial prune on the calling thread.
        contractor.prune(cs);
        self.stats.num_prune += 1;
        if cs.current().is_empty() {
            return Ok(false);
        }

        // Seed the shared stack with up to one box per worker.
        let stack = GlobalStack::new();
        let mut seeded: i64 = 0;
        for b in fill_up(cs.current().clone(), n_jobs) {
            stack.push(b);
            seeded += 1;
        }
        let number_of_boxes = AtomicI64::new(seeded);
        let found_delta_sat = AtomicI64::new(-1);

        let mut statuses: Vec<ContractorStatus> =
            (0..n_jobs).map(|i| cs.clone_for_worker(i)).collect();
        let mut results: Vec<IcpResult<IcpStats>> = Vec::new();

        {
            let (pool_statuses, main_status) = statuses.split_at_mut(n_jobs - 1);
            let main_status = &mut main_status[0];
            let stack_ref = &stack;
            let found_ref = &found_delta_sat;
            let count_ref = &number_of_boxes;
            let config = &self.config;

            let mut pool_results: Vec<IcpResult<IcpStats>> = Vec::new();
            let main_result = thread::scope(|s| {
                let handles: Vec<_> = pool_statuses
                    .iter_mut()
                    .enumerate()
                    .map(|(i, st)| {
                        s.spawn(move || {
                            worker(
                                contractor, config, evaluators, i, stack_ref, st, found_ref,
                                count_ref,
                            )
                        })
                    })
                    .collect();

                let last = n_jobs - 1;
                let main = worker(
                    contractor,
                    config,
                    evaluators,
                    last,
                    stack_ref,
                    main_status,
                    found_ref,
                    count_ref,
                );
                for h in handles {
                    // Worker closures do not panic; a poisoned join is a
                    // bug in the engine itself.
                    pool_results.push(h.join().expect("worker thread panicked"));
                }
                main
            });
            results.extend(pool_results);
            results.push(main_result);
        }

        // Merge every worker's bookkeeping into the caller's status.
        for st in &statuses {
            cs.inplace_join(st);
        }
        for r in &results {
            match r {
                Ok(s) => {
                    self.stats.num_prune += s.num_prune;
                    self.stats.num_branch += s.num_branch;
                }
                Err(IcpError::Cancelled) => return Err(IcpError::Cancelled),
                Err(e) => return Err(e.clone()),
            }
        }

        let finder = found_delta_sat.load(Ordering::Acquire);
        if finder >= 0 {
            *cs.current_mut() = statuses[finder as usize].current().clone();
            Ok(true)
        } else {
            cs.current_mut().set_empty();
            Ok(false)
        }
    }
}
