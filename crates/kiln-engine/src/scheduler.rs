//! Weighted bounded-concurrency admission.
//!
//! Each task declares a resource vector; the scheduler admits it only when
//! the running set's sum plus the candidate fits the configured caps.
//! Permits release on drop and wake whatever waiters now fit. Admission may
//! suspend, but an admitted task never waits on admission of its own
//! subtasks — the engine acquires permits only around leaf work (fetches and
//! step execution), never across a recursive dep build.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::trace;

use kiln_rule::ResourceAmounts;

struct Waiter {
    amounts: ResourceAmounts,
    admit: oneshot::Sender<()>,
}

struct SchedulerState {
    in_use: ResourceAmounts,
    waiters: VecDeque<Waiter>,
}

/// Weighted admission pool with fair (FIFO) or unfair (first-fit) queueing.
pub struct Scheduler {
    caps: ResourceAmounts,
    fair: bool,
    state: Mutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(caps: ResourceAmounts, fair: bool) -> Self {
        Self {
            caps,
            fair,
            state: Mutex::new(SchedulerState {
                in_use: ResourceAmounts::ZERO,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Admit a task occupying `amounts`, suspending until it fits.
    ///
    /// Demands larger than the caps are clamped so every task is eventually
    /// admissible.
    pub async fn acquire(self: &Arc<Self>, amounts: ResourceAmounts) -> ResourcePermit {
        let amounts = clamp(amounts, self.caps);

        let wait = {
            let mut state = self.state.lock().unwrap();
            let fits = state
                .in_use
                .checked_add(amounts)
                .is_some_and(|sum| sum.fits_within(self.caps));
            // Under fair queueing a newcomer never jumps the queue.
            if fits && (!self.fair || state.waiters.is_empty()) {
                state.in_use = state.in_use.checked_add(amounts).unwrap_or(state.in_use);
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(Waiter {
                    amounts,
                    admit: tx,
                });
                Some(rx)
            }
        };

        if let Some(rx) = wait {
            trace!("waiting for admission");
            // The sender is only dropped if the scheduler itself is dropped,
            // which cannot happen while we hold an Arc to it.
            let _ = rx.await;
        }

        ResourcePermit {
            scheduler: self.clone(),
            amounts,
        }
    }

    fn release(&self, amounts: ResourceAmounts) {
        let mut state = self.state.lock().unwrap();
        state.in_use = state.in_use.saturating_sub(amounts);

        if self.fair {
            // Admit from the front only; a waiter that does not fit blocks
            // everyone behind it.
            while let Some(front) = state.waiters.front() {
                let Some(sum) = state.in_use.checked_add(front.amounts) else {
                    break;
                };
                if !sum.fits_within(self.caps) {
                    break;
                }
                let waiter = state.waiters.pop_front().unwrap();
                state.in_use = sum;
                let _ = waiter.admit.send(());
            }
        } else {
            // First-fit scan over the whole queue.
            let mut i = 0;
            while i < state.waiters.len() {
                let Some(sum) = state.in_use.checked_add(state.waiters[i].amounts) else {
                    i += 1;
                    continue;
                };
                if sum.fits_within(self.caps) {
                    let waiter = state.waiters.remove(i).unwrap();
                    state.in_use = sum;
                    let _ = waiter.admit.send(());
                } else {
                    i += 1;
                }
            }
        }
    }
}

fn clamp(amounts: ResourceAmounts, caps: ResourceAmounts) -> ResourceAmounts {
    ResourceAmounts {
        cpu: amounts.cpu.min(caps.cpu),
        memory: amounts.memory.min(caps.memory),
        disk_io: amounts.disk_io.min(caps.disk_io),
        network_io: amounts.network_io.min(caps.network_io),
    }
}

/// Held for the duration of admitted work; releases its quota on drop.
pub struct ResourcePermit {
    scheduler: Arc<Scheduler>,
    amounts: ResourceAmounts,
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        self.scheduler.release(self.amounts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn caps(cpu: u32) -> ResourceAmounts {
        ResourceAmounts {
            cpu,
            memory: cpu,
            disk_io: cpu,
            network_io: cpu,
        }
    }

    #[tokio::test]
    async fn concurrent_admissions_respect_caps() {
        let scheduler = Arc::new(Scheduler::new(caps(2), true));
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let scheduler = scheduler.clone();
            let running = running.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = scheduler.acquire(ResourceAmounts::one_cpu()).await;
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn oversized_demand_is_clamped_and_admitted() {
        let scheduler = Arc::new(Scheduler::new(caps(1), true));
        let _permit = scheduler
            .acquire(ResourceAmounts {
                cpu: 64,
                memory: 64,
                disk_io: 64,
                network_io: 64,
            })
            .await;
    }

    #[tokio::test]
    async fn permit_drop_wakes_waiter() {
        let scheduler = Arc::new(Scheduler::new(caps(1), true));
        let first = scheduler.acquire(ResourceAmounts::one_cpu()).await;

        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _permit = scheduler.acquire(ResourceAmounts::one_cpu()).await;
            })
        };

        // The waiter cannot finish while the first permit is held.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be admitted after release")
            .unwrap();
    }

    fn cpu(n: u32) -> ResourceAmounts {
        ResourceAmounts {
            cpu: n,
            ..ResourceAmounts::ZERO
        }
    }

    #[tokio::test]
    async fn unfair_queue_lets_small_tasks_pass_large_ones() {
        let scheduler = Arc::new(Scheduler::new(caps(2), false));
        let hold = scheduler.acquire(cpu(1)).await;

        // A task needing both cpus has to queue...
        let big = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _p = scheduler.acquire(cpu(2)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!big.is_finished());

        // ...but a single-cpu task still gets in ahead of it.
        let small = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _p = scheduler.acquire(cpu(1)).await;
            })
        };
        tokio::time::timeout(Duration::from_millis(200), small)
            .await
            .expect("small task should pass the queued large one")
            .unwrap();

        assert!(!big.is_finished());
        drop(hold);
        tokio::time::timeout(Duration::from_millis(200), big)
            .await
            .expect("large task should be admitted after release")
            .unwrap();
    }

    #[tokio::test]
    async fn fair_queue_blocks_newcomers_behind_the_front() {
        let scheduler = Arc::new(Scheduler::new(caps(2), true));
        let hold = scheduler.acquire(cpu(1)).await;

        let big = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _p = scheduler.acquire(cpu(2)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Fits, but queues behind the large task under FIFO admission.
        let small = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _p = scheduler.acquire(cpu(1)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!small.is_finished());

        drop(hold);
        tokio::time::timeout(Duration::from_millis(200), big)
            .await
            .expect("front of queue should be admitted first")
            .unwrap();
        tokio::time::timeout(Duration::from_millis(200), small)
            .await
            .expect("small task should follow")
            .unwrap();
    }
}
