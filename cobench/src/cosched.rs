// Copyright (c) Facebook, Inc. and its affiliates.
//
// Co-scheduled execution. Each slot keeps invoking its workload until its
// own runtimes are stable and every other slot is stable too. Once all
// slots are done, the sample which observed it is void as the partners may
// no longer have been running, and the slot exits.
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, trace, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread;

use super::runner::Invoke;
use cobench_intf::Sample;

#[derive(Debug, thiserror::Error)]
pub enum CoRunError {
    #[error("slot {slot} ({cmd:?}) failed: {err:#}")]
    Workload {
        slot: usize,
        cmd: String,
        err: anyhow::Error,
    },
    #[error("slot {slot} ({cmd:?}) panicked")]
    Panicked { slot: usize, cmd: String },
}

#[derive(Debug, Default)]
struct DoneState {
    nr_done: usize,
    nr_transitions: usize,
}

/// Number of slots which are locally done. Every access is a take-and-put
/// under the lock so that each slot sees every update in order.
#[derive(Debug)]
pub struct DoneCounter {
    nr_slots: usize,
    state: Mutex<DoneState>,
}

impl DoneCounter {
    pub fn new(nr_slots: usize) -> Self {
        Self {
            nr_slots,
            state: Mutex::new(Default::default()),
        }
    }

    /// `decide` is called with the lock held and whether all slots were
    /// already done. If it returns true, the calling slot is marked done.
    /// Returns whether all slots are done afterwards.
    pub fn exchange<F: FnOnce(bool) -> bool>(&self, decide: F) -> bool {
        let mut state = self.state.lock().unwrap();
        let all_done = state.nr_done >= self.nr_slots;
        if decide(all_done) && !all_done {
            state.nr_done += 1;
            if state.nr_done == self.nr_slots {
                state.nr_transitions += 1;
            }
        }
        state.nr_done >= self.nr_slots
    }

    pub fn nr_done(&self) -> usize {
        self.state.lock().unwrap().nr_done
    }

    /// How many times the counter went from "some" to "all done".
    pub fn nr_transitions(&self) -> usize {
        self.state.lock().unwrap().nr_transitions
    }
}

#[derive(Debug, Default)]
pub struct SlotResult {
    pub samples: Vec<Sample>,
    pub nr_runs: u32,
    pub nr_void: u32,
}

fn population_variance(samples: &[Sample]) -> f64 {
    if samples.len() == 0 {
        return 0.0;
    }
    let secs: Vec<f64> = samples.iter().map(|s| s.secs()).collect();
    statistical::population_variance(&secs, None)
}

pub struct CoSched {
    pub min_runs: u32,
    pub variance_diff: Option<f64>,
}

impl CoSched {
    pub fn new(min_runs: u32, variance_diff: Option<f64>) -> Self {
        assert!(min_runs >= 1);
        Self {
            min_runs,
            variance_diff,
        }
    }

    fn run_slot<W: Invoke>(
        &self,
        slot: usize,
        wl: &mut W,
        counter: &DoneCounter,
        err_tx: &Sender<CoRunError>,
        err_rx: &Receiver<CoRunError>,
    ) -> Option<SlotResult> {
        let mut res = SlotResult::default();
        let mut local_done = false;
        let mut last_var = 0.0;

        loop {
            let sample = match wl.invoke() {
                Ok(v) => v,
                Err(err) => {
                    let _ = err_tx.try_send(CoRunError::Workload {
                        slot,
                        cmd: wl.name().to_string(),
                        err,
                    });
                    return None;
                }
            };
            res.nr_runs += 1;

            if !err_rx.is_empty() {
                debug!("cosched: slot {} ({:?}) stopping, partner failed", slot, wl.name());
                return None;
            }

            let all_done = counter.exchange(|was_all_done| {
                if was_all_done {
                    trace!(
                        "cosched: slot {} ({:?}) void sample {:.3}s",
                        slot,
                        wl.name(),
                        sample.secs()
                    );
                    res.nr_void += 1;
                } else {
                    res.samples.push(sample);
                }

                if local_done || res.nr_runs < self.min_runs {
                    return false;
                }
                local_done = match self.variance_diff {
                    None => true,
                    Some(diff) => {
                        let var = population_variance(&res.samples);
                        let stable = (var - last_var).abs() <= diff;
                        trace!(
                            "cosched: slot {} variance {:.6} -> {:.6} stable={}",
                            slot,
                            last_var,
                            var,
                            stable
                        );
                        last_var = var;
                        stable
                    }
                };
                local_done
            });

            if all_done {
                debug!(
                    "cosched: slot {} ({:?}) done after {} runs, {} void",
                    slot,
                    wl.name(),
                    res.nr_runs,
                    res.nr_void
                );
                return Some(res);
            }
        }
    }

    /// Run `workloads` concurrently, one thread per slot, and return the
    /// accepted samples of each slot in slot order. The first failure is
    /// returned instead and the samples of all slots are dropped.
    pub fn run<W: Invoke>(&self, workloads: Vec<W>) -> Result<Vec<SlotResult>, CoRunError> {
        let counter = DoneCounter::new(workloads.len());
        self.run_with_counter(workloads, &counter)
    }

    pub fn run_with_counter<W: Invoke>(
        &self,
        workloads: Vec<W>,
        counter: &DoneCounter,
    ) -> Result<Vec<SlotResult>, CoRunError> {
        let nr_slots = workloads.len();
        assert!(nr_slots > 0);
        assert_eq!(counter.nr_slots, nr_slots);
        let names: Vec<String> = workloads.iter().map(|w| w.name().to_string()).collect();
        let (err_tx, err_rx) = channel::bounded::<CoRunError>(nr_slots);

        let results: Vec<Option<SlotResult>> = thread::scope(|s| {
            let handles: Vec<_> = workloads
                .into_iter()
                .enumerate()
                .map(|(slot, mut wl)| {
                    let (err_tx, err_rx) = (err_tx.clone(), err_rx.clone());
                    let cmd = names[slot].clone();
                    s.spawn(move || {
                        let ret = panic::catch_unwind(AssertUnwindSafe(|| {
                            self.run_slot(slot, &mut wl, counter, &err_tx, &err_rx)
                        }));
                        match ret {
                            Ok(v) => v,
                            Err(_) => {
                                let _ = err_tx.try_send(CoRunError::Panicked { slot, cmd });
                                None
                            }
                        }
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(slot, h)| match h.join() {
                    Ok(v) => v,
                    Err(_) => {
                        let _ = err_tx.try_send(CoRunError::Panicked {
                            slot,
                            cmd: names[slot].clone(),
                        });
                        None
                    }
                })
                .collect()
        });

        trace!(
            "cosched: {}/{} slots done, {} transitions",
            counter.nr_done(),
            nr_slots,
            counter.nr_transitions()
        );

        if let Ok(err) = err_rx.try_recv() {
            while let Ok(other) = err_rx.try_recv() {
                warn!("cosched: {}", &other);
            }
            return Err(err);
        }

        let mut slots = vec![];
        for (slot, res) in results.into_iter().enumerate() {
            match res {
                Some(v) => slots.push(v),
                None => {
                    return Err(CoRunError::Panicked {
                        slot,
                        cmd: names[slot].clone(),
                    })
                }
            }
        }
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use std::sync::Arc;
    use std::time::Duration;

    struct FakeWorkload {
        name: String,
        runtimes: Vec<f64>,
        nr_calls: u32,
        fail_at: Option<u32>,
        panic_at: Option<u32>,
    }

    impl FakeWorkload {
        fn new(name: &str, runtimes: &[f64]) -> Self {
            Self {
                name: name.into(),
                runtimes: runtimes.to_vec(),
                nr_calls: 0,
                fail_at: None,
                panic_at: None,
            }
        }
    }

    impl Invoke for FakeWorkload {
        fn name(&self) -> &str {
            &self.name
        }

        fn invoke(&mut self) -> Result<Sample> {
            let idx = self.nr_calls as usize % self.runtimes.len();
            self.nr_calls += 1;
            thread::sleep(Duration::from_millis(1));
            if self.fail_at == Some(self.nr_calls) {
                bail!("{:?} failed (exit status: 1)", &self.name);
            }
            if self.panic_at == Some(self.nr_calls) {
                panic!("{:?} exploded", &self.name);
            }
            Ok(Sample::new(Duration::from_secs_f64(self.runtimes[idx]), None))
        }
    }

    #[test]
    fn test_pair_fixed_runs() {
        let _ = ::env_logger::try_init();
        let cs = CoSched::new(3, None);
        let counter = DoneCounter::new(2);
        let res = cs
            .run_with_counter(
                vec![
                    FakeWorkload::new("A", &[1.0]),
                    FakeWorkload::new("B", &[2.0, 2.5]),
                ],
                &counter,
            )
            .unwrap();

        assert_eq!(counter.nr_done(), 2);
        assert_eq!(counter.nr_transitions(), 1);
        assert_eq!(res.len(), 2);
        for r in res.iter() {
            assert!(r.nr_runs >= 3);
            assert!(r.samples.len() >= 3);
            assert_eq!(r.nr_runs as usize, r.samples.len() + r.nr_void as usize);
        }
        // Only the slot which finished first runs once more after everyone
        // is done and that run is dropped.
        assert_eq!(res.iter().map(|r| r.nr_void).sum::<u32>(), 1);
        assert!(res.iter().any(|r| r.nr_void == 0));
    }

    #[test]
    fn test_single_slot() {
        let _ = ::env_logger::try_init();
        let res = CoSched::new(4, None)
            .run(vec![FakeWorkload::new("A", &[1.0])])
            .unwrap();
        assert_eq!(res[0].nr_runs, 4);
        assert_eq!(res[0].samples.len(), 4);
        assert_eq!(res[0].nr_void, 0);
    }

    #[test]
    fn test_variance_stability() {
        let _ = ::env_logger::try_init();
        // Constant runtimes are stable as soon as the minimum is reached.
        let res = CoSched::new(2, Some(0.001))
            .run(vec![FakeWorkload::new("A", &[1.0])])
            .unwrap();
        assert_eq!(res[0].nr_runs, 2);

        // Variances 1.0, 0.889, 1.0, 0.96 for 2..5 alternating 1s and 3s.
        let res = CoSched::new(2, Some(0.05))
            .run(vec![FakeWorkload::new("A", &[1.0, 3.0])])
            .unwrap();
        assert_eq!(res[0].nr_runs, 5);
        assert_eq!(res[0].samples.len(), 5);
    }

    #[test]
    fn test_failure_discards_pair() {
        let _ = ::env_logger::try_init();
        let mut a = FakeWorkload::new("A", &[1.0]);
        a.fail_at = Some(2);
        let b = FakeWorkload::new("B", &[1.0]);

        let err = CoSched::new(3, None).run(vec![a, b]).unwrap_err();
        match &err {
            CoRunError::Workload { slot, cmd, .. } => {
                assert_eq!(*slot, 0);
                assert_eq!(cmd, "A");
            }
            _ => panic!("unexpected error {:?}", &err),
        }
        assert!(format!("{}", &err).contains("exit status: 1"));
    }

    #[test]
    fn test_panic_is_reported() {
        let _ = ::env_logger::try_init();
        let a = FakeWorkload::new("A", &[1.0]);
        let mut b = FakeWorkload::new("B", &[1.0]);
        b.panic_at = Some(1);

        let err = CoSched::new(2, None).run(vec![a, b]).unwrap_err();
        assert!(matches!(err, CoRunError::Panicked { slot: 1, .. }));
    }

    #[test]
    fn test_counter_transition_once() {
        let _ = ::env_logger::try_init();
        let counter = Arc::new(DoneCounter::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    let mut done = false;
                    let mut nr_all_done = 0;
                    for _ in 0..100 {
                        if counter.exchange(|_| {
                            let mark = !done;
                            done = true;
                            mark
                        }) {
                            nr_all_done += 1;
                        }
                    }
                    nr_all_done
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.nr_done(), 8);
        assert_eq!(counter.nr_transitions(), 1);
    }
}
