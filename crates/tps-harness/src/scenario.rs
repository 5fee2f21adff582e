//! Multi-thread scenarios run against a fresh domain.
//!
//! Every scenario drives real threads through the lifecycle API, hands
//! control between them with [`Semaphore`]s, and records one step per domain
//! call. Steps are emitted to the structured log after the threads join.

use std::sync::mpsc::{self, Sender};
use std::sync::OnceLock;
use std::thread::{self, ScopedJoinHandle};

use thiserror::Error;
use tps_core::{
    MetricsSnapshot, NullObserver, PthreadRuntime, Semaphore, TPS_SIZE, Tid, TpsConfig,
    TpsDomain, TpsError,
};

use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

const MESSAGE: &[u8] = b"Hello world!\n";
const READERS: usize = 4;

/// Available scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum ScenarioKind {
    /// One thread writes and reads back at two offsets.
    RoundTrip,
    /// Every documented failure mode, on one thread.
    ErrorCases,
    /// Two threads share a page; the sharer diverges.
    CowHandoff,
    /// Several clones of one page; one diverges, the rest keep the original.
    ManyReaders,
}

impl ScenarioKind {
    pub const ALL: [Self; 4] = [
        Self::RoundTrip,
        Self::ErrorCases,
        Self::CowHandoff,
        Self::ManyReaders,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::RoundTrip => "round-trip",
            Self::ErrorCases => "error-cases",
            Self::CowHandoff => "cow-handoff",
            Self::ManyReaders => "many-readers",
        }
    }
}

/// Why a scenario failed.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("{thread}: {op} failed: {source}")]
    Op {
        thread: String,
        op: &'static str,
        source: TpsError,
    },
    #[error("{thread}: {op} succeeded, expected {expected}")]
    UnexpectedSuccess {
        thread: String,
        op: &'static str,
        expected: TpsError,
    },
    #[error("{thread}: {op} failed with `{actual}`, expected `{expected}`")]
    WrongError {
        thread: String,
        op: &'static str,
        expected: TpsError,
        actual: TpsError,
    },
    #[error("{thread}: {what}: expected {expected}, got {actual}")]
    Mismatch {
        thread: String,
        what: &'static str,
        expected: String,
        actual: String,
    },
    #[error("{0}: peer thread exited early")]
    PeerExited(String),
    #[error("thread {0} panicked")]
    ThreadPanicked(String),
    #[error("structured log write failed: {0}")]
    Log(#[from] std::io::Error),
}

/// Summary of a passed scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScenarioReport {
    pub kind: ScenarioKind,
    pub steps: usize,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug)]
struct StepRecord {
    thread: String,
    op: &'static str,
    result: Result<(), TpsError>,
    expected: Option<TpsError>,
    share_count: Option<u32>,
}

impl StepRecord {
    fn passed(&self) -> bool {
        match (&self.result, &self.expected) {
            (Ok(()), None) => true,
            (Err(actual), Some(expected)) => actual == expected,
            _ => false,
        }
    }
}

/// One scenario thread: records each domain call it makes.
struct Actor<'d> {
    name: String,
    tid: Tid,
    domain: &'d TpsDomain,
    steps: Sender<StepRecord>,
}

impl<'d> Actor<'d> {
    /// Must be called on the thread the actor represents.
    fn here(name: impl Into<String>, domain: &'d TpsDomain, steps: Sender<StepRecord>) -> Self {
        Self {
            name: name.into(),
            tid: PthreadRuntime::self_tid(),
            domain,
            steps,
        }
    }

    fn record(&self, op: &'static str, result: Result<(), TpsError>, expected: Option<TpsError>) {
        let step = StepRecord {
            thread: self.name.clone(),
            op,
            result,
            expected,
            share_count: self.domain.share_count(self.tid),
        };
        // The receiver outlives every actor.
        let _ = self.steps.send(step);
    }

    fn ok(&self, op: &'static str, result: Result<(), TpsError>) -> Result<(), ScenarioError> {
        self.record(op, result, None);
        result.map_err(|source| ScenarioError::Op {
            thread: self.name.clone(),
            op,
            source,
        })
    }

    fn fails(
        &self,
        op: &'static str,
        result: Result<(), TpsError>,
        expected: TpsError,
    ) -> Result<(), ScenarioError> {
        self.record(op, result, Some(expected));
        match result {
            Ok(()) => Err(ScenarioError::UnexpectedSuccess {
                thread: self.name.clone(),
                op,
                expected,
            }),
            Err(actual) if actual == expected => Ok(()),
            Err(actual) => Err(ScenarioError::WrongError {
                thread: self.name.clone(),
                op,
                expected,
                actual,
            }),
        }
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<(), ScenarioError> {
        self.ok("write", self.domain.write(offset, data.len(), data))
    }

    fn read_expect(&self, offset: usize, expected: &[u8]) -> Result<(), ScenarioError> {
        let mut buf = vec![0_u8; expected.len()];
        self.ok("read", self.domain.read(offset, buf.len(), &mut buf))?;
        if buf != expected {
            return Err(self.mismatch(
                "page contents",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(&buf),
            ));
        }
        Ok(())
    }

    fn expect_share_count(&self, expected: u32) -> Result<(), ScenarioError> {
        let actual = self.domain.share_count(self.tid);
        if actual != Some(expected) {
            return Err(self.mismatch("share count", format!("{expected}"), format!("{actual:?}")));
        }
        Ok(())
    }

    fn mismatch(
        &self,
        what: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> ScenarioError {
        ScenarioError::Mismatch {
            thread: self.name.clone(),
            what,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

fn join(
    handle: ScopedJoinHandle<'_, Result<(), ScenarioError>>,
    name: &str,
) -> Result<(), ScenarioError> {
    handle
        .join()
        .map_err(|_| ScenarioError::ThreadPanicked(name.to_string()))?
}

/// Release every semaphore `times` times so blocked peers can observe the
/// failure instead of hanging.
fn release_all(sems: &[&Semaphore], times: usize) {
    for sem in sems {
        for _ in 0..times {
            sem.up();
        }
    }
}

fn round_trip(domain: &TpsDomain, steps: &Sender<StepRecord>) -> Result<(), ScenarioError> {
    thread::scope(|s| {
        let worker = s.spawn(|| -> Result<(), ScenarioError> {
            let a = Actor::here("worker", domain, steps.clone());
            a.ok("create", domain.create())?;
            a.write(0, MESSAGE)?;
            a.read_expect(0, MESSAGE)?;
            a.write(10, MESSAGE)?;
            a.read_expect(10, MESSAGE)?;
            a.read_expect(0, b"Hello worlHello")?;
            a.read_expect(TPS_SIZE - 4, &[0; 4])?;
            a.ok("destroy", domain.destroy())
        });
        join(worker, "worker")
    })
}

fn error_cases(domain: &TpsDomain, steps: &Sender<StepRecord>) -> Result<(), ScenarioError> {
    thread::scope(|s| {
        let worker = s.spawn(|| -> Result<(), ScenarioError> {
            let a = Actor::here("worker", domain, steps.clone());
            let me = a.tid;
            let mut buf = vec![0_u8; TPS_SIZE + 1];

            a.fails("destroy", domain.destroy(), TpsError::NoBinding(me))?;
            a.fails("read", domain.read(0, 4, &mut buf), TpsError::NoBinding(me))?;
            a.fails("write", domain.write(0, 4, &buf), TpsError::NoBinding(me))?;
            a.fails("clone", domain.clone_from_thread(me), TpsError::NoBinding(me))?;

            a.ok("create", domain.create())?;
            a.fails("create", domain.create(), TpsError::DuplicateBinding(me))?;
            a.fails(
                "clone",
                domain.clone_from_thread(me),
                TpsError::DuplicateBinding(me),
            )?;

            a.fails(
                "read",
                domain.read(0, TPS_SIZE + 1, &mut buf),
                TpsError::OutOfBounds {
                    offset: 0,
                    length: TPS_SIZE + 1,
                },
            )?;
            a.fails(
                "write",
                domain.write(TPS_SIZE, 1, b"x"),
                TpsError::OutOfBounds {
                    offset: TPS_SIZE,
                    length: 1,
                },
            )?;
            a.fails(
                "read",
                domain.read_with(0, 4, None),
                TpsError::InvalidBuffer {
                    length: 4,
                    available: 0,
                },
            )?;
            a.fails(
                "write",
                domain.write(0, 8, b"abc"),
                TpsError::InvalidBuffer {
                    length: 8,
                    available: 3,
                },
            )?;

            a.ok("init", domain.init(false))?;
            a.fails("init", domain.init(false), TpsError::AlreadyInitialized)?;

            a.ok("destroy", domain.destroy())?;
            a.fails("destroy", domain.destroy(), TpsError::NoBinding(me))
        });
        join(worker, "worker")
    })
}

fn cow_handoff(domain: &TpsDomain, steps: &Sender<StepRecord>) -> Result<(), ScenarioError> {
    let owner_turn = Semaphore::new(0);
    let sharer_turn = Semaphore::new(0);
    let (tid_tx, tid_rx) = mpsc::channel::<Tid>();
    let turns = [&owner_turn, &sharer_turn];

    thread::scope(|s| {
        let owner = s.spawn(|| {
            // Owned here so the sharer sees a closed channel if we bail out.
            let tid_tx = tid_tx;
            let body = || -> Result<(), ScenarioError> {
                let a = Actor::here("owner", domain, steps.clone());
                a.ok("create", domain.create())?;
                a.write(0, MESSAGE)?;
                a.read_expect(0, MESSAGE)?;
                tid_tx
                    .send(a.tid)
                    .map_err(|_| ScenarioError::PeerExited(a.name.clone()))?;

                sharer_turn.up();
                owner_turn.down();

                a.read_expect(0, b"H")?;
                a.expect_share_count(1)?;
                a.ok("destroy", domain.destroy())?;
                sharer_turn.up();
                Ok(())
            };
            let result = body();
            if result.is_err() {
                release_all(&turns, 2);
            }
            result
        });

        let sharer = s.spawn(|| {
            let tid_rx = tid_rx;
            let body = || -> Result<(), ScenarioError> {
                let a = Actor::here("sharer", domain, steps.clone());
                sharer_turn.down();
                let owner_tid = tid_rx
                    .recv()
                    .map_err(|_| ScenarioError::PeerExited(a.name.clone()))?;

                a.ok("clone", domain.clone_from_thread(owner_tid))?;
                a.expect_share_count(2)?;
                a.read_expect(0, MESSAGE)?;
                a.write(0, b"h")?;
                a.expect_share_count(1)?;
                a.read_expect(0, b"hello world!\n")?;

                owner_turn.up();
                sharer_turn.down();

                a.ok("destroy", domain.destroy())?;
                a.fails("destroy", domain.destroy(), TpsError::NoBinding(a.tid))
            };
            let result = body();
            if result.is_err() {
                release_all(&turns, 2);
            }
            result
        });

        let owner_result = join(owner, "owner");
        let sharer_result = join(sharer, "sharer");
        owner_result.and(sharer_result)
    })
}

fn many_readers(domain: &TpsDomain, steps: &Sender<StepRecord>) -> Result<(), ScenarioError> {
    let owner_tid = OnceLock::new();
    let page_ready = Semaphore::new(0);
    let cloned = Semaphore::new(0);
    let proceed = Semaphore::new(0);
    let finished = Semaphore::new(0);
    let all = [&page_ready, &cloned, &proceed, &finished];

    thread::scope(|s| {
        let owner = s.spawn(|| {
            let body = || -> Result<(), ScenarioError> {
                let a = Actor::here("owner", domain, steps.clone());
                a.ok("create", domain.create())?;
                a.write(0, MESSAGE)?;
                let _ = owner_tid.set(a.tid);
                release_all(&[&page_ready], READERS);

                for _ in 0..READERS {
                    cloned.down();
                }
                a.expect_share_count(READERS as u32 + 1)?;
                release_all(&[&proceed], READERS);

                for _ in 0..READERS {
                    finished.down();
                }
                a.expect_share_count(1)?;
                a.read_expect(0, MESSAGE)?;
                a.ok("destroy", domain.destroy())
            };
            let result = body();
            if result.is_err() {
                release_all(&all, READERS);
            }
            result
        });

        let readers: Vec<_> = (0..READERS)
            .map(|idx| {
                let name = format!("reader-{idx}");
                let actor_name = name.clone();
                let all = &all;
                let page_ready = &page_ready;
                let cloned = &cloned;
                let proceed = &proceed;
                let finished = &finished;
                let owner_tid = &owner_tid;
                let handle = s.spawn(move || {
                    let body = || -> Result<(), ScenarioError> {
                        let a = Actor::here(actor_name.clone(), domain, steps.clone());
                        page_ready.down();
                        let target = *owner_tid
                            .get()
                            .ok_or_else(|| ScenarioError::PeerExited(a.name.clone()))?;
                        a.ok("clone", domain.clone_from_thread(target))?;
                        a.read_expect(0, MESSAGE)?;
                        cloned.up();

                        proceed.down();
                        if idx == 0 {
                            a.write(0, b"X")?;
                            a.read_expect(0, b"Xello world!\n")?;
                        } else {
                            a.read_expect(0, MESSAGE)?;
                        }
                        a.ok("destroy", domain.destroy())?;
                        finished.up();
                        Ok(())
                    };
                    let result = body();
                    if result.is_err() {
                        release_all(all, READERS);
                    }
                    result
                });
                (name, handle)
            })
            .collect();

        let mut outcome = join(owner, "owner");
        for (name, handle) in readers {
            outcome = outcome.and(join(handle, &name));
        }
        outcome
    })?;

    if domain.live_pages() != 0 {
        return Err(ScenarioError::Mismatch {
            thread: "main".to_string(),
            what: "live pages after teardown",
            expected: "0".to_string(),
            actual: domain.live_pages().to_string(),
        });
    }
    Ok(())
}

/// Run one scenario on a fresh domain, logging every step.
pub fn run_scenario(
    kind: ScenarioKind,
    config: TpsConfig,
    log: &mut LogEmitter,
) -> Result<ScenarioReport, ScenarioError> {
    let domain = TpsDomain::builder()
        .observer(NullObserver)
        .config(config)
        .build();
    let scenario = kind.name();

    let start = LogEntry::new(log.next_trace_id(), LogLevel::Info, "scenario_start")
        .with_scenario(scenario);
    log.emit_entry(start)?;

    let (tx, rx) = mpsc::channel();
    let result = match kind {
        ScenarioKind::RoundTrip => round_trip(&domain, &tx),
        ScenarioKind::ErrorCases => error_cases(&domain, &tx),
        ScenarioKind::CowHandoff => cow_handoff(&domain, &tx),
        ScenarioKind::ManyReaders => many_readers(&domain, &tx),
    };
    drop(tx);

    let mut steps = 0;
    for step in rx.try_iter() {
        steps += 1;
        let passed = step.passed();
        let mut entry = LogEntry::new(
            log.next_trace_id(),
            if passed { LogLevel::Debug } else { LogLevel::Error },
            "tps_op",
        )
        .with_scenario(scenario)
        .with_thread(step.thread)
        .with_op(step.op)
        .with_outcome(if passed { Outcome::Pass } else { Outcome::Fail });
        if let Err(err) = &step.result {
            entry = entry.with_tps_error(err);
        }
        if let Some(count) = step.share_count {
            entry = entry.with_share_count(count);
        }
        if let Some(expected) = step.expected {
            entry = entry.with_details(serde_json::json!({ "expected": expected.to_string() }));
        }
        log.emit_entry(entry)?;
    }

    let metrics = domain.metrics();
    let (level, outcome) = match &result {
        Ok(()) => (LogLevel::Info, Outcome::Pass),
        Err(_) => (LogLevel::Error, Outcome::Fail),
    };
    let mut end = LogEntry::new(log.next_trace_id(), level, "scenario_end")
        .with_scenario(scenario)
        .with_outcome(outcome)
        .with_details(metrics_json(&metrics));
    if let Err(err) = &result {
        end = end.with_error(err.to_string());
    }
    log.emit_entry(end)?;
    log.flush()?;

    result.map(|()| ScenarioReport {
        kind,
        steps,
        metrics,
    })
}

fn metrics_json(m: &MetricsSnapshot) -> serde_json::Value {
    serde_json::json!({
        "creates": m.creates,
        "destroys": m.destroys,
        "clones": m.clones,
        "reads": m.reads,
        "writes": m.writes,
        "cow_forks": m.cow_forks,
        "pages_reserved": m.pages_reserved,
        "pages_released": m.pages_released,
        "protection_failures": m.protection_failures,
        "release_failures": m.release_failures,
        "rejected_accesses": m.rejected_accesses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_kebab_case_and_unique() {
        let names: Vec<&str> = ScenarioKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(
            names,
            ["round-trip", "error-cases", "cow-handoff", "many-readers"]
        );
        for kind in ScenarioKind::ALL {
            let parsed = <ScenarioKind as clap::ValueEnum>::from_str(kind.name(), false);
            assert_eq!(parsed, Ok(kind));
        }
    }

    #[test]
    fn step_pass_rules() {
        let step = |result, expected| StepRecord {
            thread: "t".to_string(),
            op: "read",
            result,
            expected,
            share_count: None,
        };
        let err = TpsError::NoBinding(Tid(1));
        assert!(step(Ok(()), None).passed());
        assert!(step(Err(err), Some(err)).passed());
        assert!(!step(Ok(()), Some(err)).passed());
        assert!(!step(Err(err), None).passed());
        assert!(!step(Err(err), Some(TpsError::AlreadyInitialized)).passed());
    }
}
