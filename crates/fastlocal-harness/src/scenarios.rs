//! Invariant scenarios for indexed thread-local storage.
//!
//! Each scenario drives the public variable API on fresh threads and counts
//! the assertions it evaluates. A violated invariant stops the scenario and
//! is reported as a failure rather than a panic, so one bad scenario does not
//! hide the others.

use std::sync::{Arc, Barrier};
use std::time::Instant;

use fastlocal_core::carrier::current_table;
use fastlocal_core::slot_table::INITIAL_CAPACITY;
use fastlocal_core::{
    LocalError, MetricsSnapshot, ThreadLocalVariable, global_metrics, remove_all, thread,
    tracked_variable_count,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome, StreamKind};

/// Failures that prevent a scenario from producing a verdict.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("storage error: {0}")]
    Storage(#[from] LocalError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("scenario thread panicked in {scenario}")]
    ThreadPanicked { scenario: &'static str },
}

/// Outcome of one scenario body: checks evaluated, or the first violation.
type Verdict = Result<u64, String>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which thread flavor a scenario runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ThreadMode {
    /// Threads spawned through `fastlocal_core::thread` (fast path).
    Carried,
    /// Plain `std::thread` threads (fallback path).
    Generic,
    /// Run every scenario once in each mode.
    Both,
}

impl ThreadMode {
    /// The concrete modes this selection expands to.
    #[must_use]
    pub fn expand(self) -> &'static [ThreadMode] {
        match self {
            Self::Carried => &[Self::Carried],
            Self::Generic => &[Self::Generic],
            Self::Both => &[Self::Carried, Self::Generic],
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Carried => "carried",
            Self::Generic => "generic",
            Self::Both => "both",
        }
    }
}

/// The invariants the harness knows how to exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Unset -> Set -> Unset cycle with re-initialization.
    Lifecycle,
    /// No thread observes another thread's value.
    Isolation,
    /// `remove_all` clears exactly the touched variables.
    RemoveAll,
    /// Values survive table growth past the initial capacity.
    Growth,
    /// The removal set tracks live values only.
    BoundedBookkeeping,
    /// Slot indices increase strictly in construction order.
    AllocationOrder,
}

impl Scenario {
    pub const ALL: [Scenario; 6] = [
        Self::Lifecycle,
        Self::Isolation,
        Self::RemoveAll,
        Self::Growth,
        Self::BoundedBookkeeping,
        Self::AllocationOrder,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::Isolation => "isolation",
            Self::RemoveAll => "remove_all",
            Self::Growth => "growth",
            Self::BoundedBookkeeping => "bounded_bookkeeping",
            Self::AllocationOrder => "allocation_order",
        }
    }
}

/// Knobs shared by all scenarios.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScenarioConfig {
    /// Threads used by multi-threaded scenarios.
    pub threads: usize,
    /// Repetitions inside each scenario loop.
    pub iterations: usize,
    /// Variables constructed by the allocation-order scenario.
    pub variables: usize,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            iterations: 200,
            variables: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of one scenario in one thread mode.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub mode: ThreadMode,
    pub outcome: Outcome,
    pub threads: usize,
    pub checks: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ScenarioReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }
}

/// Machine-readable summary of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub config: ScenarioConfig,
    pub passed: usize,
    pub failed: usize,
    pub reports: Vec<ScenarioReport>,
    pub metrics: MetricsSnapshot,
}

impl RunSummary {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Run `scenarios` in every mode `mode` expands to, logging each one.
pub fn run_scenarios(
    scenarios: &[Scenario],
    mode: ThreadMode,
    config: ScenarioConfig,
    log: &mut LogEmitter,
) -> Result<RunSummary, HarnessError> {
    log.emit_entry(
        LogEntry::new("", LogLevel::Info, "run_start")
            .with_stream(StreamKind::Scenario)
            .with_threads(config.threads)
            .with_details(serde_json::json!({
                "scenarios": scenarios.iter().map(|s| s.name()).collect::<Vec<_>>(),
                "mode": mode.as_str(),
                "iterations": config.iterations,
            })),
    )?;

    let mut reports = Vec::new();
    for &scenario in scenarios {
        for &concrete in mode.expand() {
            log.emit_entry(
                LogEntry::new("", LogLevel::Debug, "scenario_start")
                    .with_stream(StreamKind::Scenario)
                    .with_scenario(scenario.name(), concrete.as_str()),
            )?;
            let report = run_one(scenario, concrete, config)?;
            let level = if report.passed() {
                LogLevel::Info
            } else {
                LogLevel::Error
            };
            let mut entry = LogEntry::new("", level, "scenario_end")
                .with_stream(StreamKind::Scenario)
                .with_scenario(scenario.name(), concrete.as_str())
                .with_outcome(report.outcome)
                .with_threads(report.threads)
                .with_checks(report.checks)
                .with_duration_ms(report.duration_ms);
            if let Some(failure) = &report.failure {
                entry = entry.with_details(serde_json::json!({ "failure": failure }));
            }
            log.emit_entry(entry)?;
            reports.push(report);
        }
    }

    let failed = reports.iter().filter(|r| !r.passed()).count();
    let metrics = global_metrics().snapshot();
    log.emit_entry(
        LogEntry::new("", LogLevel::Info, "run_end")
            .with_stream(StreamKind::Scenario)
            .with_outcome(if failed == 0 { Outcome::Pass } else { Outcome::Fail })
            .with_metrics(serde_json::to_value(metrics).map_err(std::io::Error::other)?),
    )?;
    log.flush()?;

    Ok(RunSummary {
        run_id: log.run_id().to_string(),
        config,
        passed: reports.len() - failed,
        failed,
        reports,
        metrics,
    })
}

/// Run a single scenario in one concrete mode.
pub fn run_one(
    scenario: Scenario,
    mode: ThreadMode,
    config: ScenarioConfig,
) -> Result<ScenarioReport, HarnessError> {
    let started = Instant::now();
    let (threads, verdict) = match scenario {
        Scenario::Lifecycle => (1, on_thread(scenario, mode, move || lifecycle(config))?),
        Scenario::Isolation => (config.threads, isolation(mode, config)?),
        Scenario::RemoveAll => (1, on_thread(scenario, mode, remove_all_exact)?),
        Scenario::Growth => (1, on_thread(scenario, mode, growth)?),
        Scenario::BoundedBookkeeping => (
            1,
            on_thread(scenario, mode, move || bounded_bookkeeping(config))?,
        ),
        Scenario::AllocationOrder => (
            1,
            on_thread(scenario, mode, move || allocation_order(config))?,
        ),
    };
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let (outcome, checks, failure) = match verdict {
        Ok(checks) => (Outcome::Pass, checks, None),
        Err(failure) => (Outcome::Fail, 0, Some(failure)),
    };
    Ok(ScenarioReport {
        scenario,
        mode,
        outcome,
        threads,
        checks,
        duration_ms,
        failure,
    })
}

fn spawn_in_mode<F, T>(mode: ThreadMode, f: F) -> std::io::Result<std::thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match mode {
        ThreadMode::Generic => std::thread::Builder::new().spawn(f),
        ThreadMode::Carried | ThreadMode::Both => thread::spawn(f),
    }
}

/// Run `body` on one fresh thread of the given mode.
fn on_thread<F>(scenario: Scenario, mode: ThreadMode, body: F) -> Result<Verdict, HarnessError>
where
    F: FnOnce() -> Result<Verdict, LocalError> + Send + 'static,
{
    let handle = spawn_in_mode(mode, move || {
        let verdict = body();
        // Generic threads get no automatic teardown.
        remove_all();
        verdict
    })?;
    let verdict = handle.join().map_err(|_| HarnessError::ThreadPanicked {
        scenario: scenario.name(),
    })?;
    Ok(verdict?)
}

/// Counts checks and turns the first violation into a `Verdict` error.
#[derive(Default)]
struct Checks(u64);

impl Checks {
    fn ensure(&mut self, ok: bool, what: impl FnOnce() -> String) -> Result<(), String> {
        self.0 += 1;
        if ok { Ok(()) } else { Err(what()) }
    }
}

macro_rules! check {
    ($checks:expr, $cond:expr, $($msg:tt)+) => {
        if let Err(violation) = $checks.ensure($cond, || format!($($msg)+)) {
            return Ok(Err(violation));
        }
    };
}

// ---------------------------------------------------------------------------
// Scenario bodies
// ---------------------------------------------------------------------------

fn lifecycle(config: ScenarioConfig) -> Result<Verdict, LocalError> {
    let mut checks = Checks::default();
    let var = ThreadLocalVariable::with_initial(|| 0u64)?;
    for round in 0..config.iterations as u64 {
        check!(checks, !var.is_set(), "round {round}: set before first access");
        check!(checks, var.get()? == 0, "round {round}: initial value not 0");
        check!(checks, var.is_set(), "round {round}: get did not set");
        var.set(round + 5)?;
        check!(checks, var.get()? == round + 5, "round {round}: set value lost");
        check!(checks, tracked_variable_count() == 1, "round {round}: not tracked once");
        var.remove();
        check!(checks, !var.is_set(), "round {round}: still set after remove");
        check!(
            checks,
            tracked_variable_count() == 0,
            "round {round}: still tracked after remove"
        );
    }
    Ok(Ok(checks.0))
}

/// Run `store`, then meet the other threads at `barrier` even if it failed.
fn store_then_wait(
    barrier: &Barrier,
    store: impl FnOnce() -> Result<(), LocalError>,
) -> Result<(), LocalError> {
    let stored = store();
    barrier.wait();
    stored
}

fn isolation(mode: ThreadMode, config: ScenarioConfig) -> Result<Verdict, HarnessError> {
    let threads = config.threads.max(1);
    let iterations = config.iterations;
    let var = Arc::new(ThreadLocalVariable::with_initial(|| usize::MAX)?);
    let barrier = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for id in 0..threads {
        let var = Arc::clone(&var);
        let barrier = Arc::clone(&barrier);
        handles.push(spawn_in_mode(mode, move || -> Result<Verdict, LocalError> {
            let mut checks = Checks::default();
            let first = var.get();
            // Every thread has stored before anyone reads back.
            store_then_wait(&barrier, || var.set(id))?;
            check!(checks, first? == usize::MAX, "thread {id}: saw a foreign value first");
            for _ in 0..iterations {
                let seen = var.get()?;
                check!(checks, seen == id, "thread {id}: observed {seen}");
            }
            var.remove();
            remove_all();
            Ok(Ok(checks.0))
        })?);
    }

    let mut total = 0;
    let mut first_failure = None;
    for handle in handles {
        let verdict = handle.join().map_err(|_| HarnessError::ThreadPanicked {
            scenario: Scenario::Isolation.name(),
        })??;
        match verdict {
            Ok(checks) => total += checks,
            Err(violation) => {
                first_failure.get_or_insert(violation);
            }
        }
    }
    Ok(first_failure.map_or(Ok(total), Err))
}

fn remove_all_exact() -> Result<Verdict, LocalError> {
    let mut checks = Checks::default();
    let vars = (0..12u32)
        .map(|i| ThreadLocalVariable::with_initial(move || i))
        .collect::<Result<Vec<_>, _>>()?;
    let (touched, untouched) = vars.split_at(8);

    for (i, var) in touched.iter().enumerate() {
        if i % 2 == 0 {
            var.set(100 + i as u32)?;
        } else {
            var.get()?;
        }
    }
    check!(checks, tracked_variable_count() == 8, "expected 8 tracked");

    remove_all();

    check!(checks, tracked_variable_count() == 0, "tracked set survived remove_all");
    for var in &vars {
        check!(checks, !var.is_set(), "slot {} still set", var.slot());
    }
    for (i, var) in untouched.iter().enumerate() {
        let expected = 8 + i as u32;
        check!(
            checks,
            var.get()? == expected,
            "untouched slot {} lost its initializer",
            var.slot()
        );
    }
    check!(
        checks,
        tracked_variable_count() == untouched.len(),
        "re-initialized variables not tracked"
    );
    Ok(Ok(checks.0))
}

fn growth() -> Result<Verdict, LocalError> {
    let mut checks = Checks::default();
    let count = INITIAL_CAPACITY + 9;
    let vars = (0..count)
        .map(|_| ThreadLocalVariable::<usize>::new())
        .collect::<Result<Vec<_>, _>>()?;
    for (i, var) in vars.iter().enumerate() {
        var.set(i * 7)?;
    }
    let capacity = current_table().capacity();
    check!(
        checks,
        capacity > INITIAL_CAPACITY,
        "table did not grow (capacity {capacity})"
    );
    for (i, var) in vars.iter().enumerate() {
        let value = var.get()?;
        check!(checks, value == i * 7, "slot {} read back {value}", var.slot());
    }
    check!(checks, tracked_variable_count() == count, "not every value tracked");
    Ok(Ok(checks.0))
}

fn bounded_bookkeeping(config: ScenarioConfig) -> Result<Verdict, LocalError> {
    let mut checks = Checks::default();
    let vars = (0..16)
        .map(|_| ThreadLocalVariable::<u64>::new())
        .collect::<Result<Vec<_>, _>>()?;
    for round in 0..config.iterations {
        for (i, var) in vars.iter().enumerate() {
            var.set(round as u64)?;
            if (i + round) % 3 == 0 {
                var.remove();
            }
        }
        let live = vars.iter().filter(|v| v.is_set()).count();
        let tracked = tracked_variable_count();
        check!(
            checks,
            tracked == live,
            "round {round}: {tracked} tracked for {live} live values"
        );
    }
    Ok(Ok(checks.0))
}

fn allocation_order(config: ScenarioConfig) -> Result<Verdict, LocalError> {
    let mut checks = Checks::default();
    let vars = (0..config.variables.max(2))
        .map(|_| ThreadLocalVariable::<u8>::new())
        .collect::<Result<Vec<_>, _>>()?;
    for pair in vars.windows(2) {
        check!(
            checks,
            pair[1].slot() > pair[0].slot(),
            "slot {} followed {}",
            pair[1].slot(),
            pair[0].slot()
        );
    }
    Ok(Ok(checks.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ScenarioConfig {
        ScenarioConfig {
            threads: 4,
            iterations: 20,
            variables: 500,
        }
    }

    #[test]
    fn every_scenario_passes_in_both_modes() {
        for scenario in Scenario::ALL {
            for &mode in ThreadMode::Both.expand() {
                let report = run_one(scenario, mode, small()).unwrap();
                assert!(report.passed(), "{scenario:?}/{mode:?}: {:?}", report.failure);
                assert!(report.checks > 0);
            }
        }
    }

    #[test]
    fn failed_store_still_releases_the_barrier() {
        let barrier = Arc::new(Barrier::new(2));
        let other = Arc::clone(&barrier);
        let peer = std::thread::spawn(move || store_then_wait(&other, || Ok(())));
        let failed = store_then_wait(&barrier, || {
            Err(LocalError::ResourceExhausted {
                resource: fastlocal_core::ExhaustedResource::TableCapacity,
                limit: 0,
            })
        });
        assert!(failed.is_err());
        assert!(peer.join().unwrap().is_ok());
    }

    #[test]
    fn both_expands_to_concrete_modes() {
        assert_eq!(
            ThreadMode::Both.expand(),
            &[ThreadMode::Carried, ThreadMode::Generic]
        );
        assert_eq!(ThreadMode::Generic.expand(), &[ThreadMode::Generic]);
    }

    #[test]
    fn scenario_names_are_unique() {
        let mut names: Vec<_> = Scenario::ALL.iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Scenario::ALL.len());
    }

    #[test]
    fn checks_stop_at_first_violation() {
        fn body() -> Result<Verdict, LocalError> {
            let mut checks = Checks::default();
            check!(checks, true, "fine");
            check!(checks, false, "broken at {}", 2);
            check!(checks, false, "never reached");
            Ok(Ok(checks.0))
        }
        assert_eq!(body().unwrap(), Err("broken at 2".to_string()));
    }

    #[test]
    fn run_logs_each_scenario_and_summarizes() {
        let mut log = LogEmitter::to_buffer("unit");
        let summary = run_scenarios(
            &[Scenario::Lifecycle, Scenario::Growth],
            ThreadMode::Both,
            small(),
            &mut log,
        )
        .unwrap();
        assert!(summary.all_passed());
        assert_eq!(summary.reports.len(), 4);

        let text = String::from_utf8(log.buffered().unwrap().to_vec()).unwrap();
        let (lines, errors) = crate::structured_log::validate_log_text(&text);
        assert!(errors.is_empty(), "{errors:?}");
        // run_start + 4 * (start + end) + run_end
        assert_eq!(lines, 10);
    }
}
