// kiln-core/src/interpreter/session.rs
//
// The formula interpreter. A session resolves the requested formulae, then
// drives each node of the plan through fetch, build, install and self-test on
// a bounded worker pool. A node starts only once every dependency reached a
// state that satisfies dependents; a failure skips everything that depends on
// it. Each formula is driven at most once per session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use kiln_common::cache::DownloadCache;
use kiln_common::config::Config;
use kiln_common::dependency::{resolve, resolve_all, ResolveOptions, ResolvedGraph};
use kiln_common::error::{KilnError, Result, Stage};
use kiln_common::formulary::Formulary;
use kiln_common::keg::KegRegistry;
use kiln_common::model::Formula;
use kiln_common::pipeline::{FormulaState, PipelineEvent, Procedure};
use kiln_net::TransportRouter;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use super::report::{FormulaRecord, SessionReport};
use crate::build::{self, DependencyPrefixes};
use crate::fetch::{FetchedSource, SourceAcquirer};
use crate::install::{self, active_install};
use crate::verify::{run_self_test, VerificationReport};
use crate::{emit, EventSender};

const RETRY_BASE_DELAY_MS: u64 = 250;

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub include_optional: bool,
    /// Formulae processed at the same time.
    pub jobs: usize,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            include_optional: false,
            jobs: config.jobs.max(1),
        }
    }

    fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            include_optional: self.include_optional,
        }
    }
}

/// What an install would do, computed without side effects.
#[derive(Debug, Clone)]
pub struct Plan {
    pub graph: Option<ResolvedGraph>,
    /// Plan members whose exact version is installed and active.
    pub installed: HashSet<String>,
    /// Requested formulae that could not be loaded or resolved.
    pub failures: Vec<(String, KilnError)>,
}

impl Plan {
    pub fn order(&self) -> Vec<&str> {
        self.graph.as_ref().map(ResolvedGraph::names).unwrap_or_default()
    }

    pub fn to_install(&self) -> Vec<&str> {
        self.order()
            .into_iter()
            .filter(|name| !self.installed.contains(*name))
            .collect()
    }
}

/// State shared with worker tasks.
struct Shared {
    config: Config,
    acquirer: SourceAcquirer,
    cancel: CancellationToken,
    events: EventSender,
}

pub struct Session {
    shared: Arc<Shared>,
    formulary: Arc<Formulary>,
    options: SessionOptions,
}

impl Session {
    pub fn new(
        config: Config,
        formulary: Formulary,
        acquirer: SourceAcquirer,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        let options = SessionOptions::from_config(&config);
        Self {
            shared: Arc::new(Shared {
                config,
                acquirer,
                cancel,
                events,
            }),
            formulary: Arc::new(formulary),
            options,
        }
    }

    /// A session over the formula directories and download cache of
    /// `config`, fetching through the scheme router.
    pub fn for_config(
        config: Config,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let formulary = Formulary::load(&config)?;
        let transport = TransportRouter::new(config.allow_http)?;
        let acquirer = SourceAcquirer::new(DownloadCache::new(&config), Arc::new(transport));
        Ok(Self::new(config, formulary, acquirer, events, cancel))
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn formulary(&self) -> &Formulary {
        &self.formulary
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    /// Loads and resolves every target. A target that fails to resolve is
    /// reported on its own and does not prevent the others from being planned.
    pub fn plan(&self, targets: &[String]) -> Plan {
        let options = self.options.resolve_options();
        let mut roots = Vec::new();
        let mut failures = Vec::new();
        let mut seen = HashSet::new();
        for target in targets {
            if !seen.insert(target.as_str()) {
                continue;
            }
            let resolved = self
                .formulary
                .get(target)
                .and_then(|f| resolve(&f, &self.formulary, options).map(|_| f));
            match resolved {
                Ok(formula) => roots.push(formula),
                Err(e) => {
                    debug!("Could not plan '{}': {}", target, e);
                    failures.push((target.clone(), e));
                }
            }
        }

        let graph = if roots.is_empty() {
            None
        } else {
            match resolve_all(&roots, &self.formulary, options) {
                Ok(graph) => Some(graph),
                Err(e) => {
                    failures.extend(roots.iter().map(|r| (r.name.clone(), e.clone())));
                    None
                }
            }
        };

        let mut installed = HashSet::new();
        for node in graph.iter().flat_map(|g| g.order.iter()) {
            match active_install(&self.shared.config, &node.formula) {
                Ok(Some(_)) => {
                    installed.insert(node.name().to_string());
                }
                Ok(None) => {}
                Err(e) => warn!("Could not read install state of {}: {}", node.name(), e),
            }
        }
        let graph = graph.map(|g| g.without_build_only_of(&installed));
        if let Some(graph) = &graph {
            installed.retain(|name| graph.node(name).is_some());
        }
        Plan {
            graph,
            installed,
            failures,
        }
    }

    /// Installs `targets` and everything they depend on.
    #[instrument(skip(self))]
    pub async fn install(&self, targets: &[String]) -> SessionReport {
        let start = Instant::now();
        emit(
            &self.shared.events,
            PipelineEvent::SessionStarted {
                targets: targets.to_vec(),
            },
        );

        let plan = self.plan(targets);
        let mut records = self.planning_failures(&plan);
        if let Some(graph) = &plan.graph {
            emit(
                &self.shared.events,
                PipelineEvent::PlanResolved {
                    order: graph.names().iter().map(|n| n.to_string()).collect(),
                },
            );
            records.extend(self.run_graph(graph, &plan.installed).await);
        }
        self.finish(Procedure::Install, records, start)
    }

    /// Runs the self-test of each installed target again.
    #[instrument(skip(self))]
    pub async fn test(&self, targets: &[String]) -> SessionReport {
        let start = Instant::now();
        emit(
            &self.shared.events,
            PipelineEvent::SessionStarted {
                targets: targets.to_vec(),
            },
        );
        let mut records = Vec::with_capacity(targets.len());
        for target in targets {
            if self.shared.cancel.is_cancelled() {
                break;
            }
            let mut record = FormulaRecord::new(target.as_str(), None, true);
            self.shared.enter(&mut record, FormulaState::Pending);
            if let Err(e) = self.test_installed(target, &mut record).await {
                let stage = match e {
                    KilnError::NotInstalled(_) => Stage::Verify,
                    _ => e.stage().unwrap_or(Stage::Verify),
                };
                self.shared.fail(&mut record, stage, e);
            }
            records.push(record);
        }
        self.finish(Procedure::Test, records, start)
    }

    async fn test_installed(&self, name: &str, record: &mut FormulaRecord) -> Result<()> {
        let config = &self.shared.config;
        let mut formula = (*self.formulary.get(name)?).clone();
        let keg = KegRegistry::new(config.clone())
            .get_active_keg(name)?
            .ok_or_else(|| KilnError::NotInstalled(name.to_string()))?;
        if keg.version_str != formula.version {
            warn!(
                "{} {} is installed but the formula describes {}; testing the installed version",
                name, keg.version_str, formula.version
            );
            formula.version = keg.version_str.clone();
        }
        record.version = Some(keg.version_str.clone());
        self.shared.enter(record, FormulaState::Installed);

        let formula = Arc::new(formula);
        let deps = match resolve(&formula, &self.formulary, self.options.resolve_options()) {
            Ok(graph) => runtime_prefixes(config, &graph, &formula),
            Err(e) => {
                warn!("Testing {} without its dependencies: {}", name, e);
                Vec::new()
            }
        };
        let report = run_self_test(
            config,
            &formula,
            &keg.path,
            &deps,
            &self.shared.cancel,
            &self.shared.events,
        )
        .await?;
        self.shared.settle_verification(record, report);
        Ok(())
    }

    fn planning_failures(&self, plan: &Plan) -> Vec<FormulaRecord> {
        plan.failures
            .iter()
            .map(|(name, e)| {
                let mut record = FormulaRecord::new(name.as_str(), None, true);
                self.shared.enter(&mut record, FormulaState::Pending);
                let stage = e.stage().unwrap_or(Stage::Resolve);
                self.shared.fail(&mut record, stage, e.clone());
                record
            })
            .collect()
    }

    fn finish(
        &self,
        procedure: Procedure,
        records: Vec<FormulaRecord>,
        start: Instant,
    ) -> SessionReport {
        let report = SessionReport {
            procedure,
            records,
            cancelled: self.shared.cancel.is_cancelled(),
            duration: start.elapsed(),
        };
        emit(
            &self.shared.events,
            PipelineEvent::SessionFinished {
                duration_secs: report.duration.as_secs_f64(),
                success_count: report.success_count(),
                fail_count: report.fail_count(),
                skipped_count: report.skipped_count(),
            },
        );
        debug!(
            "Session finished in {:.2}s with exit code {}",
            report.duration.as_secs_f64(),
            report.exit_code()
        );
        report
    }

    /// Kahn-style scheduling over `graph`: ready nodes are spawned onto a
    /// `JoinSet`, at most `jobs` of them hold a permit at a time.
    async fn run_graph(
        &self,
        graph: &ResolvedGraph,
        installed: &HashSet<String>,
    ) -> Vec<FormulaRecord> {
        let config = &self.shared.config;
        let mut records: HashMap<String, FormulaRecord> = HashMap::new();
        for node in &graph.order {
            let version = Some(node.formula.version.clone());
            let mut record = FormulaRecord::new(node.name(), version, node.requested);
            self.shared.enter(&mut record, FormulaState::Pending);
            self.shared.enter(&mut record, FormulaState::Resolved);
            if installed.contains(node.name()) {
                info!("{} {} is already installed", node.name(), node.formula.version);
                self.shared.enter(&mut record, FormulaState::Installed);
            }
            records.insert(node.name().to_string(), record);
        }

        let mut waiting_on: HashMap<String, usize> = HashMap::new();
        let mut ready: VecDeque<String> = VecDeque::new();
        for node in &graph.order {
            let name = node.name();
            if records[name].state().satisfies_dependents() {
                continue;
            }
            let pending = graph
                .dependencies_of(name)
                .iter()
                .filter(|dep| !records[dep.as_str()].state().satisfies_dependents())
                .count();
            if pending == 0 {
                ready.push_back(name.to_string());
            } else {
                waiting_on.insert(name.to_string(), pending);
            }
        }

        let permits = Arc::new(Semaphore::new(self.options.jobs.max(1)));
        let mut tasks: JoinSet<FormulaRecord> = JoinSet::new();
        loop {
            while let Some(name) = ready.pop_front() {
                let Some(mut record) = records.remove(&name) else {
                    continue;
                };
                let Some(node) = graph.node(&name) else {
                    records.insert(name, record);
                    continue;
                };
                if self.shared.cancel.is_cancelled() {
                    self.shared.enter(
                        &mut record,
                        FormulaState::Skipped {
                            blocked_by: "interrupt".to_string(),
                        },
                    );
                    records.insert(name, record);
                    continue;
                }
                let formula = Arc::clone(&node.formula);
                let direct = graph.dependencies_of(&name).to_vec();
                let build_deps = prefixes_from(config, graph, direct);
                let test_deps = runtime_prefixes(config, graph, &formula);
                let shared = Arc::clone(&self.shared);
                let permits = Arc::clone(&permits);
                let span = info_span!("formula", name = %name);
                tasks.spawn(
                    async move {
                        let _permit = permits.acquire_owned().await;
                        let fallback = record.clone();
                        let run = drive(&shared, formula, record, build_deps, test_deps);
                        let driven = AssertUnwindSafe(run).catch_unwind().await;
                        match driven {
                            Ok(record) => record,
                            Err(panic) => {
                                let mut record = fallback;
                                let message = panic_message(panic);
                                shared.fail(&mut record, Stage::Build, KilnError::Generic(message));
                                record
                            }
                        }
                    }
                    .instrument(span),
                );
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let record = match joined {
                Ok(record) => record,
                Err(e) => {
                    error!("Worker task failed: {}", e);
                    continue;
                }
            };
            let name = record.name.clone();
            let unblocks = record.state().satisfies_dependents();
            records.insert(name.clone(), record);

            if unblocks {
                for dependent in graph.dependents_of(&name) {
                    if let Some(count) = waiting_on.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            waiting_on.remove(dependent);
                            ready.push_back(dependent.to_string());
                        }
                    }
                }
            } else {
                self.skip_dependents(graph, &name, &mut records, &mut waiting_on);
            }
        }

        for name in waiting_on.into_keys() {
            if let Some(record) = records.get_mut(&name) {
                self.shared.enter(
                    record,
                    FormulaState::Skipped {
                        blocked_by: "interrupt".to_string(),
                    },
                );
            }
        }

        graph
            .order
            .iter()
            .filter_map(|node| records.remove(node.name()))
            .collect()
    }

    fn skip_dependents(
        &self,
        graph: &ResolvedGraph,
        failed: &str,
        records: &mut HashMap<String, FormulaRecord>,
        waiting_on: &mut HashMap<String, usize>,
    ) {
        let mut queue: VecDeque<String> = VecDeque::from([failed.to_string()]);
        while let Some(current) = queue.pop_front() {
            for dependent in graph.dependents_of(&current) {
                if waiting_on.remove(dependent).is_none() {
                    continue;
                }
                if let Some(record) = records.get_mut(dependent) {
                    warn!("Skipping {} because {} failed", dependent, failed);
                    self.shared.enter(
                        record,
                        FormulaState::Skipped {
                            blocked_by: failed.to_string(),
                        },
                    );
                }
                queue.push_back(dependent.to_string());
            }
        }
    }
}

impl Shared {
    fn enter(&self, record: &mut FormulaRecord, state: FormulaState) {
        debug!("[{}] -> {}", record.name, state);
        emit(&self.events, PipelineEvent::state(&record.name, state.clone()));
        record.trace.push(state);
    }

    fn fail(&self, record: &mut FormulaRecord, stage: Stage, e: KilnError) {
        if stage == Stage::Verify {
            warn!("{} installed but failed verification: {}", record.name, e);
        } else {
            error!("{} failed at {}: {}", record.name, stage, e);
        }
        self.enter(record, FormulaState::failed(stage, &e));
        record.error = Some(e);
    }

    fn settle_verification(&self, record: &mut FormulaRecord, report: VerificationReport) {
        match report.error() {
            None => self.enter(record, FormulaState::Verified),
            Some(e) => {
                emit(
                    &self.events,
                    PipelineEvent::VerificationWarning {
                        formula: record.name.clone(),
                        failures: report.failures.clone(),
                    },
                );
                self.fail(record, Stage::Verify, e);
            }
        }
        record.verification = Some(report);
    }

    /// Fetches with caller-owned retries: transient failures are retried up
    /// to `fetch_retries` times with exponential backoff plus jitter.
    async fn fetch_with_retry(&self, formula: &Formula) -> Result<FetchedSource> {
        emit(
            &self.events,
            PipelineEvent::DownloadStarted {
                formula: formula.name.clone(),
                url: formula.url.clone(),
            },
        );
        let mut attempt = 0u32;
        loop {
            match self.acquirer.fetch(&formula.url, &formula.sha256, &self.cancel).await {
                Ok(source) => {
                    emit(
                        &self.events,
                        PipelineEvent::DownloadFinished {
                            formula: formula.name.clone(),
                            path: source.path().to_path_buf(),
                            size_bytes: source.size_bytes(),
                            cached: source.cached(),
                        },
                    );
                    return Ok(source);
                }
                Err(e)
                    if e.is_transient()
                        && attempt < self.config.fetch_retries
                        && !self.cancel.is_cancelled() =>
                {
                    let delay = retry_delay(attempt);
                    attempt += 1;
                    warn!(
                        "Fetching {} failed ({}); retry {}/{} in {:?}",
                        formula.name, e, attempt, self.config.fetch_retries, delay
                    );
                    emit(
                        &self.events,
                        PipelineEvent::FetchRetry {
                            formula: formula.name.clone(),
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                            error: e.to_string(),
                        },
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(KilnError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Drives one formula from `Resolved` to a terminal state.
async fn drive(
    shared: &Shared,
    formula: Arc<Formula>,
    mut record: FormulaRecord,
    build_deps: DependencyPrefixes,
    test_deps: DependencyPrefixes,
) -> FormulaRecord {
    let config = &shared.config;

    let source = match shared.fetch_with_retry(&formula).await {
        Ok(source) => source,
        Err(e) => {
            shared.fail(&mut record, Stage::Fetch, e);
            return record;
        }
    };
    shared.enter(&mut record, FormulaState::Fetched);

    let (cancel, events) = (&shared.cancel, &shared.events);
    let built = match build::build(config, &formula, &source, &build_deps, cancel, events).await {
        Ok(built) => built,
        Err(e) => {
            shared.fail(&mut record, Stage::Build, e);
            return record;
        }
    };
    shared.enter(&mut record, FormulaState::Built);

    let installed = install::install(config, &formula, &built, cancel).await;
    if let Err(e) = built.cleanup() {
        warn!("Failed to remove build sandbox of {}: {}", formula.name, e);
    }
    let outcome = match installed {
        Ok(outcome) => outcome,
        Err(e) => {
            shared.fail(&mut record, Stage::Install, e);
            return record;
        }
    };
    shared.enter(&mut record, FormulaState::Installed);
    if !outcome.was_installed() {
        debug!("{} was committed by another run; not testing again", formula.name);
        return record;
    }

    let keg = config.formula_keg_path(&formula.name, &formula.version);
    match run_self_test(config, &formula, &keg, &test_deps, cancel, events).await {
        Ok(report) => shared.settle_verification(&mut record, report),
        Err(e) => shared.fail(&mut record, Stage::Verify, e),
    }
    record
}

/// Opt prefixes of `start` and everything they depend on, breadth first so
/// direct dependencies are searched before indirect ones.
fn prefixes_from(config: &Config, graph: &ResolvedGraph, start: Vec<String>) -> DependencyPrefixes {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = start.into();
    let mut prefixes = Vec::new();
    while let Some(name) = queue.pop_front() {
        if !seen.insert(name.clone()) {
            continue;
        }
        queue.extend(graph.dependencies_of(&name).iter().cloned());
        prefixes.push((name.clone(), config.formula_opt_path(&name)));
    }
    prefixes
}

/// Prefixes a formula needs when it runs: its runtime dependencies and
/// everything below them.
fn runtime_prefixes(
    config: &Config,
    graph: &ResolvedGraph,
    formula: &Formula,
) -> DependencyPrefixes {
    let start = formula
        .runtime_dependencies()
        .into_iter()
        .filter(|d| graph.node(&d.name).is_some())
        .map(|d| d.name.clone())
        .collect();
    prefixes_from(config, graph, start)
}

fn retry_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_DELAY_MS << attempt.min(6);
    let jitter = rand::rng().random_range(0..=base / 4);
    Duration::from_millis(base + jitter)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    match payload.downcast_ref::<&'static str>() {
        Some(s) => (*s).to_string(),
        None => match payload.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "worker panicked".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_exponentially() {
        let first = retry_delay(0).as_millis();
        let third = retry_delay(2).as_millis();
        assert!((250..=312).contains(&first));
        assert!((1000..=1250).contains(&third));
    }
}
