//! Runs a query across every (period, program, department) combination.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};
use url::Url;

use crate::detail::{build_records, parse_detail_page, RecordContext};
use crate::fetcher::HttpFetcher;
use crate::listing::{build_search_url, walk_pages, MAX_PAGES};
use crate::models::{is_all_departments, program_id, Config, ProgramPolicy, SectionRecord};

/// Set from outside to stop a running query at the next checkpoint.
pub type CancelFlag = Arc<AtomicBool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Delays between requests to the schedule board.
#[derive(Debug, Clone, Copy)]
pub struct Pacing {
    pub page_delay: Duration,
    pub detail_delay: Duration,
    pub combination_delay: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            page_delay: Duration::from_millis(500),
            detail_delay: Duration::from_millis(300),
            combination_delay: Duration::from_millis(500),
        }
    }
}

impl Pacing {
    #[cfg(test)]
    pub fn none() -> Self {
        Self {
            page_delay: Duration::ZERO,
            detail_delay: Duration::ZERO,
            combination_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub periods: Vec<String>,
    pub programs: Vec<String>,
    /// `None` means no department filter.
    pub departments: Vec<Option<String>>,
    pub discipline_code: Option<String>,
    pub policy: ProgramPolicy,
}

impl QueryRequest {
    pub fn from_config(config: &Config) -> Self {
        let departments = config
            .departments
            .iter()
            .map(|d| (!is_all_departments(d)).then(|| d.trim().to_uppercase()))
            .collect();

        Self {
            periods: config.periods.clone(),
            programs: config.programs.clone(),
            departments,
            discipline_code: config.discipline_code.clone(),
            policy: config.program_policy(),
        }
    }

    /// Period outer, program middle, department inner.
    fn combinations(&self) -> Vec<Combination> {
        // the discipline code replaces the department filter in the query,
        // so every department would issue the same search
        let departments: Vec<Option<String>> = match &self.discipline_code {
            Some(_) => vec![None],
            None if self.departments.is_empty() => vec![None],
            None => self.departments.clone(),
        };

        let mut combinations = Vec::new();
        for period in &self.periods {
            for program in &self.programs {
                let Some(id) = program_id(program) else {
                    warn!(program = %program, "unknown program, skipping");
                    continue;
                };
                for department in &departments {
                    combinations.push(Combination {
                        period: period.clone(),
                        program: program.clone(),
                        program_id: id,
                        department: department.clone(),
                    });
                }
            }
        }
        combinations
    }
}

#[derive(Debug, Clone)]
struct Combination {
    period: String,
    program: String,
    program_id: &'static str,
    department: Option<String>,
}

#[derive(Debug)]
pub struct QueryOutcome {
    pub status: QueryState,
    pub records: Vec<SectionRecord>,
}

pub struct QueryRunner {
    fetcher: HttpFetcher,
    base_url: String,
    origin: Url,
    pacing: Pacing,
    state: QueryState,
    cancel: CancelFlag,
}

impl QueryRunner {
    pub fn new(base_url: &str) -> Result<Self> {
        let parsed =
            Url::parse(base_url).with_context(|| format!("Invalid base url: {}", base_url))?;
        let mut origin = parsed.clone();
        origin.set_path("/");
        origin.set_query(None);
        origin.set_fragment(None);

        Ok(Self {
            fetcher: HttpFetcher::new()?,
            base_url: parsed.to_string(),
            origin,
            pacing: Pacing::default(),
            state: QueryState::Idle,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        Arc::clone(&self.cancel)
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    /// Returns a finished or failed runner to `Idle` and clears any cancel request.
    pub fn reset(&mut self) {
        self.state = QueryState::Idle;
        self.cancel.store(false, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Runs the whole query. On `Err` the runner is left `Failed` and any
    /// partial results are dropped.
    pub async fn run_query(&mut self, request: &QueryRequest) -> Result<QueryOutcome> {
        if self.state != QueryState::Idle {
            bail!("runner is {:?}, reset it before starting a new query", self.state);
        }
        self.state = QueryState::Running;
        // pages cached by an earlier run are not reused
        self.fetcher.clear_cache();

        match self.collect(request).await {
            Ok((records, cancelled)) => {
                self.state = if cancelled {
                    QueryState::Cancelled
                } else {
                    QueryState::Completed
                };
                info!(
                    records = records.len(),
                    cached_pages = self.fetcher.cached_pages(),
                    state = ?self.state,
                    "query finished"
                );
                Ok(QueryOutcome {
                    status: self.state,
                    records,
                })
            }
            Err(e) => {
                self.state = QueryState::Failed;
                Err(e)
            }
        }
    }

    async fn collect(&mut self, request: &QueryRequest) -> Result<(Vec<SectionRecord>, bool)> {
        if request.periods.is_empty() {
            bail!("no period selected");
        }
        let combinations = request.combinations();
        if combinations.is_empty() {
            bail!("none of the selected programs can be searched: {:?}", request.programs);
        }

        let total = combinations.len();
        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut cancelled = false;

        for (index, combination) in combinations.iter().enumerate() {
            if self.is_cancelled() {
                cancelled = true;
                break;
            }
            if index > 0 {
                tokio::time::sleep(self.pacing.combination_delay).await;
            }

            info!(
                step = index + 1,
                total,
                period = %combination.period,
                program = %combination.program,
                department = combination.department.as_deref().unwrap_or("ALL"),
                "querying"
            );

            let (batch, stopped) = self.query_combination(combination, request).await;
            let before = records.len();
            for record in batch {
                if seen.insert(record.run_key()) {
                    records.push(record);
                }
            }
            debug!(added = records.len() - before, "combination merged");

            if stopped {
                cancelled = true;
                break;
            }
        }

        if cancelled {
            info!(records = records.len(), "query cancelled, keeping partial results");
        }
        normalize_batch(&mut records);
        Ok((records, cancelled))
    }

    /// Records for one combination, unique by (code, section, program).
    /// The flag is true when a cancel request interrupted the detail loop.
    async fn query_combination(
        &mut self,
        combination: &Combination,
        request: &QueryRequest,
    ) -> (Vec<SectionRecord>, bool) {
        let search_url = build_search_url(
            &self.base_url,
            combination.program_id,
            combination.department.as_deref(),
            &combination.period,
            request.discipline_code.as_deref(),
        );
        let links = walk_pages(
            &mut self.fetcher,
            &search_url,
            &self.origin,
            self.pacing.page_delay,
            MAX_PAGES,
        )
        .await;

        let mut batch = Vec::new();
        let mut seen = HashSet::new();

        for (index, link) in links.iter().enumerate() {
            if self.is_cancelled() {
                return (batch, true);
            }
            if index > 0 {
                tokio::time::sleep(self.pacing.detail_delay).await;
            }

            let Some(html) = self.fetcher.fetch(link).await else {
                continue;
            };
            let page = parse_detail_page(&html);
            let ctx = RecordContext {
                period: &combination.period,
                source_program: &combination.program,
                requested_department: combination.department.as_deref(),
                policy: &request.policy,
                detail_url: link,
            };

            for record in build_records(&page, &ctx) {
                if seen.insert(record.batch_key()) {
                    batch.push(record);
                }
            }
        }

        (batch, false)
    }
}

/// Recomputes derived figures and fills missing overflow counts for a whole batch.
pub fn normalize_batch(records: &mut [SectionRecord]) {
    for record in records.iter_mut() {
        record.recompute_derived();
        record.backfill_overflow();
    }
}
