//! Context-aware aggregation engine
//!
//! A stateless per-call pipeline over the (context × date) grid:
//!
//! 1. **Isolate**: resolve the target slice, or the partition family for a
//!    total query; mixing contexted slices without an explicit target is a
//!    hard error
//! 2. **Determine combinations**: one concrete combination for a
//!    fully-specified query, or the registry's value set for the one
//!    varying key of a partition
//! 3. **Coverage check**: per combination, set-difference the requested
//!    window against covered dates and group the gaps into minimal
//!    contiguous sub-ranges
//! 4. **Gap-fill**: one concurrent fetch per (combination × sub-range);
//!    results merge latest-write-wins, merges serialized per store
//! 5. **Per-combination aggregate**: sum (n, k), mean = k/n, stdev from
//!    the pluggable rate-variance estimator
//! 6. **Cross-combination reduction**: complete / mece-aggregated /
//!    partial, with deterministic MECE tie-breaking by registry
//!    declaration order
//! 7. **Non-daily sources**: exact aggregate hit, arbitrary-window
//!    refetch, or linear time-overlap proration
//!
//! Incompleteness is communicated through status and warnings, never
//! through errors; the only hard error past validation is the
//! slice-isolation invariant of step 1.

pub mod adapter;
pub mod coverage;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::SliceCache;
use crate::config::EngineConfig;
use crate::dsl::{self, ParsedConstraintSet};
use crate::error::{ConfigurationError, Result};
use crate::registry::ContextRegistry;
use crate::signature::{
    build_aggregate_signature, build_daily_signature, validate_signature, DataQuerySpec,
    ResolvedFilter,
};
use crate::stats::{mean_rate, BinomialVariance, RateVariance};
use crate::store::SliceStore;
use crate::types::{AggregationStatus, DateRange, SliceKey, SourceCapability};

use self::adapter::{FetchRequest, SourceAdapter};

// ============================================================================
// Requests and Results
// ============================================================================

/// How the target expression should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateMode {
    /// The expression names exactly the slice to aggregate
    Exact,
    /// The expression is an uncontexted base; attempt a total by summing
    /// one complete MECE partition of stored contexted slices
    PartitionTotal,
}

/// One aggregation query
#[derive(Debug, Clone)]
pub struct AggregateRequest {
    /// Atomic slice expression (no OR-semantics; explode compounds first)
    pub expression: String,
    /// Exact-slice or partition-total interpretation
    pub mode: AggregateMode,
    /// Requested window; an explicit `window(...)` constraint in the
    /// expression overrides it
    pub window: DateRange,
    /// Anchor for relative date bounds
    pub today: NaiveDate,
    /// What the external source can answer
    pub capability: SourceCapability,
    /// Base query spec: connection, topology, source; per-combination
    /// filters are resolved by the engine
    pub spec: DataQuerySpec,
}

/// Non-fatal diagnostics attached to an aggregation result
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationWarning {
    /// A MECE-capable key was used but some of its values had no usable
    /// coverage
    MissingMeceValues {
        /// The partition key
        context: String,
        /// Values with no usable coverage
        missing: Vec<String>,
    },
    /// Stored slices under other context keys were not folded into the
    /// total
    IgnoredGroups {
        /// The ignored context keys
        contexts: Vec<String>,
    },
    /// Other context keys would have produced an equivalent total
    EquivalentTotals {
        /// The key actually summed
        used: String,
        /// Keys that appear equally complete
        alternatives: Vec<String>,
    },
    /// No complete MECE partition existed; the sum is not a true total
    NotATotal,
    /// One fetch failed; its combination contributes nothing
    FetchFailed {
        /// Slice the fetch was filling
        key: SliceKey,
        /// The sub-range that failed
        range: DateRange,
        /// Adapter-reported message
        message: String,
    },
    /// A stored slice's signature mismatches the current spec; its data
    /// was still used
    StaleSignature {
        /// The stale slice
        key: SliceKey,
        /// Mismatch description
        reason: String,
    },
    /// An aggregate-only answer was linearly scaled by time overlap
    Prorated {
        /// The scaled slice
        key: SliceKey,
        /// Overlap fraction applied to n and k
        fraction: f64,
    },
}

impl fmt::Display for AggregationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationWarning::MissingMeceValues { context, missing } => write!(
                f,
                "partition over '{}' is incomplete; missing values: {}",
                context,
                missing.join(", ")
            ),
            AggregationWarning::IgnoredGroups { contexts } => write!(
                f,
                "stored slices for {} were not included in the total",
                contexts.join(", ")
            ),
            AggregationWarning::EquivalentTotals { used, alternatives } => write!(
                f,
                "summed '{}'; equivalent totals exist via {}",
                used,
                alternatives.join(", ")
            ),
            AggregationWarning::NotATotal => {
                write!(f, "no complete MECE partition; result is not a true total")
            },
            AggregationWarning::FetchFailed { key, range, message } => {
                write!(f, "fetch for {} over {} failed: {}", key, range, message)
            },
            AggregationWarning::StaleSignature { key, reason } => {
                write!(f, "stored data for {} may be stale: {}", key, reason)
            },
            AggregationWarning::Prorated { key, fraction } => write!(
                f,
                "{} was prorated by time overlap fraction {:.4}",
                key, fraction
            ),
        }
    }
}

/// The answer to one aggregation query
#[derive(Debug, Clone)]
pub struct AggregationResult {
    /// Soundness of the answer
    pub status: AggregationStatus,
    /// Summed trial count
    pub n: u64,
    /// Summed success count
    pub k: u64,
    /// k / n, 0 when n = 0
    pub mean: f64,
    /// Spread of the rate per the configured estimator
    pub stdev: f64,
    /// Slices that contributed data
    pub contributing: Vec<SliceKey>,
    /// Non-fatal diagnostics
    pub warnings: Vec<AggregationWarning>,
}

// ============================================================================
// Engine
// ============================================================================

/// The aggregation engine
///
/// Holds read-only collaborators (registry, config, estimator); all query
/// state is per-call. The store and cache are passed into
/// [`AggregationEngine::aggregate`] by reference, never held.
pub struct AggregationEngine {
    registry: Arc<ContextRegistry>,
    config: EngineConfig,
    estimator: Box<dyn RateVariance>,
}

impl AggregationEngine {
    /// Create an engine with the default binomial estimator
    pub fn new(registry: Arc<ContextRegistry>, config: EngineConfig) -> Self {
        Self {
            registry,
            config,
            estimator: Box::new(BinomialVariance),
        }
    }

    /// Replace the rate-variance estimator
    pub fn with_estimator(mut self, estimator: Box<dyn RateVariance>) -> Self {
        self.estimator = estimator;
        self
    }

    /// The registry this engine consults
    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    /// Explode a compound expression into atomic slice keys, attaching a
    /// warning when the configured cap is exceeded
    pub fn explode(&self, expression: &str) -> Result<dsl::Explosion> {
        dsl::explode(expression, &self.registry, self.config.explosion_cap)
    }

    /// Run one aggregation query
    pub async fn aggregate(
        &self,
        adapter: &dyn SourceAdapter,
        store: &RwLock<SliceStore>,
        cache: &SliceCache,
        request: &AggregateRequest,
    ) -> Result<AggregationResult> {
        let parsed = dsl::parse(&request.expression)?;
        let (base, expr_window) = parsed.split_window();
        let window = match expr_window {
            Some(w) => w.resolve(request.today, &request.window)?,
            None => request.window,
        };

        // Step 1 + 2: isolate and determine combinations
        let plan = {
            let guard = store.read();
            self.plan(&base, request, &guard)?
        };

        // Step 3: per-combination coverage over the requested window
        let mut states = self.prepare_combinations(&plan, request, &window, store, cache)?;

        // Step 4: concurrent gap-fill, merges serialized on the store
        self.gap_fill(adapter, store, cache, &window, &mut states)
            .await;

        // Step 5: per-combination sums from the now-merged store
        let guard = store.read();
        let mut outcomes = Vec::with_capacity(states.len());
        for state in states {
            outcomes.push(state.into_outcome(&guard, &window));
        }
        drop(guard);

        // Step 6: cross-combination reduction
        Ok(self.reduce(&plan, outcomes, &window))
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    fn plan(
        &self,
        base: &ParsedConstraintSet,
        request: &AggregateRequest,
        store: &SliceStore,
    ) -> Result<Plan> {
        if !base.is_storable() {
            // Compounds must be exploded before aggregation
            return Err(crate::error::SyntaxError::UnexpandedSelection(
                base.canonical_string(),
            )
            .into());
        }

        if !base.contexts.is_empty() {
            if request.mode == AggregateMode::PartitionTotal {
                return Err(ConfigurationError::InvalidPartitionTarget(
                    base.canonical_string(),
                )
                .into());
            }
            let key = base.slice_key()?;
            let contexts: BTreeMap<String, String> = base.contexts.iter().cloned().collect();
            return Ok(Plan::Single(Combination { contexts, key }));
        }

        // Uncontexted base: inspect the stored family
        let family = family_members(base, store);
        let contexted: Vec<&FamilyMember> =
            family.iter().filter(|m| !m.contexts.is_empty()).collect();

        match request.mode {
            AggregateMode::Exact => {
                if !contexted.is_empty() {
                    // Slice-isolation invariant: never silently mix
                    return Err(ConfigurationError::MixedSlices(base.canonical_string()).into());
                }
                let key = base.slice_key()?;
                Ok(Plan::Single(Combination {
                    contexts: BTreeMap::new(),
                    key,
                }))
            },
            AggregateMode::PartitionTotal => {
                self.plan_partition(base, store, &contexted)
            },
        }
    }

    fn plan_partition(
        &self,
        base: &ParsedConstraintSet,
        store: &SliceStore,
        contexted: &[&FamilyMember],
    ) -> Result<Plan> {
        // An uncontexted stored slice answers the total directly
        let base_key = base.slice_key()?;
        if store.find(&base_key).is_some() || contexted.is_empty() {
            return Ok(Plan::Single(Combination {
                contexts: BTreeMap::new(),
                key: base_key,
            }));
        }

        // Candidate keys: single-context family members, grouped by key,
        // considered in registry declaration order
        let mut present: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for member in contexted {
            if member.contexts.len() == 1 {
                let (key, value) = member.contexts.iter().next().expect("len checked");
                present
                    .entry(key.clone())
                    .or_default()
                    .insert(value.clone());
            }
        }

        let mut candidates: Vec<Candidate> = Vec::new();
        for key in self.registry.keys() {
            let Some(values) = present.get(key) else {
                continue;
            };
            let definition = self.registry.context(key)?;
            let required = definition.mece_values();
            let complete_by_presence = required
                .as_ref()
                .map(|req| req.iter().all(|v| values.contains(v)))
                .unwrap_or(false);
            candidates.push(Candidate {
                context: key.to_string(),
                required,
                complete_by_presence,
                present: values.iter().cloned().collect(),
            });
        }

        // Only multi-context slices stored: nothing partitions the base,
        // so fetch the base directly
        if candidates.is_empty() {
            return Ok(Plan::Single(Combination {
                contexts: BTreeMap::new(),
                key: base_key,
            }));
        }

        // Tie-break policy: first complete candidate in declaration order,
        // else first MECE-capable, else first present
        let chosen_index = candidates
            .iter()
            .position(|c| c.complete_by_presence)
            .or_else(|| candidates.iter().position(|c| c.required.is_some()))
            .unwrap_or(0);
        let chosen = candidates[chosen_index].clone();

        let equivalent: Vec<String> = candidates
            .iter()
            .enumerate()
            .filter(|(i, c)| *i != chosen_index && c.complete_by_presence)
            .map(|(_, c)| c.context.clone())
            .collect();
        let ignored: Vec<String> = candidates
            .iter()
            .enumerate()
            .filter(|(i, c)| *i != chosen_index && !c.complete_by_presence)
            .map(|(_, c)| c.context.clone())
            .collect();

        // Combinations: the registry's full value set when the key can be
        // MECE (gap-fill may complete it), otherwise just what is stored
        let values: Vec<String> = match &chosen.required {
            Some(required) => required.clone(),
            None => chosen.present.clone(),
        };
        let mut combos = Vec::with_capacity(values.len());
        for value in &values {
            let expanded = base.with_context(&chosen.context, value);
            combos.push(Combination {
                key: expanded.slice_key()?,
                contexts: expanded.contexts.iter().cloned().collect(),
            });
        }
        debug!(
            context = %chosen.context,
            combinations = combos.len(),
            "planned partition aggregation"
        );
        Ok(Plan::Partition {
            context: chosen.context,
            required: chosen.required,
            combos,
            equivalent,
            ignored,
        })
    }

    // ------------------------------------------------------------------
    // Coverage and gap-fill
    // ------------------------------------------------------------------

    fn prepare_combinations(
        &self,
        plan: &Plan,
        request: &AggregateRequest,
        window: &DateRange,
        store: &RwLock<SliceStore>,
        cache: &SliceCache,
    ) -> Result<Vec<ComboState>> {
        let combos: Vec<Combination> = match plan {
            Plan::Single(combo) => vec![combo.clone()],
            Plan::Partition { combos, .. } => combos.clone(),
        };

        let guard = store.read();
        let mut states = Vec::with_capacity(combos.len());
        for combo in combos {
            let spec = self.combination_spec(&request.spec, &combo, request.capability, window);
            let mut state = ComboState::new(combo, spec, request.capability);

            let stored = cache.slice_for(&guard, &state.combo.key);
            if self.config.check_staleness {
                if let Some(slice) = stored.as_deref() {
                    if let Some(signature) = &slice.signature {
                        let check = validate_signature(signature, &state.spec);
                        if !check.valid {
                            state.warnings.push(AggregationWarning::StaleSignature {
                                key: state.combo.key.clone(),
                                reason: check.reason.unwrap_or_default(),
                            });
                        }
                    }
                }
            }

            if request.capability.daily {
                let series = stored.as_deref().and_then(|s| s.daily()).unwrap_or(&[]);
                let covered = coverage::covered_dates(series, window);
                state.tasks = coverage::missing_ranges(&covered, window)
                    .into_iter()
                    .map(TaskKind::DailyGap)
                    .collect();
            } else {
                self.plan_non_daily(&mut state, stored.as_deref(), request, window);
            }
            states.push(state);
        }
        Ok(states)
    }

    /// Step 7: aggregate-only sources
    fn plan_non_daily(
        &self,
        state: &mut ComboState,
        stored: Option<&crate::store::StoredSlice>,
        request: &AggregateRequest,
        window: &DateRange,
    ) {
        // Stored daily data that already covers the window answers the
        // query without consulting the source again
        if let Some(series) = stored.and_then(|s| s.daily()) {
            if coverage::fully_covered(series, window) {
                let (n, k) = coverage::sum_window(series, window);
                state.preset = Some(PresetValue {
                    n,
                    k,
                    complete: true,
                });
                return;
            }
        }

        if let Some((stored_window, n, k)) = stored.and_then(|s| s.aggregate()) {
            if stored_window == *window {
                state.preset = Some(PresetValue {
                    n,
                    k,
                    complete: true,
                });
                return;
            }
            if !request.capability.arbitrary_window {
                // Fixed coarse windows: linear time-overlap proration
                let overlap = stored_window.overlap_days(window);
                if overlap > 0 && self.config.allow_proration {
                    let fraction = overlap as f64 / stored_window.days() as f64;
                    state.preset = Some(PresetValue {
                        n: (n as f64 * fraction).round() as u64,
                        k: (k as f64 * fraction).round() as u64,
                        complete: false,
                    });
                    state.prorated = Some(fraction);
                    state.warnings.push(AggregationWarning::Prorated {
                        key: state.combo.key.clone(),
                        fraction,
                    });
                    return;
                }
            }
        }

        // One fresh fetch for the exact window; sources without
        // arbitrary-window support report failure through the adapter
        state.tasks = vec![TaskKind::AggregateWindow(*window)];
    }

    async fn gap_fill(
        &self,
        adapter: &dyn SourceAdapter,
        store: &RwLock<SliceStore>,
        cache: &SliceCache,
        window: &DateRange,
        states: &mut [ComboState],
    ) {
        let mut fetches = Vec::new();
        for (index, state) in states.iter().enumerate() {
            for task in &state.tasks {
                let range = match task {
                    TaskKind::DailyGap(range) => *range,
                    TaskKind::AggregateWindow(range) => *range,
                };
                let request = FetchRequest {
                    key: state.combo.key.clone(),
                    combination: state.combo.contexts.clone(),
                    range,
                    spec: state.spec.with_window(range),
                };
                fetches.push((index, task.clone(), request));
            }
        }
        if fetches.is_empty() {
            return;
        }
        info!(
            fetches = fetches.len(),
            window = %window,
            "gap-filling missing coverage"
        );

        let concurrency = self.config.max_concurrent_fetches.max(1);
        let replies: Vec<_> = stream::iter(fetches)
            .map(|(index, task, request)| async move {
                let reply = adapter.fetch(request.clone()).await;
                (index, task, request, reply)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        // Merges are serialized behind the store's write lock; a failed
        // fetch poisons only its own combination
        let mut mutated = false;
        let mut guard = store.write();
        for (index, task, request, reply) in replies {
            match reply {
                Ok(reply) => {
                    let merge = match task {
                        TaskKind::DailyGap(_) => guard.merge_daily(
                            &request.key,
                            Some(build_daily_signature(&request.spec)),
                            reply.daily_points,
                        ),
                        TaskKind::AggregateWindow(range) => {
                            let (n, k) = reply
                                .daily_points
                                .iter()
                                .fold((0, 0), |(n, k), p| (n + p.n, k + p.k));
                            guard.put_aggregate(
                                &request.key,
                                Some(build_aggregate_signature(&request.spec)),
                                range,
                                n,
                                k,
                            )
                        },
                    };
                    match merge {
                        Ok(()) => mutated = true,
                        Err(e) => {
                            warn!(key = %request.key, error = %e, "merge rejected");
                            states[index].failed = true;
                            states[index].warnings.push(AggregationWarning::FetchFailed {
                                key: request.key.clone(),
                                range: request.range,
                                message: e.to_string(),
                            });
                        },
                    }
                },
                Err(e) => {
                    warn!(key = %request.key, range = %request.range, error = %e, "fetch failed");
                    states[index].failed = true;
                    states[index].warnings.push(AggregationWarning::FetchFailed {
                        key: request.key.clone(),
                        range: request.range,
                        message: e.message,
                    });
                },
            }
        }
        let config = guard.config().clone();
        drop(guard);
        if mutated {
            cache.invalidate(&config);
        }
    }

    // ------------------------------------------------------------------
    // Reduction
    // ------------------------------------------------------------------

    fn reduce(
        &self,
        plan: &Plan,
        outcomes: Vec<ComboOutcome>,
        window: &DateRange,
    ) -> AggregationResult {
        let mut warnings: Vec<AggregationWarning> = Vec::new();
        let mut contributing: Vec<SliceKey> = Vec::new();
        let mut n: u64 = 0;
        let mut k: u64 = 0;
        let mut any_prorated = false;
        let mut covered_values: BTreeSet<String> = BTreeSet::new();

        for outcome in &outcomes {
            warnings.extend(outcome.warnings.iter().cloned());
            if outcome.prorated.is_some() {
                any_prorated = true;
            }
            if let Some((combo_n, combo_k)) = outcome.value {
                n += combo_n;
                k += combo_k;
                contributing.push(outcome.key.clone());
            }
            if outcome.complete {
                if let Plan::Partition { context, .. } = plan {
                    if let Some(value) = outcome.contexts.get(context) {
                        covered_values.insert(value.clone());
                    }
                }
            }
        }

        let status = match plan {
            Plan::Single(_) => {
                let outcome = outcomes.first();
                let complete = outcome.map(|o| o.complete).unwrap_or(false);
                if any_prorated {
                    AggregationStatus::Prorated
                } else if complete {
                    AggregationStatus::Complete
                } else {
                    AggregationStatus::Partial
                }
            },
            Plan::Partition {
                context,
                required,
                equivalent,
                ignored,
                ..
            } => {
                if !ignored.is_empty() {
                    warnings.push(AggregationWarning::IgnoredGroups {
                        contexts: ignored.clone(),
                    });
                }
                match required {
                    Some(required_values) => {
                        let missing: Vec<String> = required_values
                            .iter()
                            .filter(|v| !covered_values.contains(*v))
                            .cloned()
                            .collect();
                        if missing.is_empty() {
                            if !equivalent.is_empty() {
                                warnings.push(AggregationWarning::EquivalentTotals {
                                    used: context.clone(),
                                    alternatives: equivalent.clone(),
                                });
                            }
                            AggregationStatus::MeceAggregated
                        } else {
                            warnings.push(AggregationWarning::MissingMeceValues {
                                context: context.clone(),
                                missing,
                            });
                            AggregationStatus::Partial
                        }
                    },
                    None => {
                        warnings.push(AggregationWarning::NotATotal);
                        AggregationStatus::Partial
                    },
                }
            },
        };

        debug!(status = %status, n, k, window = %window, "aggregation reduced");
        AggregationResult {
            status,
            n,
            k,
            mean: mean_rate(n, k),
            stdev: self.estimator.stdev(n, k),
            contributing,
            warnings,
        }
    }

    // ------------------------------------------------------------------
    // Spec derivation
    // ------------------------------------------------------------------

    /// The normalized spec for one combination: base spec plus resolved
    /// filters for each pinned context
    fn combination_spec(
        &self,
        base: &DataQuerySpec,
        combo: &Combination,
        capability: SourceCapability,
        window: &DateRange,
    ) -> DataQuerySpec {
        let mut filters: Vec<ResolvedFilter> = base.filters.clone();
        for (context, value) in &combo.contexts {
            let descriptor = match self
                .registry
                .source_mapping(context, value, &base.source_id)
            {
                Ok(expr) => expr.describe(),
                Err(e) => {
                    // Registry self-consistency beyond MECE needs is not
                    // validated at query time; fall back to a literal
                    // descriptor
                    debug!(context = %context, value = %value, error = %e,
                        "no source mapping; using literal descriptor");
                    format!("{}=={}", context, value)
                },
            };
            filters.push(ResolvedFilter {
                context: context.clone(),
                descriptor,
            });
        }
        let mut spec = base.with_filters(filters);
        spec.granularity = if capability.daily {
            crate::types::Granularity::Daily
        } else {
            crate::types::Granularity::AggregateOnly
        };
        spec.window = Some(*window);
        spec
    }
}

// ============================================================================
// Internal pipeline state
// ============================================================================

/// One concrete (key → value) context combination and its storage key
#[derive(Debug, Clone)]
struct Combination {
    contexts: BTreeMap<String, String>,
    key: SliceKey,
}

#[derive(Debug, Clone)]
struct Candidate {
    context: String,
    required: Option<Vec<String>>,
    complete_by_presence: bool,
    present: Vec<String>,
}

#[derive(Debug)]
enum Plan {
    Single(Combination),
    Partition {
        context: String,
        required: Option<Vec<String>>,
        combos: Vec<Combination>,
        equivalent: Vec<String>,
        ignored: Vec<String>,
    },
}

#[derive(Debug, Clone)]
enum TaskKind {
    DailyGap(DateRange),
    AggregateWindow(DateRange),
}

#[derive(Debug, Clone, Copy)]
struct PresetValue {
    n: u64,
    k: u64,
    complete: bool,
}

struct ComboState {
    combo: Combination,
    spec: DataQuerySpec,
    capability: SourceCapability,
    tasks: Vec<TaskKind>,
    preset: Option<PresetValue>,
    prorated: Option<f64>,
    failed: bool,
    warnings: Vec<AggregationWarning>,
}

impl ComboState {
    fn new(combo: Combination, spec: DataQuerySpec, capability: SourceCapability) -> Self {
        Self {
            combo,
            spec,
            capability,
            tasks: Vec::new(),
            preset: None,
            prorated: None,
            failed: false,
            warnings: Vec::new(),
        }
    }

    /// Read the final per-combination value out of the merged store
    fn into_outcome(self, store: &SliceStore, window: &DateRange) -> ComboOutcome {
        let mut outcome = ComboOutcome {
            key: self.combo.key.clone(),
            contexts: self.combo.contexts,
            value: None,
            complete: false,
            prorated: self.prorated,
            warnings: self.warnings,
        };
        if self.failed {
            return outcome;
        }
        if let Some(preset) = self.preset {
            outcome.value = Some((preset.n, preset.k));
            outcome.complete = preset.complete;
            return outcome;
        }
        let stored = store.find(&outcome.key);
        if self.capability.daily {
            let series = stored.and_then(|s| s.daily()).unwrap_or(&[]);
            let covered = coverage::covered_dates(series, window);
            if covered.is_empty() {
                return outcome;
            }
            outcome.value = Some(coverage::sum_window(series, window));
            outcome.complete = covered.len() as u64 == window.days();
        } else if let Some((stored_window, n, k)) = stored.and_then(|s| s.aggregate()) {
            if stored_window == *window {
                outcome.value = Some((n, k));
                outcome.complete = true;
            }
        }
        outcome
    }
}

struct ComboOutcome {
    key: SliceKey,
    contexts: BTreeMap<String, String>,
    value: Option<(u64, u64)>,
    complete: bool,
    prorated: Option<f64>,
    warnings: Vec<AggregationWarning>,
}

// ============================================================================
// Family scan
// ============================================================================

struct FamilyMember {
    contexts: BTreeMap<String, String>,
}

/// Stored slices sharing the base's non-context constraints
fn family_members(base: &ParsedConstraintSet, store: &SliceStore) -> Vec<FamilyMember> {
    let mut members = Vec::new();
    for slice in store.slices() {
        let Ok(set) = dsl::parse(slice.key.as_str()) else {
            continue;
        };
        if set.visited == base.visited
            && set.exclude == base.exclude
            && set.cases == base.cases
            && set.window.is_none()
            && set.is_storable()
        {
            members.push(FamilyMember {
                contexts: set.contexts.iter().cloned().collect(),
            });
        }
    }
    members
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ContextDefinition, OtherPolicy};
    use crate::types::{ConfigId, DayCount, Granularity};
    use super::adapter::InMemorySource;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, day).unwrap()
    }

    fn registry() -> Arc<ContextRegistry> {
        Arc::new(
            ContextRegistry::from_definitions(vec![ContextDefinition::enumerated(
                "browser-type",
                &["chrome", "safari", "firefox"],
                OtherPolicy::NoneAssertedComplete,
            )])
            .unwrap(),
        )
    }

    fn base_spec() -> DataQuerySpec {
        DataQuerySpec {
            connection_id: "conn".to_string(),
            source_id: "ga4".to_string(),
            topology_nodes: vec!["landing".to_string(), "checkout".to_string()],
            case_splits: vec![],
            filters: vec![],
            granularity: Granularity::Daily,
            window: None,
        }
    }

    fn request(expression: &str, mode: AggregateMode, capability: SourceCapability) -> AggregateRequest {
        AggregateRequest {
            expression: expression.to_string(),
            mode,
            window: DateRange::new(d(1), d(10)).unwrap(),
            today: d(31),
            capability,
            spec: base_spec(),
        }
    }

    #[test]
    fn test_explode_uses_configured_cap() {
        let engine = AggregationEngine::new(
            registry(),
            EngineConfig::default().with_explosion_cap(2),
        );
        // The bare key expands to all three browser values
        let explosion = engine.explode("visited(checkout).context(browser-type)").unwrap();
        assert_eq!(explosion.keys.len(), 3);
        assert_eq!(
            explosion.warnings,
            vec![dsl::ExplodeWarning::CapExceeded { produced: 3, cap: 2 }]
        );

        let roomy = AggregationEngine::new(registry(), EngineConfig::default());
        let explosion = roomy.explode("visited(checkout).context(browser-type)").unwrap();
        assert!(explosion.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_exact_slice_gap_fill_and_sum() {
        let engine = AggregationEngine::new(registry(), EngineConfig::default());
        let store = RwLock::new(SliceStore::new(ConfigId::new("cfg")));
        let cache = SliceCache::new();
        let key = SliceKey::from_canonical("visited(checkout).context(browser-type:chrome)");
        let source = InMemorySource::new().with_series(
            key.clone(),
            (1..=10).map(|day| DayCount::new(d(day), 10, 2)).collect(),
        );

        let result = engine
            .aggregate(
                &source,
                &store,
                &cache,
                &request(
                    "visited(checkout).context(browser-type:chrome)",
                    AggregateMode::Exact,
                    SourceCapability::daily(),
                ),
            )
            .await
            .unwrap();

        assert_eq!(result.status, AggregationStatus::Complete);
        assert_eq!(result.n, 100);
        assert_eq!(result.k, 20);
        assert!((result.mean - 0.2).abs() < 1e-12);
        assert_eq!(result.contributing, vec![key]);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_warning_not_error() {
        let engine = AggregationEngine::new(registry(), EngineConfig::default());
        let store = RwLock::new(SliceStore::new(ConfigId::new("cfg")));
        let cache = SliceCache::new();
        let key = SliceKey::from_canonical("visited(checkout).context(browser-type:chrome)");
        let source = InMemorySource::new().with_failure(key);

        let result = engine
            .aggregate(
                &source,
                &store,
                &cache,
                &request(
                    "visited(checkout).context(browser-type:chrome)",
                    AggregateMode::Exact,
                    SourceCapability::daily(),
                ),
            )
            .await
            .unwrap();

        assert_eq!(result.status, AggregationStatus::Partial);
        assert_eq!(result.n, 0);
        assert!(result
            .warnings
            .iter()
            .any(|w| matches!(w, AggregationWarning::FetchFailed { .. })));
    }

    #[tokio::test]
    async fn test_mixed_slices_is_hard_error() {
        let engine = AggregationEngine::new(registry(), EngineConfig::default());
        let mut seeded = SliceStore::new(ConfigId::new("cfg"));
        seeded
            .merge_daily(
                &SliceKey::from_canonical("visited(checkout).context(browser-type:chrome)"),
                None,
                vec![DayCount::new(d(1), 10, 1)],
            )
            .unwrap();
        let store = RwLock::new(seeded);
        let cache = SliceCache::new();
        let source = InMemorySource::new();

        let err = engine
            .aggregate(
                &source,
                &store,
                &cache,
                &request(
                    "visited(checkout)",
                    AggregateMode::Exact,
                    SourceCapability::daily(),
                ),
            )
            .await;
        assert!(matches!(
            err,
            Err(crate::error::Error::Configuration(
                ConfigurationError::MixedSlices(_)
            ))
        ));
    }

    #[tokio::test]
    async fn test_partition_total_over_mece_key() {
        let engine = AggregationEngine::new(registry(), EngineConfig::default());
        let mut seeded = SliceStore::new(ConfigId::new("cfg"));
        for value in ["chrome", "safari", "firefox"] {
            seeded
                .merge_daily(
                    &SliceKey::from_canonical(format!(
                        "visited(checkout).context(browser-type:{value})"
                    )),
                    None,
                    (1..=10).map(|day| DayCount::new(d(day), 10, 1)).collect(),
                )
                .unwrap();
        }
        let store = RwLock::new(seeded);
        let cache = SliceCache::new();
        let source = InMemorySource::new();

        let result = engine
            .aggregate(
                &source,
                &store,
                &cache,
                &request(
                    "visited(checkout)",
                    AggregateMode::PartitionTotal,
                    SourceCapability::daily(),
                ),
            )
            .await
            .unwrap();

        assert_eq!(result.status, AggregationStatus::MeceAggregated);
        assert_eq!(result.n, 300);
        assert_eq!(result.k, 30);
        assert_eq!(result.contributing.len(), 3);
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_proration_scales_by_overlap() {
        let engine = AggregationEngine::new(registry(), EngineConfig::default());
        let mut seeded = SliceStore::new(ConfigId::new("cfg"));
        let key = SliceKey::from_canonical("visited(checkout).context(browser-type:chrome)");
        // 31-day stored aggregate; 15/31 of it overlaps the request
        seeded
            .put_aggregate(&key, None, DateRange::new(d(1), d(31)).unwrap(), 3100, 310)
            .unwrap();
        let store = RwLock::new(seeded);
        let cache = SliceCache::new();
        let source = InMemorySource::new();

        let mut req = request(
            "visited(checkout).context(browser-type:chrome)",
            AggregateMode::Exact,
            SourceCapability::aggregate_fixed(),
        );
        req.window = DateRange::new(d(17), d(31)).unwrap();

        let result = engine
            .aggregate(&source, &store, &cache, &req)
            .await
            .unwrap();

        assert_eq!(result.status, AggregationStatus::Prorated);
        assert_eq!(result.n, 1500);
        assert_eq!(result.k, 150);
        assert!(result
            .warnings
            .iter()
            .any(|w| matches!(w, AggregationWarning::Prorated { .. })));
        assert_eq!(source.fetch_count(), 0);
    }
}
