//! Multi-criteria agent selection.
//!
//! Selection runs a fixed pipeline: take the eligible agents from a
//! [`CandidateSource`], apply hard filters in order, score the survivors with
//! the chosen [`SelectionStrategy`], then pick the best or return the ranking.
//! Selection is advisory and reserves nothing on the chosen agent.

use crate::core::agent::{contains_tag, AgentId, RegisteredAgent};
use crate::error::{Error, Result};
use crate::orchestration::registry::CandidateSource;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// Weight of the required-skill ratio in the skill sub-score.
const REQUIRED_SKILL_WEIGHT: f64 = 0.7;
/// Weight of the preferred-skill ratio in the skill sub-score.
const PREFERRED_SKILL_WEIGHT: f64 = 0.3;
/// Added to the composite score when the agent runs on the preferred runtime.
pub const RUNTIME_BONUS: f64 = 0.1;

/// Scoring strategy, selected by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Fraction of required and preferred skills covered.
    SkillMatch,
    /// Cheapest agent wins.
    CostOptimized,
    /// Fast agents win, discounted by their current load.
    SpeedOptimized,
    /// Most reliable agent wins; cost breaks ties.
    ReliabilityOptimized,
    /// Least loaded agent wins.
    LoadBalanced,
    /// Weighted sum of skill, cost, reliability, load and speed.
    #[default]
    Balanced,
}

impl SelectionStrategy {
    pub const ALL: [SelectionStrategy; 6] = [
        SelectionStrategy::SkillMatch,
        SelectionStrategy::CostOptimized,
        SelectionStrategy::SpeedOptimized,
        SelectionStrategy::ReliabilityOptimized,
        SelectionStrategy::LoadBalanced,
        SelectionStrategy::Balanced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::SkillMatch => "skill-match",
            SelectionStrategy::CostOptimized => "cost-optimized",
            SelectionStrategy::SpeedOptimized => "speed-optimized",
            SelectionStrategy::ReliabilityOptimized => "reliability-optimized",
            SelectionStrategy::LoadBalanced => "load-balanced",
            SelectionStrategy::Balanced => "balanced",
        }
    }

    /// Composite score from the sub-scores.
    fn composite(&self, details: &ScoreBreakdown, weights: &ScoreWeights) -> f64 {
        match self {
            SelectionStrategy::SkillMatch => details.skill,
            SelectionStrategy::CostOptimized => details.cost,
            SelectionStrategy::SpeedOptimized => details.speed,
            SelectionStrategy::ReliabilityOptimized => details.reliability,
            SelectionStrategy::LoadBalanced => details.load,
            SelectionStrategy::Balanced => {
                weights.skill * details.skill
                    + weights.cost * details.cost
                    + weights.reliability * details.reliability
                    + weights.load * details.load
                    + weights.speed * details.speed
            }
        }
    }

    /// Tie-break between equal composites before falling back to
    /// registration order.
    fn tie_break(&self, a: &RegisteredAgent, b: &RegisteredAgent) -> Ordering {
        match self {
            SelectionStrategy::ReliabilityOptimized => a
                .capabilities
                .cost_per_hour
                .total_cmp(&b.capabilities.cost_per_hour),
            _ => Ordering::Equal,
        }
    }
}

impl std::fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SelectionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| Error::Validation(format!("unknown selection strategy: {s}")))
    }
}

/// Relative weights for [`SelectionStrategy::Balanced`].
///
/// Weights need not sum to one; only their relative size matters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub skill: f64,
    pub cost: f64,
    pub reliability: f64,
    pub load: f64,
    pub speed: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            skill: 0.4,
            cost: 0.2,
            reliability: 0.25,
            load: 0.15,
            speed: 0.0,
        }
    }
}

impl ScoreWeights {
    pub fn validate(&self) -> Result<()> {
        let all = [self.skill, self.cost, self.reliability, self.load, self.speed];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::Validation(format!(
                "score weights must be finite and non-negative: {self:?}"
            )));
        }
        Ok(())
    }
}

/// Hard-constraint category, reported when filtering eliminates everyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// No healthy agent to start from.
    HealthyAgents,
    RequiredSkills,
    RequiredSpecialties,
    RequiredLanguages,
    MaxCost,
    MinReliability,
    MinSpeed,
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConstraintKind::HealthyAgents => "healthy agents",
            ConstraintKind::RequiredSkills => "required skills",
            ConstraintKind::RequiredSpecialties => "required specialties",
            ConstraintKind::RequiredLanguages => "required languages",
            ConstraintKind::MaxCost => "max cost",
            ConstraintKind::MinReliability => "min reliability",
            ConstraintKind::MinSpeed => "min speed",
        };
        write!(f, "{label}")
    }
}

/// What the caller needs from an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionCriteria {
    /// Every skill must be present (case-insensitive).
    pub required_skills: Vec<String>,
    /// Scored bonus per matching skill.
    pub preferred_skills: Vec<String>,
    pub required_specialties: Vec<String>,
    pub required_languages: Vec<String>,
    pub max_cost_per_hour: Option<f64>,
    pub min_reliability: Option<f64>,
    pub min_speed: Option<f64>,
    /// Soft preference; boosts the score, never excludes.
    pub preferred_runtime: Option<String>,
    pub strategy: SelectionStrategy,
    /// Overrides the default weights for the balanced strategy.
    pub weights: Option<ScoreWeights>,
    /// Agents never to return, e.g. ones that just failed this work.
    pub exclude: Vec<AgentId>,
}

impl SelectionCriteria {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn require_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn prefer_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preferred_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn require_specialties<I, S>(mut self, specialties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_specialties = specialties.into_iter().map(Into::into).collect();
        self
    }

    pub fn require_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_languages = languages.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_cost(mut self, cost: f64) -> Self {
        self.max_cost_per_hour = Some(cost);
        self
    }

    pub fn min_reliability(mut self, reliability: f64) -> Self {
        self.min_reliability = Some(reliability);
        self
    }

    pub fn min_speed(mut self, speed: f64) -> Self {
        self.min_speed = Some(speed);
        self
    }

    pub fn prefer_runtime(mut self, runtime: &str) -> Self {
        self.preferred_runtime = Some(runtime.to_string());
        self
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn excluding(mut self, agent: AgentId) -> Self {
        if !self.exclude.contains(&agent) {
            self.exclude.push(agent);
        }
        self
    }
}

/// Every sub-score, reported regardless of the strategy used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// `0.7 * required ratio + 0.3 * preferred ratio`; an empty list counts as fully met.
    pub skill: f64,
    /// Cheapest candidate cost divided by this agent's cost.
    pub cost: f64,
    pub reliability: f64,
    /// `1 - load`.
    pub load: f64,
    /// Speed relative to the fastest candidate, discounted by load.
    pub speed: f64,
    /// [`RUNTIME_BONUS`] when the runtime matches the preference, else 0.
    pub runtime_bonus: f64,
}

/// Outcome of a selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    /// Snapshot of the chosen agent at selection time.
    pub agent: RegisteredAgent,
    pub score: f64,
    pub strategy: SelectionStrategy,
    pub details: ScoreBreakdown,
    /// Candidates left after hard filtering.
    pub candidates_considered: usize,
}

impl SelectionResult {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent.id
    }
}

/// Filters and scores agents from a candidate source.
#[derive(Clone)]
pub struct AgentSelector {
    source: Arc<dyn CandidateSource>,
    default_weights: ScoreWeights,
}

impl AgentSelector {
    pub fn new(source: Arc<dyn CandidateSource>) -> Self {
        Self {
            source,
            default_weights: ScoreWeights::default(),
        }
    }

    /// Replace the weights used when criteria carry none.
    pub fn with_default_weights(mut self, weights: ScoreWeights) -> Self {
        self.default_weights = weights;
        self
    }

    /// Best single agent.
    ///
    /// # Errors
    /// `Error::Selection` naming the constraint that eliminated the last candidates.
    pub fn select_agent(&self, criteria: &SelectionCriteria) -> Result<SelectionResult> {
        let mut ranked = self.evaluate(criteria)?;
        let best = ranked.swap_remove(0);
        debug!(
            agent_id = %best.agent.id,
            score = best.score,
            strategy = %best.strategy,
            candidates = best.candidates_considered,
            "agent selected"
        );
        Ok(best)
    }

    /// Top `count` distinct agents, best first.
    ///
    /// # Errors
    /// `Error::NotEnoughCandidates` when fewer than `count` pass filtering.
    pub fn select_multiple_agents(
        &self,
        criteria: &SelectionCriteria,
        count: usize,
    ) -> Result<Vec<SelectionResult>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut ranked = match self.evaluate(criteria) {
            Ok(ranked) => ranked,
            Err(Error::Selection { .. }) => {
                return Err(Error::NotEnoughCandidates {
                    requested: count,
                    available: 0,
                })
            }
            Err(e) => return Err(e),
        };
        if ranked.len() < count {
            return Err(Error::NotEnoughCandidates {
                requested: count,
                available: ranked.len(),
            });
        }
        ranked.truncate(count);
        Ok(ranked)
    }

    /// Every passing candidate, best first. Empty when none pass.
    ///
    /// Invalid weights also yield an empty ranking and are logged at warn;
    /// `select_agent` reports them as a `Validation` error.
    pub fn rank_agents(&self, criteria: &SelectionCriteria) -> Vec<SelectionResult> {
        match self.evaluate(criteria) {
            Ok(ranked) => ranked,
            Err(Error::Validation(reason)) => {
                warn!(reason = %reason, "Refusing to rank agents with invalid weights");
                Vec::new()
            }
            Err(e) => {
                debug!(error = %e, "No agents ranked");
                Vec::new()
            }
        }
    }

    fn evaluate(&self, criteria: &SelectionCriteria) -> Result<Vec<SelectionResult>> {
        let weights = criteria.weights.unwrap_or(self.default_weights);
        weights.validate()?;
        rank_candidates(self.source.candidates(), criteria, &weights)
    }
}

impl std::fmt::Debug for AgentSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSelector")
            .field("default_weights", &self.default_weights)
            .finish()
    }
}

/// Filter, score and sort `candidates`. Never returns an empty `Ok`.
pub fn rank_candidates(
    candidates: Vec<RegisteredAgent>,
    criteria: &SelectionCriteria,
    weights: &ScoreWeights,
) -> Result<Vec<SelectionResult>> {
    let candidates = filter_candidates(candidates, criteria)?;
    let count = candidates.len();

    let min_cost = candidates
        .iter()
        .map(|a| a.capabilities.cost_per_hour)
        .fold(f64::INFINITY, f64::min);
    let max_speed = candidates
        .iter()
        .map(|a| a.capabilities.average_speed)
        .fold(0.0, f64::max);

    let mut ranked: Vec<SelectionResult> = candidates
        .into_iter()
        .map(|agent| {
            let details = score_breakdown(&agent, criteria, min_cost, max_speed);
            let score = criteria.strategy.composite(&details, weights) + details.runtime_bonus;
            SelectionResult {
                agent,
                score,
                strategy: criteria.strategy,
                details,
                candidates_considered: count,
            }
        })
        .collect();

    // Stable sort keeps registration order for full ties.
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| criteria.strategy.tie_break(&a.agent, &b.agent))
    });
    Ok(ranked)
}

fn filter_candidates(
    agents: Vec<RegisteredAgent>,
    criteria: &SelectionCriteria,
) -> Result<Vec<RegisteredAgent>> {
    let mut pool: Vec<RegisteredAgent> = agents
        .into_iter()
        .filter(|a| a.is_healthy() && !criteria.exclude.contains(&a.id))
        .collect();
    ensure_remaining(&pool, ConstraintKind::HealthyAgents, || {
        "no healthy agents are available".to_string()
    })?;

    pool.retain(|a| {
        criteria
            .required_skills
            .iter()
            .all(|s| a.capabilities.has_skill(s))
    });
    ensure_remaining(&pool, ConstraintKind::RequiredSkills, || {
        format!("no agent has all of [{}]", criteria.required_skills.join(", "))
    })?;

    pool.retain(|a| {
        criteria
            .required_specialties
            .iter()
            .all(|s| a.capabilities.has_specialty(s))
    });
    ensure_remaining(&pool, ConstraintKind::RequiredSpecialties, || {
        format!(
            "no agent has all of [{}]",
            criteria.required_specialties.join(", ")
        )
    })?;

    pool.retain(|a| {
        criteria
            .required_languages
            .iter()
            .all(|l| a.capabilities.has_language(l))
    });
    ensure_remaining(&pool, ConstraintKind::RequiredLanguages, || {
        format!(
            "no agent speaks all of [{}]",
            criteria.required_languages.join(", ")
        )
    })?;

    if let Some(max) = criteria.max_cost_per_hour {
        pool.retain(|a| a.capabilities.cost_per_hour <= max);
        ensure_remaining(&pool, ConstraintKind::MaxCost, || {
            format!("no agent costs at most {max} per hour")
        })?;
    }

    if let Some(min) = criteria.min_reliability {
        pool.retain(|a| a.capabilities.reliability >= min);
        ensure_remaining(&pool, ConstraintKind::MinReliability, || {
            format!("no agent has reliability of at least {min}")
        })?;
    }

    if let Some(min) = criteria.min_speed {
        pool.retain(|a| a.capabilities.average_speed >= min);
        ensure_remaining(&pool, ConstraintKind::MinSpeed, || {
            format!("no agent has speed of at least {min}")
        })?;
    }

    Ok(pool)
}

fn ensure_remaining(
    pool: &[RegisteredAgent],
    constraint: ConstraintKind,
    message: impl FnOnce() -> String,
) -> Result<()> {
    if pool.is_empty() {
        return Err(Error::Selection {
            constraint,
            message: message(),
        });
    }
    Ok(())
}

fn score_breakdown(
    agent: &RegisteredAgent,
    criteria: &SelectionCriteria,
    min_cost: f64,
    max_speed: f64,
) -> ScoreBreakdown {
    let caps = &agent.capabilities;
    let required = match_ratio(&criteria.required_skills, &caps.skills);
    let preferred = match_ratio(&criteria.preferred_skills, &caps.skills);
    let idle = (1.0 - agent.load).clamp(0.0, 1.0);
    let runtime_bonus = match &criteria.preferred_runtime {
        Some(runtime) if agent.runtime.eq_ignore_ascii_case(runtime) => RUNTIME_BONUS,
        _ => 0.0,
    };

    ScoreBreakdown {
        skill: REQUIRED_SKILL_WEIGHT * required + PREFERRED_SKILL_WEIGHT * preferred,
        cost: min_cost / caps.cost_per_hour,
        reliability: caps.reliability,
        load: idle,
        speed: if max_speed > 0.0 {
            caps.average_speed / max_speed * idle
        } else {
            0.0
        },
        runtime_bonus,
    }
}

fn match_ratio(wanted: &[String], have: &[String]) -> f64 {
    if wanted.is_empty() {
        return 1.0;
    }
    let matched = wanted.iter().filter(|w| contains_tag(have, w)).count();
    matched as f64 / wanted.len() as f64
}
