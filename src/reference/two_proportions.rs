//! Two-proportion group sequential test built on the component protocol.
//!
//! Three stages run in order at every look:
//! - [`WaldZStatistic`]: unpooled Wald Z over all observations so far
//! - [`FixedAlphaBoundary`]: two-sided normal critical value for the design's alpha
//! - [`BoundarySignaler`]: `stop` once |Z| crosses the boundary
//!
//! Group B is the variant: a better B yields a positive Z.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::component::{Component, Role, StageLabels, StepContext, StepOutcome, Upstream};
use crate::core::{replay, Ledger, Payload, PayloadRegistry, Projection, ReplayBound};
use crate::domain::{Event, EventDraft, EventFilter, Namespace, TimeIndex};
use crate::error::{LedgerError, Result};
use crate::runtime::Plan;

pub const STAT_TAG: &str = "stat:waldz";
pub const CRITERIA_TAG: &str = "crit:gst";
pub const DECISION_TAG: &str = "gst:decision";
pub const DESIGN_TAG: &str = "design:two_prop";
pub const OBSERVATION_TAG: &str = "obs";

fn default_min_observations() -> u64 {
    2
}

/// Experiment design.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwoPropDesign {
    /// Two-sided Type I error rate
    pub alpha: f64,

    /// Total trials required before any stop signal
    #[serde(default = "default_min_observations")]
    pub min_observations: u64,
}

impl Payload for TwoPropDesign {
    const PAYLOAD_TYPE: &'static str = "TwoPropDesign";
}

/// One batch of Bernoulli trials per arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TwoPropObsBatch {
    #[serde(rename = "nA")]
    pub n_a: u64,
    #[serde(rename = "nB")]
    pub n_b: u64,
    #[serde(rename = "mA")]
    pub m_a: u64,
    #[serde(rename = "mB")]
    pub m_b: u64,
}

impl Payload for TwoPropObsBatch {
    const PAYLOAD_TYPE: &'static str = "TwoPropObsBatch";
}

/// Wald Z statistic and the counts it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaldZ {
    pub z: f64,
    /// Standard error; `None` when undefined (an empty arm or zero variance)
    pub se: Option<f64>,
    #[serde(rename = "nA")]
    pub n_a: u64,
    #[serde(rename = "nB")]
    pub n_b: u64,
    #[serde(rename = "mA")]
    pub m_a: u64,
    #[serde(rename = "mB")]
    pub m_b: u64,
    #[serde(rename = "pA_hat")]
    pub p_a_hat: f64,
    #[serde(rename = "pB_hat")]
    pub p_b_hat: f64,
}

impl Payload for WaldZ {
    const PAYLOAD_TYPE: &'static str = "WaldZ";
}

impl WaldZ {
    /// Unpooled Wald Z for `H0: pA = pB`.
    pub fn from_counts(totals: &TwoPropObsBatch) -> Self {
        let TwoPropObsBatch { n_a, n_b, m_a, m_b } = *totals;
        let mut stat = Self {
            z: 0.0,
            se: None,
            n_a,
            n_b,
            m_a,
            m_b,
            p_a_hat: 0.0,
            p_b_hat: 0.0,
        };
        if n_a == 0 || n_b == 0 {
            return stat;
        }

        let (na, nb) = (n_a as f64, n_b as f64);
        stat.p_a_hat = m_a as f64 / na;
        stat.p_b_hat = m_b as f64 / nb;
        let var = stat.p_a_hat * (1.0 - stat.p_a_hat) / na + stat.p_b_hat * (1.0 - stat.p_b_hat) / nb;
        if var > 0.0 {
            let se = var.sqrt();
            stat.se = Some(se);
            stat.z = (stat.p_b_hat - stat.p_a_hat) / se;
        }
        stat
    }

    pub fn total_n(&self) -> u64 {
        self.n_a + self.n_b
    }
}

/// Two-sided critical boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boundary {
    pub upper: f64,
    pub lower: f64,
    pub alpha: f64,
}

impl Payload for Boundary {
    const PAYLOAD_TYPE: &'static str = "GSTBoundary";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Stop,
    Continue,
}

/// Stop/continue decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub reason: String,
    pub z: f64,
    pub threshold: f64,
    pub total_n: u64,
    #[serde(rename = "pA_hat")]
    pub p_a_hat: f64,
    #[serde(rename = "pB_hat")]
    pub p_b_hat: f64,
}

impl Payload for Decision {
    const PAYLOAD_TYPE: &'static str = "Signal";
}

/// Register every payload type of this scheme.
pub fn register_payloads(registry: &PayloadRegistry) -> Result<()> {
    registry.register::<TwoPropDesign>()?;
    registry.register::<TwoPropObsBatch>()?;
    registry.register::<WaldZ>()?;
    registry.register::<Boundary>()?;
    registry.register::<Decision>()?;
    Ok(())
}

/// The statistic -> criteria -> signal plan.
pub fn gst_plan() -> Plan {
    Plan::new("two_prop_gst")
        .stage(WaldZStatistic::default())
        .stage(FixedAlphaBoundary::default())
        .stage(BoundarySignaler::default())
}

/// Record the design for `entity_id`.
pub async fn record_design(
    ledger: &Ledger,
    entity_id: &str,
    time_index: impl Into<TimeIndex>,
    design: &TwoPropDesign,
) -> Result<Event> {
    let time_index = time_index.into();
    let draft = EventDraft::new(entity_id, Namespace::Design, "registered", time_index.clone())
        .step_key(format!("design:{}", time_index))
        .tag(DESIGN_TAG);
    ledger.append_typed(draft, design).await
}

/// Record one observation batch for `entity_id`.
pub async fn record_observation(
    ledger: &Ledger,
    entity_id: &str,
    time_index: impl Into<TimeIndex>,
    batch: &TwoPropObsBatch,
) -> Result<Event> {
    let time_index = time_index.into();
    let draft = EventDraft::new(entity_id, Namespace::Observation, "observation", time_index.clone())
        .step_key(format!("obs:{}", time_index))
        .tag(OBSERVATION_TAG);
    ledger.append_typed(draft, batch).await
}

/// Sum of every observation batch replayed into it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationTotals {
    pub totals: TwoPropObsBatch,
    pub batches: usize,
}

impl Projection for ObservationTotals {
    fn apply(&mut self, event: &Event, registry: &PayloadRegistry) -> Result<()> {
        if event.payload_type() != TwoPropObsBatch::PAYLOAD_TYPE {
            return Ok(());
        }
        let batch: TwoPropObsBatch = registry.decode(event)?;
        let overflow = |field: &str| LedgerError::MalformedPayload {
            payload_type: TwoPropObsBatch::PAYLOAD_TYPE.to_string(),
            message: format!("{} total overflows u64 at event {}", field, event.id()),
        };
        let t = &self.totals;
        let summed = TwoPropObsBatch {
            n_a: t.n_a.checked_add(batch.n_a).ok_or_else(|| overflow("nA"))?,
            n_b: t.n_b.checked_add(batch.n_b).ok_or_else(|| overflow("nB"))?,
            m_a: t.m_a.checked_add(batch.m_a).ok_or_else(|| overflow("mA"))?,
            m_b: t.m_b.checked_add(batch.m_b).ok_or_else(|| overflow("mB"))?,
        };
        self.totals = summed;
        self.batches += 1;
        Ok(())
    }
}

fn design_filter() -> EventFilter {
    EventFilter::any()
        .namespace(Namespace::Design)
        .payload_type(TwoPropDesign::PAYLOAD_TYPE)
}

/// Producer: Wald Z over all observations visible at this step.
#[derive(Debug, Clone)]
pub struct WaldZStatistic {
    labels: StageLabels,
}

impl Default for WaldZStatistic {
    fn default() -> Self {
        Self {
            labels: StageLabels::for_role(Role::Statistic).with_tag(STAT_TAG),
        }
    }
}

#[async_trait]
impl Component for WaldZStatistic {
    fn name(&self) -> &str {
        "waldz"
    }

    fn role(&self) -> Role {
        Role::Statistic
    }

    async fn step(&self, ctx: &StepContext) -> Result<StepOutcome> {
        if let Upstream::Missing(outcome) = ctx.require_latest::<TwoPropDesign>(design_filter(), "design").await? {
            return Ok(outcome);
        }

        let filter = ctx
            .visible()
            .namespace(Namespace::Observation)
            .payload_type(TwoPropObsBatch::PAYLOAD_TYPE);
        let mut observed = ObservationTotals::default();
        replay(ctx.reader(), &filter, &ReplayBound::All, &mut observed).await?;
        if observed.batches == 0 {
            return Ok(StepOutcome::skipped("observations"));
        }

        let stat = WaldZ::from_counts(&observed.totals);
        debug!(z = stat.z, total_n = stat.total_n(), batches = observed.batches, "Computed Wald Z");
        ctx.emit_labeled(&self.labels, &stat).await?;
        Ok(StepOutcome::Advanced)
    }
}

/// Gate: fixed two-sided boundary `Φ⁻¹(1 - α/2)`.
#[derive(Debug, Clone)]
pub struct FixedAlphaBoundary {
    labels: StageLabels,
}

impl Default for FixedAlphaBoundary {
    fn default() -> Self {
        Self {
            labels: StageLabels::for_role(Role::Criteria).with_tag(CRITERIA_TAG),
        }
    }
}

#[async_trait]
impl Component for FixedAlphaBoundary {
    fn name(&self) -> &str {
        "fixed_alpha_boundary"
    }

    fn role(&self) -> Role {
        Role::Criteria
    }

    async fn step(&self, ctx: &StepContext) -> Result<StepOutcome> {
        let stat_filter = EventFilter::any().namespace(Namespace::Statistic).tag(STAT_TAG);
        if let Upstream::Missing(outcome) = ctx.require_latest::<WaldZ>(stat_filter, "statistic").await? {
            return Ok(outcome);
        }
        let design = match ctx.require_latest::<TwoPropDesign>(design_filter(), "design").await? {
            Upstream::Ready(design) => design,
            Upstream::Missing(outcome) => return Ok(outcome),
        };

        if !(design.alpha > 0.0 && design.alpha < 1.0) {
            return Err(LedgerError::component(
                self.name(),
                format!("alpha must be in (0, 1), got {}", design.alpha),
            ));
        }

        let upper = inverse_normal_cdf(1.0 - design.alpha / 2.0);
        let boundary = Boundary {
            upper,
            lower: -upper,
            alpha: design.alpha,
        };
        ctx.emit_labeled(&self.labels, &boundary).await?;
        Ok(StepOutcome::Advanced)
    }
}

/// Decision: stop once |Z| reaches the boundary.
///
/// "Continue" decisions are written only when the step's signal policy asks
/// for them.
#[derive(Debug, Clone)]
pub struct BoundarySignaler {
    labels: StageLabels,
}

impl Default for BoundarySignaler {
    fn default() -> Self {
        Self {
            labels: StageLabels::for_role(Role::Signaler).with_tag(DECISION_TAG),
        }
    }
}

impl BoundarySignaler {
    /// Pure decision rule.
    pub fn decide(stat: &WaldZ, boundary: &Boundary, min_observations: u64) -> Decision {
        let (action, reason) = if stat.total_n() < min_observations {
            (Action::Continue, "insufficient_observations")
        } else if stat.z.abs() >= boundary.upper {
            let reason = if stat.z > 0.0 {
                "significant"
            } else {
                "significant_negative"
            };
            (Action::Stop, reason)
        } else {
            (Action::Continue, "within_boundary")
        };

        Decision {
            action,
            reason: reason.to_string(),
            z: stat.z,
            threshold: boundary.upper,
            total_n: stat.total_n(),
            p_a_hat: stat.p_a_hat,
            p_b_hat: stat.p_b_hat,
        }
    }
}

#[async_trait]
impl Component for BoundarySignaler {
    fn name(&self) -> &str {
        "boundary_signaler"
    }

    fn role(&self) -> Role {
        Role::Signaler
    }

    async fn step(&self, ctx: &StepContext) -> Result<StepOutcome> {
        let stat_filter = EventFilter::any().namespace(Namespace::Statistic).tag(STAT_TAG);
        let stat = match ctx.require_latest::<WaldZ>(stat_filter, "statistic").await? {
            Upstream::Ready(stat) => stat,
            Upstream::Missing(outcome) => return Ok(outcome),
        };
        let crit_filter = EventFilter::any().namespace(Namespace::Criteria).tag(CRITERIA_TAG);
        let boundary = match ctx.require_latest::<Boundary>(crit_filter, "criteria").await? {
            Upstream::Ready(boundary) => boundary,
            Upstream::Missing(outcome) => return Ok(outcome),
        };
        let design = match ctx.require_latest::<TwoPropDesign>(design_filter(), "design").await? {
            Upstream::Ready(design) => design,
            Upstream::Missing(outcome) => return Ok(outcome),
        };

        let decision = Self::decide(&stat, &boundary, design.min_observations);
        if decision.action == Action::Continue && !ctx.policy().record_continue {
            return Ok(StepOutcome::Quiet);
        }
        ctx.emit_labeled(&self.labels, &decision).await?;
        Ok(StepOutcome::Advanced)
    }
}

/// Standard normal quantile (Acklam's rational approximation, relative
/// error below 1.2e-9). `p` must lie in (0, 1).
pub fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -inverse_normal_cdf(1.0 - p)
    }
}
