//! Power allocation engine
//!
//! Splits the station budget over the sessions that want power. The core is
//! [`allocate`], a pure function of a registry snapshot and the budget inputs;
//! the same inputs always give the same plan.
//!
//! Uncontended demand is granted in full. Under contention sessions are
//! admitted oldest first while one `min_allocation_kw` slot each still fits,
//! the rest are parked at zero, and the admitted sessions share the budget
//! proportionally to their demand with a floor of
//! `min(min_allocation_kw, demand)` enforced by water-filling. Admission
//! depends only on arrival order, so lowering one request never takes power
//! from another session. BESS boost only joins the budget while demand exceeds the
//! grid budget.

use crate::error::Result;
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::registry::RegistrySnapshot;
use crate::session::ChargingSession;
use serde::{Deserialize, Serialize};

/// Slack for float comparisons on kW sums
pub const EPSILON_KW: f64 = 1e-6;

/// Setpoint for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub session_id: String,
    pub charger_id: String,
    /// Demand after clamping to the charger ceiling
    pub requested_kw: f64,
    pub allocated_kw: f64,
    /// Granted nothing this cycle
    pub suspended: bool,
}

/// Result of one allocation cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationPlan {
    /// One entry per candidate session, ordered by charger id
    pub entries: Vec<Allocation>,
    /// Contract limit minus static load
    pub grid_budget_kw: f64,
    /// Grid budget plus any boost engaged this cycle
    pub budget_kw: f64,
    /// Boost made available to the budget (0 when demand fits the grid)
    pub boost_kw: f64,
    pub total_requested_kw: f64,
    pub total_allocated_kw: f64,
    /// Demand exceeded the budget and had to be rationed
    pub contended: bool,
}

impl AllocationPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Power actually drawn from the battery to serve the plan
    pub fn active_boost_kw(&self) -> f64 {
        (self.total_allocated_kw - self.grid_budget_kw).max(0.0)
    }

    pub fn allocation_for(&self, charger_id: &str) -> Option<&Allocation> {
        self.entries.iter().find(|a| a.charger_id == charger_id)
    }
}

struct Candidate<'a> {
    session: &'a ChargingSession,
    demand_kw: f64,
    floor_kw: f64,
}

/// Compute allocations for every session that wants power
pub fn allocate(
    snapshot: &RegistrySnapshot,
    boost_kw: f64,
    grid_budget_kw: f64,
    min_allocation_kw: f64,
) -> AllocationPlan {
    let grid_budget_kw = grid_budget_kw.max(0.0);
    let min_allocation_kw = min_allocation_kw.max(0.0);
    let mut candidates: Vec<Candidate<'_>> = snapshot
        .sessions
        .iter()
        .filter(|s| s.status.wants_power())
        .map(|s| {
            let ceiling = snapshot
                .charger_max_kw
                .get(&s.charger_id)
                .copied()
                .unwrap_or(f64::INFINITY);
            let demand_kw = s.requested_power_kw.min(ceiling).max(0.0);
            Candidate {
                session: s,
                demand_kw,
                floor_kw: min_allocation_kw.min(demand_kw),
            }
        })
        .collect();

    if candidates.is_empty() {
        return AllocationPlan {
            grid_budget_kw,
            budget_kw: grid_budget_kw,
            ..AllocationPlan::default()
        };
    }

    let total_requested_kw: f64 = candidates.iter().map(|c| c.demand_kw).sum();
    let boost_kw = if total_requested_kw > grid_budget_kw + EPSILON_KW {
        boost_kw.max(0.0)
    } else {
        0.0
    };
    let budget_kw = grid_budget_kw + boost_kw;
    let contended = total_requested_kw > budget_kw + EPSILON_KW;

    let granted: Vec<f64> = if contended {
        ration(&mut candidates, budget_kw, min_allocation_kw)
    } else {
        candidates.iter().map(|c| c.demand_kw).collect()
    };

    let mut entries: Vec<Allocation> = candidates
        .iter()
        .zip(granted)
        .map(|(c, allocated_kw)| Allocation {
            session_id: c.session.id.clone(),
            charger_id: c.session.charger_id.clone(),
            requested_kw: c.demand_kw,
            allocated_kw,
            suspended: allocated_kw <= EPSILON_KW,
        })
        .collect();
    entries.sort_by(|a, b| a.charger_id.cmp(&b.charger_id));

    let total_allocated_kw = entries.iter().map(|a| a.allocated_kw).sum();
    AllocationPlan {
        entries,
        grid_budget_kw,
        budget_kw,
        boost_kw,
        total_requested_kw,
        total_allocated_kw,
        contended,
    }
}

/// Contended split. Reorders `candidates` oldest first and returns the grant
/// for each position. Every session reserves a full `slot_kw` for admission,
/// whatever its own demand.
fn ration(candidates: &mut [Candidate<'_>], budget_kw: f64, slot_kw: f64) -> Vec<f64> {
    candidates.sort_by(|a, b| {
        a.session
            .connected_at
            .cmp(&b.session.connected_at)
            .then_with(|| a.session.charger_id.cmp(&b.session.charger_id))
    });

    // Oldest sessions claim their slots first; the first one that no longer
    // fits cuts off everyone connected after it.
    let mut reserved_kw = 0.0;
    let mut admitted = 0;
    while admitted < candidates.len() && reserved_kw + slot_kw <= budget_kw + EPSILON_KW {
        reserved_kw += slot_kw;
        admitted += 1;
    }

    let mut granted = vec![0.0; candidates.len()];
    let admitted_demand: f64 = candidates[..admitted].iter().map(|c| c.demand_kw).sum();
    if admitted_demand <= budget_kw + EPSILON_KW {
        for (g, c) in granted.iter_mut().zip(candidates.iter()).take(admitted) {
            *g = c.demand_kw;
        }
        return granted;
    }

    let mut pinned = vec![false; admitted];
    let mut remaining_kw = budget_kw;
    loop {
        let share_base: f64 = (0..admitted)
            .filter(|&i| !pinned[i])
            .map(|i| candidates[i].demand_kw)
            .sum();
        if share_base <= EPSILON_KW {
            break;
        }
        let ratio = (remaining_kw / share_base).clamp(0.0, 1.0);

        let mut newly_pinned = false;
        for i in 0..admitted {
            let c = &candidates[i];
            if !pinned[i] && c.demand_kw * ratio < c.floor_kw - EPSILON_KW {
                pinned[i] = true;
                granted[i] = c.floor_kw;
                remaining_kw -= c.floor_kw;
                newly_pinned = true;
            }
        }

        if !newly_pinned {
            for i in (0..admitted).filter(|&i| !pinned[i]) {
                granted[i] = candidates[i].demand_kw * ratio;
            }
            break;
        }
    }
    granted
}

/// Allocation engine: [`allocate`] plus boost fallback and logging
#[derive(Debug, Clone)]
pub struct AllocationEngine {
    min_allocation_kw: f64,
    logger: StructuredLogger,
}

impl AllocationEngine {
    pub fn new(station_id: &str, min_allocation_kw: f64) -> Self {
        Self {
            min_allocation_kw,
            logger: get_logger_with_context(
                LogContext::new("engine").with_station_id(station_id),
            ),
        }
    }

    pub const fn min_allocation_kw(&self) -> f64 {
        self.min_allocation_kw
    }

    /// Run one cycle. A failed boost figure falls back to the grid budget alone.
    pub fn run(
        &self,
        snapshot: &RegistrySnapshot,
        boost: Result<f64>,
        grid_budget_kw: f64,
    ) -> AllocationPlan {
        let boost_kw = match boost {
            Ok(kw) => kw,
            Err(e) => {
                self.logger
                    .warn(&format!("Boost unavailable, using grid budget only: {e}"));
                0.0
            }
        };

        let plan = allocate(snapshot, boost_kw, grid_budget_kw, self.min_allocation_kw);
        if plan.is_empty() {
            self.logger.trace("No active sessions; nothing to allocate");
            return plan;
        }

        let suspended = plan.entries.iter().filter(|a| a.suspended).count();
        let summary = format!(
            "Allocated {:.2} of {:.2} kW requested over {} sessions (budget {:.2} kW, boost {:.2} kW, suspended {})",
            plan.total_allocated_kw,
            plan.total_requested_kw,
            plan.entries.len(),
            plan.budget_kw,
            plan.boost_kw,
            suspended
        );
        if plan.contended {
            self.logger.info(&summary);
        } else {
            self.logger.debug(&summary);
        }
        plan
    }
}
