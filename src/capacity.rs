//! Station capacity model
//!
//! Tracks the contractual ceiling and what the last committed plan drew
//! against it. `commit` is the last line of defence for the capacity
//! invariant: a plan that would exceed the budget is refused and the
//! previous usage figures stay in place.

use crate::allocation::{AllocationPlan, EPSILON_KW};
use crate::config::Config;
use crate::error::{PowershareError, Result};
use serde::{Deserialize, Serialize};

/// Read-only usage figures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapacityUsage {
    pub contract_limit_kw: f64,
    pub static_load_kw: f64,
    pub grid_budget_kw: f64,
    pub current_total_allocated_kw: f64,
    pub active_bess_contribution_kw: f64,
    pub bess_charge_kw: f64,
    /// Grid draw including auxiliaries and battery charging
    pub grid_import_kw: f64,
}

#[derive(Debug, Clone)]
pub struct CapacityModel {
    contract_limit_kw: f64,
    static_load_kw: f64,
    current_total_allocated_kw: f64,
    active_bess_contribution_kw: f64,
    bess_charge_kw: f64,
}

impl CapacityModel {
    pub const fn new(contract_limit_kw: f64, static_load_kw: f64) -> Self {
        Self {
            contract_limit_kw,
            static_load_kw,
            current_total_allocated_kw: 0.0,
            active_bess_contribution_kw: 0.0,
            bess_charge_kw: 0.0,
        }
    }

    pub const fn from_config(config: &Config) -> Self {
        Self::new(config.station.contract_limit_kw, config.station.static_load_kw)
    }

    /// Contract limit minus station auxiliaries
    pub fn grid_budget(&self) -> f64 {
        (self.contract_limit_kw - self.static_load_kw).max(0.0)
    }

    pub const fn current_total_allocated_kw(&self) -> f64 {
        self.current_total_allocated_kw
    }

    pub const fn active_bess_contribution_kw(&self) -> f64 {
        self.active_bess_contribution_kw
    }

    /// Record a plan as the station's current draw
    pub fn commit(&mut self, plan: &AllocationPlan) -> Result<()> {
        let grid_budget = self.grid_budget();
        let contribution = (plan.total_allocated_kw - grid_budget).max(0.0);
        let budget = grid_budget + plan.boost_kw.max(0.0);
        if plan.total_allocated_kw > budget + EPSILON_KW {
            return Err(PowershareError::CapacityExceeded {
                allocated_kw: plan.total_allocated_kw,
                budget_kw: budget,
            });
        }
        self.current_total_allocated_kw = plan.total_allocated_kw;
        self.active_bess_contribution_kw = contribution;
        Ok(())
    }

    /// Record battery charging drawn from the grid headroom
    pub fn set_bess_charge(&mut self, charge_kw: f64) -> Result<()> {
        let headroom = self.grid_budget() - self.current_total_allocated_kw;
        if charge_kw > 0.0 && (self.active_bess_contribution_kw > 0.0 || charge_kw > headroom + EPSILON_KW) {
            return Err(PowershareError::CapacityExceeded {
                allocated_kw: self.current_total_allocated_kw + charge_kw,
                budget_kw: self.grid_budget(),
            });
        }
        self.bess_charge_kw = charge_kw.max(0.0);
        Ok(())
    }

    /// Back to zero draw, used on shutdown
    pub fn reset(&mut self) {
        self.current_total_allocated_kw = 0.0;
        self.active_bess_contribution_kw = 0.0;
        self.bess_charge_kw = 0.0;
    }

    pub fn usage(&self) -> CapacityUsage {
        let grid_import_kw = self.static_load_kw + self.current_total_allocated_kw
            - self.active_bess_contribution_kw
            + self.bess_charge_kw;
        CapacityUsage {
            contract_limit_kw: self.contract_limit_kw,
            static_load_kw: self.static_load_kw,
            grid_budget_kw: self.grid_budget(),
            current_total_allocated_kw: self.current_total_allocated_kw,
            active_bess_contribution_kw: self.active_bess_contribution_kw,
            bess_charge_kw: self.bess_charge_kw,
            grid_import_kw,
        }
    }
}
