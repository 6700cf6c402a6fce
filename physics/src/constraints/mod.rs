mod constraint_distance;
mod constraint_point;

use crate::{
    body::{Body, BodyHandle},
    solver::{Jacobian, SolverBody, SolverConstraint},
};
use glam::Vec3;

pub use constraint_distance::ConstraintDistance;
pub use constraint_point::ConstraintPoint;

/// Per-step values handed to joints when they build their rows.
#[derive(Copy, Clone, Debug)]
pub struct ConstraintInfo {
    pub dt_sec: f32,
    /// Fraction of the positional error corrected per step.
    pub erp: f32,
}

impl ConstraintInfo {
    /// Target velocity that removes `erp` of `error` this step.
    pub fn correction_velocity(&self, error: f32) -> f32 {
        -error * self.erp / self.dt_sec
    }
}

/// One scalar row produced by a joint.
#[derive(Copy, Clone, Debug)]
pub struct JointRow {
    pub jacobian: Jacobian,
    /// Velocity along the Jacobian the row drives towards.
    pub velocity_target: f32,
    pub lower_limit: f32,
    pub upper_limit: f32,
    /// Impulse kept from the previous step.
    pub warm_start_impulse: f32,
}

impl JointRow {
    pub fn bilateral(jacobian: Jacobian, velocity_target: f32, warm_start_impulse: f32) -> Self {
        Self {
            jacobian,
            velocity_target,
            lower_limit: f32::NEG_INFINITY,
            upper_limit: f32::INFINITY,
            warm_start_impulse,
        }
    }
}

/// A joint between two bodies, solved by the sequential impulse solver one row at a time.
pub trait Constraint: Send + Sync {
    fn body_a(&self) -> BodyHandle;
    fn body_b(&self) -> BodyHandle;

    fn row_count(&self) -> usize;

    fn setup_row(&mut self, index: usize, body_a: &Body, body_b: &Body, info: &ConstraintInfo) -> JointRow;

    /// Applies one Gauss-Seidel update to a row, returning the impulse change.
    fn solve_row(&self, row: &mut SolverConstraint, body_a: &mut SolverBody, body_b: &mut SolverBody) -> f32 {
        row.resolve(body_a, body_b)
    }

    /// Stores the row's accumulated impulse for warm starting the next step.
    fn writeback_row(&mut self, index: usize, impulse: f32);
}

#[derive(Default)]
pub struct ConstraintArena {
    constraints: Vec<Box<dyn Constraint>>,
}

impl ConstraintArena {
    pub fn new() -> Self {
        ConstraintArena {
            constraints: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.constraints.clear();
    }

    pub fn add(&mut self, constraint: impl Constraint + 'static) -> usize {
        self.constraints.push(Box::new(constraint));
        self.constraints.len() - 1
    }

    /// Drops every joint attached to `handle`, returns how many were removed.
    pub fn remove_attached(&mut self, handle: BodyHandle) -> usize {
        let before = self.constraints.len();
        self.constraints
            .retain(|constraint| constraint.body_a() != handle && constraint.body_b() != handle);
        before - self.constraints.len()
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Constraint> {
        self.constraints.get(index).map(|constraint| constraint.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Constraint> {
        self.constraints.iter().map(|constraint| constraint.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut dyn Constraint> {
        self.constraints.iter_mut().map(as_dyn_mut)
    }
}

fn as_dyn_mut(constraint: &mut Box<dyn Constraint>) -> &mut dyn Constraint {
    &mut **constraint
}

/// World space anchor offsets from each body's centre of mass.
fn world_offsets(body_a: &Body, anchor_a: Vec3, body_b: &Body, anchor_b: Vec3) -> (Vec3, Vec3) {
    (body_a.orientation * anchor_a, body_b.orientation * anchor_b)
}
