use super::{world_offsets, Constraint, ConstraintInfo, JointRow};
use crate::{
    body::{Body, BodyHandle},
    solver::Jacobian,
};
use glam::Vec3;

const AXES: [Vec3; 3] = [Vec3::X, Vec3::Y, Vec3::Z];

/// Ball and socket joint, pins an anchor on each body to the same world point.
#[derive(Copy, Clone, Debug)]
pub struct ConstraintPoint {
    handle_a: BodyHandle,
    handle_b: BodyHandle,
    anchor_a: Vec3,
    anchor_b: Vec3,
    cached_lambda: [f32; 3],
}

impl ConstraintPoint {
    pub fn new(handle_a: BodyHandle, anchor_a: Vec3, handle_b: BodyHandle, anchor_b: Vec3) -> Self {
        Self {
            handle_a,
            handle_b,
            anchor_a,
            anchor_b,
            cached_lambda: [0.0; 3],
        }
    }

    pub fn from_world_pivot(handle_a: BodyHandle, body_a: &Body, handle_b: BodyHandle, body_b: &Body, pivot: Vec3) -> Self {
        Self::new(handle_a, body_a.world_to_local(pivot), handle_b, body_b.world_to_local(pivot))
    }

    pub fn cached_impulses(&self) -> [f32; 3] {
        self.cached_lambda
    }
}

impl Constraint for ConstraintPoint {
    fn body_a(&self) -> BodyHandle {
        self.handle_a
    }

    fn body_b(&self) -> BodyHandle {
        self.handle_b
    }

    fn row_count(&self) -> usize {
        3
    }

    fn setup_row(&mut self, index: usize, body_a: &Body, body_b: &Body, info: &ConstraintInfo) -> JointRow {
        let (ra, rb) = world_offsets(body_a, self.anchor_a, body_b, self.anchor_b);
        let axis = AXES[index];

        let jacobian = Jacobian {
            linear_a: -axis,
            angular_a: -ra.cross(axis),
            linear_b: axis,
            angular_b: rb.cross(axis),
        };

        let error = (body_b.position + rb - body_a.position - ra).dot(axis);
        JointRow::bilateral(jacobian, info.correction_velocity(error), self.cached_lambda[index])
    }

    fn writeback_row(&mut self, index: usize, impulse: f32) {
        self.cached_lambda[index] = impulse;
    }
}
