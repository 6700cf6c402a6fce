use super::{world_offsets, Constraint, ConstraintInfo, JointRow};
use crate::{
    body::{Body, BodyHandle},
    solver::Jacobian,
};
use glam::Vec3;

/// Keeps two anchor points a fixed distance apart.
#[derive(Copy, Clone, Debug)]
pub struct ConstraintDistance {
    handle_a: BodyHandle,
    handle_b: BodyHandle,
    anchor_a: Vec3, // the anchor location in body_a's space
    anchor_b: Vec3, // the anchor location in body_b's space
    rest_length: f32,
    cached_lambda: f32,
}

impl ConstraintDistance {
    pub fn new(handle_a: BodyHandle, anchor_a: Vec3, handle_b: BodyHandle, anchor_b: Vec3, rest_length: f32) -> Self {
        ConstraintDistance {
            handle_a,
            handle_b,
            anchor_a,
            anchor_b,
            rest_length,
            cached_lambda: 0.0,
        }
    }

    /// Uses the current distance between the anchors as the rest length.
    pub fn from_bodies(
        handle_a: BodyHandle,
        body_a: &Body,
        world_anchor_a: Vec3,
        handle_b: BodyHandle,
        body_b: &Body,
        world_anchor_b: Vec3,
    ) -> Self {
        Self::new(
            handle_a,
            body_a.world_to_local(world_anchor_a),
            handle_b,
            body_b.world_to_local(world_anchor_b),
            (world_anchor_b - world_anchor_a).length(),
        )
    }

    pub fn rest_length(&self) -> f32 {
        self.rest_length
    }

    pub fn cached_impulse(&self) -> f32 {
        self.cached_lambda
    }
}

impl Constraint for ConstraintDistance {
    fn body_a(&self) -> BodyHandle {
        self.handle_a
    }

    fn body_b(&self) -> BodyHandle {
        self.handle_b
    }

    fn row_count(&self) -> usize {
        1
    }

    fn setup_row(&mut self, _index: usize, body_a: &Body, body_b: &Body, info: &ConstraintInfo) -> JointRow {
        let (ra, rb) = world_offsets(body_a, self.anchor_a, body_b, self.anchor_b);
        let a = body_a.position + ra;
        let b = body_b.position + rb;

        let r = b - a;
        let length = r.length();
        // coincident anchors leave no direction to constrain, the solver skips a zero row
        let n = if length > f32::EPSILON {
            r / length
        } else {
            Vec3::ZERO
        };

        let jacobian = Jacobian {
            linear_a: -n,
            angular_a: -ra.cross(n),
            linear_b: n,
            angular_b: rb.cross(n),
        };

        // baumgarte stabilization
        let c = length - self.rest_length;
        JointRow::bilateral(jacobian, info.correction_velocity(c), self.cached_lambda)
    }

    fn writeback_row(&mut self, _index: usize, impulse: f32) {
        self.cached_lambda = impulse;
    }
}
