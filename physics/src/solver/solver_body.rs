use crate::body::{Body, BodyHandle};
use glam::{Mat3, Vec3};

/// Snapshot of a body for one solve.
///
/// Impulses only touch the delta and push/turn accumulators, the velocities captured at setup
/// stay untouched until writeback.
#[derive(Copy, Clone, Debug)]
pub struct SolverBody {
    pub body: BodyHandle,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub delta_linear_velocity: Vec3,
    pub delta_angular_velocity: Vec3,
    // split impulse pseudo velocities
    pub push_velocity: Vec3,
    pub turn_velocity: Vec3,
    pub inv_mass: f32,
    pub inv_inertia_world: Mat3,
}

impl SolverBody {
    pub fn new(handle: BodyHandle, body: &Body) -> Self {
        let (inv_mass, inv_inertia_world) = if body.has_infinite_mass() {
            (0.0, Mat3::ZERO)
        } else {
            (body.inv_mass, body.inv_inertia_tensor_world())
        };
        Self {
            body: handle,
            linear_velocity: body.linear_velocity,
            angular_velocity: body.angular_velocity,
            delta_linear_velocity: Vec3::ZERO,
            delta_angular_velocity: Vec3::ZERO,
            push_velocity: Vec3::ZERO,
            turn_velocity: Vec3::ZERO,
            inv_mass,
            inv_inertia_world,
        }
    }

    pub fn is_static(&self) -> bool {
        self.inv_mass == 0.0
    }

    /// `angular_component` is the inverse world inertia times the angular Jacobian.
    #[inline]
    pub fn apply_impulse(&mut self, linear: Vec3, angular_component: Vec3, magnitude: f32) {
        if self.is_static() {
            return;
        }
        self.delta_linear_velocity += linear * (self.inv_mass * magnitude);
        self.delta_angular_velocity += angular_component * magnitude;
    }

    #[inline]
    pub fn apply_push_impulse(&mut self, linear: Vec3, angular_component: Vec3, magnitude: f32) {
        if self.is_static() {
            return;
        }
        self.push_velocity += linear * (self.inv_mass * magnitude);
        self.turn_velocity += angular_component * magnitude;
    }

    pub fn total_linear_velocity(&self) -> Vec3 {
        self.linear_velocity + self.delta_linear_velocity
    }

    pub fn total_angular_velocity(&self) -> Vec3 {
        self.angular_velocity + self.delta_angular_velocity
    }
}
