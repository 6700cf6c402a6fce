use super::SolverBody;
use glam::Vec3;

// effective masses below this are treated as a degenerate row
const MIN_DIAGONAL: f32 = 1e-12;

/// Linear and angular parts of a scalar constraint's Jacobian for both bodies.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Jacobian {
    pub linear_a: Vec3,
    pub angular_a: Vec3,
    pub linear_b: Vec3,
    pub angular_b: Vec3,
}

impl Jacobian {
    /// Row along `normal` at offsets `ra` and `rb`, positive when A moves away from B.
    pub fn contact(normal: Vec3, ra: Vec3, rb: Vec3) -> Self {
        Self {
            linear_a: normal,
            angular_a: ra.cross(normal),
            linear_b: -normal,
            angular_b: -rb.cross(normal),
        }
    }

    #[inline]
    pub fn velocity(&self, linear_a: Vec3, angular_a: Vec3, linear_b: Vec3, angular_b: Vec3) -> f32 {
        self.linear_a.dot(linear_a)
            + self.angular_a.dot(angular_a)
            + self.linear_b.dot(linear_b)
            + self.angular_b.dot(angular_b)
    }

    pub fn is_finite(&self) -> bool {
        self.linear_a.is_finite() && self.angular_a.is_finite() && self.linear_b.is_finite() && self.angular_b.is_finite()
    }
}

/// What a solver row was built from, used to route impulses back at writeback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RowKind {
    ContactNormal { manifold: usize, point: usize },
    Friction { manifold: usize, point: usize, direction: u8 },
    Joint { constraint: usize, row: usize },
}

/// One scalar constraint row between two solver bodies.
#[derive(Copy, Clone, Debug)]
pub struct SolverConstraint {
    pub kind: RowKind,
    pub body_a: usize,
    pub body_b: usize,
    pub jacobian: Jacobian,
    pub angular_component_a: Vec3,
    pub angular_component_b: Vec3,
    /// Inverse of the effective mass, zero for degenerate rows.
    pub jac_diag_inv: f32,
    pub rhs: f32,
    pub rhs_penetration: f32,
    pub lower_limit: f32,
    pub upper_limit: f32,
    pub applied_impulse: f32,
    pub applied_push_impulse: f32,
    pub friction: f32,
    /// For friction rows, the index of the normal row bounding them.
    pub friction_index: usize,
}

impl SolverConstraint {
    pub fn new(kind: RowKind, body_a: usize, body_b: usize, jacobian: Jacobian, a: &SolverBody, b: &SolverBody) -> Self {
        let angular_component_a = a.inv_inertia_world * jacobian.angular_a;
        let angular_component_b = b.inv_inertia_world * jacobian.angular_b;

        let denom = a.inv_mass * jacobian.linear_a.length_squared()
            + jacobian.angular_a.dot(angular_component_a)
            + b.inv_mass * jacobian.linear_b.length_squared()
            + jacobian.angular_b.dot(angular_component_b);
        let jac_diag_inv = if denom.is_finite() && denom > MIN_DIAGONAL && jacobian.is_finite() {
            denom.recip()
        } else {
            0.0
        };

        Self {
            kind,
            body_a,
            body_b,
            jacobian,
            angular_component_a,
            angular_component_b,
            jac_diag_inv,
            rhs: 0.0,
            rhs_penetration: 0.0,
            lower_limit: f32::NEG_INFINITY,
            upper_limit: f32::INFINITY,
            applied_impulse: 0.0,
            applied_push_impulse: 0.0,
            friction: 0.0,
            friction_index: 0,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.jac_diag_inv == 0.0
    }

    /// Velocity along the Jacobian using the bodies' setup velocities.
    pub fn relative_velocity(&self, a: &SolverBody, b: &SolverBody) -> f32 {
        self.jacobian
            .velocity(a.linear_velocity, a.angular_velocity, b.linear_velocity, b.angular_velocity)
    }

    /// Applies `impulse` to both bodies as if it came out of an iteration.
    pub fn warm_start(&mut self, impulse: f32, a: &mut SolverBody, b: &mut SolverBody) {
        if self.is_degenerate() || !impulse.is_finite() {
            return;
        }
        self.applied_impulse = impulse;
        a.apply_impulse(self.jacobian.linear_a, self.angular_component_a, impulse);
        b.apply_impulse(self.jacobian.linear_b, self.angular_component_b, impulse);
    }

    /// One projected Gauss-Seidel update. Returns the impulse applied.
    pub fn resolve(&mut self, a: &mut SolverBody, b: &mut SolverBody) -> f32 {
        if self.is_degenerate() {
            return 0.0;
        }

        let delta_velocity = self.jacobian.velocity(
            a.delta_linear_velocity,
            a.delta_angular_velocity,
            b.delta_linear_velocity,
            b.delta_angular_velocity,
        );
        let mut delta_impulse = self.rhs - self.jac_diag_inv * delta_velocity;
        if !delta_impulse.is_finite() {
            return 0.0;
        }

        let sum = self.applied_impulse + delta_impulse;
        if sum < self.lower_limit {
            delta_impulse = self.lower_limit - self.applied_impulse;
            self.applied_impulse = self.lower_limit;
        } else if sum > self.upper_limit {
            delta_impulse = self.upper_limit - self.applied_impulse;
            self.applied_impulse = self.upper_limit;
        } else {
            self.applied_impulse = sum;
        }

        a.apply_impulse(self.jacobian.linear_a, self.angular_component_a, delta_impulse);
        b.apply_impulse(self.jacobian.linear_b, self.angular_component_b, delta_impulse);
        delta_impulse
    }

    /// Penetration recovery on the pseudo velocities, never below zero.
    pub fn resolve_split(&mut self, a: &mut SolverBody, b: &mut SolverBody) -> f32 {
        if self.is_degenerate() || self.rhs_penetration == 0.0 {
            return 0.0;
        }

        let push_velocity = self
            .jacobian
            .velocity(a.push_velocity, a.turn_velocity, b.push_velocity, b.turn_velocity);
        let mut delta_impulse = self.rhs_penetration - self.jac_diag_inv * push_velocity;
        if !delta_impulse.is_finite() {
            return 0.0;
        }

        let sum = self.applied_push_impulse + delta_impulse;
        if sum < self.lower_limit {
            delta_impulse = self.lower_limit - self.applied_push_impulse;
            self.applied_push_impulse = self.lower_limit;
        } else {
            self.applied_push_impulse = sum;
        }

        a.apply_push_impulse(self.jacobian.linear_a, self.angular_component_a, delta_impulse);
        b.apply_push_impulse(self.jacobian.linear_b, self.angular_component_b, delta_impulse);
        delta_impulse
    }
}
