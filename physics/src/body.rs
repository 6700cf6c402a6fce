use crate::{
    bounds::Bounds,
    broadphase::{CollisionFilter, ProxyHandle},
};
use glam::{Mat3, Quat, Vec3};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyHandle(pub u32);

impl Default for BodyHandle {
    // default to invalid value
    fn default() -> Self {
        Self(u32::MAX)
    }
}

impl BodyHandle {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Body storage with stable handles. Removed slots are reused by later bodies.
#[derive(Debug, Default)]
pub struct BodyArena {
    bodies: Vec<Option<Body>>,
    // live handles in ascending order
    handles: Vec<BodyHandle>,
    free: Vec<BodyHandle>,
}

impl BodyArena {
    pub fn new() -> Self {
        BodyArena {
            bodies: Vec::new(),
            handles: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn add(&mut self, body: Body) -> BodyHandle {
        let handle = match self.free.pop() {
            Some(handle) => {
                self.bodies[handle.index()] = Some(body);
                handle
            }
            None => {
                self.bodies.push(Some(body));
                BodyHandle(self.bodies.len() as u32 - 1)
            }
        };
        if let Err(position) = self.handles.binary_search(&handle) {
            self.handles.insert(position, handle);
        }
        handle
    }

    /// Takes the body out of the arena, its handle may be handed out again.
    pub fn remove(&mut self, handle: BodyHandle) -> Option<Body> {
        let body = self.bodies.get_mut(handle.index())?.take()?;
        if let Ok(position) = self.handles.binary_search(&handle) {
            self.handles.remove(position);
        }
        self.free.push(handle);
        Some(body)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Body> {
        self.bodies.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Body> {
        self.bodies.iter_mut().flatten()
    }

    pub fn clear(&mut self) {
        self.bodies.clear();
        self.handles.clear();
        self.free.clear();
    }

    /// Number of live bodies.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// One past the highest handle index ever used, for tables indexed by handle.
    pub(crate) fn slot_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn get_body(&self, handle: BodyHandle) -> Option<&Body> {
        self.bodies.get(handle.index())?.as_ref()
    }

    pub fn get_body_mut(&mut self, handle: BodyHandle) -> Option<&mut Body> {
        self.bodies.get_mut(handle.index())?.as_mut()
    }

    pub fn handles(&self) -> &[BodyHandle] {
        &self.handles
    }

    pub fn log_bodies(&self, step_num: u64, delta_seconds: f32) {
        for (index, body) in self.bodies.iter().enumerate() {
            let body = match body {
                Some(body) if !body.has_infinite_mass() => body,
                _ => continue,
            };
            log::trace!(
                "step: {} dt: {} index: {} pos: {} rot: {} lin: {} ang: {}",
                step_num,
                delta_seconds,
                index,
                body.position,
                body.orientation,
                body.linear_velocity,
                body.angular_velocity
            );
        }
    }
}

/// Rigid body state. `position` is the centre of mass.
#[derive(Clone, Debug)]
pub struct Body {
    pub position: Vec3,
    pub orientation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub inv_mass: f32,
    /// Diagonal of the inverse inertia tensor in body space.
    pub inv_inertia_local: Vec3,
    pub restitution: f32,
    pub friction: f32,
    /// Collision bounds in body space, transformed to world space for the broadphase.
    pub local_bounds: Bounds,
    pub filter: CollisionFilter,
    pub proxy: Option<ProxyHandle>,
}

impl Default for Body {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            inv_mass: 1.0,
            inv_inertia_local: Vec3::ONE,
            restitution: 0.5,
            friction: 0.5,
            local_bounds: Bounds::from_center_half_extents(Vec3::ZERO, Vec3::splat(0.5)),
            filter: CollisionFilter::default(),
            proxy: None,
        }
    }
}

impl Body {
    /// Solid sphere, pass a zero `inv_mass` for a static body.
    pub fn sphere(position: Vec3, radius: f32, inv_mass: f32) -> Self {
        // I = 2/5 m r^2
        let inv_inertia = if radius > 0.0 {
            inv_mass * 2.5 / (radius * radius)
        } else {
            0.0
        };
        Self {
            position,
            inv_mass,
            inv_inertia_local: Vec3::splat(inv_inertia),
            local_bounds: Bounds::from_center_half_extents(Vec3::ZERO, Vec3::splat(radius)),
            ..Self::default()
        }
    }

    /// Solid box with the given half extents.
    pub fn cuboid(position: Vec3, half_extents: Vec3, inv_mass: f32) -> Self {
        // I_x = m/3 (hy^2 + hz^2) for half extents
        let sq = half_extents * half_extents;
        let moments = Vec3::new(sq.y + sq.z, sq.x + sq.z, sq.x + sq.y);
        let inv_inertia = Vec3::select(
            moments.cmpgt(Vec3::ZERO),
            Vec3::splat(3.0 * inv_mass) / moments,
            Vec3::ZERO,
        );
        Self {
            position,
            inv_mass,
            inv_inertia_local: inv_inertia,
            local_bounds: Bounds::from_center_half_extents(Vec3::ZERO, half_extents),
            ..Self::default()
        }
    }

    pub fn world_to_local(&self, world_point: Vec3) -> Vec3 {
        let tmp = world_point - self.position;
        let inv_orientation = self.orientation.conjugate();
        inv_orientation * tmp // body_space
    }

    pub fn local_to_world(&self, body_point: Vec3) -> Vec3 {
        self.position + self.orientation * body_point // world_point
    }

    /// Bounds of the rotated local bounds in world space.
    pub fn world_bounds(&self) -> Bounds {
        let Bounds { mins, maxs } = self.local_bounds;
        let corners = [
            Vec3::new(mins.x, mins.y, mins.z),
            Vec3::new(maxs.x, mins.y, mins.z),
            Vec3::new(mins.x, maxs.y, mins.z),
            Vec3::new(maxs.x, maxs.y, mins.z),
            Vec3::new(mins.x, mins.y, maxs.z),
            Vec3::new(maxs.x, mins.y, maxs.z),
            Vec3::new(mins.x, maxs.y, maxs.z),
            Vec3::new(maxs.x, maxs.y, maxs.z),
        ];
        Bounds::from_points(&corners.map(|corner| self.local_to_world(corner)))
    }

    pub fn inv_inertia_tensor_world(&self) -> Mat3 {
        let orientation = Mat3::from_quat(self.orientation);
        orientation * Mat3::from_diagonal(self.inv_inertia_local) * orientation.transpose()
    }

    pub fn apply_impulse_linear(&mut self, impulse: Vec3) {
        if self.has_infinite_mass() {
            return;
        }

        // p = mv
        // dp = m dv = J
        // => dv = J / m
        self.linear_velocity += impulse * self.inv_mass;
    }

    /// Advances position and orientation by the current velocities.
    pub fn update(&mut self, delta_seconds: f32) {
        if self.has_infinite_mass() {
            return;
        }

        self.position += self.linear_velocity * delta_seconds;

        // total torque is equal to external applied torques + internal torque (precession)
        // T = T_external + omega x I * omega
        // T_external = 0 because it was applied by the solver
        // I a = -(w x I * w)
        let inv_inertia = self.inv_inertia_tensor_world();
        let det = inv_inertia.determinant();
        if det.is_normal() {
            let inertia_tensor = inv_inertia.inverse();
            let alpha = inv_inertia
                * (-self
                    .angular_velocity
                    .cross(inertia_tensor * self.angular_velocity));
            self.angular_velocity += alpha * delta_seconds;
        }

        self.orientation = integrate_orientation(self.orientation, self.angular_velocity, delta_seconds);
    }

    /// Moves the body by split impulse pseudo velocities without touching its real velocity.
    pub fn apply_pseudo_velocity(&mut self, push_velocity: Vec3, turn_velocity: Vec3, delta_seconds: f32) {
        if self.has_infinite_mass() {
            return;
        }
        self.position += push_velocity * delta_seconds;
        self.orientation = integrate_orientation(self.orientation, turn_velocity, delta_seconds);
    }

    pub fn has_infinite_mass(&self) -> bool {
        self.inv_mass == 0.0
    }
}

fn integrate_orientation(orientation: Quat, angular_velocity: Vec3, delta_seconds: f32) -> Quat {
    let d_angle = angular_velocity * delta_seconds;
    let angle = d_angle.length();
    let rcp_angle = angle.recip();
    let dq = if rcp_angle.is_finite() {
        Quat::from_axis_angle(d_angle * rcp_angle, angle)
    } else {
        Quat::IDENTITY
    };
    (dq * orientation).normalize()
}
