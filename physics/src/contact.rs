use glam::Vec3;

/// One point of a persistent manifold.
///
/// The normal is in world space, on body B and pointing towards body A. `distance` is negative
/// while the bodies penetrate.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ContactPoint {
    pub local_point_a: Vec3,
    pub local_point_b: Vec3,
    pub world_point_a: Vec3,
    pub world_point_b: Vec3,
    pub normal_world_on_b: Vec3,
    pub distance: f32,

    pub combined_friction: f32,
    pub combined_restitution: f32,

    // accumulated impulses from the last solve, used for warm starting
    pub applied_impulse: f32,
    pub applied_impulse_lateral1: f32,
    pub applied_impulse_lateral2: f32,

    pub lateral_friction_dir1: Vec3,
    pub lateral_friction_dir2: Vec3,
    pub lateral_friction_initialized: bool,

    /// Number of refreshes this point survived.
    pub lifetime: u32,
}

impl Default for ContactPoint {
    fn default() -> Self {
        Self {
            local_point_a: Vec3::ZERO,
            local_point_b: Vec3::ZERO,
            world_point_a: Vec3::ZERO,
            world_point_b: Vec3::ZERO,
            normal_world_on_b: Vec3::Y,
            distance: 0.0,
            combined_friction: 0.0,
            combined_restitution: 0.0,
            applied_impulse: 0.0,
            applied_impulse_lateral1: 0.0,
            applied_impulse_lateral2: 0.0,
            lateral_friction_dir1: Vec3::ZERO,
            lateral_friction_dir2: Vec3::ZERO,
            lateral_friction_initialized: false,
            lifetime: 0,
        }
    }
}

impl ContactPoint {
    pub fn new(
        local_point_a: Vec3,
        local_point_b: Vec3,
        world_point_a: Vec3,
        world_point_b: Vec3,
        normal_world_on_b: Vec3,
        distance: f32,
    ) -> Self {
        Self {
            local_point_a,
            local_point_b,
            world_point_a,
            world_point_b,
            normal_world_on_b,
            distance,
            ..Self::default()
        }
    }

    /// Keeps the warm start state of `old` when this point replaces it.
    pub fn inherit_impulses(&mut self, old: &ContactPoint) {
        self.applied_impulse = old.applied_impulse;
        self.applied_impulse_lateral1 = old.applied_impulse_lateral1;
        self.applied_impulse_lateral2 = old.applied_impulse_lateral2;
        self.lateral_friction_dir1 = old.lateral_friction_dir1;
        self.lateral_friction_dir2 = old.lateral_friction_dir2;
        self.lateral_friction_initialized = old.lateral_friction_initialized;
        self.lifetime = old.lifetime;
    }

    pub fn clear_impulses(&mut self) {
        self.applied_impulse = 0.0;
        self.applied_impulse_lateral1 = 0.0;
        self.applied_impulse_lateral2 = 0.0;
        self.lateral_friction_initialized = false;
    }
}
