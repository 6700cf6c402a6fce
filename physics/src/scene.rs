use crate::{
    body::{Body, BodyArena, BodyHandle},
    broadphase::{Broadphase, BroadphaseStats},
    config::WorldConfig,
    constraints::{Constraint, ConstraintArena},
    error::{PhysicsError, PhysicsResult},
    island::build_islands,
    manifold::PersistentManifold,
    solver::{SequentialImpulseSolver, SolveStats},
};
use std::path::Path;

/// Contact generation for a pair whose broadphase bounds overlap.
///
/// The manifold has already been refreshed against the current transforms. Implementations add
/// or replace points with body A and B in the manifold's order.
pub trait NarrowPhase {
    fn process_pair(&mut self, body_a: &Body, body_b: &Body, manifold: &mut PersistentManifold);
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct StepStats {
    pub broadphase: BroadphaseStats,
    pub islands: usize,
    pub manifolds: usize,
    pub contact_rows: usize,
    pub friction_rows: usize,
    pub joint_rows: usize,
    pub skipped_rows: usize,
}

impl StepStats {
    fn add_solve(&mut self, solve: &SolveStats) {
        self.contact_rows += solve.contact_rows;
        self.friction_rows += solve.friction_rows;
        self.joint_rows += solve.joint_rows;
        self.skipped_rows += solve.skipped_rows;
    }
}

pub struct PhysicsScene {
    config: WorldConfig,
    bodies: BodyArena,
    constraints: ConstraintArena,
    broadphase: Broadphase<BodyHandle, PersistentManifold>,
    solver: SequentialImpulseSolver,
    step_num: u64,
}

impl PhysicsScene {
    pub fn new(config: WorldConfig) -> PhysicsResult<Self> {
        config.validate()?;
        Ok(PhysicsScene {
            bodies: BodyArena::default(),
            constraints: ConstraintArena::default(),
            broadphase: Broadphase::new(config.broadphase)?,
            solver: SequentialImpulseSolver::new(config.solver)?,
            step_num: 0,
            config,
        })
    }

    pub fn from_config_file(path: impl AsRef<Path>) -> PhysicsResult<Self> {
        Self::new(WorldConfig::load(path)?)
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Removes all bodies and joints and restarts the solver's random sequence.
    pub fn reset(&mut self) -> PhysicsResult<()> {
        self.step_num = 0;
        self.bodies.clear();
        self.constraints.clear();
        self.broadphase = Broadphase::new(self.config.broadphase)?;
        self.solver.reset();
        Ok(())
    }

    /// Adds a body and its broadphase proxy. Bodies with infinite mass go straight to the fixed
    /// set.
    pub fn add_body(&mut self, body: Body) -> PhysicsResult<BodyHandle> {
        let bounds = body.world_bounds();
        let (filter, fixed) = (body.filter, body.has_infinite_mass());
        let handle = self.bodies.add(body);
        let proxy = if fixed {
            self.broadphase.create_static_proxy(bounds, filter, handle)
        } else {
            self.broadphase.create_proxy(bounds, filter, handle)
        };
        match proxy {
            Ok(proxy) => {
                if let Some(body) = self.bodies.get_body_mut(handle) {
                    body.proxy = Some(proxy);
                }
                Ok(handle)
            }
            Err(e) => {
                self.bodies.remove(handle);
                Err(e)
            }
        }
    }

    /// Removes a body, its proxy with every pair it was part of, and the joints attached to it.
    pub fn remove_body(&mut self, handle: BodyHandle) -> PhysicsResult<Body> {
        let proxy = self
            .bodies
            .get_body(handle)
            .ok_or(PhysicsError::UnknownBody(handle))?
            .proxy;
        if let Some(proxy) = proxy {
            self.broadphase.destroy_proxy(proxy)?;
        }
        let joints = self.constraints.remove_attached(handle);
        if joints > 0 {
            log::debug!("removed {} joints attached to {:?}", joints, handle);
        }
        let mut body = self.bodies.remove(handle).ok_or(PhysicsError::UnknownBody(handle))?;
        body.proxy = None;
        Ok(body)
    }

    pub fn add_constraint(&mut self, constraint: impl Constraint + 'static) -> PhysicsResult<usize> {
        for handle in [constraint.body_a(), constraint.body_b()] {
            if self.bodies.get_body(handle).is_none() {
                return Err(PhysicsError::UnknownBody(handle));
            }
        }
        Ok(self.constraints.add(constraint))
    }

    pub fn body(&self, handle: BodyHandle) -> Option<&Body> {
        self.bodies.get_body(handle)
    }

    pub fn body_mut(&mut self, handle: BodyHandle) -> Option<&mut Body> {
        self.bodies.get_body_mut(handle)
    }

    pub fn bodies(&self) -> &BodyArena {
        &self.bodies
    }

    pub fn iter_body_handles(&self) -> core::slice::Iter<BodyHandle> {
        self.bodies.handles().iter()
    }

    pub fn broadphase(&self) -> &Broadphase<BodyHandle, PersistentManifold> {
        &self.broadphase
    }

    pub fn step_num(&self) -> u64 {
        self.step_num
    }

    /// Advances the simulation by `delta_seconds`.
    ///
    /// Errors are returned before any body is touched. Bodies whose bounds are not finite keep
    /// their previous proxy and take no part in contact generation.
    pub fn step(&mut self, delta_seconds: f32, narrow_phase: &mut impl NarrowPhase) -> PhysicsResult<StepStats> {
        if !delta_seconds.is_finite() || delta_seconds <= 0.0 {
            return Err(PhysicsError::InvalidTimeStep(delta_seconds));
        }
        // broadphase (update proxies of bodies that moved, then build potential collision pairs)
        for (handle, body) in self.bodies.handles().iter().zip(self.bodies.iter()) {
            let proxy = match body.proxy {
                Some(proxy) => proxy,
                None => continue,
            };
            let bounds = body.world_bounds();
            if !bounds.is_valid() {
                // keep the stale proxy until the body is back in a valid state
                log::debug!("skipping proxy update of {:?} with bounds {:?}", handle, bounds);
                continue;
            }
            let moved = self
                .broadphase
                .proxy(proxy)
                .map_or(false, |stored| stored.bounds() != bounds);
            if moved {
                self.broadphase.set_aabb(proxy, bounds)?;
            }
        }
        self.broadphase.calculate_overlapping_pairs()?;
        self.step_num += 1;

        // narrowphase (perform actual collision detection)
        let friction_combine = self.config.solver.friction_combine;
        let restitution_combine = self.config.solver.restitution_combine;
        for (handle_a, handle_b, pair) in self.broadphase.pairs_mut() {
            let (body_a, body_b) = match (self.bodies.get_body(handle_a), self.bodies.get_body(handle_b)) {
                (Some(body_a), Some(body_b)) => (body_a, body_b),
                _ => continue,
            };

            // skip body pairs with infinite mass
            if body_a.has_infinite_mass() && body_b.has_infinite_mass() {
                continue;
            }

            let manifold = pair
                .internal_info
                .get_or_insert_with(|| PersistentManifold::new(handle_a, handle_b));
            if !body_a.position.is_finite() || !body_b.position.is_finite() {
                manifold.clear();
                continue;
            }
            manifold.refresh(body_a, body_b);
            narrow_phase.process_pair(body_a, body_b, manifold);

            let friction = friction_combine.combine(body_a.friction, body_b.friction);
            let restitution = restitution_combine.combine(body_a.restitution, body_b.restitution);
            for contact in manifold.contacts_mut() {
                contact.combined_friction = friction;
                contact.combined_restitution = restitution;
            }
            pair.processed = true;
        }

        // gravity impulse
        for body in self.bodies.iter_mut() {
            if !body.has_infinite_mass() {
                // gravity needs to be an impulse
                // I = dp, F = dp/dt => dp = F * dt => I = F * dt
                // F = mgs
                let impulse_gravity = self.config.gravity * body.inv_mass.recip() * delta_seconds;
                body.apply_impulse_linear(impulse_gravity);
            }
        }

        // solve constraints, one batch per island
        let constraint_bodies: Vec<(BodyHandle, BodyHandle)> = self
            .constraints
            .iter()
            .map(|constraint| (constraint.body_a(), constraint.body_b()))
            .collect();
        let mut manifolds: Vec<Option<&mut PersistentManifold>> = self
            .broadphase
            .pair_cache_mut()
            .iter_mut()
            .filter_map(|pair| pair.internal_info.as_mut())
            .filter(|manifold| !manifold.is_empty())
            .map(Some)
            .collect();
        let manifold_bodies: Vec<(BodyHandle, BodyHandle)> = manifolds
            .iter()
            .flatten()
            .map(|manifold| (manifold.handle_a(), manifold.handle_b()))
            .collect();
        let mut constraints: Vec<Option<&mut dyn Constraint>> = self.constraints.iter_mut().map(Some).collect();

        let islands = build_islands(&self.bodies, &manifold_bodies, &constraint_bodies);
        let mut stats = StepStats {
            islands: islands.len(),
            manifolds: manifold_bodies.len(),
            ..StepStats::default()
        };
        for island in &islands {
            let mut island_manifolds: Vec<&mut PersistentManifold> = island
                .manifolds
                .iter()
                .filter_map(|&index| manifolds[index].take())
                .collect();
            let mut island_constraints: Vec<&mut dyn Constraint> = island
                .constraints
                .iter()
                .filter_map(|&index| constraints[index].take())
                .collect();
            let solve = self.solver.solve_group(
                &mut self.bodies,
                &mut island_manifolds,
                &mut island_constraints,
                delta_seconds,
            )?;
            stats.add_solve(&solve);
        }

        // update positions
        for body in self.bodies.iter_mut() {
            body.update(delta_seconds);
        }

        stats.broadphase = self.broadphase.stats();
        self.bodies.log_bodies(self.step_num, delta_seconds);
        log::debug!(
            "step {}: {} pairs, {} manifolds, {} islands",
            self.step_num,
            stats.broadphase.pair_count,
            stats.manifolds,
            stats.islands
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod test {
    use super::{NarrowPhase, PhysicsScene};
    use crate::{
        body::{Body, BodyHandle},
        config::WorldConfig,
        constraints::ConstraintDistance,
        contact::ContactPoint,
        error::PhysicsError,
        manifold::PersistentManifold,
    };
    use glam::Vec3;

    const DT: f32 = 1.0 / 60.0;

    /// Spheres (dynamic bodies, radius from their bounds) against boxes (static bodies, top face
    /// only) and each other.
    struct SphereNarrowPhase {
        margin: f32,
    }

    impl SphereNarrowPhase {
        fn radius(body: &Body) -> f32 {
            body.local_bounds.half_extents().x
        }

        // contact of `sphere` against `other`, normal pointing from other to sphere
        fn contact(&self, sphere: &Body, other: &Body) -> Option<(Vec3, Vec3, Vec3, f32)> {
            let radius = Self::radius(sphere);
            let (normal, point_on_other, distance) = if other.has_infinite_mass() {
                let top = other.world_bounds().maxs.y;
                let distance = sphere.position.y - radius - top;
                (Vec3::Y, Vec3::new(sphere.position.x, top, sphere.position.z), distance)
            } else {
                let d = sphere.position - other.position;
                let length = d.length();
                let normal = d.try_normalize()?;
                let other_radius = Self::radius(other);
                (normal, other.position + normal * other_radius, length - radius - other_radius)
            };
            if distance > self.margin {
                return None;
            }
            Some((sphere.position - normal * radius, point_on_other, normal, distance))
        }
    }

    impl NarrowPhase for SphereNarrowPhase {
        fn process_pair(&mut self, body_a: &Body, body_b: &Body, manifold: &mut PersistentManifold) {
            let found = if body_a.has_infinite_mass() {
                self.contact(body_b, body_a)
                    .map(|(on_b, on_a, normal, distance)| (on_a, on_b, -normal, distance))
            } else {
                self.contact(body_a, body_b)
            };
            if let Some((world_a, world_b, normal, distance)) = found {
                manifold.add_contact(ContactPoint::new(
                    body_a.world_to_local(world_a),
                    body_b.world_to_local(world_b),
                    world_a,
                    world_b,
                    normal,
                    distance,
                ));
            }
        }
    }

    fn narrow_phase() -> SphereNarrowPhase {
        SphereNarrowPhase { margin: 0.2 }
    }

    fn ground() -> Body {
        Body {
            restitution: 0.0,
            ..Body::cuboid(Vec3::new(0.0, -0.5, 0.0), Vec3::new(50.0, 0.5, 50.0), 0.0)
        }
    }

    fn ball(position: Vec3) -> Body {
        Body {
            restitution: 0.0,
            ..Body::sphere(position, 0.5, 1.0)
        }
    }

    #[test]
    fn test_ball_comes_to_rest() {
        let mut scene = PhysicsScene::new(WorldConfig::default()).unwrap();
        scene.add_body(ground()).unwrap();
        let handle = scene.add_body(ball(Vec3::new(0.0, 2.0, 0.0))).unwrap();

        let mut narrow = narrow_phase();
        for _ in 0..180 {
            scene.step(DT, &mut narrow).unwrap();
        }
        let body = scene.body(handle).unwrap();
        assert!((body.position.y - 0.5).abs() < 0.05, "{}", body.position);
        assert!(body.linear_velocity.length() < 0.05, "{}", body.linear_velocity);
        assert_eq!(scene.broadphase().pair_cache().len(), 1);
    }

    #[test]
    fn test_separate_piles_are_separate_islands() {
        let mut scene = PhysicsScene::new(WorldConfig::default()).unwrap();
        scene.add_body(ground()).unwrap();
        scene.add_body(ball(Vec3::new(-5.0, 0.5, 0.0))).unwrap();
        scene.add_body(ball(Vec3::new(-5.0, 1.5, 0.0))).unwrap();
        scene.add_body(ball(Vec3::new(5.0, 0.5, 0.0))).unwrap();

        let stats = scene.step(DT, &mut narrow_phase()).unwrap();
        assert_eq!(stats.manifolds, 3);
        assert_eq!(stats.islands, 2);
        assert_eq!(stats.contact_rows, 3);
    }

    #[test]
    fn test_pendulum_keeps_length() {
        let mut scene = PhysicsScene::new(WorldConfig::default()).unwrap();
        let pivot = scene
            .add_body(Body::cuboid(Vec3::new(0.0, 5.0, 0.0), Vec3::splat(0.1), 0.0))
            .unwrap();
        let bob = scene.add_body(ball(Vec3::new(2.0, 5.0, 0.0))).unwrap();
        scene
            .add_constraint(ConstraintDistance::new(pivot, Vec3::ZERO, bob, Vec3::ZERO, 2.0))
            .unwrap();

        let mut narrow = narrow_phase();
        for _ in 0..120 {
            let stats = scene.step(DT, &mut narrow).unwrap();
            assert_eq!(stats.joint_rows, 1);
        }
        let length = (scene.body(bob).unwrap().position - Vec3::new(0.0, 5.0, 0.0)).length();
        assert!((length - 2.0).abs() < 0.1, "{}", length);

        assert!(matches!(
            scene.add_constraint(ConstraintDistance::new(pivot, Vec3::ZERO, BodyHandle(9), Vec3::ZERO, 1.0)),
            Err(PhysicsError::UnknownBody(BodyHandle(9)))
        ));
    }

    #[test]
    fn test_invalid_body_does_not_stop_step() {
        let mut scene = PhysicsScene::new(WorldConfig::default()).unwrap();
        scene.add_body(ground()).unwrap();
        let healthy = scene.add_body(ball(Vec3::new(-5.0, 5.0, 0.0))).unwrap();
        let broken = scene.add_body(ball(Vec3::new(5.0, 0.5, 0.0))).unwrap();
        scene.body_mut(broken).unwrap().position = Vec3::new(f32::NAN, 0.5, 0.0);

        let mut narrow = narrow_phase();
        for _ in 0..10 {
            let stats = scene.step(DT, &mut narrow).unwrap();
            assert_eq!(stats.manifolds, 0);
        }
        assert_eq!(scene.step_num(), 10);
        let body = scene.body(healthy).unwrap();
        assert!(body.position.y < 5.0);
        assert!((body.linear_velocity.y + 10.0 * 10.0 * DT).abs() < 1e-4);
    }

    #[test]
    fn test_failed_step_leaves_bodies_untouched() {
        let mut config = WorldConfig::default();
        config.broadphase.max_pairs = Some(1);
        let mut scene = PhysicsScene::new(config).unwrap();
        scene.add_body(ground()).unwrap();
        scene.add_body(ball(Vec3::new(0.0, 0.5, 0.0))).unwrap();
        let far = scene.add_body(ball(Vec3::new(0.0, 20.0, 0.0))).unwrap();
        assert_eq!(scene.broadphase().pair_cache().len(), 1);

        // dropped onto the ground, a second pair does not fit
        scene.body_mut(far).unwrap().position = Vec3::new(3.0, 0.5, 0.0);
        assert!(matches!(
            scene.step(DT, &mut narrow_phase()),
            Err(PhysicsError::PairCapacityExceeded(1))
        ));
        assert_eq!(scene.step_num(), 0);
        assert!(scene.bodies().iter().all(|body| body.linear_velocity == Vec3::ZERO));
    }

    #[test]
    fn test_remove_body() {
        let mut scene = PhysicsScene::new(WorldConfig::default()).unwrap();
        scene.add_body(ground()).unwrap();
        let a = scene.add_body(ball(Vec3::new(0.0, 0.5, 0.0))).unwrap();
        let b = scene.add_body(ball(Vec3::new(5.0, 0.5, 0.0))).unwrap();
        scene
            .add_constraint(ConstraintDistance::new(a, Vec3::ZERO, b, Vec3::ZERO, 5.0))
            .unwrap();
        assert_eq!(scene.broadphase().pair_cache().len(), 2);

        let removed = scene.remove_body(a).unwrap();
        assert!(removed.proxy.is_none());
        assert!(scene.body(a).is_none());
        assert_eq!(scene.broadphase().pair_cache().len(), 1);
        assert_eq!(scene.broadphase().proxy_count(), 2);
        assert!(matches!(scene.remove_body(a), Err(PhysicsError::UnknownBody(_))));

        let stats = scene.step(DT, &mut narrow_phase()).unwrap();
        assert_eq!(stats.joint_rows, 0);
        assert_eq!(stats.contact_rows, 1);

        // the slot is handed out again
        let c = scene.add_body(ball(Vec3::new(-5.0, 0.5, 0.0))).unwrap();
        assert_eq!(c, a);
        assert_eq!(scene.bodies().len(), 3);
        assert_eq!(scene.broadphase().pair_cache().len(), 2);
    }

    fn run_scene() -> Vec<Vec3> {
        let mut scene = PhysicsScene::new(WorldConfig::default()).unwrap();
        scene.add_body(ground()).unwrap();
        for i in 0..8 {
            let offset = (i % 3) as f32 * 0.3;
            scene
                .add_body(ball(Vec3::new(offset, 0.5 + i as f32 * 1.1, offset * 0.5)))
                .unwrap();
        }
        let mut narrow = narrow_phase();
        for _ in 0..60 {
            scene.step(DT, &mut narrow).unwrap();
        }
        scene.bodies().iter().map(|body| body.position).collect()
    }

    #[test]
    fn test_step_is_deterministic() {
        let first = run_scene();
        let second = run_scene();
        assert_eq!(first, second);
        assert!(first.iter().all(|position| position.is_finite()));
    }

    #[test]
    fn test_invalid_step() {
        let mut scene = PhysicsScene::new(WorldConfig::default()).unwrap();
        assert!(matches!(
            scene.step(-1.0, &mut narrow_phase()),
            Err(PhysicsError::InvalidTimeStep(_))
        ));

        let mut config = WorldConfig::default();
        config.solver.iterations = 0;
        assert!(PhysicsScene::new(config).is_err());
    }
}
