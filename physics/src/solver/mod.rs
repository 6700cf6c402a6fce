mod solver_body;
mod solver_constraint;

pub use solver_body::SolverBody;
pub use solver_constraint::{Jacobian, RowKind, SolverConstraint};

use crate::{
    body::{Body, BodyArena, BodyHandle},
    config::{PositionCorrection, SolverConfig},
    constraints::{Constraint, ConstraintInfo},
    contact::ContactPoint,
    error::{PhysicsError, PhysicsResult},
    manifold::PersistentManifold,
};
use glam::Vec3;
use rand::{seq::SliceRandom, SeedableRng};
use rand_pcg::Pcg32;

const NO_SOLVER_BODY: usize = usize::MAX;

// cached friction directions are dropped once the normal has turned this far
const TANGENT_TOLERANCE: f32 = 1e-3;

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SolveStats {
    pub solver_bodies: usize,
    pub contact_rows: usize,
    pub friction_rows: usize,
    pub joint_rows: usize,
    /// Rows with no effective mass or non-finite Jacobians, never solved.
    pub skipped_rows: usize,
    pub iterations: u32,
    /// Largest impulse change seen in the last iteration.
    pub last_max_delta: f32,
}

/// Projected Gauss-Seidel solver over contact, friction and joint rows.
pub struct SequentialImpulseSolver {
    config: SolverConfig,
    rng: Pcg32,
    solver_bodies: Vec<SolverBody>,
    body_map: Vec<usize>,
    contact_rows: Vec<SolverConstraint>,
    friction_rows: Vec<SolverConstraint>,
    joint_rows: Vec<SolverConstraint>,
    contact_order: Vec<usize>,
    friction_order: Vec<usize>,
}

impl SequentialImpulseSolver {
    pub fn new(config: SolverConfig) -> PhysicsResult<Self> {
        config.validate()?;
        Ok(Self {
            rng: Pcg32::seed_from_u64(config.random_seed),
            config,
            solver_bodies: Vec::new(),
            body_map: Vec::new(),
            contact_rows: Vec::new(),
            friction_rows: Vec::new(),
            joint_rows: Vec::new(),
            contact_order: Vec::new(),
            friction_order: Vec::new(),
        })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SolverConfig) -> PhysicsResult<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn set_random_seed(&mut self, seed: u64) {
        self.config.random_seed = seed;
        self.rng = Pcg32::seed_from_u64(seed);
    }

    /// Restarts the row shuffling sequence from the configured seed.
    pub fn reset(&mut self) {
        self.rng = Pcg32::seed_from_u64(self.config.random_seed);
    }

    /// Solves one batch of manifolds and joints, writing velocities to `bodies` and impulses back
    /// to the manifolds and joints.
    pub fn solve_group(
        &mut self,
        bodies: &mut BodyArena,
        manifolds: &mut [&mut PersistentManifold],
        constraints: &mut [&mut dyn Constraint],
        dt_sec: f32,
    ) -> PhysicsResult<SolveStats> {
        if !dt_sec.is_finite() || dt_sec <= 0.0 {
            return Err(PhysicsError::InvalidTimeStep(dt_sec));
        }

        self.solver_bodies.clear();
        self.contact_rows.clear();
        self.friction_rows.clear();
        self.joint_rows.clear();
        self.body_map.clear();
        self.body_map.resize(bodies.slot_count(), NO_SOLVER_BODY);

        let mut stats = SolveStats::default();
        self.setup_contacts(bodies, manifolds, dt_sec, &mut stats)?;
        self.setup_joints(bodies, constraints, dt_sec, &mut stats)?;

        self.contact_order.clear();
        self.contact_order.extend(0..self.contact_rows.len());
        self.friction_order.clear();
        self.friction_order.extend(0..self.friction_rows.len());

        for iteration in 0..self.config.iterations {
            if self.config.randomize_order && (iteration & 7) == 0 {
                self.contact_order.shuffle(&mut self.rng);
                self.friction_order.shuffle(&mut self.rng);
            }
            stats.last_max_delta = self.solve_iteration(constraints);
            stats.iterations += 1;
        }

        if let PositionCorrection::SplitImpulse { .. } = self.config.position_correction {
            for _ in 0..self.config.iterations {
                for &index in &self.contact_order {
                    let row = &mut self.contact_rows[index];
                    if let Some((a, b)) = pair_mut(&mut self.solver_bodies, row.body_a, row.body_b) {
                        row.resolve_split(a, b);
                    }
                }
            }
        }

        self.writeback(bodies, manifolds, constraints, dt_sec);

        stats.solver_bodies = self.solver_bodies.len();
        stats.contact_rows = self.contact_rows.len();
        stats.friction_rows = self.friction_rows.len();
        stats.joint_rows = self.joint_rows.len();
        log::debug!(
            "solved {} bodies, {} contact rows, {} friction rows, {} joint rows, {} skipped, last delta {}",
            stats.solver_bodies,
            stats.contact_rows,
            stats.friction_rows,
            stats.joint_rows,
            stats.skipped_rows,
            stats.last_max_delta
        );
        Ok(stats)
    }

    fn solver_body_index(&mut self, handle: BodyHandle, body: &Body) -> usize {
        let index = self.body_map[handle.index()];
        if index != NO_SOLVER_BODY {
            return index;
        }
        let index = self.solver_bodies.len();
        self.solver_bodies.push(SolverBody::new(handle, body));
        self.body_map[handle.index()] = index;
        index
    }

    fn setup_contacts(
        &mut self,
        bodies: &BodyArena,
        manifolds: &mut [&mut PersistentManifold],
        dt_sec: f32,
        stats: &mut SolveStats,
    ) -> PhysicsResult<()> {
        for (manifold_index, manifold) in manifolds.iter_mut().enumerate() {
            let (handle_a, handle_b) = (manifold.handle_a(), manifold.handle_b());
            let body_a = bodies.get_body(handle_a).ok_or(PhysicsError::UnknownBody(handle_a))?;
            let body_b = bodies.get_body(handle_b).ok_or(PhysicsError::UnknownBody(handle_b))?;
            if handle_a == handle_b || (body_a.has_infinite_mass() && body_b.has_infinite_mass()) {
                continue;
            }

            let index_a = self.solver_body_index(handle_a, body_a);
            let index_b = self.solver_body_index(handle_b, body_b);
            for (point_index, point) in manifold.contacts_mut().iter_mut().enumerate() {
                let ra = point.world_point_a - body_a.position;
                let rb = point.world_point_b - body_b.position;
                self.setup_contact_point(manifold_index, point_index, point, index_a, index_b, ra, rb, dt_sec, stats);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn setup_contact_point(
        &mut self,
        manifold: usize,
        point_index: usize,
        point: &mut ContactPoint,
        index_a: usize,
        index_b: usize,
        ra: Vec3,
        rb: Vec3,
        dt_sec: f32,
        stats: &mut SolveStats,
    ) {
        let normal = point.normal_world_on_b;
        if !normal.is_finite() || !normal.is_normalized() {
            let friction_rows = match (self.config.friction, self.config.two_friction_directions) {
                (false, _) => 0,
                (true, false) => 1,
                (true, true) => 2,
            };
            log::debug!("skipping contact {} of manifold {} with normal {}", point_index, manifold, normal);
            stats.skipped_rows += 1 + friction_rows;
            point.clear_impulses();
            return;
        }
        let (a, b) = (&self.solver_bodies[index_a], &self.solver_bodies[index_b]);

        let mut row = SolverConstraint::new(
            RowKind::ContactNormal {
                manifold,
                point: point_index,
            },
            index_a,
            index_b,
            Jacobian::contact(normal, ra, rb),
            a,
            b,
        );
        row.friction = point.combined_friction;
        row.lower_limit = 0.0;
        row.upper_limit = f32::INFINITY;

        if row.is_degenerate() {
            log::debug!("skipping degenerate contact row {:?}", row.kind);
            stats.skipped_rows += 1;
        } else {
            let rel_vel = row.relative_velocity(a, b);
            let restitution = restitution_curve(rel_vel, point.combined_restitution);

            let penetration = point.distance + self.config.linear_slop;
            let mut velocity_error = restitution - rel_vel;
            let positional_error = if penetration > 0.0 {
                // still apart, allow closing the gap this step
                velocity_error -= penetration / dt_sec;
                0.0
            } else {
                -penetration * self.config.position_correction.erp() / dt_sec
            };

            let penetration_impulse = positional_error * row.jac_diag_inv;
            let velocity_impulse = velocity_error * row.jac_diag_inv;
            match self.config.position_correction {
                PositionCorrection::Baumgarte { .. } => {
                    row.rhs = penetration_impulse + velocity_impulse;
                }
                PositionCorrection::SplitImpulse { .. } => {
                    row.rhs = velocity_impulse;
                    row.rhs_penetration = penetration_impulse;
                }
            }
        }

        let normal_index = self.contact_rows.len();
        if self.config.warm_starting {
            if let Some((a, b)) = pair_mut(&mut self.solver_bodies, index_a, index_b) {
                row.warm_start(point.applied_impulse * self.config.warm_starting_factor, a, b);
            }
        }
        self.contact_rows.push(row);

        if !self.config.friction {
            return;
        }

        let directions = if self.config.two_friction_directions {
            2
        } else {
            1
        };

        // two cached directions span the tangent plane for as long as the normal holds, so the
        // lateral impulses stay meaningful for warm starting
        let reuse_cached = directions == 2
            && point.lateral_friction_initialized
            && tangent_to(point.lateral_friction_dir1, normal)
            && tangent_to(point.lateral_friction_dir2, normal);
        let (dir1, dir2) = if reuse_cached {
            (point.lateral_friction_dir1, point.lateral_friction_dir2)
        } else {
            let (a, b) = (&self.solver_bodies[index_a], &self.solver_bodies[index_b]);
            let vel =
                (a.linear_velocity + a.angular_velocity.cross(ra)) - (b.linear_velocity + b.angular_velocity.cross(rb));
            let lateral = vel - normal * normal.dot(vel);
            let lateral_sq = lateral.length_squared();
            let (dir1, dir2) = if lateral_sq > f32::EPSILON {
                let dir1 = lateral / lateral_sq.sqrt();
                (dir1, dir1.cross(normal).normalize_or_zero())
            } else {
                normal.any_orthonormal_pair()
            };
            if point.lateral_friction_initialized && dir1.dot(point.lateral_friction_dir1) < 1.0 - TANGENT_TOLERANCE {
                // the old impulses belong to other directions
                point.applied_impulse_lateral1 = 0.0;
                point.applied_impulse_lateral2 = 0.0;
            }
            point.lateral_friction_dir1 = dir1;
            point.lateral_friction_dir2 = dir2;
            point.lateral_friction_initialized = true;
            (dir1, dir2)
        };
        for direction in 0..directions {
            let (dir, warm_impulse) = if direction == 0 {
                (dir1, point.applied_impulse_lateral1)
            } else {
                (dir2, point.applied_impulse_lateral2)
            };
            self.add_friction_row(
                RowKind::Friction {
                    manifold,
                    point: point_index,
                    direction: direction as u8,
                },
                dir,
                ra,
                rb,
                normal_index,
                point.combined_friction,
                warm_impulse,
                stats,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_friction_row(
        &mut self,
        kind: RowKind,
        dir: Vec3,
        ra: Vec3,
        rb: Vec3,
        normal_index: usize,
        friction: f32,
        warm_impulse: f32,
        stats: &mut SolveStats,
    ) {
        let normal_row = &self.contact_rows[normal_index];
        let (index_a, index_b) = (normal_row.body_a, normal_row.body_b);
        let normal_impulse = normal_row.applied_impulse;

        let (a, b) = (&self.solver_bodies[index_a], &self.solver_bodies[index_b]);
        let mut row = SolverConstraint::new(kind, index_a, index_b, Jacobian::contact(dir, ra, rb), a, b);
        row.friction = friction;
        row.friction_index = normal_index;
        row.lower_limit = -friction * normal_impulse;
        row.upper_limit = friction * normal_impulse;

        if row.is_degenerate() {
            stats.skipped_rows += 1;
        } else {
            row.rhs = -row.relative_velocity(a, b) * row.jac_diag_inv;
            if self.config.warm_starting {
                if let Some((a, b)) = pair_mut(&mut self.solver_bodies, index_a, index_b) {
                    row.warm_start(warm_impulse * self.config.warm_starting_factor, a, b);
                }
            }
        }
        self.friction_rows.push(row);
    }

    fn setup_joints(
        &mut self,
        bodies: &BodyArena,
        constraints: &mut [&mut dyn Constraint],
        dt_sec: f32,
        stats: &mut SolveStats,
    ) -> PhysicsResult<()> {
        let info = ConstraintInfo {
            dt_sec,
            erp: self.config.position_correction.erp(),
        };

        for (constraint_index, constraint) in constraints.iter_mut().enumerate() {
            let (handle_a, handle_b) = (constraint.body_a(), constraint.body_b());
            let body_a = bodies.get_body(handle_a).ok_or(PhysicsError::UnknownBody(handle_a))?;
            let body_b = bodies.get_body(handle_b).ok_or(PhysicsError::UnknownBody(handle_b))?;
            if handle_a == handle_b {
                log::warn!("joint {} connects {:?} to itself, ignored", constraint_index, handle_a);
                continue;
            }

            let index_a = self.solver_body_index(handle_a, body_a);
            let index_b = self.solver_body_index(handle_b, body_b);
            for row_index in 0..constraint.row_count() {
                let joint_row = constraint.setup_row(row_index, body_a, body_b, &info);

                let (a, b) = (&self.solver_bodies[index_a], &self.solver_bodies[index_b]);
                let mut row = SolverConstraint::new(
                    RowKind::Joint {
                        constraint: constraint_index,
                        row: row_index,
                    },
                    index_a,
                    index_b,
                    joint_row.jacobian,
                    a,
                    b,
                );
                row.lower_limit = joint_row.lower_limit;
                row.upper_limit = joint_row.upper_limit;

                if row.is_degenerate() {
                    stats.skipped_rows += 1;
                } else {
                    row.rhs = (joint_row.velocity_target - row.relative_velocity(a, b)) * row.jac_diag_inv;
                    if self.config.warm_starting {
                        let warm_impulse = (joint_row.warm_start_impulse * self.config.warm_starting_factor)
                            .clamp(row.lower_limit, row.upper_limit);
                        if let Some((a, b)) = pair_mut(&mut self.solver_bodies, index_a, index_b) {
                            row.warm_start(warm_impulse, a, b);
                        }
                    }
                }
                self.joint_rows.push(row);
            }
        }
        Ok(())
    }

    // one pass over joints, then contacts, then friction
    fn solve_iteration(&mut self, constraints: &[&mut dyn Constraint]) -> f32 {
        let mut max_delta = 0.0f32;

        for row in self.joint_rows.iter_mut() {
            let constraint = match row.kind {
                RowKind::Joint { constraint, .. } => constraint,
                _ => continue,
            };
            if let Some((a, b)) = pair_mut(&mut self.solver_bodies, row.body_a, row.body_b) {
                let delta = constraints[constraint].solve_row(row, a, b);
                max_delta = max_delta.max(delta.abs());
            }
        }

        for &index in &self.contact_order {
            let row = &mut self.contact_rows[index];
            if let Some((a, b)) = pair_mut(&mut self.solver_bodies, row.body_a, row.body_b) {
                max_delta = max_delta.max(row.resolve(a, b).abs());
            }
        }

        for &index in &self.friction_order {
            let row = &mut self.friction_rows[index];
            // friction is bounded by the normal impulse as it stands now
            let bound = row.friction * self.contact_rows[row.friction_index].applied_impulse;
            row.lower_limit = -bound;
            row.upper_limit = bound;
            if let Some((a, b)) = pair_mut(&mut self.solver_bodies, row.body_a, row.body_b) {
                max_delta = max_delta.max(row.resolve(a, b).abs());
            }
        }

        max_delta
    }

    fn writeback(
        &mut self,
        bodies: &mut BodyArena,
        manifolds: &mut [&mut PersistentManifold],
        constraints: &mut [&mut dyn Constraint],
        dt_sec: f32,
    ) {
        for row in self.contact_rows.iter().chain(self.friction_rows.iter()) {
            let (manifold, point) = match row.kind {
                RowKind::ContactNormal { manifold, point } | RowKind::Friction { manifold, point, .. } => {
                    (manifold, point)
                }
                RowKind::Joint { .. } => continue,
            };
            let contact = match manifolds
                .get_mut(manifold)
                .and_then(|manifold| manifold.contacts_mut().get_mut(point))
            {
                Some(contact) => contact,
                None => continue,
            };
            match row.kind {
                RowKind::Friction { direction: 0, .. } => contact.applied_impulse_lateral1 = row.applied_impulse,
                RowKind::Friction { .. } => contact.applied_impulse_lateral2 = row.applied_impulse,
                _ => contact.applied_impulse = row.applied_impulse,
            }
        }

        let limit = self.config.max_impulse_magnitude;
        for row in &self.joint_rows {
            if let RowKind::Joint { constraint, row: row_index } = row.kind {
                // limit the warm starting to reasonable limits
                let impulse = if row.applied_impulse.is_finite() {
                    row.applied_impulse.clamp(-limit, limit)
                } else {
                    0.0
                };
                constraints[constraint].writeback_row(row_index, impulse);
            }
        }

        let split_impulse = matches!(self.config.position_correction, PositionCorrection::SplitImpulse { .. });
        for solver_body in &self.solver_bodies {
            self.body_map[solver_body.body.index()] = NO_SOLVER_BODY;
            if solver_body.is_static() {
                continue;
            }
            if let Some(body) = bodies.get_body_mut(solver_body.body) {
                body.linear_velocity = solver_body.total_linear_velocity();
                body.angular_velocity = solver_body.total_angular_velocity();
                if split_impulse {
                    body.apply_pseudo_velocity(solver_body.push_velocity, solver_body.turn_velocity, dt_sec);
                }
            }
        }
    }
}

fn tangent_to(dir: Vec3, normal: Vec3) -> bool {
    dir.is_normalized() && dir.dot(normal).abs() < TANGENT_TOLERANCE
}

/// Bounce velocity for an approaching contact, zero for separating ones.
fn restitution_curve(rel_vel: f32, restitution: f32) -> f32 {
    f32::max(0.0, -rel_vel * restitution)
}

fn pair_mut(bodies: &mut [SolverBody], index_a: usize, index_b: usize) -> Option<(&mut SolverBody, &mut SolverBody)> {
    match index_a.cmp(&index_b) {
        std::cmp::Ordering::Less => {
            let (head, tail) = bodies.split_at_mut(index_b);
            Some((head.get_mut(index_a)?, tail.get_mut(0)?))
        }
        std::cmp::Ordering::Greater => {
            let (head, tail) = bodies.split_at_mut(index_a);
            Some((tail.get_mut(0)?, head.get_mut(index_b)?))
        }
        std::cmp::Ordering::Equal => None,
    }
}

#[cfg(test)]
mod test {
    use super::SequentialImpulseSolver;
    use crate::{
        body::{Body, BodyArena, BodyHandle},
        config::{PositionCorrection, SolverConfig},
        constraints::{Constraint, ConstraintDistance, ConstraintPoint},
        contact::ContactPoint,
        error::PhysicsError,
        manifold::PersistentManifold,
    };
    use glam::Vec3;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg32;

    const DT: f32 = 1.0 / 60.0;
    const GRAVITY: Vec3 = Vec3::new(0.0, -10.0, 0.0);

    fn contact(
        bodies: &BodyArena,
        manifold: &PersistentManifold,
        world_point: Vec3,
        normal: Vec3,
        distance: f32,
        friction: f32,
    ) -> ContactPoint {
        let body_a = bodies.get_body(manifold.handle_a()).unwrap();
        let body_b = bodies.get_body(manifold.handle_b()).unwrap();
        ContactPoint {
            combined_friction: friction,
            ..ContactPoint::new(
                body_a.world_to_local(world_point),
                body_b.world_to_local(world_point),
                world_point,
                world_point,
                normal,
                distance,
            )
        }
    }

    fn add_ground(bodies: &mut BodyArena) -> BodyHandle {
        bodies.add(Body::cuboid(
            Vec3::new(0.0, -0.5, 0.0),
            Vec3::new(10.0, 0.5, 10.0),
            0.0,
        ))
    }

    #[test]
    fn test_two_spheres_converge() {
        let mut bodies = BodyArena::new();
        let a = bodies.add(Body {
            linear_velocity: Vec3::new(0.0, -1.0, 0.0),
            ..Body::sphere(Vec3::new(0.0, 1.0, 0.0), 0.5, 1.0)
        });
        let b = bodies.add(Body {
            linear_velocity: Vec3::new(0.0, 1.0, 0.0),
            ..Body::sphere(Vec3::ZERO, 0.5, 1.0)
        });
        let mut manifold = PersistentManifold::new(a, b);
        let point = contact(&bodies, &manifold, Vec3::new(0.0, 0.5, 0.0), Vec3::Y, 0.0, 0.0);
        manifold.add_contact(point);

        let mut solver = SequentialImpulseSolver::new(SolverConfig::default()).unwrap();
        solver
            .solve_group(&mut bodies, &mut [&mut manifold], &mut [], DT)
            .unwrap();

        let va = bodies.get_body(a).unwrap().linear_velocity;
        let vb = bodies.get_body(b).unwrap().linear_velocity;
        assert!((va - vb).dot(Vec3::Y) >= -1e-5);
        assert!((va + vb).abs_diff_eq(Vec3::ZERO, 1e-5));
        assert!((manifold.contacts()[0].applied_impulse - 1.0).abs() < 1e-5);

        // resting on top of each other under gravity
        for handle in [a, b] {
            let body = bodies.get_body_mut(handle).unwrap();
            body.linear_velocity = GRAVITY * DT;
        }
        solver
            .solve_group(&mut bodies, &mut [&mut manifold], &mut [], DT)
            .unwrap();
        let va = bodies.get_body(a).unwrap().linear_velocity;
        let vb = bodies.get_body(b).unwrap().linear_velocity;
        assert!((va - vb).dot(Vec3::Y) >= -1e-5);
    }

    #[test]
    fn test_friction_bound() {
        let mut bodies = BodyArena::new();
        let ground = add_ground(&mut bodies);
        let cube = bodies.add(Body {
            linear_velocity: Vec3::new(2.0, 0.0, 0.5) + GRAVITY * DT,
            angular_velocity: Vec3::new(0.3, 1.0, 0.0),
            ..Body::cuboid(Vec3::new(0.0, 0.5, 0.0), Vec3::splat(0.5), 1.0)
        });

        let mut manifold = PersistentManifold::new(cube, ground);
        for (x, z) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
            let point = contact(&bodies, &manifold, Vec3::new(x, 0.0, z), Vec3::Y, -0.005, 0.3);
            manifold.add_contact(point);
        }
        assert_eq!(manifold.num_contacts(), 4);

        let mut solver = SequentialImpulseSolver::new(SolverConfig::default()).unwrap();
        for _ in 0..3 {
            let stats = solver
                .solve_group(&mut bodies, &mut [&mut manifold], &mut [], DT)
                .unwrap();
            assert_eq!(stats.contact_rows, 4);
            assert_eq!(stats.friction_rows, 8);
            for point in manifold.contacts() {
                let bound = point.combined_friction * point.applied_impulse;
                assert!(point.applied_impulse >= 0.0);
                assert!(point.applied_impulse_lateral1.abs() <= bound + 1e-6);
                assert!(point.applied_impulse_lateral2.abs() <= bound + 1e-6);
            }
        }
    }

    #[test]
    fn test_warm_start_idempotent() {
        let mut bodies = BodyArena::new();
        let ground = add_ground(&mut bodies);
        let ball = bodies.add(Body {
            friction: 0.5,
            ..Body::sphere(Vec3::new(0.0, 0.5, 0.0), 0.5, 1.0)
        });
        let mut manifold = PersistentManifold::new(ball, ground);
        let point = contact(&bodies, &manifold, Vec3::ZERO, Vec3::Y, 0.0, 0.5);
        manifold.add_contact(point);

        let mut solver = SequentialImpulseSolver::new(SolverConfig::default()).unwrap();
        let mut impulses = Vec::new();
        let mut stats = Vec::new();
        for _ in 0..2 {
            bodies.get_body_mut(ball).unwrap().linear_velocity += GRAVITY * DT;
            stats.push(
                solver
                    .solve_group(&mut bodies, &mut [&mut manifold], &mut [], DT)
                    .unwrap(),
            );
            impulses.push(manifold.contacts()[0].applied_impulse);
            let body = bodies.get_body(ball).unwrap();
            assert!(body.linear_velocity.abs_diff_eq(Vec3::ZERO, 1e-5));
        }

        assert!((impulses[0] - impulses[1]).abs() < 1e-6);
        // the warm start already holds the answer
        assert!(stats[1].last_max_delta < 1e-5);
    }

    fn random_scene(seed: u64) -> (BodyArena, Vec<PersistentManifold>) {
        let mut rng = Pcg32::seed_from_u64(seed);
        let mut bodies = BodyArena::new();
        let mut handles = vec![add_ground(&mut bodies)];
        for i in 0..6 {
            handles.push(bodies.add(Body {
                linear_velocity: Vec3::new(
                    rng.gen_range(-1.0..1.0),
                    rng.gen_range(-2.0..0.0),
                    rng.gen_range(-1.0..1.0),
                ),
                angular_velocity: Vec3::new(rng.gen_range(-1.0..1.0), 0.0, rng.gen_range(-1.0..1.0)),
                ..Body::sphere(Vec3::new(i as f32 * 0.9, 0.5, 0.0), 0.5, 1.0)
            }));
        }

        let mut manifolds = Vec::new();
        for pair in handles.windows(2) {
            let mut manifold = PersistentManifold::new(pair[1], pair[0]);
            for _ in 0..3 {
                let world_point = Vec3::new(
                    rng.gen_range(-3.0..3.0),
                    rng.gen_range(0.0..0.5),
                    rng.gen_range(-0.5..0.5),
                );
                let normal = Vec3::new(rng.gen_range(-0.3..0.3), 1.0, rng.gen_range(-0.3..0.3)).normalize();
                let point = contact(&bodies, &manifold, world_point, normal, rng.gen_range(-0.05..0.0), 0.4);
                manifold.add_contact(point);
            }
            manifolds.push(manifold);
        }
        (bodies, manifolds)
    }

    fn solve_random_scene(seed: u64) -> Vec<(Vec3, Vec3)> {
        let (mut bodies, mut manifolds) = random_scene(3);
        let mut refs: Vec<&mut PersistentManifold> = manifolds.iter_mut().collect();
        let mut solver = SequentialImpulseSolver::new(SolverConfig {
            random_seed: seed,
            ..SolverConfig::default()
        })
        .unwrap();
        solver.solve_group(&mut bodies, &mut refs, &mut [], DT).unwrap();
        bodies
            .iter()
            .map(|body| (body.linear_velocity, body.angular_velocity))
            .collect()
    }

    #[test]
    fn test_determinism() {
        let first = solve_random_scene(17);
        let second = solve_random_scene(17);
        assert_eq!(first, second);
        assert!(first.iter().all(|(linear, angular)| linear.is_finite() && angular.is_finite()));
    }

    #[test]
    fn test_degenerate_rows_skipped() {
        let mut bodies = BodyArena::new();
        let ground = add_ground(&mut bodies);
        let other_ground = add_ground(&mut bodies);
        let ball = bodies.add(Body {
            linear_velocity: Vec3::new(0.0, -1.0, 0.0),
            ..Body::sphere(Vec3::new(0.0, 0.5, 0.0), 0.5, 1.0)
        });

        let mut broken = PersistentManifold::new(ball, ground);
        let point = contact(&bodies, &broken, Vec3::ZERO, Vec3::splat(f32::NAN), -0.01, 0.5);
        broken.add_contact(point);
        let mut fixed_pair = PersistentManifold::new(ground, other_ground);
        let point = contact(&bodies, &fixed_pair, Vec3::ZERO, Vec3::Y, -0.01, 0.5);
        fixed_pair.add_contact(point);

        let mut solver = SequentialImpulseSolver::new(SolverConfig::default()).unwrap();
        let stats = solver
            .solve_group(&mut bodies, &mut [&mut broken, &mut fixed_pair], &mut [], DT)
            .unwrap();
        assert_eq!(stats.skipped_rows, 3);
        let body = bodies.get_body(ball).unwrap();
        assert_eq!(body.linear_velocity, Vec3::new(0.0, -1.0, 0.0));
        assert_eq!(body.angular_velocity, Vec3::ZERO);
    }

    #[test]
    fn test_unnormalized_normal_skipped() {
        for (friction, skipped) in [(true, 3), (false, 1)] {
            let mut bodies = BodyArena::new();
            let ground = add_ground(&mut bodies);
            let ball = bodies.add(Body {
                linear_velocity: Vec3::new(0.5, -1.0, 0.0),
                ..Body::sphere(Vec3::new(0.0, 0.5, 0.0), 0.5, 1.0)
            });
            let mut manifold = PersistentManifold::new(ball, ground);
            let point = ContactPoint {
                applied_impulse: 5.0,
                ..contact(&bodies, &manifold, Vec3::ZERO, Vec3::new(0.0, 2.0, 0.0), -0.01, 0.5)
            };
            manifold.add_contact(point);

            let mut solver = SequentialImpulseSolver::new(SolverConfig {
                friction,
                ..SolverConfig::default()
            })
            .unwrap();
            let stats = solver
                .solve_group(&mut bodies, &mut [&mut manifold], &mut [], DT)
                .unwrap();
            assert_eq!(stats.skipped_rows, skipped);
            assert_eq!(stats.contact_rows, 0);
            assert_eq!(stats.friction_rows, 0);
            assert_eq!(manifold.contacts()[0].applied_impulse, 0.0);
            let body = bodies.get_body(ball).unwrap();
            assert_eq!(body.linear_velocity, Vec3::new(0.5, -1.0, 0.0));
        }
    }

    fn bounce(velocity: f32, restitution: f32) -> f32 {
        let mut bodies = BodyArena::new();
        let ground = add_ground(&mut bodies);
        let ball = bodies.add(Body {
            linear_velocity: Vec3::new(0.0, velocity, 0.0),
            ..Body::sphere(Vec3::new(0.0, 0.5, 0.0), 0.5, 1.0)
        });
        let mut manifold = PersistentManifold::new(ball, ground);
        let point = ContactPoint {
            combined_restitution: restitution,
            ..contact(&bodies, &manifold, Vec3::ZERO, Vec3::Y, 0.0, 0.0)
        };
        manifold.add_contact(point);

        let mut solver = SequentialImpulseSolver::new(SolverConfig::default()).unwrap();
        solver
            .solve_group(&mut bodies, &mut [&mut manifold], &mut [], DT)
            .unwrap();
        bodies.get_body(ball).unwrap().linear_velocity.y
    }

    #[test]
    fn test_restitution() {
        // approaching at 2 m/s bounces back at e * 2
        assert!((bounce(-2.0, 0.5) - 1.0).abs() < 1e-4);
        assert!((bounce(-2.0, 1.0) - 2.0).abs() < 1e-4);
        assert!(bounce(-2.0, 0.0).abs() < 1e-4);
        // already separating, nothing is added
        assert!((bounce(1.0, 0.5) - 1.0).abs() < 1e-6);
    }

    fn slide(bodies: &mut BodyArena, ball: BodyHandle, velocity: Vec3) {
        let body = bodies.get_body_mut(ball).unwrap();
        body.linear_velocity = velocity + GRAVITY * DT;
        body.angular_velocity = Vec3::ZERO;
    }

    #[test]
    fn test_cached_friction_directions() {
        let mut bodies = BodyArena::new();
        let ground = add_ground(&mut bodies);
        let ball = bodies.add(Body {
            linear_velocity: Vec3::new(0.0, 0.0, 2.0) + GRAVITY * DT,
            ..Body::sphere(Vec3::new(0.0, 0.5, 0.0), 0.5, 1.0)
        });
        let mut manifold = PersistentManifold::new(ball, ground);
        let point = contact(&bodies, &manifold, Vec3::ZERO, Vec3::Y, 0.0, 0.1);
        manifold.add_contact(point);

        let mut solver = SequentialImpulseSolver::new(SolverConfig::default()).unwrap();
        solver
            .solve_group(&mut bodies, &mut [&mut manifold], &mut [], DT)
            .unwrap();
        let point = manifold.contacts()[0];
        assert!(point.lateral_friction_initialized);
        assert!(point.lateral_friction_dir1.abs_diff_eq(Vec3::Z, 1e-5));

        // sliding sideways now, the cached pair still spans the plane and is kept
        slide(&mut bodies, ball, Vec3::new(2.0, 0.0, 0.0));
        solver
            .solve_group(&mut bodies, &mut [&mut manifold], &mut [], DT)
            .unwrap();
        let point = manifold.contacts()[0];
        assert!(point.lateral_friction_dir1.abs_diff_eq(Vec3::Z, 1e-5));
        assert!(point.applied_impulse_lateral2.abs() > 0.0);

        // a single direction follows the sliding velocity
        solver
            .set_config(SolverConfig {
                two_friction_directions: false,
                ..SolverConfig::default()
            })
            .unwrap();
        slide(&mut bodies, ball, Vec3::new(2.0, 0.0, 0.0));
        solver
            .solve_group(&mut bodies, &mut [&mut manifold], &mut [], DT)
            .unwrap();
        let point = manifold.contacts()[0];
        assert!(point.lateral_friction_dir1.abs_diff_eq(Vec3::X, 1e-5));
    }

    #[test]
    fn test_split_impulse_leaves_velocity() {
        for position_correction in [
            PositionCorrection::SplitImpulse { erp: 0.2 },
            PositionCorrection::Baumgarte { erp: 0.2 },
        ] {
            let mut bodies = BodyArena::new();
            let ground = add_ground(&mut bodies);
            let ball = bodies.add(Body::sphere(Vec3::new(0.0, 0.4, 0.0), 0.5, 1.0));
            let mut manifold = PersistentManifold::new(ball, ground);
            let point = contact(&bodies, &manifold, Vec3::ZERO, Vec3::Y, -0.1, 0.0);
            manifold.add_contact(point);

            let mut solver = SequentialImpulseSolver::new(SolverConfig {
                position_correction,
                ..SolverConfig::default()
            })
            .unwrap();
            solver
                .solve_group(&mut bodies, &mut [&mut manifold], &mut [], DT)
                .unwrap();

            let body = bodies.get_body(ball).unwrap();
            match position_correction {
                PositionCorrection::SplitImpulse { .. } => {
                    assert!(body.linear_velocity.abs_diff_eq(Vec3::ZERO, 1e-6));
                    // 0.1 * 0.2 of the penetration is pushed out this step
                    assert!((body.position.y - 0.42).abs() < 1e-4);
                }
                PositionCorrection::Baumgarte { .. } => {
                    assert!(body.linear_velocity.y > 1.0);
                    assert_eq!(body.position.y, 0.4);
                }
            }
        }
    }

    #[test]
    fn test_joints() {
        let mut bodies = BodyArena::new();
        let anchor = bodies.add(Body::cuboid(Vec3::ZERO, Vec3::splat(0.1), 0.0));
        let ball = bodies.add(Body {
            linear_velocity: Vec3::new(1.0, -1.0, 0.0),
            ..Body::sphere(Vec3::new(2.0, 0.0, 0.0), 0.25, 1.0)
        });

        let mut distance = ConstraintDistance::new(anchor, Vec3::ZERO, ball, Vec3::ZERO, 2.0);
        let mut solver = SequentialImpulseSolver::new(SolverConfig::default()).unwrap();
        {
            let mut joints: [&mut dyn Constraint; 1] = [&mut distance];
            let stats = solver.solve_group(&mut bodies, &mut [], &mut joints, DT).unwrap();
            assert_eq!(stats.joint_rows, 1);
        }
        let body = bodies.get_body(ball).unwrap();
        assert!(body.linear_velocity.abs_diff_eq(Vec3::new(0.0, -1.0, 0.0), 1e-5));
        assert!((distance.cached_impulse() + 1.0).abs() < 1e-5);

        let ball_body = bodies.get_body(ball).unwrap().clone();
        let anchor_body = bodies.get_body(anchor).unwrap().clone();
        let mut point = ConstraintPoint::from_world_pivot(anchor, &anchor_body, ball, &ball_body, ball_body.position);
        bodies.get_body_mut(ball).unwrap().linear_velocity = Vec3::new(1.0, 2.0, 3.0);
        {
            let mut joints: [&mut dyn Constraint; 1] = [&mut point];
            let stats = solver.solve_group(&mut bodies, &mut [], &mut joints, DT).unwrap();
            assert_eq!(stats.joint_rows, 3);
        }
        let body = bodies.get_body(ball).unwrap();
        assert!(body.linear_velocity.abs_diff_eq(Vec3::ZERO, 1e-5));
        let cached = point.cached_impulses();
        assert!((cached[0] + 1.0).abs() < 1e-5);
        assert!((cached[1] + 2.0).abs() < 1e-5);
        assert!((cached[2] + 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_invalid_input() {
        let mut bodies = BodyArena::new();
        let ball = bodies.add(Body::sphere(Vec3::ZERO, 0.5, 1.0));
        let mut solver = SequentialImpulseSolver::new(SolverConfig::default()).unwrap();
        assert!(matches!(
            solver.solve_group(&mut bodies, &mut [], &mut [], 0.0),
            Err(PhysicsError::InvalidTimeStep(_))
        ));

        let mut manifold = PersistentManifold::new(ball, BodyHandle(5));
        assert!(matches!(
            solver.solve_group(&mut bodies, &mut [&mut manifold], &mut [], DT),
            Err(PhysicsError::UnknownBody(BodyHandle(5)))
        ));

        assert!(matches!(
            SequentialImpulseSolver::new(SolverConfig {
                iterations: 0,
                ..SolverConfig::default()
            }),
            Err(PhysicsError::InvalidIterationCount(0))
        ));
    }
}
