//! Tunables for the broadphase, the solver and the scene. Stored as JSON.

use crate::error::{PhysicsError, PhysicsResult};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

/// How two materials' coefficients are combined for a contact.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombineRule {
    Multiply,
    Average,
    Min,
    Max,
}

impl CombineRule {
    pub fn combine(self, a: f32, b: f32) -> f32 {
        match self {
            CombineRule::Multiply => a * b,
            CombineRule::Average => (a + b) * 0.5,
            CombineRule::Min => a.min(b),
            CombineRule::Max => a.max(b),
        }
    }
}

/// Penetration recovery policy. Only one is active for a solve.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PositionCorrection {
    /// Feed a fraction of the penetration into the normal row's target velocity.
    Baumgarte { erp: f32 },
    /// Correct penetration with pseudo velocities that move positions but are never reported.
    SplitImpulse { erp: f32 },
}

impl PositionCorrection {
    pub fn erp(self) -> f32 {
        match self {
            PositionCorrection::Baumgarte { erp } | PositionCorrection::SplitImpulse { erp } => erp,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub iterations: u32,
    pub position_correction: PositionCorrection,
    pub warm_starting: bool,
    /// Scale applied to last step's impulses before they are reapplied.
    pub warm_starting_factor: f32,
    pub randomize_order: bool,
    pub random_seed: u64,
    pub friction: bool,
    pub two_friction_directions: bool,
    /// Penetration allowed before any correction kicks in.
    pub linear_slop: f32,
    pub friction_combine: CombineRule,
    pub restitution_combine: CombineRule,
    /// Accumulated joint impulses are clamped to this before being kept for warm starting.
    pub max_impulse_magnitude: f32,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            position_correction: PositionCorrection::Baumgarte { erp: 0.2 },
            warm_starting: true,
            warm_starting_factor: 1.0,
            randomize_order: true,
            random_seed: 0,
            friction: true,
            two_friction_directions: true,
            linear_slop: 0.0,
            friction_combine: CombineRule::Multiply,
            restitution_combine: CombineRule::Multiply,
            max_impulse_magnitude: 1e5,
        }
    }
}

impl SolverConfig {
    pub fn validate(&self) -> PhysicsResult<()> {
        if self.iterations == 0 {
            return Err(PhysicsError::InvalidIterationCount(self.iterations));
        }
        let erp = self.position_correction.erp();
        if !(0.0..=1.0).contains(&erp) {
            return Err(PhysicsError::InvalidConfig(format!(
                "error reduction parameter {} must be within [0, 1]",
                erp
            )));
        }
        if !(0.0..=1.0).contains(&self.warm_starting_factor) {
            return Err(PhysicsError::InvalidConfig(format!(
                "warm starting factor {} must be within [0, 1]",
                self.warm_starting_factor
            )));
        }
        if !self.linear_slop.is_finite() || self.linear_slop < 0.0 {
            return Err(PhysicsError::InvalidConfig(format!(
                "linear slop {} must be finite and non-negative",
                self.linear_slop
            )));
        }
        if self.max_impulse_magnitude.is_nan() || self.max_impulse_magnitude <= 0.0 {
            return Err(PhysicsError::InvalidConfig(format!(
                "max impulse magnitude {} must be positive",
                self.max_impulse_magnitude
            )));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadphaseConfig {
    /// Added to every side of a proxy's bounds when its leaf is (re)inserted.
    pub margin: f32,
    /// Fraction of a proxy's half extent added in its direction of motion on re-insertion.
    pub prediction: f32,
    /// Percentage of dynamic leaves re-inserted for tree quality each step.
    pub dynamic_update_percent: u32,
    /// Percentage of fixed leaves re-inserted each step after proxies were demoted.
    pub fixed_update_percent: u32,
    /// Percentage of cached pairs checked for separation each step.
    pub cleanup_percent: u32,
    /// Only find pairs inside `calculate_overlapping_pairs` instead of on every proxy update.
    pub deferred_collide: bool,
    pub max_proxies: Option<usize>,
    pub max_pairs: Option<usize>,
}

impl Default for BroadphaseConfig {
    fn default() -> Self {
        Self {
            margin: 0.05,
            prediction: 0.0,
            dynamic_update_percent: 1,
            fixed_update_percent: 0,
            cleanup_percent: 100,
            deferred_collide: false,
            max_proxies: None,
            max_pairs: None,
        }
    }
}

impl BroadphaseConfig {
    pub fn validate(&self) -> PhysicsResult<()> {
        if !self.margin.is_finite() || self.margin < 0.0 {
            return Err(PhysicsError::InvalidConfig(format!(
                "broadphase margin {} must be finite and non-negative",
                self.margin
            )));
        }
        if !self.prediction.is_finite() || self.prediction < 0.0 {
            return Err(PhysicsError::InvalidConfig(format!(
                "velocity prediction {} must be finite and non-negative",
                self.prediction
            )));
        }
        for (name, percent) in [
            ("dynamic update", self.dynamic_update_percent),
            ("fixed update", self.fixed_update_percent),
            ("cleanup", self.cleanup_percent),
        ] {
            if percent > 100 {
                return Err(PhysicsError::InvalidConfig(format!(
                    "{} percentage {} exceeds 100",
                    name, percent
                )));
            }
        }
        if self.cleanup_percent == 0 {
            return Err(PhysicsError::InvalidConfig(
                "cleanup percentage must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    pub gravity: Vec3,
    pub solver: SolverConfig,
    pub broadphase: BroadphaseConfig,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -10.0, 0.0),
            solver: SolverConfig::default(),
            broadphase: BroadphaseConfig::default(),
        }
    }
}

impl WorldConfig {
    pub fn validate(&self) -> PhysicsResult<()> {
        if !self.gravity.is_finite() {
            return Err(PhysicsError::InvalidConfig(format!(
                "gravity {} must be finite",
                self.gravity
            )));
        }
        self.solver.validate()?;
        self.broadphase.validate()
    }

    pub fn load(path: impl AsRef<Path>) -> PhysicsResult<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let config: WorldConfig = serde_json::from_reader(reader)?;
        config.validate()?;

        Ok(config)
    }

    /// Like `load` but falls back to the defaults when the file is missing or invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("could not load physics config {:?}: {}, using defaults", path, e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> PhysicsResult<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);

        serde_json::to_writer_pretty(writer, self)?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{CombineRule, PositionCorrection, SolverConfig, WorldConfig};
    use crate::error::PhysicsError;

    #[test]
    fn test_combine_rules() {
        assert!((CombineRule::Multiply.combine(0.5, 0.4) - 0.2).abs() < 1e-6);
        assert!((CombineRule::Average.combine(0.5, 0.3) - 0.4).abs() < 1e-6);
        assert_eq!(CombineRule::Min.combine(0.5, 0.3), 0.3);
        assert_eq!(CombineRule::Max.combine(0.5, 0.3), 0.5);
    }

    #[test]
    fn test_validate() {
        assert!(WorldConfig::default().validate().is_ok());

        let config = SolverConfig {
            iterations: 0,
            ..SolverConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PhysicsError::InvalidIterationCount(0))
        ));

        let config = SolverConfig {
            position_correction: PositionCorrection::SplitImpulse { erp: 1.5 },
            ..SolverConfig::default()
        };
        assert!(matches!(config.validate(), Err(PhysicsError::InvalidConfig(_))));

        let mut config = WorldConfig::default();
        config.broadphase.cleanup_percent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_defaults() {
        let config: WorldConfig =
            serde_json::from_str(r#"{ "solver": { "iterations": 4, "random_seed": 9 } }"#).unwrap();
        assert_eq!(config.solver.iterations, 4);
        assert_eq!(config.solver.random_seed, 9);
        assert_eq!(config.broadphase, WorldConfig::default().broadphase);

        let text = serde_json::to_string(&config).unwrap();
        let back: WorldConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join("physics_config_test.json");
        let mut config = WorldConfig::default();
        config.solver.iterations = 6;
        config.broadphase.deferred_collide = true;
        config.save(&path).unwrap();
        assert_eq!(WorldConfig::load(&path).unwrap(), config);
        std::fs::remove_file(&path).unwrap();

        let missing = std::env::temp_dir().join("physics_config_missing.json");
        assert_eq!(WorldConfig::load_or_default(missing), WorldConfig::default());
    }
}
