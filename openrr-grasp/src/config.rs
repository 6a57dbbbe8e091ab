/*
Copyright 2017 Takashi Ogura

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::path::Path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Configuration of one grasp trial. Shared read-only by all trials of a batch.
#[derive(Clone, Serialize, Deserialize, Debug, Default, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GraspTrialConfig {
    #[serde(default)]
    pub scene: SceneConfig,
    #[serde(default)]
    pub phase_limits: PhaseLimits,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub close: CloseConfig,
    #[serde(default)]
    pub contact: ContactConfig,
    #[serde(default)]
    pub stability: StabilityConfig,
    #[serde(default)]
    pub divergence: DivergenceConfig,
    /// Wall clock ceiling of one trial in seconds.
    #[serde(default)]
    pub wall_clock_timeout_sec: Option<f64>,
}

impl GraspTrialConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(s).map_err(Error::TomlStrParseFailure)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let config: Self = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| Error::NoFile(path.to_owned(), e))?,
        )
        .map_err(|e| Error::TomlParseFailure(path.to_owned(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the trial cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        let mut checks = Checks::default();
        checks.non_negative(
            "scene.max_initial_penetration",
            self.scene.max_initial_penetration,
        );

        checks.positive("motion.translation_tolerance", self.motion.translation_tolerance);
        checks.positive("motion.rotation_tolerance", self.motion.rotation_tolerance);
        checks.positive("motion.approach_speed", self.motion.approach_speed);
        checks.positive("motion.angular_speed", self.motion.angular_speed);
        checks.positive("motion.lift_height", self.motion.lift_height);
        checks.positive("motion.lift_velocity", self.motion.lift_velocity);
        checks.positive("motion.lift_acceleration", self.motion.lift_acceleration);

        checks.non_negative("close.stall_velocity", self.close.stall_velocity);
        if self.close.stall_steps == 0 {
            checks.fail("close.stall_steps", "must be at least 1".to_owned());
        }
        checks.positive("close.velocity_gain", self.close.velocity_gain);
        checks.positive("close.max_joint_velocity", self.close.max_joint_velocity);
        checks.positive("close.torque_gain", self.close.torque_gain);
        checks.non_negative("close.guard_preload", self.close.guard_preload);
        checks.non_negative("close.start_tolerance", self.close.start_tolerance);
        checks.positive("close.waypoint_tolerance", self.close.waypoint_tolerance);
        checks.positive(
            "close.final_waypoint_tolerance",
            self.close.final_waypoint_tolerance,
        );
        checks.positive("close.max_tracking_error", self.close.max_tracking_error);

        checks.non_negative("contact.force_noise_floor", self.contact.force_noise_floor);
        if self.contact.min_contact_links == 0 {
            checks.fail("contact.min_contact_links", "must be at least 1".to_owned());
        }

        let stability = &self.stability;
        checks.non_negative(
            "stability.max_translation_deviation",
            stability.max_translation_deviation,
        );
        checks.non_negative(
            "stability.max_rotation_deviation",
            stability.max_rotation_deviation,
        );
        checks.non_negative("stability.max_relative_speed", stability.max_relative_speed);
        if !(0.0..=1.0).contains(&stability.min_contact_persistence) {
            checks.fail(
                "stability.min_contact_persistence",
                format!("must be 0.0~1.0 but {}", stability.min_contact_persistence),
            );
        }
        if let Some(mu) = stability.friction_coefficient {
            checks.non_negative("stability.friction_coefficient", mu);
        }
        if stability.friction_cone_edges < 3 {
            checks.fail(
                "stability.friction_cone_edges",
                format!("must be at least 3 but {}", stability.friction_cone_edges),
            );
        }
        checks.non_negative("stability.load_safety_factor", stability.load_safety_factor);
        checks.positive("stability.gravity", stability.gravity);

        checks.positive("divergence.max_position", self.divergence.max_position);
        checks.positive(
            "divergence.max_linear_velocity",
            self.divergence.max_linear_velocity,
        );
        checks.positive(
            "divergence.max_angular_velocity",
            self.divergence.max_angular_velocity,
        );

        if let Some(timeout) = self.wall_clock_timeout_sec {
            checks.positive("wall_clock_timeout_sec", timeout);
        }
        checks.finish()
    }
}

#[derive(Default)]
struct Checks {
    first_error: Option<Error>,
}

impl Checks {
    fn fail(&mut self, field: &str, message: String) {
        if self.first_error.is_none() {
            self.first_error = Some(Error::InvalidConfig {
                field: field.to_owned(),
                message,
            });
        }
    }

    fn positive(&mut self, field: &str, value: f64) {
        if !(value.is_finite() && value > 0.0) {
            self.fail(field, format!("must be positive but {value}"));
        }
    }

    fn non_negative(&mut self, field: &str, value: f64) {
        if !(value.is_finite() && value >= 0.0) {
            self.fail(field, format!("must be >= 0 but {value}"));
        }
    }

    fn finish(self) -> Result<(), Error> {
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// JSON schema of [`GraspTrialConfig`].
pub fn config_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(GraspTrialConfig)
}

#[derive(Clone, Serialize, Deserialize, Debug, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SceneConfig {
    /// Largest gripper/object penetration accepted right after loading [m].
    #[serde(default = "default_max_initial_penetration")]
    pub max_initial_penetration: f64,
    /// Steps run with the gripper held still so that the object settles.
    #[serde(default = "default_pre_roll_steps")]
    pub pre_roll_steps: u64,
}

fn default_max_initial_penetration() -> f64 {
    0.001
}

fn default_pre_roll_steps() -> u64 {
    60
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            max_initial_penetration: default_max_initial_penetration(),
            pre_roll_steps: default_pre_roll_steps(),
        }
    }
}

/// Step budget of each phase.
#[derive(Clone, Serialize, Deserialize, Debug, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PhaseLimits {
    #[serde(default = "default_approach_steps")]
    pub approach: u64,
    #[serde(default = "default_approach_steps")]
    pub align: u64,
    #[serde(default = "default_close_steps")]
    pub close: u64,
    #[serde(default = "default_lift_steps")]
    pub lift: u64,
}

fn default_approach_steps() -> u64 {
    1000
}

fn default_close_steps() -> u64 {
    1000
}

fn default_lift_steps() -> u64 {
    600
}

impl Default for PhaseLimits {
    fn default() -> Self {
        Self {
            approach: default_approach_steps(),
            align: default_approach_steps(),
            close: default_close_steps(),
            lift: default_lift_steps(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MotionConfig {
    /// [m]
    #[serde(default = "default_translation_tolerance")]
    pub translation_tolerance: f64,
    /// [rad]
    #[serde(default = "default_rotation_tolerance")]
    pub rotation_tolerance: f64,
    /// Base speed during Approach and Align [m/s].
    #[serde(default = "default_approach_speed")]
    pub approach_speed: f64,
    /// Base angular speed during Approach and Align [rad/s].
    #[serde(default = "default_angular_speed")]
    pub angular_speed: f64,
    #[serde(default = "default_lift_height")]
    pub lift_height: f64,
    #[serde(default = "default_lift_velocity")]
    pub lift_velocity: f64,
    #[serde(default = "default_lift_acceleration")]
    pub lift_acceleration: f64,
}

fn default_translation_tolerance() -> f64 {
    1e-3
}

fn default_rotation_tolerance() -> f64 {
    0.01
}

fn default_approach_speed() -> f64 {
    0.2
}

fn default_angular_speed() -> f64 {
    1.0
}

fn default_lift_height() -> f64 {
    0.1
}

fn default_lift_velocity() -> f64 {
    0.1
}

fn default_lift_acceleration() -> f64 {
    0.5
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            translation_tolerance: default_translation_tolerance(),
            rotation_tolerance: default_rotation_tolerance(),
            approach_speed: default_approach_speed(),
            angular_speed: default_angular_speed(),
            lift_height: default_lift_height(),
            lift_velocity: default_lift_velocity(),
            lift_acceleration: default_lift_acceleration(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CloseConfig {
    /// Joint speed under which a joint counts as stopped.
    #[serde(default = "default_stall_velocity")]
    pub stall_velocity: f64,
    /// Consecutive steps every joint has to be stopped.
    #[serde(default = "default_stall_steps")]
    pub stall_steps: u64,
    /// Proportional gain of velocity and torque actuators.
    #[serde(default = "default_velocity_gain")]
    pub velocity_gain: f64,
    #[serde(default = "default_max_joint_velocity")]
    pub max_joint_velocity: f64,
    #[serde(default = "default_torque_gain")]
    pub torque_gain: f64,
    /// Stop a finger on its first contact.
    #[serde(default)]
    pub guarded: bool,
    /// How far a guarded finger keeps squeezing past its contact position.
    #[serde(default = "default_guard_preload")]
    pub guard_preload: f64,
    /// Allowed distance of every joint from the open configuration before closing.
    #[serde(default = "default_start_tolerance")]
    pub start_tolerance: f64,
    #[serde(default = "default_waypoint_tolerance")]
    pub waypoint_tolerance: f64,
    #[serde(default = "default_final_waypoint_tolerance")]
    pub final_waypoint_tolerance: f64,
    /// Largest distance of a free, position-driven joint from its current
    /// waypoint before closing is aborted.
    #[serde(default = "default_max_tracking_error")]
    pub max_tracking_error: f64,
}

fn default_stall_velocity() -> f64 {
    1e-3
}

fn default_stall_steps() -> u64 {
    10
}

fn default_velocity_gain() -> f64 {
    2.0
}

fn default_max_joint_velocity() -> f64 {
    0.5
}

fn default_torque_gain() -> f64 {
    2000.0
}

fn default_guard_preload() -> f64 {
    0.002
}

fn default_start_tolerance() -> f64 {
    0.005
}

fn default_waypoint_tolerance() -> f64 {
    0.005
}

fn default_final_waypoint_tolerance() -> f64 {
    0.001
}

fn default_max_tracking_error() -> f64 {
    2.0
}

impl Default for CloseConfig {
    fn default() -> Self {
        Self {
            stall_velocity: default_stall_velocity(),
            stall_steps: default_stall_steps(),
            velocity_gain: default_velocity_gain(),
            max_joint_velocity: default_max_joint_velocity(),
            torque_gain: default_torque_gain(),
            guarded: false,
            guard_preload: default_guard_preload(),
            start_tolerance: default_start_tolerance(),
            waypoint_tolerance: default_waypoint_tolerance(),
            final_waypoint_tolerance: default_final_waypoint_tolerance(),
            max_tracking_error: default_max_tracking_error(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ContactConfig {
    /// Contacts with a smaller normal force are dropped [N].
    #[serde(default = "default_force_noise_floor")]
    pub force_noise_floor: f64,
    /// Distinct links in contact needed for a grasp.
    #[serde(default = "default_min_contact_links")]
    pub min_contact_links: usize,
}

fn default_force_noise_floor() -> f64 {
    0.1
}

fn default_min_contact_links() -> usize {
    2
}

impl Default for ContactConfig {
    fn default() -> Self {
        Self {
            force_noise_floor: default_force_noise_floor(),
            min_contact_links: default_min_contact_links(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StabilityConfig {
    /// [m]
    #[serde(default = "default_max_translation_deviation")]
    pub max_translation_deviation: f64,
    /// [rad]
    #[serde(default = "default_max_rotation_deviation")]
    pub max_rotation_deviation: f64,
    /// Object speed relative to the gripper [m/s].
    #[serde(default = "default_max_relative_speed")]
    pub max_relative_speed: f64,
    /// Fraction of lift samples that must keep `min_contact_links` links in contact.
    #[serde(default = "default_min_contact_persistence")]
    pub min_contact_persistence: f64,
    /// Defaults to the product of the object and pad friction coefficients.
    #[serde(default)]
    pub friction_coefficient: Option<f64>,
    #[serde(default = "default_friction_cone_edges")]
    pub friction_cone_edges: usize,
    #[serde(default = "default_load_safety_factor")]
    pub load_safety_factor: f64,
    #[serde(default = "default_gravity")]
    pub gravity: f64,
}

fn default_max_translation_deviation() -> f64 {
    0.01
}

fn default_max_rotation_deviation() -> f64 {
    0.1
}

fn default_max_relative_speed() -> f64 {
    0.05
}

fn default_min_contact_persistence() -> f64 {
    0.9
}

fn default_friction_cone_edges() -> usize {
    8
}

fn default_load_safety_factor() -> f64 {
    1.0
}

fn default_gravity() -> f64 {
    9.81
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            max_translation_deviation: default_max_translation_deviation(),
            max_rotation_deviation: default_max_rotation_deviation(),
            max_relative_speed: default_max_relative_speed(),
            min_contact_persistence: default_min_contact_persistence(),
            friction_coefficient: None,
            friction_cone_edges: default_friction_cone_edges(),
            load_safety_factor: default_load_safety_factor(),
            gravity: default_gravity(),
        }
    }
}

/// Ceilings past which the simulation is considered diverged.
#[derive(Clone, Serialize, Deserialize, Debug, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DivergenceConfig {
    /// Distance from the world origin [m].
    #[serde(default = "default_max_position")]
    pub max_position: f64,
    #[serde(default = "default_max_linear_velocity")]
    pub max_linear_velocity: f64,
    #[serde(default = "default_max_angular_velocity")]
    pub max_angular_velocity: f64,
}

fn default_max_position() -> f64 {
    100.0
}

fn default_max_linear_velocity() -> f64 {
    50.0
}

fn default_max_angular_velocity() -> f64 {
    100.0
}

impl Default for DivergenceConfig {
    fn default() -> Self {
        Self {
            max_position: default_max_position(),
            max_linear_velocity: default_max_linear_velocity(),
            max_angular_velocity: default_max_angular_velocity(),
        }
    }
}
