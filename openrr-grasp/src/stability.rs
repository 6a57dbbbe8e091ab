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

use std::{collections::BTreeMap, fmt, sync::Arc};

use auto_impl::auto_impl;
use graspi::BodyState;
use nalgebra::{Matrix3, Matrix3x2, Vector3};
use serde::{Deserialize, Serialize};

use crate::{
    config::StabilityConfig,
    contact::{Contact, ContactSample},
};

/// Object and gripper base state right after a lift step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    pub step: u64,
    pub object: BodyState,
    pub gripper: BodyState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Success,
    Failure,
    Aborted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Largest translation of the object relative to the gripper base [m].
    pub max_translation_deviation: f64,
    /// Largest rotation of the object relative to the gripper base [rad].
    pub max_rotation_deviation: f64,
    /// Largest object speed relative to the gripper base [m/s].
    pub max_relative_speed: f64,
    /// Fraction of lift samples with enough links in contact.
    pub contact_persistence: f64,
    pub force_closure: bool,
    /// Sum of the friction forces the final contacts can carry [N].
    pub friction_capacity: f64,
    /// Load the contacts have to carry [N].
    pub required_load: f64,
    pub lift_samples: usize,
}

/// Why a lift was not judged stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    NoLiftData,
    TranslationDeviation,
    RotationDeviation,
    RelativeSpeed,
    ContactPersistence,
    ForceClosure,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Violation::NoLiftData => "no lift data",
            Violation::TranslationDeviation => "translation deviation",
            Violation::RotationDeviation => "rotation deviation",
            Violation::RelativeSpeed => "relative speed",
            Violation::ContactPersistence => "contact persistence",
            Violation::ForceClosure => "no force closure",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// [`Verdict::Success`] or [`Verdict::Failure`].
    pub verdict: Verdict,
    pub metrics: QualityMetrics,
    pub violations: Vec<Violation>,
}

/// Physical quantities of the grasped object.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    pub object_mass: f64,
    pub friction_coefficient: f64,
    pub gravity: f64,
    /// World up direction.
    pub up: Vector3<f64>,
}

impl EvaluationContext {
    pub fn new(object_mass: f64, friction_coefficient: f64, gravity: f64) -> Self {
        Self {
            object_mass,
            friction_coefficient,
            gravity,
            up: Vector3::z(),
        }
    }

    pub fn weight(&self) -> f64 {
        self.object_mass * self.gravity
    }
}

/// Decides whether a set of contacts can hold the object against gravity.
#[auto_impl(&, Box, Arc)]
pub trait ForceClosureCheck: Send + Sync {
    /// `contacts` has at most one contact per link.
    fn holds(&self, contacts: &[Contact], context: &EvaluationContext) -> bool;
}

/// Keeps the contact with the largest normal force of every link.
pub fn strongest_per_link(contacts: &[Contact]) -> Vec<Contact> {
    let mut strongest: BTreeMap<&str, &Contact> = BTreeMap::new();
    for contact in contacts {
        let entry = strongest.entry(contact.link.as_str()).or_insert(contact);
        if contact.normal_force > entry.normal_force {
            *entry = contact;
        }
    }
    strongest.into_values().cloned().collect()
}

/// Linearized friction cone check.
///
/// Holds iff the up direction lies in the convex cone spanned by the edges of
/// all friction cones and the friction capacity carries the scaled weight.
#[derive(Debug, Clone)]
pub struct FrictionConeCheck {
    edges: usize,
    load_safety_factor: f64,
}

impl FrictionConeCheck {
    pub fn new(edges: usize, load_safety_factor: f64) -> Self {
        Self {
            edges: edges.max(3),
            load_safety_factor,
        }
    }

    /// Edges of the friction cone around `normal`.
    pub fn cone_edges(&self, normal: &Vector3<f64>, mu: f64) -> Vec<Vector3<f64>> {
        let n = normal.normalize();
        let helper = if n.x.abs() < 0.9 {
            Vector3::x()
        } else {
            Vector3::y()
        };
        let t1 = (helper - n * n.dot(&helper)).normalize();
        let t2 = n.cross(&t1);
        (0..self.edges)
            .map(|j| {
                let theta = std::f64::consts::TAU * j as f64 / self.edges as f64;
                n + (t1 * theta.cos() + t2 * theta.sin()) * mu
            })
            .collect()
    }
}

/// Whether `target` is a non-negative combination of `edges`.
///
/// A vector in the cone of `edges` is in the cone of at most three of them.
fn cone_contains(edges: &[Vector3<f64>], target: &Vector3<f64>) -> bool {
    const EPS: f64 = 1e-9;
    let target = target.normalize();
    if edges
        .iter()
        .any(|e| e.norm() > EPS && e.normalize().dot(&target) > 1.0 - EPS)
    {
        return true;
    }
    for (i, a) in edges.iter().enumerate() {
        for b in &edges[i + 1..] {
            let m = Matrix3x2::from_columns(&[*a, *b]);
            let Some(inv) = (m.transpose() * m).try_inverse() else {
                continue;
            };
            let lambda = inv * m.transpose() * target;
            if lambda.iter().all(|l| *l >= -EPS) && (m * lambda - target).norm() < 1e-7 {
                return true;
            }
        }
    }
    for (i, a) in edges.iter().enumerate() {
        for (j, b) in edges.iter().enumerate().skip(i + 1) {
            for c in &edges[j + 1..] {
                let m = Matrix3::from_columns(&[*a, *b, *c]);
                if m.determinant().abs() < 1e-12 {
                    continue;
                }
                let Some(inv) = m.try_inverse() else {
                    continue;
                };
                if (inv * target).iter().all(|l| *l >= -EPS) {
                    return true;
                }
            }
        }
    }
    false
}

impl ForceClosureCheck for FrictionConeCheck {
    fn holds(&self, contacts: &[Contact], context: &EvaluationContext) -> bool {
        if contacts.is_empty() {
            return false;
        }
        let mu = context.friction_coefficient;
        let capacity: f64 = contacts.iter().map(|c| mu * c.normal_force).sum();
        if capacity < self.load_safety_factor * context.weight() {
            return false;
        }
        let edges: Vec<_> = contacts
            .iter()
            .flat_map(|c| self.cone_edges(&c.normal, mu))
            .collect();
        cone_contains(&edges, &context.up)
    }
}

/// Scores the lift phase of a trial.
#[derive(Clone)]
pub struct StabilityEvaluator {
    config: StabilityConfig,
    min_contact_links: usize,
    check: Arc<dyn ForceClosureCheck>,
}

impl fmt::Debug for StabilityEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StabilityEvaluator")
            .field("config", &self.config)
            .field("min_contact_links", &self.min_contact_links)
            .finish_non_exhaustive()
    }
}

impl StabilityEvaluator {
    pub fn new(config: StabilityConfig, min_contact_links: usize) -> Self {
        let check = Arc::new(FrictionConeCheck::new(
            config.friction_cone_edges,
            config.load_safety_factor,
        ));
        Self {
            config,
            min_contact_links,
            check,
        }
    }

    pub fn with_force_closure_check(mut self, check: Arc<dyn ForceClosureCheck>) -> Self {
        self.check = check;
        self
    }

    /// Computes the metrics of a lift and judges them against the thresholds.
    ///
    /// `samples` and `poses` must only contain lift data; the first pose is the
    /// reference.
    pub fn evaluate(
        &self,
        samples: &[ContactSample],
        poses: &[PoseSample],
        context: &EvaluationContext,
    ) -> Evaluation {
        let mut metrics = QualityMetrics {
            required_load: self.config.load_safety_factor * context.weight(),
            lift_samples: samples.len(),
            ..Default::default()
        };
        let Some((first, last)) = poses.first().zip(samples.last()).filter(|_| poses.len() > 1)
        else {
            return Evaluation {
                verdict: Verdict::Failure,
                metrics,
                violations: vec![Violation::NoLiftData],
            };
        };

        let reference = first.gripper.pose.inverse() * first.object.pose;
        for pose in poses {
            let relative = pose.gripper.pose.inverse() * pose.object.pose;
            let deviation = reference.inverse() * relative;
            metrics.max_translation_deviation = metrics
                .max_translation_deviation
                .max(deviation.translation.vector.norm());
            metrics.max_rotation_deviation =
                metrics.max_rotation_deviation.max(deviation.rotation.angle());

            let lever = pose.object.pose.translation.vector - pose.gripper.pose.translation.vector;
            let carried =
                pose.gripper.linear_velocity + pose.gripper.angular_velocity.cross(&lever);
            metrics.max_relative_speed = metrics
                .max_relative_speed
                .max((pose.object.linear_velocity - carried).norm());
        }

        let persistent = samples
            .iter()
            .filter(|s| s.num_contact_links() >= self.min_contact_links)
            .count();
        metrics.contact_persistence = persistent as f64 / samples.len() as f64;

        let contacts = strongest_per_link(&last.contacts);
        metrics.friction_capacity = contacts
            .iter()
            .map(|c| context.friction_coefficient * c.normal_force)
            .sum();
        metrics.force_closure = self.check.holds(&contacts, context);

        let config = &self.config;
        let mut violations = vec![];
        if metrics.max_translation_deviation > config.max_translation_deviation {
            violations.push(Violation::TranslationDeviation);
        }
        if metrics.max_rotation_deviation > config.max_rotation_deviation {
            violations.push(Violation::RotationDeviation);
        }
        if metrics.max_relative_speed > config.max_relative_speed {
            violations.push(Violation::RelativeSpeed);
        }
        if metrics.contact_persistence < config.min_contact_persistence {
            violations.push(Violation::ContactPersistence);
        }
        if !metrics.force_closure {
            violations.push(Violation::ForceClosure);
        }
        Evaluation {
            verdict: if violations.is_empty() {
                Verdict::Success
            } else {
                Verdict::Failure
            },
            metrics,
            violations,
        }
    }
}
