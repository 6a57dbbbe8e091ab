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

use std::collections::BTreeSet;

use graspi::{ContactPoint, SteppableWorld};
use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scene::SimulationHandle;

/// A contact between a gripper link and the object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub link: String,
    pub position: Point3<f64>,
    /// Unit normal pointing from the link into the object.
    pub normal: Vector3<f64>,
    pub normal_force: f64,
    pub tangential_force: f64,
    pub depth: f64,
}

impl From<ContactPoint> for Contact {
    fn from(point: ContactPoint) -> Self {
        Self {
            link: point.link,
            position: point.position,
            normal: point.normal,
            normal_force: point.normal_force,
            tangential_force: point.tangential_force,
            depth: point.depth,
        }
    }
}

/// Contacts observed right after one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactSample {
    /// Simulated step count.
    pub step: u64,
    /// Simulated time [s].
    pub time: f64,
    pub contacts: Vec<Contact>,
}

impl ContactSample {
    /// Names of the distinct links in contact, sorted.
    pub fn contact_links(&self) -> Vec<String> {
        self.contacts
            .iter()
            .map(|c| c.link.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(ToOwned::to_owned)
            .collect()
    }

    pub fn num_contact_links(&self) -> usize {
        self.contacts
            .iter()
            .map(|c| c.link.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn is_in_contact(&self, link: &str) -> bool {
        self.contacts.iter().any(|c| c.link == link)
    }
}

#[derive(Debug, Error)]
#[error("contact sample at step {} does not follow step {}", step, last)]
pub struct NonMonotonicSample {
    pub last: u64,
    pub step: u64,
}

/// Append-only sequence of contact samples ordered by step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactTrace {
    samples: Vec<ContactSample>,
}

impl ContactTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: ContactSample) -> Result<(), NonMonotonicSample> {
        if let Some(last) = self.samples.last() {
            if sample.step <= last.step {
                return Err(NonMonotonicSample {
                    last: last.step,
                    step: sample.step,
                });
            }
        }
        self.samples.push(sample);
        Ok(())
    }

    pub fn samples(&self) -> &[ContactSample] {
        &self.samples
    }

    pub fn last(&self) -> Option<&ContactSample> {
        self.samples.last()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples taken after `step`.
    pub fn since(&self, step: u64) -> &[ContactSample] {
        let start = self.samples.partition_point(|s| s.step <= step);
        &self.samples[start..]
    }
}

/// Extracts gripper/object contacts.
#[derive(Debug, Clone)]
pub struct ContactMonitor {
    force_noise_floor: f64,
}

impl ContactMonitor {
    pub fn new(force_noise_floor: f64) -> Self {
        Self { force_noise_floor }
    }

    /// Contacts between the gripper and the object at the current step, without
    /// the ones whose normal force is under the noise floor.
    pub fn sample<W: SteppableWorld>(
        &self,
        handle: &SimulationHandle<W>,
    ) -> Result<ContactSample, graspi::Error> {
        let contacts = handle
            .contact_points()?
            .into_iter()
            .filter(|c| c.normal_force >= self.force_noise_floor)
            .map(Contact::from)
            .collect();
        let step = handle.step_count();
        Ok(ContactSample {
            step,
            time: step as f64 * handle.timestep(),
            contacts,
        })
    }
}
