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

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{contact::NonMonotonicSample, motion::Phase};

/// Error for loading and validating `openrr_grasp` configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("openrr-grasp: No File {:?} is found ({}).", .0, .1)]
    NoFile(PathBuf, #[source] std::io::Error),
    #[error("openrr-grasp: Failed to parse {:?} as toml ({}).", .0, .1)]
    TomlParseFailure(PathBuf, #[source] toml::de::Error),
    #[error("openrr-grasp: Failed to parse config ({}).", .0)]
    TomlStrParseFailure(#[source] toml::de::Error),
    #[error("openrr-grasp: Invalid config {}: {}", field, message)]
    InvalidConfig { field: String, message: String },
    #[error("openrr-grasp: graspi: {:?}", .0)]
    Graspi(#[from] graspi::Error),
    #[error("openrr-grasp: Other: {:?}", .0)]
    Other(#[from] anyhow::Error),
}

/// The scene of a trial could not be built.
///
/// No world is left alive when this is returned.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SceneBuildError {
    #[error("openrr-grasp: Invalid descriptor: {}", .0)]
    InvalidDescriptor(#[source] graspi::Error),
    #[error("openrr-grasp: World error while building the scene: {}", .0)]
    World(#[source] graspi::Error),
    #[error(
        "openrr-grasp: Link {} penetrates the object by {} (max {}).",
        link,
        depth,
        max
    )]
    InitialPenetration { link: String, depth: f64, max: f64 },
}

/// A phase was interrupted before it completed or timed out.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PhaseError {
    #[error(
        "openrr-grasp: Joint {} starts at {} but {} is expected (tolerance {}).",
        joint,
        position,
        expected,
        tolerance
    )]
    StartStateMismatch {
        joint: String,
        position: f64,
        expected: f64,
        tolerance: f64,
    },
    #[error(
        "openrr-grasp: Joint {} is at {} but its waypoint is {} (max error {}).",
        joint,
        position,
        goal,
        max
    )]
    TrackingError {
        joint: String,
        position: f64,
        goal: f64,
        max: f64,
    },
    #[error("openrr-grasp: Unexpected contact with {:?} during {}.", links, phase)]
    UnexpectedCollision { phase: Phase, links: Vec<String> },
    #[error("openrr-grasp: Simulation diverged: {}", .0)]
    Diverged(String),
    #[error("openrr-grasp: Canceled.")]
    Canceled,
    #[error("openrr-grasp: Wall clock timeout ({:?}).", .0)]
    WallClockTimeout(Duration),
    #[error("openrr-grasp: {}", .0)]
    NonMonotonicSample(#[from] NonMonotonicSample),
    #[error("openrr-grasp: graspi: {}", .0)]
    Simulation(#[from] graspi::Error),
}
