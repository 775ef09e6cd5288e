//! Geometric value types shared across the acquisition engine.
//!
//! These are pure value objects: beam-shift offsets ([`Point`]), absolute and
//! relative stage coordinates ([`StagePosition`]) and fractional scan
//! rectangles ([`ScanningArea`]). `ScanningArea` additionally comes in a
//! shared, update-in-place flavour ([`SharedScanningArea`]) so that a
//! rendering overlay holding a handle observes new bounds without
//! re-subscribing.

use std::ops::{Add, Mul, Sub};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A 2D offset or coordinate in physical units (metres).
///
/// Used for beam shifts, stigmator values and lens alignments, anything the
/// microscope exposes as an (x, y) pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance from the origin.
    pub fn radius(&self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Point {
    type Output = Point;

    fn mul(self, rhs: f64) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

/// Absolute or relative stage coordinates.
///
/// `rotation` and `tilt` are in degrees; linear axes in metres. A relative
/// position is simply a `StagePosition` whose fields are deltas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rotation: f64,
    pub tilt: f64,
}

impl StagePosition {
    pub fn new(x: f64, y: f64, z: f64, rotation: f64, tilt: f64) -> Self {
        Self {
            x,
            y,
            z,
            rotation,
            tilt,
        }
    }

    /// A pure lateral move, leaving z, rotation and tilt untouched.
    pub fn lateral(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            ..Self::default()
        }
    }

    /// Largest absolute linear-axis delta to another position.
    ///
    /// Used by move verification: the stage is considered settled when this
    /// drops below the configured tolerance.
    pub fn linear_distance(&self, other: &StagePosition) -> f64 {
        let dx = (self.x - other.x).abs();
        let dy = (self.y - other.y).abs();
        let dz = (self.z - other.z).abs();
        dx.max(dy).max(dz)
    }
}

impl Add for StagePosition {
    type Output = StagePosition;

    fn add(self, rhs: StagePosition) -> StagePosition {
        StagePosition {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
            z: self.z + rhs.z,
            rotation: self.rotation + rhs.rotation,
            tilt: self.tilt + rhs.tilt,
        }
    }
}

/// A rectangle in fractional image coordinates (0.0..=1.0 on both axes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanningArea {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ScanningArea {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The full frame.
    pub fn full() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    /// Replaces the bounds in place.
    pub fn update(&mut self, x: f64, y: f64, width: f64, height: f64) {
        self.x = x;
        self.y = y;
        self.width = width;
        self.height = height;
    }

    /// Converts to a pixel rectangle `(x, y, width, height)` for an image of
    /// `(cols, rows)` pixels.
    pub fn to_pixels(&self, cols: usize, rows: usize) -> (usize, usize, usize, usize) {
        let px = (self.x * cols as f64).round() as usize;
        let py = (self.y * rows as f64).round() as usize;
        let pw = (self.width * cols as f64).round() as usize;
        let ph = (self.height * rows as f64).round() as usize;
        (
            px.min(cols),
            py.min(rows),
            pw.min(cols - px.min(cols)),
            ph.min(rows - py.min(rows)),
        )
    }

    /// Center of the rectangle in fractional coordinates.
    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// Shared, update-in-place scanning area.
///
/// Single-writer discipline: the acquisition loop updates the bounds, any
/// number of readers (e.g. a GUI overlay) snapshot them. This replaces the
/// silent aliasing of a plain mutable rectangle with an explicit shared cell.
#[derive(Clone, Debug, Default)]
pub struct SharedScanningArea {
    inner: Arc<RwLock<ScanningArea>>,
}

impl SharedScanningArea {
    pub fn new(area: ScanningArea) -> Self {
        Self {
            inner: Arc::new(RwLock::new(area)),
        }
    }

    /// Snapshot of the current bounds.
    pub fn get(&self) -> ScanningArea {
        *self.inner.read()
    }

    /// Updates the bounds in place; all holders observe the new value.
    pub fn update(&self, x: f64, y: f64, width: f64, height: f64) {
        self.inner.write().update(x, y, width, height);
    }
}
