//! Core types shared across all modules.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Basic math
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    pub fn one() -> Self {
        Self::new(1.0, 1.0, 1.0)
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Unit vector in the same direction, or zero for a zero vector.
    pub fn normalize(&self) -> Self {
        let len = self.length();
        if len == 0.0 {
            return Self::zero();
        }
        Self::new(self.x / len, self.y / len, self.z / len)
    }
}

impl std::fmt::Display for Vec3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

/// Unit rotation quaternion handed to the renderer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub fn identity() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }

    /// Rotation of `radians` around `axis` (normalised here).
    pub fn from_axis_angle(axis: Vec3, radians: f32) -> Self {
        let axis = axis.normalize();
        let (s, c) = (radians * 0.5).sin_cos();
        Self {
            x: axis.x * s,
            y: axis.y * s,
            z: axis.z * s,
            w: c,
        }
    }

    /// Interpret `v` as an axis-angle vector: its direction is the axis and
    /// its length is the angle in degrees.
    pub fn from_scaled_axis_degrees(v: Vec3) -> Self {
        let degrees = v.length();
        if degrees == 0.0 {
            return Self::identity();
        }
        Self::from_axis_angle(v, degrees.to_radians())
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt()
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::identity()
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-local instance identifier. Assigned once by the factory and never
/// reused within a process; also the total lock order over instances.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of one live connection inside a `NetworkManager`.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Stats & config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TreeStats {
    /// Root plus every descendant.
    pub instance_count: usize,
    pub renderable_count: usize,
    pub registered_classes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Capacity of the event queue between receive loops and the owning
    /// thread. Producers block once it is full.
    pub event_buffer: usize,
    /// Largest accepted frame body (type + subtype + payload) in bytes.
    pub max_frame_len: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            event_buffer: 1024,
            max_frame_len: 16 * 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    /// Config with the given queue capacity; zero falls back to the default.
    pub fn with_event_buffer(event_buffer: usize) -> Self {
        let mut config = Self::default();
        if event_buffer > 0 {
            config.event_buffer = event_buffer;
        }
        config
    }
}
