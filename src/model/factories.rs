//! Programmatic model constructors used by demos and tests.

use nalgebra::Vector3;

use crate::model::{JointType, Model, UNIVERSE};
use crate::spatial::{Placement, SpatialInertia};

/// Serial pendulum of `n` links rotating about the world Y axis, each link a
/// point mass at the end of a massless rod of the given length hanging along
/// `-Z`. Frames `link_<k>` sit at each joint; `tip` at the end of the chain.
#[must_use]
pub fn n_link_pendulum(n: usize, mass: f64, length: f64) -> Model {
    let mut model = Model::new("pendulum");
    let mut parent = UNIVERSE;
    for k in 0..n {
        let placement = if k == 0 {
            Placement::identity()
        } else {
            Placement::translation(0.0, 0.0, -length)
        };
        parent = model
            .add_joint(
                format!("pivot_{k}"),
                JointType::Revolute(Vector3::y()),
                parent,
                placement,
                SpatialInertia::point_mass(mass, Vector3::new(0.0, 0.0, -length)),
            )
            .unwrap_or_else(|_| unreachable!("generated names are unique"));
        model
            .add_frame(
                format!("link_{k}"),
                parent,
                Placement::identity(),
            )
            .unwrap_or_else(|_| unreachable!("generated names are unique"));
    }
    model
        .add_frame("tip", parent, Placement::translation(0.0, 0.0, -length))
        .unwrap_or_else(|_| unreachable!("generated names are unique"));
    model
}

/// Free-flying homogeneous sphere. The `root` frame sits at the center, the
/// `bottom` frame at the lowest point of the surface.
#[must_use]
pub fn free_sphere(name: &str, mass: f64, radius: f64) -> Model {
    let mut model = Model::new(name);
    let root = model
        .add_joint(
            "root",
            JointType::Free,
            UNIVERSE,
            Placement::identity(),
            SpatialInertia::sphere(mass, radius, Vector3::zeros()),
        )
        .unwrap_or_else(|_| unreachable!("fresh model"));
    model
        .add_frame("bottom", root, Placement::translation(0.0, 0.0, -radius))
        .unwrap_or_else(|_| unreachable!("fresh model"));
    model
}

/// Free-flying homogeneous box with the four bottom corners exposed as
/// frames `corner_0..=corner_3`.
#[must_use]
pub fn free_box(name: &str, mass: f64, sx: f64, sy: f64, sz: f64) -> Model {
    let mut model = Model::new(name);
    let root = model
        .add_joint(
            "root",
            JointType::Free,
            UNIVERSE,
            Placement::identity(),
            SpatialInertia::cuboid(mass, sx, sy, sz, Vector3::zeros()),
        )
        .unwrap_or_else(|_| unreachable!("fresh model"));
    let hx = 0.5 * sx;
    let hy = 0.5 * sy;
    let hz = 0.5 * sz;
    for (k, (cx, cy)) in [(-hx, -hy), (hx, -hy), (hx, hy), (-hx, hy)]
        .into_iter()
        .enumerate()
    {
        model
            .add_frame(format!("corner_{k}"), root, Placement::translation(cx, cy, -hz))
            .unwrap_or_else(|_| unreachable!("fresh model"));
    }
    model
}
