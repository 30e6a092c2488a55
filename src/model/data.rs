//! Mutable per-model scratch refreshed by the kinematic and dynamic
//! algorithms.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn, Vector3};

use crate::model::Model;
use crate::spatial::{Force, Motion, Placement, SpatialInertia};

/// Dynamic counterpart of [`Model`].
///
/// Every field is an output of one of the algorithms in
/// [`crate::model::algorithms`]; nothing here survives a change of `q`/`v`
/// without recomputation.
pub struct Data {
    /// World placement of each joint frame.
    pub joint_placement: Vec<Placement>,
    /// World placement of each operational frame.
    pub frame_placement: Vec<Placement>,
    /// Joint spatial velocity, local joint frame.
    pub v_local: Vec<Motion>,
    /// Joint spatial acceleration, local joint frame.
    pub a_local: Vec<Motion>,
    /// Joint spatial velocity, world frame referenced at the world origin.
    pub v_world: Vec<Motion>,
    /// Joint spatial acceleration, world frame referenced at the world
    /// origin.
    pub a_world: Vec<Motion>,
    /// Velocity-product (bias) acceleration with zero joint acceleration,
    /// world frame. Refreshed by the constraint pass.
    pub bias_acc_world: Vec<Motion>,
    /// Motion subspace column of each DOF, world frame.
    pub dof_subspace_world: Vec<Motion>,
    /// Spatial momentum of each kinematic subtree, world frame.
    pub momentum: Vec<Force>,
    /// Net spatial force on each kinematic subtree, world frame.
    pub force: Vec<Force>,
    /// Composite (subtree) spatial inertia, world frame.
    pub subtree_inertia: Vec<SpatialInertia>,
    /// Center of mass of each subtree, world frame.
    pub com: Vec<Vector3<f64>>,
    /// Center-of-mass velocity of each subtree, world frame.
    pub vcom: Vec<Vector3<f64>>,
    /// Centroidal momentum.
    pub centroidal_momentum: Force,
    /// Centroidal momentum time derivative.
    pub centroidal_momentum_dot: Force,
    /// Joint-space inertia matrix.
    pub mass_matrix: DMatrix<f64>,
    /// Cholesky factorization of the joint-space inertia.
    pub mass_chol: Option<Cholesky<f64, Dyn>>,
    /// Nonlinear effects vector (Coriolis, centrifugal, gravity).
    pub nle: DVector<f64>,
    /// Joint accelerations from the last forward-dynamics solve.
    pub ddq: DVector<f64>,
    /// Delassus matrix `J·M⁻¹·Jᵀ` of the last constraint solve.
    pub jminv_jt: DMatrix<f64>,
    /// Joint-space torque residual `M⁻¹·(u − nle)` of the last solve.
    pub torque_residual: DVector<f64>,
    /// Kinetic energy of the last energy evaluation.
    pub kinetic_energy: f64,
    /// Potential energy of the last energy evaluation.
    pub potential_energy: f64,
}

impl Data {
    /// Allocate scratch sized for `model`.
    #[must_use]
    pub fn new(model: &Model) -> Self {
        let nj = model.njoints();
        let nf = model.nframes();
        let nv = model.nv;
        Self {
            joint_placement: vec![Placement::identity(); nj],
            frame_placement: vec![Placement::identity(); nf],
            v_local: vec![Motion::zero(); nj],
            a_local: vec![Motion::zero(); nj],
            v_world: vec![Motion::zero(); nj],
            a_world: vec![Motion::zero(); nj],
            bias_acc_world: vec![Motion::zero(); nj],
            dof_subspace_world: vec![Motion::zero(); nv],
            momentum: vec![Force::zero(); nj],
            force: vec![Force::zero(); nj],
            subtree_inertia: vec![SpatialInertia::zero(); nj],
            com: vec![Vector3::zeros(); nj],
            vcom: vec![Vector3::zeros(); nj],
            centroidal_momentum: Force::zero(),
            centroidal_momentum_dot: Force::zero(),
            mass_matrix: DMatrix::zeros(nv, nv),
            mass_chol: None,
            nle: DVector::zeros(nv),
            ddq: DVector::zeros(nv),
            jminv_jt: DMatrix::zeros(0, 0),
            torque_residual: DVector::zeros(nv),
            kinetic_energy: 0.0,
            potential_energy: 0.0,
        }
    }

    /// Total mechanical energy of the last energy evaluation.
    #[must_use]
    pub fn total_energy(&self) -> f64 {
        self.kinetic_energy + self.potential_energy
    }
}
