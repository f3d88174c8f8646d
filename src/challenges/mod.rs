// Challenge classification and resolution: signatures, solver context, and
// the per-kind solver registry.

pub mod classifier;
pub mod context;
pub mod solvers;
