// Stateless numeric routines: the IRLS logistic solver and the
// interaction-model construction that feeds it.

pub mod logistic;
pub mod model;
