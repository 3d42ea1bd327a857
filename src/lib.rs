mod admittance;
mod backend;
mod config;
mod dc;
mod error;
mod grid;
mod newton;
mod soln;
mod solver;

pub use backend::*;
pub use config::*;
pub use error::*;
pub use grid::*;
pub use solver::*;
