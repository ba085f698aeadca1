//! XPANSION - investment optimization for multi-stage stochastic
//! capacity-expansion problems in power systems.
//!
//! Given a portfolio of candidate assets (thermal units, batteries,
//! intermittent renewables, transmission lines) and a nested stochastic
//! operational model, the engine evaluates the expected total cost of an
//! investment plan and produces the affine minorants (cutting planes) that
//! a bundle-style master solver consumes.
//!
//! The crate is organized around the investment oracle:
//!
//! - [`problem::InvestmentProblem`] packages the decision vector, its
//!   bounds and the linear side constraints;
//! - [`oracle::InvestmentOracle`] evaluates the expected operational cost
//!   over scenarios and builds subgradients;
//! - [`pool::GlobalPool`] stores the linearizations produced by past
//!   evaluations under master-assigned names;
//! - [`operation::OperationalModel`] is the contract that the nested
//!   unit-commitment evaluators must satisfy.

pub mod asset;
pub mod constraint;
pub mod error;
pub mod event;
pub mod fixture;
pub mod linearization;
pub mod log;
pub mod operation;
pub mod oracle;
pub mod pool;
pub mod problem;
pub mod scenario;
pub mod scheduler;
pub mod state;
pub mod utils;

pub use crate::asset::{Asset, AssetKind};
pub use crate::constraint::{ConstraintSide, LinearConstraint};
pub use crate::error::{Error, Result};
pub use crate::oracle::{InvestmentOracle, OracleOptions, OracleStatus};
pub use crate::problem::InvestmentProblem;
