//! Pathcheck command-line model checker.
//!
//! Wraps the `pathcheck-simulation` engine with what a standalone run needs:
//!
//! - **Parameters**: TOML parameter files with command-line overrides
//! - **Protocols**: a registry of bundled demonstration protocols
//!
//! # Example
//!
//! ```ignore
//! use pathcheck_simulation::SimulationRunner;
//! use pathcheck_simulator::{default_registry, load_params, Overrides};
//!
//! let params = Overrides::default()
//!     .with_seed(7)
//!     .apply(load_params("mc.toml".as_ref())?);
//! let registry = default_registry();
//! let mut runner = SimulationRunner::from_registry(params, &registry, "flood", 4)?;
//! println!("{}", runner.run()?);
//! ```

pub mod config;
pub mod protocols;

pub use config::{load_params, parse_mode, parse_params, ConfigError, Overrides};
pub use protocols::{default_registry, FloodService, FloodTest, PingService};
