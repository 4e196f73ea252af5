//! Hall-probe magnetic field mapping.
//!
//! A three-axis Hall probe is carried through the bore of a magnet by
//! McLennan stepper stages. Each line along the primary axis is sampled on the
//! fly, with an ADLINK encoder comparator deciding when the probe is
//! triggered; a grid of lines over one or two outer axes forms a field map.
//!
//! - [`hardware`]: device capabilities, drivers and a simulated bench
//! - [`scan`]: the line scan engine and the grid sweep controller
//! - [`export`]: save-as-you-go CSV output
//! - [`analysis`]: peak fitting on a measured line
//! - [`config`]: layered settings

pub mod analysis;
pub mod config;
pub mod core;
pub mod error;
pub mod export;
pub mod hardware;
pub mod scan;
