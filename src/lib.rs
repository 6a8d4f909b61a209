pub mod cli;
pub mod data;
pub mod fit;
pub mod interval;
pub mod io;
pub mod model;
pub mod models;
pub mod opt;
pub mod parameters;
pub mod progress;
pub mod runner;
pub mod sensitivity;
pub mod submitter;
pub mod utils;

pub use data::{Dataset, ToyData};
pub use model::StatisticalModel;
pub use parameters::{Parameter, ParameterValues, Parameters};
pub use runner::{Runner, RunnerConfig};
pub use submitter::{LocalSubmitter, Submit, Submitter};
