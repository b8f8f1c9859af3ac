mod autopilot;
mod chunker;
mod model;
mod reducer;
mod run_queue;
mod webhook;

pub use autopilot::*;
pub use chunker::*;
pub use model::*;
pub use reducer::*;
pub use run_queue::*;
pub use webhook::*;
