pub mod pipeline;
pub mod work;

pub use pipeline::Pipeline;
pub use work::{dispatch, OutcomeTally, WorkOutcome};
