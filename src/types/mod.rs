pub mod hyperparams;
pub mod report;
pub mod series;

pub use hyperparams::*;
pub use report::*;
pub use series::*;
