pub mod checkpoint;
pub mod evaluator;
pub mod metrics;
pub mod optim;
pub mod scaler;
pub mod selection;
pub mod tcn;
pub mod trainer;
pub mod windowing;
