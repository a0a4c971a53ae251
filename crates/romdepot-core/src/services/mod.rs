pub mod progress;
pub mod refresh;
pub mod worker;
