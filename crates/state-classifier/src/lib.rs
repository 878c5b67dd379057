mod classifier;
mod rules;

pub use classifier::*;
pub use rules::*;
