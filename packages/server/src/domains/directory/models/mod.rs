pub mod lead;
pub mod restaurant;

pub use lead::*;
pub use restaurant::*;
