pub mod request_hash;

pub use request_hash::*;
