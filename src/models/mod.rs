pub mod response;
pub mod review;
pub mod sensor;

pub use response::*;
pub use review::*;
pub use sensor::*;
