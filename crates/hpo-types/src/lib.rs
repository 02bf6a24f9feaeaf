pub mod errors;
pub mod params;
pub mod suggest;

pub use errors::*;
pub use params::*;
pub use suggest::*;
