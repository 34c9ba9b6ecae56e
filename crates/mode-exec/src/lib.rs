pub mod audit;
pub mod contracts;
pub mod executor;
pub mod model_client;

pub use audit::*;
pub use contracts::*;
pub use executor::*;
pub use model_client::*;
