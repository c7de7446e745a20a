pub mod descriptor;
pub mod ids;
pub mod run;

pub use descriptor::*;
pub use ids::RunId;
pub use run::*;
