pub mod error;
pub mod events;
pub mod ids;
pub mod model;

pub use error::{CoreError, CoreResult};
pub use events::BusEvent;
pub use ids::{ConflictId, ProjectId, TaskId};
pub use model::*;
