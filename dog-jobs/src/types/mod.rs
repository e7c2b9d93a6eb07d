pub mod events;
pub mod ids;
pub mod priority;
pub mod record;
pub mod state;

pub use events::QueueEvent;
pub use ids::{IdGenerator, JobId};
pub use priority::Priority;
pub use record::JobRecord;
pub use state::JobState;
