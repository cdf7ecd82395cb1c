//! Workspace activity feeds: snapshot plus live inserts, with batched actor
//! enrichment.

pub mod buffer;
pub mod enrichment;
pub mod feed;
pub mod store;
pub mod types;

pub use buffer::ActivityBuffer;
pub use enrichment::ActorResolver;
pub use feed::{ActivityContext, ActivityFeed, FeedState};
pub use store::{ActivityStore, MemoryActivityStore, MemoryProfileDirectory, ProfileDirectory};
pub use types::{ActivityEvent, ActivityType, ActorInfo};
