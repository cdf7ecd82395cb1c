//! Named live topics multiplexed over the shared transport.

pub mod handle;
pub mod name;
pub mod registry;

pub use handle::{ChannelHandle, ChannelListener, ChannelStatusEvent, StatusOrigin, TrackId};
pub use name::{ChannelName, ChannelPurpose};
pub use registry::ChannelRegistry;
