//! # relay-core
//!
//! Core types and stream fan-out for the relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Item** - An opaque upstream record
//! - **ItemSource** - Joins the historical and live upstream legs into one sequence
//! - **ReplayBuffer** - Bounded window of recent items for late subscribers
//! - **Hub** - Single-upstream, multi-subscriber broadcast with per-item jitter
//! - **ProfileLookup** - Read-through LRU cache in front of profile lookups
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Upstream   │────▶│ ItemSource  │────▶│     Hub     │────▶ subscriptions
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                                │
//!                                                ▼
//!                                         ┌─────────────┐
//!                                         │ReplayBuffer │
//!                                         └─────────────┘
//! ```

pub mod cache;
pub mod delay;
pub mod hub;
pub mod item;
pub mod replay;
pub mod source;

#[cfg(test)]
mod test_support;

pub use cache::{Profile, ProfileCache, ProfileLookup, ProfileSource};
pub use delay::{DelayConfig, DelayPolicy, RandomDelay};
pub use hub::{
    Deliver, DeliveryError, Hub, HubConfig, HubError, HubState, HubStats, SubscriptionHandle,
};
pub use item::{Item, ItemId};
pub use replay::ReplayBuffer;
pub use source::{ItemSource, LiveStream, LogicalSequence, SourceError, Upstream};
