//! # Stores
//!
//! One store per entity family. Posts, community posts and showcases share
//! the generic [`EntityStore`]; communities and the follow graph add their
//! own relation tables on top.

pub mod community;
pub mod entity;
pub mod follow;

pub use community::CommunityStore;
pub use entity::{
    CommunityPostStore, EntityStore, FetchOutcome, PostStore, ShowcaseStore, StoreDeps,
};
pub use follow::FollowStore;
