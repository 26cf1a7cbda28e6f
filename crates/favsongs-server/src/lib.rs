//! Playback tracking core for the FavSongs service.
//!
//! Turns periodic "current playback" snapshots into counted listens per
//! account and adds frequently played tracks to a curated collection.

pub mod account_tracker;
pub mod auto_add;
pub mod clock;
pub mod collection_cache;
pub mod completion;
pub mod config;
pub mod dashboard;
pub mod events;
pub mod play_recorder;
pub mod provider;
pub mod scheduler;
pub mod spotify;
pub mod store;
pub mod track_state;
pub mod tracker_db;

#[cfg(test)]
pub(crate) mod test_support;
