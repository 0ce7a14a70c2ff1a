// VeilSync - Offline sync and encrypted-metadata cache engine
// Client-side core for E2E-encrypted cloud drives

//! The engine reconciles locally cached state (folders, files, offline
//! copies, camera rolls) against a remote zero-knowledge gateway: it
//! retries and caches gateway calls, decrypts metadata client-side, keeps
//! per-route item listings patched by local mutations and socket push
//! events, propagates re-encrypted metadata to share recipients and public
//! links, and runs the camera upload queue.
//!
//! Rendering, navigation, the socket transport itself and chunked file
//! transfer are external collaborators; see the trait seams in
//! [`api::transport`], [`transfer`] and [`camera`].

pub mod api;
pub mod camera;
pub mod config;
pub mod crypto;
pub mod decrypt;
pub mod engine;
pub mod events;
pub mod offline;
pub mod reconcile;
pub mod storage;
pub mod store;
pub mod transfer;
pub mod types;

pub use config::EngineConfig;
pub use engine::SyncEngine;
pub use types::{Item, ItemType, ParentId, SyncError};
