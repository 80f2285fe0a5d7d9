//! Client data-sync core of the OneSocial app: session and profile
//! resolution, realtime-merged lists with cursor paging, optimistic
//! mutations and wallet bootstrap, all over a pluggable backend.

pub mod alerts;
pub mod app;
pub mod auth;
pub mod backend;
pub mod chat;
pub mod config;
pub mod error;
pub mod feed;
pub mod identity;
pub mod models;
pub mod notifications;
pub mod profiles;
pub mod scope;
pub mod session;
pub mod sync;
pub mod wallet;

pub use app::AppContext;
pub use error::{BackendError, SyncError, SyncResult};
