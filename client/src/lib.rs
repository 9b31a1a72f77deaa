//! ServerList client - session management and backend access.
//!
//! This crate provides the client side of the ServerList community site,
//! where players submit game servers and admins review and rank them:
//! - A session manager tracking who is signed in and with which role
//! - A Supabase auth client and a table client
//! - Stores for server submissions and listed servers
//! - Realtime change feeds that keep the server list current
//! - Persisted auth state, rehydrated at startup
//!
//! # Architecture
//!
//! All persistence, auth enforcement and row-level security live in the
//! Supabase project. The [`session::SessionManager`] talks to it through the
//! [`backend::AuthBackend`] trait, so tests can substitute a double; the
//! [`app::ServerList`] type wires the real clients together from
//! [`config::Config`].

pub mod app;
pub mod backend;
pub mod config;
pub mod error;
pub mod realtime;
pub mod rest;
pub mod servers;
pub mod session;
pub mod storage;
pub mod submissions;
pub mod supabase;
pub mod types;
pub mod validation;

pub use app::ServerList;
pub use error::{AuthError, ClientError};
pub use session::{AuthState, AuthStatus, SessionManager, SessionManagerConfig};
