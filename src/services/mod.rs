//! Domain services used by the websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own table state, persistence and the main-server seam so
//! route handlers can stay focused on protocol translation.

pub mod action;
pub mod agent;
pub mod army;
pub mod content;
pub mod events;
pub mod housekeeping;
pub mod journal;
pub mod quality;
pub mod registry;
pub mod stats;
pub mod table;
