//! officesync viewer library: wire types, connection helpers and profiles.

pub mod profiles;
pub mod types;
pub mod ws;
