//! Utility modules

pub mod cidr;
pub mod network;
