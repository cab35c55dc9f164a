//! Helpers shared across the authentication modules
//!
//! - [`email`]: `From:` address and domain extraction

pub mod email;

pub use email::{domain_of, from_address, from_addresses, from_domain, from_domains};
