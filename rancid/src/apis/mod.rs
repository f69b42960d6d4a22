//! Custom resources read and written by this crate
//!
//! Only the fields the components in this crate inspect are modeled. Every
//! other field is kept in an `other` map so that objects round-trip through
//! a replace without losing data.

pub mod appcatalog;
pub mod charts;
pub mod management;
pub mod meta;
pub mod monitoring;
