//! # Petrel authentication databases
//!
//! The passwd-file password database (passdb) for the petrel IMAP server:
//! a flat file of `user:password:...` lines with optional `{SCHEME}`
//! password prefixes, shared between consumers through a use-counted
//! registry so one file is parsed once no matter how many auth modules
//! point at it.

#![warn(missing_docs)]

pub mod error;
pub mod passwd_file;
pub mod scheme;

pub use error::{Error, Result};
pub use passwd_file::{open, PassdbResult, PasswdFile, PasswdUser, SharedPasswdFile};
pub use scheme::DEFAULT_SCHEME;
