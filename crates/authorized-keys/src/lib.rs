//! # Authorized keys
//!
//! Rendering and merging of the managed block inside an OpenSSH
//! `authorized_keys` file.
//!
//! ## Pipeline
//!
//! ```text
//! UserRecordList
//!     │
//!     ├──> render()   (deterministic, marker-delimited snippet)
//!     │
//!     └──> update()   (strip old block, insert snippet, atomic 0600 write)
//!            └─> Updated | NotChanged
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use sshkey_authorized_keys::{render, update, MissingFilePolicy, UpdateOutcome};
//! use sshkey_protocol::{UserRecord, UserRecordList};
//! use std::path::Path;
//!
//! let records: UserRecordList = vec![UserRecord::new("octocat", 1).with_keys("ssh-ed25519 AAAA")].into();
//! let snippet = render(&records)?;
//! let path = Path::new("/home/deploy/.ssh/authorized_keys");
//! if update(path, &snippet, MissingFilePolicy::Create)? == UpdateOutcome::NotChanged {
//!     println!("nothing to do");
//! }
//! # Ok::<(), sshkey_authorized_keys::AuthorizedKeysError>(())
//! ```

mod error;
mod merge;
mod snippet;

pub use error::{AuthorizedKeysError, MalformedReason, Result};
pub use merge::{merge, update, MissingFilePolicy, UpdateOutcome};
pub use snippet::{render, BEGIN_MARKER, END_MARKER};
