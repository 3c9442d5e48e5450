//! Circle membership and status synchronization.
//!
//! A circle is a small trusted group whose members broadcast a safety status
//! during an emergency. This module keeps circle and member state consistent
//! across two interchangeable stores and exposes one contract to the UI.
//!
//! # Architecture
//!
//! ```text
//! CircleSyncEngine (validation, sessions, derived counts)
//!     └── dyn CircleStore
//!           ├── RemoteStore (push; DocumentBackend change feed)
//!           └── LocalStore  (SQLite; poll-and-diff every 3 s)
//! ```
//!
//! # Types
//!
//! - [`Circle`]: a group, keyed by its invite code
//! - [`Member`]: a registered or phone-only member row
//! - [`CircleSummary`]: status counts of a circle
//! - [`Subscription`]: handle to a live member or circle feed

mod engine;
mod error;
pub mod invite;
mod local;
pub mod remote;
mod status;
mod store;
pub mod types;
mod view;

pub use engine::{CircleSession, CircleSyncEngine, MembersSnapshot};
pub use error::{CircleError, Result};
pub use invite::{invite_link, parse_invite_link, CodeGenerator, RandomCodeGenerator};
pub use local::LocalStore;
pub use remote::{DocumentBackend, InMemoryBackend, RemoteStore};
pub use status::StatusFields;
pub use store::{CircleCallback, CircleStore, MembersCallback, Subscription};
pub use types::{
    Circle, CircleCreationResult, CircleSummary, LocalAccount, Member, MemberStatus, MyCircleInfo,
    ProfileUpdate, UserProfile, DEFAULT_CIRCLE_NAME, MAX_CIRCLE_MEMBERS,
};
pub use view::{MemberFilter, MemberQuery, MemberSortMode};

#[cfg(any(test, feature = "test-utils"))]
pub use invite::SequenceCodeGenerator;
