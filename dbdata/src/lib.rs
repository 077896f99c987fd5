//! Doubly buffered data
//!
//! [`DoublyBufferedData`] keeps two instances of a value. Readers see the
//! *foreground* instance, and the writer mutates the *background* one,
//! flips which one is in the foreground, waits for every reader that may
//! still be looking at the old foreground, and then applies the same
//! mutation a second time so both instances converge.
//!
//! Each thread reads through its own read lease (a mutex that only the
//! writer ever contends on), so reads from different threads never block
//! each other. Writes are much slower than reads: they run the update twice
//! and have to visit every registered lease.
//!
//! This makes it a good fit for data that is read on every request but
//! changes rarely, like a load balancer's server list.
//!
//! ```
//! use dbdata::DoublyBufferedData;
//!
//! let data: DoublyBufferedData<u32> = DoublyBufferedData::new(0);
//!
//! assert_eq!(data.modify(|value| {
//!     *value += 1;
//!     1
//! }), 1);
//!
//! assert_eq!(*data.read(), 1);
//! ```
#![forbid(
    unsafe_op_in_unsafe_fn,
    clippy::missing_safety_doc,
    clippy::undocumented_unsafe_blocks,
    clippy::suspicious_doc_comments,
    clippy::suspicious,
    clippy::branches_sharing_code,
    clippy::bad_bit_mask,
    clippy::std_instead_of_core,
    clippy::alloc_instead_of_core,
    clippy::std_instead_of_alloc
)]
#![cfg_attr(
    not(test),
    forbid(clippy::print_stderr, clippy::print_stdout, clippy::todo)
)]
#![deny(clippy::perf, clippy::arithmetic_side_effects, unused_unsafe)]

extern crate alloc;

mod builder;
mod data;
mod error;
mod lease;
pub mod raw;
pub mod update;

pub use builder::Builder;
pub use data::DoublyBufferedData;
pub use error::ReadError;
pub use lease::thread_exiting;
pub use raw::ReadGuard;
pub use update::{with_args, Update};
