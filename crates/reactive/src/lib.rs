//! A single reactive cell used by the session engine to expose a handful of
//! observable state fields (lifecycle phase, ICE phase, peer generation)
//! without polling.
//!
//! ```
//! # futures::executor::block_on(async {
//! use futures::StreamExt as _;
//! use session_reactive::ObservableCell;
//!
//! let phase = ObservableCell::new(0u8);
//! let mut updates = phase.subscribe();
//! assert_eq!(updates.next().await, Some(0));
//!
//! phase.set(1);
//! assert_eq!(updates.next().await, Some(1));
//! # });
//! ```

mod cell;

pub use self::cell::{DroppedError, ObservableCell};
