//! IPC fabric: transports and request correlation.
//!
//! A manager talks to each child over a [`transport::ChildLink`]; the
//! child talks back over a [`transport::ParentLink`]. Requests on either
//! side are correlated by nonce through a [`registry::NonceRegistry`].

pub mod process;
pub mod registry;
pub mod transport;
pub mod worker;

pub use process::{ProcessLink, StdioParent};
pub use registry::{await_reply, generate_nonce, NonceRegistry, RegisterOptions, WaiterMeta};
pub use transport::{ChildLink, ExitNotice, LinkEvents, ParentLink};
pub use worker::{WorkerContext, WorkerEntry, WorkerLink, WorkerParent};
