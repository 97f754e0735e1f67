//! Session core: registry, PTY ownership, replay buffer, viewer fan-out.

pub mod buffer;
pub mod pty;
pub mod registry;
pub mod session;

pub use buffer::{ReplayBuffer, PAGE_FACTOR};
pub use pty::PtyHandle;
pub use registry::SessionRegistry;
pub use session::{ConnectionId, Session, Viewer, VIEWER_QUEUE_SIZE};
