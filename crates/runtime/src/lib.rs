//! Runtime for driving a tree of remote stateful objects living in an
//! external engine process, over one ordered message stream.
//!
//! ```text
//!  controlling side                      engine process
//!  ----------------                      --------------
//!  DispatcherConnection
//!    |-- Dispatcher tree  <--- calls --- Transport <--- stdio / websocket
//!    |     (guid registry)   --- results/events -->
//!    |-- ProgressController (per call: deadline, abort, cleanups)
//!    `-- Launcher (spawn, retry-once on loader race, close-or-kill)
//! ```
//!
//! - [`transport`]: ordered, message-framed byte channels (length-prefixed
//!   pipe, WebSocket).
//! - [`dispatch`]: the guid-addressed node tree, call routing, event fan-out,
//!   and cascading disposal.
//! - [`progress`]: per-invocation deadline, abort signal, and abort-only
//!   cleanup stack.
//! - [`launcher`]: external-process launch, supervision, and graceful-close
//!   versus forced-kill escalation.

pub mod dispatch;
pub mod error;
pub mod launcher;
pub mod progress;
pub mod transport;

pub use dispatch::{
    DispatcherConnection, Dispatcher, DispatcherEvent, DispatcherState, DisposeOptions,
    MethodTable, SHUTDOWN_GRACE_PERIOD, SubscriptionId,
};
pub use error::{Error, Result};
pub use launcher::{
    Engine, ExitStatus, LaunchHooks, LaunchedProcess, ShutdownPath, close_or_kill, launch,
    launch_with_retries,
};
pub use progress::{CallMetadata, LogLine, Progress, ProgressController};
pub use transport::{PipeTransport, Transport, TransportParts, TransportReceiver, WebSocketTransport};
