pub mod backoff;
pub mod runtime;
pub mod sink;
pub mod subprocess;

pub use backoff::{backoff_delay, retry_transient};
pub use runtime::{
    route_fn, AfterHook, BeforeHook, ErrorHook, MessageRuntime, RouteHandler, RoutePredicate,
    RuntimeHandle,
};
pub use sink::{AdapterSink, ApiResponder, HttpSink, InProcessSink};
pub use subprocess::{FrameType, SubprocessSink, WireFrame};
