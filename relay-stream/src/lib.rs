#![forbid(unsafe_code)]
//! Relay stream layer: frames, credit accounting and the proxy session bridging a frontend
//! exchange to its backends.

pub mod frame;
pub mod wire;
pub mod errors;
pub mod budget;
pub mod state;
pub mod pool;
pub mod ids;
pub mod binding;
pub mod dispatch;
pub mod observer;
pub mod exchange;
pub mod session;
pub mod gateway;

pub use frame::{DataFlags, ExchangeId, Frame, FrameBody, FrameHeader, FrameKind};
pub use wire::{build_frame, parse_frame, HEADER_LEN};
pub use errors::{FaultCategory, Resource, StreamError, StreamResult, TranslationError, Violation};
pub use budget::{Budget, BudgetPool};
pub use state::HalfState;
pub use pool::{BufferPool, PoolError, Slot};
pub use ids::{is_initial, DefaultIdGenerator, IdGenerator};
pub use binding::{
    BindingAdapter, Flow, OpenMeta, Passthrough, Route, RouteResolver, RouteTarget, Unit,
};
pub use dispatch::{channel, ChannelDispatch, Dispatch, DispatchReceiver, DispatchStatus};
pub use observer::{FaultObserver, FaultReport, LogObserver, MetricsObserver};
pub use exchange::{Exchange, ExchangeTable, HalfKind, HalfStream, StreamRef, FRONTEND};
pub use session::{ProxyContext, ProxySession, SessionSettings, Side};
pub use gateway::Gateway;
